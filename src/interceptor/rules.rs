//! Packet-redirection rule program
//!
//! Builds and installs the nat/mangle rules that steer the application's
//! traffic into the proxy listeners. The program is deterministic and
//! idempotent: chains are created tolerantly, flushed, and repopulated;
//! jump rules are check-guarded so re-runs never duplicate them.
//!
//! A second mesh (ambient style) may own rules in the same namespace. Its
//! connections carry a known socket mark; ours jump at position 1 of each
//! parent chain while the mesh appends, so the evaluation order is stable
//! regardless of which installs first.

use std::process::Command;

use tracing::{debug, info};

use crate::config::InterceptConfig;
use crate::{Error, Result};

/// Socket mark the coexisting mesh sets on its own connections
pub const MESH_MARK: u32 = 0x539;

/// Tunnel port of the coexisting mesh; never redirected
pub const MESH_HBONE_PORT: u16 = 15008;

/// Source address the mesh rewrites kubelet health probes to
pub const MESH_PROBE_SOURCE: &str = "169.254.7.127";

/// SSH stays reachable directly
pub const SSH_PORT: u16 = 22;

/// Our nat chain for locally-originated traffic
pub const OUTBOUND_CHAIN: &str = "AUTHBRIDGE_OUTBOUND";

/// Our nat chain for traffic arriving at the namespace
pub const INBOUND_CHAIN: &str = "AUTHBRIDGE_INBOUND";

/// Outcome of one firewall command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Whether the command exited zero
    pub success: bool,
    /// Captured stderr, trimmed
    pub stderr: String,
}

/// Executes firewall and sysctl commands
///
/// The system implementation shells out; tests substitute a fake that
/// models kernel chain state.
pub trait CommandRunner {
    /// Run `program` with `args`, capturing the exit status
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutcome>;
}

/// Runner backed by real subprocesses
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Rules(format!("failed to run {program}: {e}")))?;

        Ok(CommandOutcome {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Installs the complete redirection program through a [`CommandRunner`]
#[derive(Debug)]
pub struct RuleInstaller<R> {
    iptables: String,
    runner: R,
}

impl<R: CommandRunner> RuleInstaller<R> {
    /// Create an installer driving the given iptables binary
    pub fn new(iptables: impl Into<String>, runner: R) -> Self {
        Self {
            iptables: iptables.into(),
            runner,
        }
    }

    /// Install the complete rule set
    ///
    /// # Errors
    ///
    /// Any individual command failure aborts with `Error::Rules`; the
    /// sidecar cannot safely run with partial rules.
    pub fn apply(&mut self, config: &InterceptConfig) -> Result<()> {
        let outbound_excludes = config.outbound_excludes()?;
        let inbound_excludes = config.inbound_excludes()?;

        info!(
            iptables = %self.iptables,
            proxy_port = config.proxy_port,
            inbound_proxy_port = config.inbound_proxy_port,
            proxy_uid = config.proxy_uid,
            "Installing interception rules"
        );

        self.prepare_chain("nat", OUTBOUND_CHAIN)?;
        self.prepare_chain("nat", INBOUND_CHAIN)?;

        for rule in outbound_rules(config, &outbound_excludes) {
            self.append("nat", OUTBOUND_CHAIN, &rule)?;
        }
        for rule in inbound_rules(config, &inbound_excludes) {
            self.append("nat", INBOUND_CHAIN, &rule)?;
        }

        // Jumps at position 1 so our chains evaluate before the mesh's
        // appended ones, whichever installed first.
        self.insert_if_missing("nat", "OUTPUT", &jump_rule(OUTBOUND_CHAIN))?;
        self.insert_if_missing("nat", "PREROUTING", &jump_rule(INBOUND_CHAIN))?;
        self.insert_if_missing("mangle", "OUTPUT", &mangle_mark_rule(config))?;

        self.enable_localnet_routing()?;

        info!("Interception rules installed");
        Ok(())
    }

    /// Create the chain if absent, then flush it
    fn prepare_chain(&mut self, table: &str, chain: &str) -> Result<()> {
        let exists = self
            .run_iptables(&strings(&["-t", table, "-nL", chain]))?
            .success;
        if !exists {
            self.must(&strings(&["-t", table, "-N", chain]))?;
        }
        self.must(&strings(&["-t", table, "-F", chain]))
    }

    /// Append a rule to a freshly flushed chain
    fn append(&mut self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = strings(&["-t", table, "-A", chain]);
        args.extend_from_slice(rule);
        self.must(&args)
    }

    /// Insert a rule at position 1 unless it is already present
    fn insert_if_missing(&mut self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut check = strings(&["-t", table, "-C", chain]);
        check.extend_from_slice(rule);
        if self.run_iptables(&check)?.success {
            debug!(table = table, chain = chain, "Jump rule already present");
            return Ok(());
        }

        let mut insert = strings(&["-t", table, "-I", chain, "1"]);
        insert.extend_from_slice(rule);
        self.must(&insert)
    }

    /// Allow redirected packets with preserved non-loopback sources to
    /// survive post-NAT re-routing
    fn enable_localnet_routing(&mut self) -> Result<()> {
        let args = strings(&["-w", "net.ipv4.conf.all.route_localnet=1"]);
        let outcome = self.runner.run("sysctl", &args)?;
        if !outcome.success {
            return Err(Error::Rules(format!(
                "sysctl route_localnet failed: {}",
                outcome.stderr
            )));
        }
        Ok(())
    }

    fn run_iptables(&mut self, args: &[String]) -> Result<CommandOutcome> {
        self.runner.run(&self.iptables, args)
    }

    /// Run an iptables command that must succeed
    fn must(&mut self, args: &[String]) -> Result<()> {
        let outcome = self.run_iptables(args)?;
        if !outcome.success {
            return Err(Error::Rules(format!(
                "{} {} failed: {}",
                self.iptables,
                args.join(" "),
                outcome.stderr
            )));
        }
        Ok(())
    }
}

/// The ordered rule list for [`OUTBOUND_CHAIN`]
#[must_use]
pub fn outbound_rules(config: &InterceptConfig, excludes: &[u16]) -> Vec<Vec<String>> {
    let mark = format!("0x{MESH_MARK:x}");
    let proxy_uid = config.proxy_uid.to_string();
    let proxy_port = config.proxy_port.to_string();
    let inbound_port = config.inbound_proxy_port.to_string();

    let mut rules = Vec::new();

    // Mesh-delivered inbound arrives as a locally-originated connection
    // after decryption; capture it for validation.
    rules.push(strings(&[
        "-p", "tcp", "-m", "mark", "--mark", &mark, "-m", "owner", "!", "--uid-owner",
        &proxy_uid, "-m", "addrtype", "--dst-type", "LOCAL", "-j", "REDIRECT", "--to-ports",
        &inbound_port,
    ]));

    // Everything else the mesh marked is its own outbound tunnel traffic.
    rules.push(strings(&["-m", "mark", "--mark", &mark, "-j", "RETURN"]));

    // The proxy's own outbound falls through to the mesh chain for
    // wrapping.
    rules.push(strings(&["-m", "owner", "--uid-owner", &proxy_uid, "-j", "RETURN"]));

    rules.push(strings(&["-d", "127.0.0.1/32", "-j", "RETURN"]));

    for port in bypass_ports(config, excludes) {
        let port = port.to_string();
        rules.push(strings(&["-p", "tcp", "--dport", &port, "-j", "RETURN"]));
    }

    rules.push(strings(&[
        "-p", "tcp", "-j", "REDIRECT", "--to-ports", &proxy_port,
    ]));

    rules
}

/// The ordered rule list for [`INBOUND_CHAIN`]
#[must_use]
pub fn inbound_rules(config: &InterceptConfig, excludes: &[u16]) -> Vec<Vec<String>> {
    let inbound_port = config.inbound_proxy_port.to_string();
    let hbone_port = MESH_HBONE_PORT.to_string();
    let probe_source = format!("{MESH_PROBE_SOURCE}/32");

    let mut rules = Vec::new();

    // Mesh health probes and the mesh tunnel port stay untouched.
    rules.push(strings(&["-s", &probe_source, "-j", "RETURN"]));
    rules.push(strings(&["-p", "tcp", "--dport", &hbone_port, "-j", "RETURN"]));

    for port in bypass_ports(config, excludes) {
        let port = port.to_string();
        rules.push(strings(&["-p", "tcp", "--dport", &port, "-j", "RETURN"]));
    }

    rules.push(strings(&[
        "-p", "tcp", "-j", "REDIRECT", "--to-ports", &inbound_port,
    ]));

    rules
}

/// The jump from a parent chain into one of ours
#[must_use]
pub fn jump_rule(chain: &str) -> Vec<String> {
    strings(&["-p", "tcp", "-j", chain])
}

/// Mark the proxy's locally-destined output with the mesh mark so the
/// mesh outbound chain treats it as already-meshed instead of redirecting
/// it straight back to us
#[must_use]
pub fn mangle_mark_rule(config: &InterceptConfig) -> Vec<String> {
    let mark = format!("0x{MESH_MARK:x}");
    let proxy_uid = config.proxy_uid.to_string();
    strings(&[
        "-p", "tcp", "-m", "owner", "--uid-owner", &proxy_uid, "-m", "addrtype", "--dst-type",
        "LOCAL", "-j", "MARK", "--set-mark", &mark,
    ])
}

/// Listener ports, SSH, and caller-configured exclusions
fn bypass_ports(config: &InterceptConfig, excludes: &[u16]) -> Vec<u16> {
    let mut ports = vec![config.proxy_port, config.inbound_proxy_port, SSH_PORT];
    ports.extend_from_slice(excludes);
    ports
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}
