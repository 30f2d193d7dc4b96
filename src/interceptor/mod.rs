//! Traffic interception
//!
//! One-shot program that redirects the application's TCP traffic into the
//! proxy listeners: locally-originated connections to the outbound
//! listener, connections arriving at the namespace to the inbound
//! listener. The proxy's own uid is exempt to prevent forwarding loops,
//! and a coexisting ambient mesh keeps full ownership of its marked
//! traffic.
//!
//! Runs before the application container starts and exits 0 once the
//! complete rule set is in kernel state; the rules themselves are not
//! touched again at runtime.

mod backend;
mod rules;

pub use backend::{detect_iptables, IPTABLES_ENV_OVERRIDE};
pub use rules::{
    inbound_rules, jump_rule, mangle_mark_rule, outbound_rules, CommandOutcome, CommandRunner,
    RuleInstaller, SystemRunner, INBOUND_CHAIN, MESH_HBONE_PORT, MESH_MARK, MESH_PROBE_SOURCE,
    OUTBOUND_CHAIN, SSH_PORT,
};

use crate::config::InterceptConfig;
use crate::Result;

/// Detect the firewall backend and install the complete rule program
///
/// # Errors
///
/// Any rule failure aborts; the caller exits non-zero so the application
/// container never starts behind partial rules.
pub fn install(config: &InterceptConfig) -> Result<()> {
    let iptables = detect_iptables();
    let mut installer = RuleInstaller::new(iptables, SystemRunner);
    installer.apply(config)
}
