//! Firewall backend detection
//!
//! The kernel ships two iptables backends (legacy xtables and the
//! nftables shim); rules installed through the wrong one are invisible to
//! the other, so the interceptor must drive whichever is active in this
//! namespace. Heuristic: prefer the legacy command when it is runnable,
//! otherwise fall back to the default binary.

use std::process::Command;

use tracing::{debug, info};

/// Environment variable overriding the iptables binary outright
pub const IPTABLES_ENV_OVERRIDE: &str = "AUTHBRIDGE_IPTABLES";

const LEGACY_BINARY: &str = "iptables-legacy";
const DEFAULT_BINARY: &str = "iptables";

/// Pick the iptables binary to drive
#[must_use]
pub fn detect_iptables() -> String {
    if let Ok(binary) = std::env::var(IPTABLES_ENV_OVERRIDE) {
        if !binary.is_empty() {
            info!(binary = %binary, "Using iptables binary from environment override");
            return binary;
        }
    }

    let legacy_works = Command::new(LEGACY_BINARY)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    if legacy_works {
        debug!("Legacy iptables backend detected");
        LEGACY_BINARY.to_string()
    } else {
        debug!("Using default iptables backend");
        DEFAULT_BINARY.to_string()
    }
}
