//! Host glob patterns
//!
//! Dialect: `*` matches within a single dot-delimited label, `**` matches
//! across labels, `?` matches one character within a label, everything else
//! is literal. Patterns are anchored to the whole host.

use regex::Regex;

use crate::{Error, Result};

/// A compiled host glob pattern
#[derive(Debug, Clone)]
pub struct HostPattern {
    pattern: String,
    regex: Regex,
}

impl HostPattern {
    /// Compile a glob pattern
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty pattern or one the regex
    /// engine rejects after translation.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Config("empty host pattern".to_string()));
        }

        let mut translated = String::with_capacity(pattern.len() + 8);
        translated.push('^');

        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        translated.push_str(".*");
                    } else {
                        translated.push_str("[^.]*");
                    }
                }
                '?' => translated.push_str("[^.]"),
                _ => {
                    let mut buf = [0u8; 4];
                    translated.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                }
            }
        }
        translated.push('$');

        let regex = Regex::new(&translated)
            .map_err(|e| Error::Config(format!("invalid host pattern {pattern:?}: {e}")))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Whether the pattern matches the given host (port already stripped)
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        self.regex.is_match(host)
    }

    /// The original glob text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Strip an optional `:port` suffix from a host string
///
/// Bracketed IPv6 addresses are unwrapped: `[::1]:8080` becomes `::1`.
/// Bare IPv6 addresses (more than one colon, no brackets) are returned
/// unchanged, as are hosts without a numeric port.
#[must_use]
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }

    match host.rfind(':') {
        Some(idx) => {
            let (name, port) = (&host[..idx], &host[idx + 1..]);
            if name.contains(':') {
                // Bare IPv6 address, the colons are part of it
                host
            } else if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                name
            } else {
                host
            }
        }
        None => host,
    }
}
