//! Destination-host route resolution
//!
//! Maps an outbound destination host to its token exchange parameters via an
//! ordered list of glob patterns. Evaluation is left-to-right; the first
//! matching route wins. A missing configuration file is not an error: every
//! lookup then misses and the caller falls back to the default exchange
//! configuration.

mod pattern;

pub use pattern::{strip_port, HostPattern};

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::Result;

/// One route entry as it appears in the YAML configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    /// Host glob pattern
    pub host: String,
    /// Audience requested in the exchanged token; empty with
    /// `passthrough: false` falls back to the default audience
    #[serde(default)]
    pub target_audience: String,
    /// Space-delimited scopes requested in the exchanged token
    #[serde(default)]
    pub token_scopes: String,
    /// Per-route token endpoint override
    #[serde(default)]
    pub token_url: String,
    /// Skip token exchange entirely for this destination
    #[serde(default)]
    pub passthrough: bool,
    /// Reserved: pre-exchange authorization check against the identity
    /// provider. Accepted in the file format, not yet acted on.
    #[serde(default)]
    pub authorization_check: bool,
}

/// Resolved exchange parameters for a destination host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMatch {
    /// Audience for the exchanged token (empty when passthrough)
    pub audience: String,
    /// Space-delimited scopes for the exchanged token
    pub scopes: String,
    /// Token endpoint override (empty means use the default endpoint)
    pub token_endpoint: String,
    /// Skip exchange and forward the original Authorization header
    pub passthrough: bool,
}

#[derive(Debug)]
struct Route {
    pattern: HostPattern,
    config: RouteMatch,
}

/// Ordered, atomically reloadable host-to-route table
///
/// Lookups take the shared lock and copy the match out; reloads build a new
/// table and swap it in one write. The table itself is immutable once
/// installed.
#[derive(Debug, Default)]
pub struct StaticResolver {
    routes: RwLock<Arc<Vec<Route>>>,
}

impl StaticResolver {
    /// Load routes from a YAML file
    ///
    /// A missing file yields an empty table. Entries with invalid host
    /// patterns are logged and skipped; the remaining routes stay valid.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let resolver = Self::default();

        if !path.exists() {
            info!(path = %path.display(), "No route config found, using defaults");
            return Ok(resolver);
        }

        let routes = Self::parse(path)?;
        info!(path = %path.display(), routes = routes.len(), "Loaded route table");
        *resolver.routes.write() = Arc::new(routes);
        Ok(resolver)
    }

    /// Re-read the route file and atomically replace the table
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed; the
    /// previous table stays installed in that case.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let routes = if path.exists() {
            Self::parse(path)?
        } else {
            Vec::new()
        };
        info!(path = %path.display(), routes = routes.len(), "Route table reloaded");
        *self.routes.write() = Arc::new(routes);
        Ok(())
    }

    /// Look up the route for a destination host
    ///
    /// The host may carry a `:port` suffix or be a bracketed IPv6 address;
    /// both are normalized before matching. Returns `None` when no route
    /// matches.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<RouteMatch> {
        let host = strip_port(host);
        let routes = Arc::clone(&self.routes.read());

        for route in routes.iter() {
            if route.pattern.matches(host) {
                debug!(host = %host, pattern = %route.pattern.as_str(), "Route matched");
                return Some(route.config.clone());
            }
        }
        None
    }

    /// Number of installed routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether the table has no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn parse(path: &Path) -> Result<Vec<Route>> {
        let content = std::fs::read_to_string(path)?;
        let configs: Vec<RouteConfig> = serde_yaml::from_str(&content)?;
        Ok(Self::compile(configs))
    }

    fn compile(configs: Vec<RouteConfig>) -> Vec<Route> {
        let mut routes = Vec::with_capacity(configs.len());
        for entry in configs {
            let pattern = match HostPattern::compile(&entry.host) {
                Ok(p) => p,
                Err(e) => {
                    warn!(pattern = %entry.host, error = %e, "Skipping invalid route pattern");
                    continue;
                }
            };
            routes.push(Route {
                pattern,
                config: RouteMatch {
                    audience: entry.target_audience,
                    scopes: entry.token_scopes,
                    token_endpoint: entry.token_url,
                    passthrough: entry.passthrough,
                },
            });
        }
        routes
    }

    #[cfg(test)]
    fn from_configs(configs: Vec<RouteConfig>) -> Self {
        let resolver = Self::default();
        *resolver.routes.write() = Arc::new(Self::compile(configs));
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(host: &str, audience: &str) -> RouteConfig {
        RouteConfig {
            host: host.to_string(),
            target_audience: audience.to_string(),
            ..RouteConfig::default()
        }
    }

    #[test]
    fn first_match_wins() {
        // GIVEN: a wildcard route before a more specific one
        let resolver = StaticResolver::from_configs(vec![
            route("*.example.com", "wildcard"),
            route("specific.example.com", "specific"),
        ]);

        // WHEN: resolving a host both patterns match
        let matched = resolver.resolve("specific.example.com").unwrap();

        // THEN: the earlier (wildcard) route is selected
        assert_eq!(matched.audience, "wildcard");
    }

    #[test]
    fn passthrough_route_shadows_later_routes() {
        let resolver = StaticResolver::from_configs(vec![
            RouteConfig {
                host: "*.trusted.internal".to_string(),
                passthrough: true,
                ..RouteConfig::default()
            },
            route("svc.trusted.internal", "svc"),
        ]);

        let matched = resolver.resolve("svc.trusted.internal").unwrap();
        assert!(matched.passthrough);
        assert!(matched.audience.is_empty());
    }

    #[test]
    fn port_is_stripped_before_matching() {
        let resolver = StaticResolver::from_configs(vec![route("api.internal", "svc-C")]);

        let matched = resolver.resolve("api.internal:8443").unwrap();
        assert_eq!(matched.audience, "svc-C");
    }

    #[test]
    fn no_match_returns_none() {
        let resolver = StaticResolver::from_configs(vec![route("api.internal", "svc-C")]);
        assert!(resolver.resolve("other.internal").is_none());
    }

    #[test]
    fn empty_table_never_matches() {
        let resolver = StaticResolver::default();
        assert!(resolver.resolve("anything.example.com").is_none());
        assert!(resolver.is_empty());
    }

    #[test]
    fn invalid_pattern_is_skipped_but_others_survive() {
        let resolver = StaticResolver::from_configs(vec![
            route("", "broken"),
            route("api.internal", "svc-C"),
        ]);

        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.resolve("api.internal").unwrap().audience, "svc-C");
    }
}
