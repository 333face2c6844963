//! Host-based route table with exact, wildcard, and suffix matching
//!
//! Lookups run against an immutable [`RouteTable`] snapshot. Reloads build a
//! complete new table and swap the `Arc` in one step, so a lookup always sees
//! either the old table or the new one.

use crate::config::{Config, RouteConfig};
use crate::handshake::normalize_host;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Where a route sends its traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// A fixed backend that is always expected to be up
    Local { host: String, port: u16 },
    /// The single on-demand backend managed by the lifecycle controller
    OnDemand,
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Pattern as configured (normalized)
    pub pattern: String,
    pub target: RouteTarget,
    /// Whether connections on this route pass admission control
    pub admission: bool,
}

/// How a pattern is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// `*.example.com`
    Wildcard,
    /// `example.com`: the host itself or any subdomain
    Suffix,
    /// Single label such as `localhost`: exact match only
    Exact,
}

/// Classify a normalized pattern
pub fn pattern_kind(pattern: &str) -> PatternKind {
    if pattern.starts_with("*.") {
        PatternKind::Wildcard
    } else if pattern.contains('.') {
        PatternKind::Suffix
    } else {
        PatternKind::Exact
    }
}

/// Normalize a configured pattern the same way hosts are normalized
pub fn normalize_pattern(pattern: &str) -> String {
    match pattern.trim().strip_prefix("*.") {
        Some(rest) => format!("*.{}", normalize_host(rest)),
        None => normalize_host(pattern),
    }
}

/// Immutable snapshot of all routes
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Every non-wildcard pattern, for the exact tier
    exact: HashMap<String, Route>,
    /// `(".example.com", route)` sorted longest suffix first
    wildcard: Vec<(String, Route)>,
    /// `(".example.com", route)` for bare multi-label patterns, longest first
    suffix: Vec<(String, Route)>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let mut table = Self::default();
        for route in routes {
            match pattern_kind(&route.pattern) {
                PatternKind::Wildcard => {
                    let suffix = route.pattern[1..].to_string();
                    table.wildcard.push((suffix, route));
                }
                PatternKind::Suffix => {
                    let suffix = format!(".{}", route.pattern);
                    table.exact.insert(route.pattern.clone(), route.clone());
                    table.suffix.push((suffix, route));
                }
                PatternKind::Exact => {
                    table.exact.insert(route.pattern.clone(), route);
                }
            }
        }
        // Most specific suffix first within each tier
        table.wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table.suffix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table
    }

    /// Build a table from the `[routes]` configuration section
    pub fn from_config(routes: &HashMap<String, RouteConfig>) -> Self {
        let routes = routes
            .iter()
            .map(|(pattern, config)| Route {
                pattern: normalize_pattern(pattern),
                target: config.target(),
                admission: config.admission(),
            })
            .collect();
        Self::new(routes)
    }

    /// Resolve a normalized host. Exact beats wildcard beats bare suffix.
    pub fn resolve(&self, host: &str) -> Option<&Route> {
        if let Some(route) = self.exact.get(host) {
            return Some(route);
        }
        if let Some((_, route)) = self.wildcard.iter().find(|(suffix, _)| host.ends_with(suffix.as_str())) {
            return Some(route);
        }
        self.suffix
            .iter()
            .find(|(suffix, _)| host.ends_with(suffix.as_str()))
            .map(|(_, route)| route)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The live route table, replaced wholesale on reload
#[derive(Debug, Default)]
pub struct SharedRoutes {
    current: RwLock<Arc<RouteTable>>,
}

impl SharedRoutes {
    pub fn new(table: RouteTable) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(table)),
        })
    }

    /// The table as of now; later reloads do not affect the returned snapshot
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.read().clone()
    }

    /// Resolve against the current snapshot
    pub fn resolve(&self, host: &str) -> Option<Route> {
        self.snapshot().resolve(host).cloned()
    }

    /// Swap in a new table
    pub fn replace(&self, table: RouteTable) {
        *self.current.write() = Arc::new(table);
    }

    /// Re-read the config file and swap in its routes.
    ///
    /// Only the route table changes; a config that fails validation leaves
    /// the current table in place.
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        let config = Config::load(path)?;
        let table = RouteTable::from_config(&config.routes);
        let count = table.len();
        self.replace(table);
        info!(routes = count, "Route table reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(pattern: &str, port: u16) -> Route {
        Route {
            pattern: normalize_pattern(pattern),
            target: RouteTarget::Local {
                host: "127.0.0.1".to_string(),
                port,
            },
            admission: false,
        }
    }

    fn port_of(route: Option<&Route>) -> Option<u16> {
        route.map(|r| match r.target {
            RouteTarget::Local { port, .. } => port,
            RouteTarget::OnDemand => 0,
        })
    }

    fn sample_table() -> RouteTable {
        RouteTable::new(vec![
            local("a.x.com", 1),
            local("*.x.com", 2),
            local("x.com", 3),
        ])
    }

    #[test]
    fn test_tier_precedence() {
        let table = sample_table();

        assert_eq!(port_of(table.resolve("a.x.com")), Some(1));
        assert_eq!(port_of(table.resolve("b.x.com")), Some(2));
        assert_eq!(port_of(table.resolve("x.com")), Some(3));
        assert_eq!(port_of(table.resolve("y.com")), None);
    }

    #[test]
    fn test_bare_suffix_matches_subdomains() {
        let table = RouteTable::new(vec![local("example.org", 7)]);

        assert_eq!(port_of(table.resolve("example.org")), Some(7));
        assert_eq!(port_of(table.resolve("deep.sub.example.org")), Some(7));
        assert_eq!(port_of(table.resolve("badexample.org")), None);
    }

    #[test]
    fn test_wildcard_does_not_match_apex() {
        let table = RouteTable::new(vec![local("*.example.org", 9)]);

        assert_eq!(port_of(table.resolve("mc.example.org")), Some(9));
        assert_eq!(port_of(table.resolve("example.org")), None);
    }

    #[test]
    fn test_single_label_is_exact_only() {
        let table = RouteTable::new(vec![local("localhost", 4)]);

        assert_eq!(port_of(table.resolve("localhost")), Some(4));
        assert_eq!(port_of(table.resolve("a.localhost")), None);
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let table = RouteTable::new(vec![local("*.x.com", 1), local("*.eu.x.com", 2)]);

        assert_eq!(port_of(table.resolve("mc.eu.x.com")), Some(2));
        assert_eq!(port_of(table.resolve("mc.us.x.com")), Some(1));
    }

    #[test]
    fn test_wildcard_beats_bare_suffix() {
        let table = RouteTable::new(vec![local("eu.x.com", 1), local("*.x.com", 2)]);

        // bare eu.x.com would match, but wildcard is the higher tier
        assert_eq!(port_of(table.resolve("mc.eu.x.com")), Some(2));
        assert_eq!(port_of(table.resolve("eu.x.com")), Some(1));
    }

    #[test]
    fn test_patterns_are_normalized() {
        let table = RouteTable::new(vec![local("Play.Example.COM.", 5), local("*.Lobby.Example.com", 6)]);

        assert_eq!(port_of(table.resolve("play.example.com")), Some(5));
        assert_eq!(port_of(table.resolve("a.lobby.example.com")), Some(6));
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let shared = SharedRoutes::new(sample_table());
        let before = shared.snapshot();

        shared.replace(RouteTable::new(vec![local("y.com", 10)]));

        // The old snapshot still resolves with the old rules
        assert_eq!(port_of(before.resolve("a.x.com")), Some(1));
        assert_eq!(port_of(before.resolve("y.com")), None);

        assert_eq!(shared.resolve("a.x.com"), None);
        assert_eq!(port_of(shared.resolve("y.com").as_ref()), Some(10));
    }

    #[test]
    fn test_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idlegate.toml");
        std::fs::write(
            &path,
            r#"
[routes]
"lobby.example.com" = { kind = "local", host = "127.0.0.1", port = 25570 }
"#,
        )
        .unwrap();

        let shared = SharedRoutes::new(sample_table());
        assert_eq!(shared.reload_from(&path).unwrap(), 1);
        assert_eq!(port_of(shared.resolve("lobby.example.com").as_ref()), Some(25570));
        assert_eq!(shared.resolve("a.x.com"), None);

        // Invalid config keeps the current table
        std::fs::write(&path, "[routes]\n\"bad.example.com\" = { kind = \"local\" }\n").unwrap();
        assert!(shared.reload_from(&path).is_err());
        assert_eq!(port_of(shared.resolve("lobby.example.com").as_ref()), Some(25570));
    }

    #[test]
    fn test_concurrent_lookups_during_swaps() {
        let shared = SharedRoutes::new(RouteTable::new(vec![local("a.com", 1), local("b.com", 1)]));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let table = shared.snapshot();
                        // Both routes always come from the same generation
                        assert_eq!(port_of(table.resolve("a.com")), port_of(table.resolve("b.com")));
                    }
                });
            }
            scope.spawn(|| {
                for i in 0..200u16 {
                    shared.replace(RouteTable::new(vec![local("a.com", i), local("b.com", i)]));
                }
            });
        });
    }
}
