use crate::error::DenialCode;
use crate::routes::{normalize_pattern, RouteTarget};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Host pattern -> route
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,

    /// The on-demand backend (required when any route is on-demand)
    pub on_demand: Option<OnDemandConfig>,

    /// Rate limiting, bans, and the allow-list
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Fallback responder for clients that cannot be forwarded
    #[serde(default)]
    pub friendly: FriendlyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 25565)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the admin API on 127.0.0.1 (default: 9999, 0 disables)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API write operations
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Seconds a client may take to send its handshake (0 disables the limit)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Backend connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            handshake_timeout_secs: default_handshake_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            pid_file: None,
        }
    }
}

/// Route kind: fixed local backend or the on-demand backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RouteKind {
    Local,
    #[serde(alias = "on_demand", alias = "ondemand")]
    OnDemand,
}

/// Configuration for a single route
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// "local" or "on-demand"
    pub kind: RouteKind,

    /// Backend host (local only)
    pub host: Option<String>,

    /// Backend port (local only)
    pub port: Option<u16>,

    /// Apply admission control (default: true for on-demand, false for local)
    pub admission: Option<bool>,
}

impl RouteConfig {
    pub fn local(host: &str, port: u16) -> Self {
        Self {
            kind: RouteKind::Local,
            host: Some(host.to_string()),
            port: Some(port),
            admission: None,
        }
    }

    pub fn on_demand() -> Self {
        Self {
            kind: RouteKind::OnDemand,
            host: None,
            port: None,
            admission: None,
        }
    }

    pub fn target(&self) -> RouteTarget {
        match self.kind {
            RouteKind::Local => RouteTarget::Local {
                host: self.host.clone().unwrap_or_default(),
                port: self.port.unwrap_or_default(),
            },
            RouteKind::OnDemand => RouteTarget::OnDemand,
        }
    }

    pub fn admission(&self) -> bool {
        self.admission.unwrap_or(self.kind == RouteKind::OnDemand)
    }

    /// Validate the route configuration
    pub fn validate(&self, pattern: &str) -> Result<(), String> {
        let normalized = normalize_pattern(pattern);
        if normalized.is_empty() || normalized == "*." {
            return Err(format!("Route '{}': pattern is empty", pattern));
        }
        let body = normalized.strip_prefix("*.").unwrap_or(&normalized);
        if body.contains('*') {
            return Err(format!(
                "Route '{}': '*' is only allowed as a leading '*.' label",
                pattern
            ));
        }

        if self.kind == RouteKind::Local {
            if self.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                return Err(format!("Route '{}': local route requires 'host' field", pattern));
            }
            if self.port.unwrap_or(0) == 0 {
                return Err(format!(
                    "Route '{}': local route requires 'port' greater than 0",
                    pattern
                ));
            }
        }

        Ok(())
    }
}

/// Which compute provider manages the on-demand backend
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Existing Docker container, started and stopped via the Docker API
    #[default]
    Docker,
    /// Always-running backend at a fixed address
    Static,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OnDemandConfig {
    /// Provider type: "docker" (default) or "static"
    #[serde(default)]
    pub provider: ProviderKind,

    /// Provider-side identifier (container name or id)
    pub instance_id: String,

    /// Port the backend serves the game protocol on
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Address to use instead of the one the provider publishes
    /// (required for the static provider)
    pub address: Option<IpAddr>,

    /// Docker host URL (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,

    /// Interval between readiness polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Give up on a readiness sequence after this many seconds
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Timeout for each TCP reachability probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Ignore start requests this soon after the last start command
    #[serde(default = "default_start_debounce")]
    pub start_debounce_secs: u64,

    /// Interval for comparing our view with the provider's
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Stop the backend after this long with no sessions
    #[serde(default = "default_idle_shutdown")]
    pub idle_shutdown_secs: u64,

    /// Coarse tick that re-derives the idle period
    #[serde(default = "default_idle_tick")]
    pub idle_tick_secs: u64,
}

impl OnDemandConfig {
    pub fn new(instance_id: &str, service_port: u16) -> Self {
        Self {
            provider: ProviderKind::default(),
            instance_id: instance_id.to_string(),
            service_port,
            address: None,
            docker_host: None,
            poll_interval_ms: default_poll_interval(),
            start_timeout_secs: default_start_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            start_debounce_secs: default_start_debounce(),
            reconcile_interval_secs: default_reconcile_interval(),
            idle_shutdown_secs: default_idle_shutdown(),
            idle_tick_secs: default_idle_tick(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn start_debounce(&self) -> Duration {
        Duration::from_secs(self.start_debounce_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_secs(self.idle_tick_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.instance_id.trim().is_empty() {
            errors.push("on_demand: 'instance_id' must not be empty".to_string());
        }
        if self.service_port == 0 {
            errors.push("on_demand: 'service_port' must be greater than 0".to_string());
        }
        if self.provider == ProviderKind::Static && self.address.is_none() {
            errors.push("on_demand: static provider requires 'address'".to_string());
        }
        for (name, value, max) in [
            ("poll_interval_ms", self.poll_interval_ms, MAX_DURATION_MS),
            ("start_timeout_secs", self.start_timeout_secs, MAX_DURATION_SECS),
            ("probe_timeout_ms", self.probe_timeout_ms, MAX_DURATION_MS),
            ("reconcile_interval_secs", self.reconcile_interval_secs, MAX_DURATION_SECS),
            ("idle_shutdown_secs", self.idle_shutdown_secs, MAX_DURATION_SECS),
            ("idle_tick_secs", self.idle_tick_secs, MAX_DURATION_SECS),
        ] {
            if value == 0 {
                errors.push(format!("on_demand: '{}' must be greater than 0", name));
            }
            check_max(errors, "on_demand", name, value, max);
        }
        check_max(errors, "on_demand", "start_debounce_secs", self.start_debounce_secs, MAX_DURATION_SECS);
    }
}

/// Token bucket parameters
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Tokens added per interval
    #[serde(default = "default_refill_tokens")]
    pub refill_tokens: u32,

    /// Refill interval in seconds
    #[serde(default = "default_refill_interval")]
    pub refill_interval_secs: u64,

    /// Tokens granted to an address seen for the first time
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: u32,
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_tokens: default_refill_tokens(),
            refill_interval_secs: default_refill_interval(),
            initial_tokens: default_initial_tokens(),
        }
    }
}

/// Failure counting and temporary ban parameters
#[derive(Debug, Deserialize, Clone)]
pub struct BanConfig {
    /// Sliding window for counting failures, in seconds
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,

    /// Failures within the window that trigger a ban
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Ban length in seconds
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,
}

impl BanConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            failure_window_secs: default_failure_window(),
            max_failures: default_max_failures(),
            ban_duration_secs: default_ban_duration(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub ban: BanConfig,

    /// Upper bound on addresses tracked by the rate limiter and ban list
    #[serde(default = "default_max_tracked_ips")]
    pub max_tracked_ips: usize,

    /// Require starting players to be on the allow-list
    #[serde(default)]
    pub allowlist_enabled: bool,

    /// JSON file holding the allow-list
    #[serde(default = "default_allowlist_path")]
    pub allowlist_path: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            ban: BanConfig::default(),
            max_tracked_ips: default_max_tracked_ips(),
            allowlist_enabled: false,
            allowlist_path: default_allowlist_path(),
        }
    }
}

impl AdmissionConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        let rl = &self.rate_limit;
        if rl.max_tokens == 0 {
            errors.push("admission.rate_limit: 'max_tokens' must be greater than 0".to_string());
        }
        if rl.initial_tokens > rl.max_tokens {
            errors.push(format!(
                "admission.rate_limit: 'initial_tokens' ({}) must not exceed 'max_tokens' ({})",
                rl.initial_tokens, rl.max_tokens
            ));
        }
        if rl.refill_tokens == 0 {
            errors.push("admission.rate_limit: 'refill_tokens' must be greater than 0".to_string());
        }
        if rl.refill_interval_secs == 0 {
            errors.push(
                "admission.rate_limit: 'refill_interval_secs' must be greater than 0".to_string(),
            );
        }
        if self.ban.max_failures == 0 {
            errors.push("admission.ban: 'max_failures' must be greater than 0".to_string());
        }
        if self.ban.failure_window_secs == 0 {
            errors.push("admission.ban: 'failure_window_secs' must be greater than 0".to_string());
        }
        if self.ban.ban_duration_secs == 0 {
            errors.push("admission.ban: 'ban_duration_secs' must be greater than 0".to_string());
        }
        check_max(errors, "admission.rate_limit", "refill_interval_secs", rl.refill_interval_secs, MAX_DURATION_SECS);
        check_max(errors, "admission.ban", "failure_window_secs", self.ban.failure_window_secs, MAX_DURATION_SECS);
        check_max(errors, "admission.ban", "ban_duration_secs", self.ban.ban_duration_secs, MAX_DURATION_SECS);
        check_max(errors, "admission", "max_tracked_ips", self.max_tracked_ips as u64, MAX_TRACKED_IPS as u64);
        if self.max_tracked_ips == 0 {
            errors.push("admission: 'max_tracked_ips' must be greater than 0".to_string());
        }
    }
}

/// Messages shown by the friendly responder, one per denial reason
#[derive(Debug, Deserialize, Clone)]
pub struct FriendlyMessages {
    #[serde(default = "default_msg_sleeping")]
    pub sleeping: String,
    #[serde(default = "default_msg_starting")]
    pub starting: String,
    #[serde(default = "default_msg_not_authorized")]
    pub not_authorized: String,
    #[serde(default = "default_msg_rate_limited")]
    pub rate_limited: String,
    #[serde(default = "default_msg_no_route")]
    pub no_route: String,
    #[serde(default = "default_msg_unavailable")]
    pub unavailable: String,
}

impl FriendlyMessages {
    pub fn message(&self, code: DenialCode) -> &str {
        match code {
            DenialCode::Sleeping => &self.sleeping,
            DenialCode::Starting => &self.starting,
            DenialCode::NotAuthorized => &self.not_authorized,
            DenialCode::RateLimited => &self.rate_limited,
            DenialCode::NoRoute => &self.no_route,
            DenialCode::Unavailable => &self.unavailable,
        }
    }
}

impl Default for FriendlyMessages {
    fn default() -> Self {
        Self {
            sleeping: default_msg_sleeping(),
            starting: default_msg_starting(),
            not_authorized: default_msg_not_authorized(),
            rate_limited: default_msg_rate_limited(),
            no_route: default_msg_no_route(),
            unavailable: default_msg_unavailable(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FriendlyConfig {
    /// Address the responder listens on (default: 127.0.0.1)
    #[serde(default = "default_friendly_bind")]
    pub bind: IpAddr,

    /// First port; one listener per reason on consecutive ports (0 = ephemeral)
    #[serde(default)]
    pub base_port: u16,

    /// Version name shown in the server list
    #[serde(default = "default_version_name")]
    pub version_name: String,

    #[serde(default)]
    pub messages: FriendlyMessages,
}

impl Default for FriendlyConfig {
    fn default() -> Self {
        Self {
            bind: default_friendly_bind(),
            base_port: 0,
            version_name: default_version_name(),
            messages: FriendlyMessages::default(),
        }
    }
}

/// Upper bound for any configured duration (one year). Deadlines are
/// computed as `Instant + Duration`, which panics on overflow.
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;
const MAX_DURATION_MS: u64 = MAX_DURATION_SECS * 1000;

/// Eviction scans the whole per-address map, so the map stays small
pub const MAX_TRACKED_IPS: usize = 100_000;

fn check_max(errors: &mut Vec<String>, section: &str, name: &str, value: u64, max: u64) {
    if value > max {
        errors.push(format!("{}: '{}' must be at most {}", section, name, max));
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    25565
}

fn default_admin_port() -> u16 {
    9999
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_service_port() -> u16 {
    25565
}

fn default_poll_interval() -> u64 {
    5000 // 5 seconds between provider polls
}

fn default_start_timeout() -> u64 {
    300 // cloud instances can take minutes to boot
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_start_debounce() -> u64 {
    30
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_idle_shutdown() -> u64 {
    600 // 10 minutes
}

fn default_idle_tick() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    3
}

fn default_refill_tokens() -> u32 {
    1
}

fn default_refill_interval() -> u64 {
    15
}

fn default_initial_tokens() -> u32 {
    1
}

fn default_failure_window() -> u64 {
    600 // 10 minutes
}

fn default_max_failures() -> u32 {
    5
}

fn default_ban_duration() -> u64 {
    1800 // 30 minutes
}

fn default_max_tracked_ips() -> usize {
    10_000
}

fn default_allowlist_path() -> String {
    "allowlist.json".to_string()
}

fn default_friendly_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_version_name() -> String {
    "idlegate".to_string()
}

fn default_msg_sleeping() -> String {
    "The server is asleep. Join to wake it up.".to_string()
}

fn default_msg_starting() -> String {
    "The server is starting. Try again in a minute.".to_string()
}

fn default_msg_not_authorized() -> String {
    "You are not allowed to start this server.".to_string()
}

fn default_msg_rate_limited() -> String {
    "Too many attempts. Please wait before trying again.".to_string()
}

fn default_msg_no_route() -> String {
    "No server is configured for this address.".to_string()
}

fn default_msg_unavailable() -> String {
    "The server is unavailable right now.".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (pattern, route) in &self.routes {
            if let Err(e) = route.validate(pattern) {
                errors.push(e);
            }
        }

        let mut patterns: HashMap<String, Vec<&str>> = HashMap::new();
        for key in self.routes.keys() {
            patterns.entry(normalize_pattern(key)).or_default().push(key);
        }
        for (pattern, mut keys) in patterns {
            if keys.len() > 1 {
                keys.sort_unstable();
                errors.push(format!(
                    "Routes '{}' all normalize to '{}'",
                    keys.join("', '"),
                    pattern
                ));
            }
        }

        let wants_on_demand = self.routes.values().any(|r| r.kind == RouteKind::OnDemand);
        match &self.on_demand {
            Some(on_demand) => on_demand.validate(&mut errors),
            None if wants_on_demand => {
                errors.push("on-demand routes require an [on_demand] section".to_string());
            }
            None => {}
        }

        self.admission.validate(&mut errors);

        if self.server.connect_timeout_ms == 0 {
            errors.push("server: 'connect_timeout_ms' must be greater than 0".to_string());
        }
        check_max(&mut errors, "server", "connect_timeout_ms", self.server.connect_timeout_ms, MAX_DURATION_MS);
        check_max(&mut errors, "server", "handshake_timeout_secs", self.server.handshake_timeout_secs, MAX_DURATION_SECS);

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 25570
bind = "127.0.0.1"
admin_port = 9000
handshake_timeout_secs = 5

[routes]
"play.example.com" = { kind = "on-demand" }
"*.lobby.example.com" = { kind = "local", host = "10.0.0.2", port = 25566 }

[on_demand]
instance_id = "mc-server"
service_port = 25565
idle_shutdown_secs = 900

[admission]
allowlist_enabled = true

[admission.rate_limit]
max_tokens = 5
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 25570);
        assert_eq!(config.server.handshake_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes["play.example.com"].kind, RouteKind::OnDemand);
        assert!(config.routes["play.example.com"].admission());
        assert!(!config.routes["*.lobby.example.com"].admission());

        let on_demand = config.on_demand.unwrap();
        assert_eq!(on_demand.provider, ProviderKind::Docker);
        assert_eq!(on_demand.idle_shutdown(), Duration::from_secs(900));
        assert_eq!(on_demand.poll_interval(), Duration::from_secs(5));

        assert!(config.admission.allowlist_enabled);
        assert_eq!(config.admission.rate_limit.max_tokens, 5);
        assert_eq!(config.admission.rate_limit.refill_tokens, 1);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 25565);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9999);
        assert!(config.routes.is_empty());
        assert!(config.on_demand.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_admission_defaults() {
        let admission = AdmissionConfig::default();

        assert_eq!(admission.rate_limit.max_tokens, 3);
        assert_eq!(admission.rate_limit.refill_tokens, 1);
        assert_eq!(admission.rate_limit.refill_interval(), Duration::from_secs(15));
        assert_eq!(admission.rate_limit.initial_tokens, 1);
        assert_eq!(admission.ban.failure_window(), Duration::from_secs(600));
        assert_eq!(admission.ban.max_failures, 5);
        assert_eq!(admission.ban.ban_duration(), Duration::from_secs(1800));
        assert!(!admission.allowlist_enabled);
    }

    #[test]
    fn test_handshake_timeout_zero_disables() {
        let config: Config = toml::from_str("[server]\nhandshake_timeout_secs = 0\n").unwrap();
        assert_eq!(config.server.handshake_timeout(), None);
    }

    #[test]
    fn test_on_demand_route_requires_section() {
        let toml = r#"
[routes]
"mc.example.com" = { kind = "on-demand" }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("require an [on_demand] section"));
    }

    #[test]
    fn test_local_route_requires_host_and_port() {
        let toml = r#"
[routes]
"a.example.com" = { kind = "local", port = 25565 }
"b.example.com" = { kind = "local", host = "10.0.0.1" }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'a.example.com': local route requires 'host' field"));
        assert!(err.contains("'b.example.com': local route requires 'port' greater than 0"));
    }

    #[test]
    fn test_colliding_patterns_rejected() {
        let toml = r#"
[routes]
"play.example.com" = { kind = "local", host = "10.0.0.1", port = 25565 }
"WWW.Play.Example.com." = { kind = "local", host = "10.0.0.2", port = 25565 }
"*.example.com" = { kind = "local", host = "10.0.0.3", port = 25565 }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Routes 'WWW.Play.Example.com.', 'play.example.com' all normalize to 'play.example.com'"));
        assert!(!err.contains("*.example.com"));
    }

    #[test]
    fn test_bad_wildcard_rejected() {
        let route = RouteConfig::local("10.0.0.1", 25565);
        assert!(route.validate("*.example.com").is_ok());
        assert!(route.validate("mc.*.example.com").is_err());
        assert!(route.validate("*example.com").is_err());
        assert!(route.validate("  ").is_err());
    }

    #[test]
    fn test_initial_tokens_cannot_exceed_max() {
        let toml = r#"
[admission.rate_limit]
max_tokens = 2
initial_tokens = 3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'initial_tokens' (3) must not exceed 'max_tokens' (2)"));
    }

    #[test]
    fn test_static_provider_requires_address() {
        let toml = r#"
[on_demand]
provider = "static"
instance_id = "fixed"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("static provider requires 'address'"));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let toml = r#"
[on_demand]
instance_id = "mc"
poll_interval_ms = 0
idle_tick_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'poll_interval_ms' must be greater than 0"));
        assert!(err.contains("'idle_tick_secs' must be greater than 0"));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let toml = r#"
[server]
connect_timeout_ms = 9223372036854775807

[on_demand]
instance_id = "mc"
idle_shutdown_secs = 9223372036854775807
start_debounce_secs = 31536001

[admission.ban]
ban_duration_secs = 9223372036854775807
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server: 'connect_timeout_ms' must be at most 31536000000"));
        assert!(err.contains("on_demand: 'idle_shutdown_secs' must be at most 31536000"));
        assert!(err.contains("on_demand: 'start_debounce_secs' must be at most 31536000"));
        assert!(err.contains("admission.ban: 'ban_duration_secs' must be at most 31536000"));

        let too_many: Config = toml::from_str("[admission]\nmax_tracked_ips = 100001\n").unwrap();
        let err = too_many.validate().unwrap_err().to_string();
        assert!(err.contains("admission: 'max_tracked_ips' must be at most 100000"));

        let ok: Config = toml::from_str("[admission.ban]\nban_duration_secs = 31536000\n").unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_friendly_messages() {
        let toml = r#"
[friendly]
base_port = 30000
[friendly.messages]
starting = "Booting!"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.friendly.base_port, 30000);
        assert_eq!(config.friendly.messages.message(DenialCode::Starting), "Booting!");
        assert_eq!(
            config.friendly.messages.message(DenialCode::NoRoute),
            "No server is configured for this address."
        );
    }

    #[test]
    fn test_route_kind_aliases() {
        let route: RouteConfig = toml::from_str("kind = \"on_demand\"").unwrap();
        assert_eq!(route.kind, RouteKind::OnDemand);
        assert_eq!(route.target(), RouteTarget::OnDemand);

        let route: RouteConfig = toml::from_str("kind = \"local\"\nhost = \"h\"\nport = 1\nadmission = true").unwrap();
        assert!(route.admission());
        assert_eq!(
            route.target(),
            RouteTarget::Local {
                host: "h".to_string(),
                port: 1
            }
        );
    }
}
