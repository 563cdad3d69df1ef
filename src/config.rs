use crate::resolver::{normalize_host, validate_identifier};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the dispatcher
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Platform domain and dispatch entry points
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Reserved identifiers
    #[serde(default)]
    pub reserved: ReservedConfig,

    /// Custom domain store and cache
    #[serde(default)]
    pub domains: DomainsConfig,

    /// Bearer credential verification
    #[serde(default)]
    pub auth: AuthConfig,

    /// Admission quotas
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Target invocation
    #[serde(default)]
    pub invoke: InvokeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 8443 when TLS is configured)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the loopback admin API (health, stats, cache invalidation)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Token for authenticated admin endpoints.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per target (default: 32)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(8443)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// The platform's own wildcard domain: `<id>.<domain>` is wildcard dispatch
    #[serde(default = "default_platform_domain")]
    pub domain: String,

    /// Path prefix for path and query dispatch
    #[serde(default = "default_dispatch_prefix")]
    pub dispatch_prefix: String,

    /// Query parameter naming the target for query dispatch
    #[serde(default = "default_query_param")]
    pub query_param: String,

    /// Hosts on which path/query dispatch is recognised (empty = any host)
    #[serde(default)]
    pub dispatch_hosts: Vec<String>,

    /// Maximum target identifier length
    #[serde(default = "default_max_identifier_len")]
    pub max_identifier_len: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            domain: default_platform_domain(),
            dispatch_prefix: default_dispatch_prefix(),
            query_param: default_query_param(),
            dispatch_hosts: Vec::new(),
            max_identifier_len: default_max_identifier_len(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReservedConfig {
    /// Identifiers that may never be dispatched to
    #[serde(default = "default_reserved_names")]
    pub names: Vec<String>,

    /// Reserved identifiers still reachable via path/query dispatch
    #[serde(default)]
    pub internal_allow: Vec<String>,
}

impl Default for ReservedConfig {
    fn default() -> Self {
        Self {
            names: default_reserved_names(),
            internal_allow: Vec::new(),
        }
    }
}

/// Backing store for custom domain records
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DomainStoreKind {
    /// Records listed in this file (default)
    #[default]
    Static,
    /// SQLite database maintained by the platform's domain verification flow
    Sqlite,
}

/// A custom domain record declared inline in the config
#[derive(Debug, Deserialize, Clone)]
pub struct DomainRecordConfig {
    pub host: String,
    pub target: String,
    #[serde(default = "default_true")]
    pub verified: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DomainsConfig {
    #[serde(default)]
    pub store: DomainStoreKind,

    /// SQLite database path (required when store = "sqlite")
    pub database: Option<String>,

    /// Time-to-live for a positive cache entry in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Time-to-live for a cached "not routable" answer in seconds
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,

    /// Timeout for one store lookup in milliseconds
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,

    /// Interval between sweeps of expired cache entries
    #[serde(default = "default_domain_purge_interval")]
    pub purge_interval_secs: u64,

    /// Inline records for the static store
    #[serde(default)]
    pub records: Vec<DomainRecordConfig>,
}

impl DomainsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            store: DomainStoreKind::default(),
            database: None,
            cache_ttl_secs: default_cache_ttl(),
            negative_ttl_secs: default_negative_ttl(),
            lookup_timeout_ms: default_lookup_timeout(),
            purge_interval_secs: default_domain_purge_interval(),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC secret for bearer JWTs. If not set, a random secret is generated
    /// at startup, which rejects every credential.
    pub jwt_secret: Option<String>,

    /// Required `iss` claim
    pub issuer: Option<String>,

    /// Required `aud` claim
    pub audience: Option<String>,

    /// Clock skew tolerance for `exp`/`nbf` in seconds
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,

    /// Timeout for one verification in milliseconds
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,
}

impl AuthConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway(),
            verify_timeout_ms: default_verify_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests admitted per identity and target in one window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u64,

    /// Quota for anonymous callers (defaults to `requests_per_window`)
    pub anonymous_requests_per_window: Option<u64>,

    /// Fixed window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Interval between sweeps of expired windows
    #[serde(default = "default_rate_purge_interval")]
    pub purge_interval_secs: u64,
}

impl RateLimitConfig {
    pub fn anonymous_quota(&self) -> u64 {
        self.anonymous_requests_per_window
            .unwrap_or(self.requests_per_window)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: default_requests_per_window(),
            anonymous_requests_per_window: None,
            window_secs: default_window_secs(),
            purge_interval_secs: default_rate_purge_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InvokeConfig {
    /// Max time to wait for a target to respond, per attempt
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delay before the single retry of a transient failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Largest request body buffered so it can be replayed on retry
    #[serde(default = "default_max_retry_body_bytes")]
    pub max_retry_body_bytes: usize,

    /// Upstream authority for targets not listed in `targets`,
    /// e.g. "{target}.apps.internal:8080"
    pub upstream_template: Option<String>,

    /// Explicit target -> upstream authority map
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

impl InvokeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            max_retry_body_bytes: default_max_retry_body_bytes(),
            upstream_template: None,
            targets: HashMap::new(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_platform_domain() -> String {
    "platform.dev".to_string()
}

fn default_dispatch_prefix() -> String {
    "/dispatch".to_string()
}

fn default_query_param() -> String {
    "worker".to_string()
}

fn default_max_identifier_len() -> usize {
    63 // one DNS label
}

fn default_reserved_names() -> Vec<String> {
    [
        "admin", "api", "app", "assets", "auth", "billing", "cdn", "dashboard", "dispatch",
        "docs", "health", "internal", "login", "mail", "platform", "root", "static", "status",
        "support", "www",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_negative_ttl() -> u64 {
    10
}

fn default_lookup_timeout() -> u64 {
    500
}

fn default_domain_purge_interval() -> u64 {
    60
}

fn default_leeway() -> u64 {
    30
}

fn default_verify_timeout() -> u64 {
    200
}

fn default_requests_per_window() -> u64 {
    600
}

fn default_window_secs() -> u64 {
    60
}

fn default_rate_purge_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_max_retry_body_bytes() -> usize {
    64 * 1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let max_len = self.platform.max_identifier_len;

        if normalize_host(&self.platform.domain).as_deref() != Some(self.platform.domain.as_str()) {
            errors.push(format!(
                "platform.domain '{}' must be a lowercase host name",
                self.platform.domain
            ));
        }

        let prefix = &self.platform.dispatch_prefix;
        if !prefix.starts_with('/') || prefix.ends_with('/') || prefix.len() < 2 {
            errors.push(format!(
                "platform.dispatch_prefix '{}' must start with '/' and not end with '/'",
                prefix
            ));
        }

        if self.platform.query_param.is_empty() {
            errors.push("platform.query_param must not be empty".to_string());
        }

        if max_len == 0 || max_len > 63 {
            errors.push("platform.max_identifier_len must be between 1 and 63".to_string());
        }

        for name in self.reserved.internal_allow.iter() {
            if !self.reserved.names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                errors.push(format!(
                    "reserved.internal_allow '{}' is not a reserved name",
                    name
                ));
            }
        }

        if self.domains.store == DomainStoreKind::Sqlite && self.domains.database.is_none() {
            errors.push("domains.database is required when domains.store = \"sqlite\"".to_string());
        }

        if self.domains.negative_ttl_secs > self.domains.cache_ttl_secs {
            errors.push("domains.negative_ttl_secs must not exceed domains.cache_ttl_secs".to_string());
        }

        for record in &self.domains.records {
            if normalize_host(&record.host).is_none() {
                errors.push(format!("domains.records host '{}' is invalid", record.host));
            }
            if validate_identifier(&record.target, max_len).is_none() {
                errors.push(format!(
                    "domains.records '{}': target '{}' is not a valid identifier",
                    record.host, record.target
                ));
            }
        }

        if self.rate_limit.window_secs == 0 {
            errors.push("rate_limit.window_secs must be greater than 0".to_string());
        }

        if self.rate_limit.requests_per_window == 0 || self.rate_limit.anonymous_quota() == 0 {
            errors.push("rate_limit quotas must be greater than 0".to_string());
        }

        if let Some(template) = &self.invoke.upstream_template {
            if !template.contains("{target}") {
                errors.push("invoke.upstream_template must contain '{target}'".to_string());
            }
        }

        for target in self.invoke.targets.keys() {
            if validate_identifier(target, max_len).is_none() {
                errors.push(format!("invoke.targets key '{}' is not a valid identifier", target));
            }
        }

        if self.invoke.request_timeout_secs == 0 {
            errors.push("invoke.request_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
