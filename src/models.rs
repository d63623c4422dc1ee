use serde::{Deserialize, Serialize};
use config::ConfigError;
use crate::core::patterns::{
    DEFAULT_ALLOWED_CRAWLERS, DEFAULT_BOT_SIGNATURES, DEFAULT_SQL_PATTERNS,
    DEFAULT_SUSPICIOUS_AGENTS, DEFAULT_XSS_PATTERNS,
};

fn owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Protected application the shield forwards allowed requests to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream service
    pub url: String,
    /// Upstream request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// Headers consulted when resolving a client identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub forwarded_for_header: String,
    pub real_ip_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            forwarded_for_header: "x-forwarded-for".to_string(),
            real_ip_header: "x-real-ip".to_string(),
        }
    }
}

/// DDoS guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosConfig {
    /// Whether the stage runs at all
    pub enabled: bool,
    /// Counting window (milliseconds)
    pub window_ms: u64,
    /// Requests per window for a client with a zero violation score
    pub base_limit: u32,
    /// Floor for the shrinking per-client limit
    pub min_limit: u32,
    /// Requests closer together than this count as rapid fire (milliseconds)
    pub rapid_fire_gap_ms: u64,
    /// Violation points per rapid-fire request
    pub rapid_fire_penalty: f64,
    /// Violation points per request with a suspicious user agent
    pub suspicious_agent_penalty: f64,
    /// User-agent patterns that add `suspicious_agent_penalty`
    pub suspicious_agents: Vec<String>,
    /// Block duration at violation score zero (milliseconds)
    pub base_block_ms: u64,
    /// Upper bound for any DDoS block (milliseconds)
    pub max_block_ms: u64,
    /// Violation score above which allowed requests are delayed
    pub throttle_threshold: f64,
    /// Delay per violation point (milliseconds)
    pub throttle_step_ms: u64,
    /// Upper bound for the delay (milliseconds)
    pub max_throttle_ms: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            base_limit: 100,
            min_limit: 10,
            rapid_fire_gap_ms: 100,
            rapid_fire_penalty: 1.0,
            suspicious_agent_penalty: 2.0,
            suspicious_agents: owned(DEFAULT_SUSPICIOUS_AGENTS),
            base_block_ms: 60_000,
            max_block_ms: 300_000,
            throttle_threshold: 2.0,
            throttle_step_ms: 1_000,
            max_throttle_ms: 5_000,
        }
    }
}

/// Bot behavior analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub enabled: bool,
    /// Maximum history entries kept per fingerprint
    pub history_size: usize,
    /// Requests per scored sample
    pub sample_size: usize,
    /// Distinct-path ratio below which the sample looks repetitive
    pub min_unique_url_ratio: f64,
    pub repetition_penalty: f64,
    /// Average gap below which the sample looks scripted (milliseconds)
    pub min_average_gap_ms: u64,
    pub timing_penalty: f64,
    /// More than this many missing browser headers is suspicious
    pub missing_headers_threshold: usize,
    pub missing_headers_penalty: f64,
    /// Suspicion above this blocks the client
    pub block_threshold: f64,
    /// Block duration for behavioral blocks (milliseconds)
    pub block_ms: u64,
    /// Suspicion removed after a clean sample
    pub suspicion_decay: f64,
    /// User-agent patterns identifying automated clients
    pub bot_signatures: Vec<String>,
    /// User-agent patterns of crawlers that are let through
    pub allowed_crawlers: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_size: 100,
            sample_size: 10,
            min_unique_url_ratio: 0.5,
            repetition_penalty: 10.0,
            min_average_gap_ms: 500,
            timing_penalty: 15.0,
            missing_headers_threshold: 2,
            missing_headers_penalty: 20.0,
            block_threshold: 50.0,
            block_ms: 3_600_000,
            suspicion_decay: 10.0,
            bot_signatures: owned(DEFAULT_BOT_SIGNATURES),
            allowed_crawlers: owned(DEFAULT_ALLOWED_CRAWLERS),
        }
    }
}

/// Additional limiter applied to paths under a prefix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteLimit {
    pub path_prefix: String,
    pub window_secs: u64,
    pub max_requests: u32,
}

/// Adaptive rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Time window in seconds
    pub window_secs: u64,
    /// Requests allowed per window before adaptation
    pub max_requests: u32,
    /// Multiplier applied to clients with machine-like timing
    pub automated_multiplier: f64,
    /// Multiplier applied to clients with relaxed timing
    pub trusted_multiplier: f64,
    /// Number of recent timestamps used for classification
    pub classification_sample: usize,
    /// Gap coefficient of variation at or below which timing is machine-like
    pub automated_max_variation: f64,
    /// Average gap above which a client is trusted (milliseconds)
    pub trusted_min_average_gap_ms: u64,
    /// Extra per-prefix limiters
    pub route_limits: Vec<RouteLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 900,
            max_requests: 100,
            automated_multiplier: 0.3,
            trusted_multiplier: 1.5,
            classification_sample: 10,
            automated_max_variation: 0.1,
            trusted_min_average_gap_ms: 1_000,
            route_limits: Vec::new(),
        }
    }
}

/// Payload inspection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub enabled: bool,
    /// SQL injection indicators, evaluated in order
    pub sql_patterns: Vec<String>,
    /// Script injection indicators, stripped from payloads
    pub xss_patterns: Vec<String>,
    /// Block duration after an injection attempt (milliseconds)
    pub injection_block_ms: u64,
    /// Nesting depth beyond which values are not scanned
    pub max_scan_depth: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sql_patterns: owned(DEFAULT_SQL_PATTERNS),
            xss_patterns: owned(DEFAULT_XSS_PATTERNS),
            injection_block_ms: 86_400_000,
            max_scan_depth: 10,
        }
    }
}

/// Request size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeConfig {
    pub enabled: bool,
    /// Maximum body size in bytes
    pub max_content_length: u64,
    /// Maximum length of any string parameter (characters)
    pub max_string_length: usize,
    /// Maximum number of elements in any array
    pub max_array_length: usize,
    /// Maximum nesting depth of structured parameters
    pub max_depth: usize,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_content_length: 1_048_576,
            max_string_length: 1_000,
            max_array_length: 100,
            max_depth: 10,
        }
    }
}

/// Stale-state sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Sweep interval in seconds
    pub interval_secs: u64,
    /// Idle time after which per-client state is evicted (seconds)
    pub stale_after_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            stale_after_secs: 86_400,
        }
    }
}

/// Where block and unblock events are reported
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    Log,
    Redis,
    Webhook,
}

/// Audit collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    /// Redis connection URL (redis sink)
    pub redis_url: String,
    /// List receiving serialized events (redis sink)
    pub redis_key: String,
    /// Maximum events kept in the list (redis sink)
    pub max_entries: usize,
    /// Endpoint receiving events (webhook sink)
    pub webhook_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::Log,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key: "shield:audit".to_string(),
            max_entries: 10_000,
            webhook_url: None,
        }
    }
}

/// Everything the request pipeline needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub identity: IdentityConfig,
    pub ddos: DdosConfig,
    pub bot: BotConfig,
    pub rate_limit: RateLimitConfig,
    pub payload: PayloadConfig,
    pub size: SizeConfig,
    pub cleanup: CleanupConfig,
}

impl ShieldConfig {
    /// Reject settings that would make a stage meaningless or panic-prone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Message(message.to_string()))
        }

        if self.ddos.window_ms == 0 {
            return invalid("ddos.window_ms must be greater than 0");
        }
        if self.ddos.base_limit == 0 || self.ddos.min_limit == 0 {
            return invalid("ddos limits must be greater than 0");
        }
        if self.ddos.max_block_ms < self.ddos.base_block_ms {
            return invalid("ddos.max_block_ms must not be below ddos.base_block_ms");
        }
        if self.bot.sample_size < 2 || self.bot.history_size < self.bot.sample_size {
            return invalid("bot.sample_size must be at least 2 and fit in bot.history_size");
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_requests == 0 {
            return invalid("rate_limit window and max_requests must be greater than 0");
        }
        if self.rate_limit.classification_sample < 3 {
            return invalid("rate_limit.classification_sample must be at least 3");
        }
        for route in &self.rate_limit.route_limits {
            if route.window_secs == 0 || route.max_requests == 0 {
                return invalid("route limits need a non-zero window and max_requests");
            }
        }
        if self.size.max_depth == 0 {
            return invalid("size.max_depth must be greater than 0");
        }
        if self.cleanup.interval_secs == 0 {
            return invalid("cleanup.interval_secs must be greater than 0");
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream application
    pub upstream: UpstreamConfig,
    /// Audit collaborator
    pub audit: AuditConfig,
    /// Request pipeline
    pub shield: ShieldConfig,
}
