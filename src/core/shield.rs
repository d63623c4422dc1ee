//! The request pipeline.
//!
//! A [`Shield`] owns every piece of per-client state and runs the checks in a
//! fixed order: block registry, DDoS guard, behavior analysis, rate limits,
//! payload inspection, size limits. It is constructed explicitly and shared
//! behind an `Arc`; independent instances do not share state.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use log::{debug, error};
use serde::Serialize;
use crate::core::audit::AuditSink;
use crate::core::block_registry::{BlockEntry, BlockRegistry};
use crate::core::bot_analyzer::{BotBehaviorAnalyzer, BotVerdict};
use crate::core::ddos_guard::{DdosGuard, DdosVerdict};
use crate::core::error::ShieldError;
use crate::core::fingerprint::generate_fingerprint;
use crate::core::identity::ClientIdentityResolver;
use crate::core::patterns::PatternError;
use crate::core::payload_inspector::PayloadInspector;
use crate::core::rate_limiter::{KeyFn, RateLimiter};
use crate::core::request::{Allowance, RateLimitStatus, RequestDescriptor};
use crate::core::size_guard::SizeGuard;
use crate::models::ShieldConfig;
use crate::utils::{Clock, SystemClock};

/// A request that passed the block list and the DDoS guard.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub client_id: String,
    pub fingerprint: String,
    /// Wait imposed by the DDoS guard before the remaining checks
    pub delay: Option<Duration>,
}

/// Entries evicted by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub counters: usize,
    pub profiles: usize,
    pub blocks: usize,
    pub rate_windows: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.counters + self.profiles + self.blocks + self.rate_windows
    }
}

/// Sizes of the in-memory tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShieldStats {
    pub tracked_clients: usize,
    pub behavior_profiles: usize,
    pub active_blocks: usize,
    pub rate_windows: usize,
}

pub struct Shield {
    config: ShieldConfig,
    clock: Arc<dyn Clock>,
    identity: ClientIdentityResolver,
    registry: Arc<BlockRegistry>,
    ddos: DdosGuard,
    bots: BotBehaviorAnalyzer,
    rate_limiter: RateLimiter,
    route_limiters: Vec<RateLimiter>,
    inspector: PayloadInspector,
    size_guard: SizeGuard,
}

impl Shield {
    pub fn new(config: ShieldConfig, audit: Arc<dyn AuditSink>) -> Result<Self, PatternError> {
        Self::with_clock(config, audit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ShieldConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PatternError> {
        let registry = Arc::new(BlockRegistry::new(audit));
        let route_limiters = config
            .rate_limit
            .route_limits
            .iter()
            .map(|route| RateLimiter::for_route(config.rate_limit.clone(), route))
            .collect();

        Ok(Self {
            identity: ClientIdentityResolver::new(config.identity.clone()),
            ddos: DdosGuard::new(config.ddos.clone(), registry.clone())?,
            bots: BotBehaviorAnalyzer::new(config.bot.clone(), registry.clone())?,
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            route_limiters,
            inspector: PayloadInspector::new(config.payload.clone(), registry.clone())?,
            size_guard: SizeGuard::new(config.size.clone()),
            registry,
            clock,
            config,
        })
    }

    /// Replace how the general rate limiter derives its key.
    pub fn with_rate_limit_key(mut self, key_fn: KeyFn) -> Self {
        self.rate_limiter.set_key_fn(key_fn);
        self
    }

    pub fn config(&self) -> &ShieldConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Run the whole pipeline, waiting out any throttle delay.
    ///
    /// Dropping the returned future abandons a pending delay; shared state is
    /// already consistent at that point.
    pub async fn process(&self, req: &mut RequestDescriptor) -> Result<Allowance, ShieldError> {
        let result = match AssertUnwindSafe(self.run(req)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ShieldError::Internal("request pipeline panicked".to_string())),
        };

        match &result {
            Ok(allowance) => {
                metrics::increment_counter!("shield_requests_total", "outcome" => "allowed");
                if let Some(delay) = allowance.throttled_for {
                    debug!("Allowed {} after {:?}", allowance.client_id, delay);
                }
            }
            Err(e) => {
                metrics::increment_counter!("shield_requests_total", "outcome" => "rejected");
                metrics::increment_counter!("shield_rejections_total", "code" => e.code().as_str());
                match e {
                    ShieldError::Internal(detail) => {
                        error!("Internal error on {} {}: {}", req.method, req.path, detail)
                    }
                    other => debug!("Rejected {} {}: {}", req.method, req.path, other),
                }
            }
        }
        result
    }

    async fn run(&self, req: &mut RequestDescriptor) -> Result<Allowance, ShieldError> {
        let admission = self.admit(req)?;
        if let Some(delay) = admission.delay {
            tokio::time::sleep(delay).await;
        }
        self.inspect(admission, req)
    }

    /// Identity, block list and DDoS guard.
    pub fn admit(&self, req: &RequestDescriptor) -> Result<Admission, ShieldError> {
        let now = self.now();
        let client_id = self.identity.resolve(req);

        if let Some(entry) = self.registry.lookup(&client_id, now) {
            return Err(ShieldError::ClientBlocked {
                retry_after: entry.retry_after_secs(now),
                reason: entry.reason,
            });
        }

        let mut delay = None;
        if self.config.ddos.enabled {
            match self.ddos.check(&client_id, req.user_agent(), now) {
                DdosVerdict::Triggered { retry_after, .. } => {
                    return Err(ShieldError::DdosTriggered { retry_after })
                }
                DdosVerdict::Throttle(wait) => delay = Some(wait),
                DdosVerdict::Allow => {}
            }
        }

        Ok(Admission {
            fingerprint: generate_fingerprint(&client_id, req),
            client_id,
            delay,
        })
    }

    /// Behavior analysis, rate limits, payload inspection and size limits.
    pub fn inspect(
        &self,
        admission: Admission,
        req: &mut RequestDescriptor,
    ) -> Result<Allowance, ShieldError> {
        let now = self.now();
        let Admission {
            client_id,
            fingerprint,
            delay,
        } = admission;

        if self.config.bot.enabled {
            match self.bots.analyze(&fingerprint, &client_id, req, now) {
                BotVerdict::BotDetected => return Err(ShieldError::BotDetected),
                BotVerdict::Suspicious { retry_after } => {
                    return Err(ShieldError::SuspiciousBehavior { retry_after })
                }
                BotVerdict::Allow => {}
            }
        }

        let rate_limit = if self.config.rate_limit.enabled {
            self.check_rate_limits(&client_id, req, now)?
        } else {
            None
        };

        let sanitized = if self.config.payload.enabled {
            self.inspector.inspect(&client_id, req, now)?
        } else {
            false
        };

        if self.config.size.enabled {
            self.size_guard.check(req)?;
        }

        Ok(Allowance {
            client_id,
            fingerprint,
            rate_limit,
            sanitized,
            throttled_for: delay,
        })
    }

    /// Every applicable limiter must admit the request; the tightest quota is reported.
    fn check_rate_limits(
        &self,
        client_id: &str,
        req: &RequestDescriptor,
        now: u64,
    ) -> Result<Option<RateLimitStatus>, ShieldError> {
        let mut tightest: Option<RateLimitStatus> = None;
        let limiters = std::iter::once(&self.rate_limiter)
            .chain(self.route_limiters.iter())
            .filter(|limiter| limiter.applies_to(&req.path));
        for limiter in limiters {
            let status = limiter.check_rate_limit(&limiter.key_for(req, client_id), now)?;
            if tightest.map(|t| status.remaining < t.remaining).unwrap_or(true) {
                tightest = Some(status);
            }
        }
        Ok(tightest)
    }

    pub fn block(&self, client_id: &str, duration_ms: u64, reason: &str) -> BlockEntry {
        self.registry.block(client_id, duration_ms, reason, self.now())
    }

    /// Lift a block and forget the client's accumulated scores.
    ///
    /// Unknown or already unblocked ids are a no-op. Returns whether a block was lifted.
    pub fn unblock(&self, client_id: &str) -> bool {
        let lifted = self.registry.unblock(client_id, self.now());
        self.ddos.reset_detection(client_id);
        self.bots.forget_client(client_id);
        lifted
    }

    pub fn block_status(&self, client_id: &str) -> Option<BlockEntry> {
        self.registry.lookup(client_id, self.now())
    }

    pub fn violation_score(&self, client_id: &str) -> Option<f64> {
        self.ddos.violation_score(client_id)
    }

    pub fn suspicion_score(&self, fingerprint: &str) -> Option<f64> {
        self.bots.suspicion_score(fingerprint)
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(self.now())
    }

    /// Evict stale per-client state and expired blocks.
    pub fn sweep_at(&self, now: u64) -> SweepReport {
        let stale_after_ms = self.config.cleanup.stale_after_secs * 1000;
        let rate_windows = std::iter::once(&self.rate_limiter)
            .chain(self.route_limiters.iter())
            .map(|limiter| limiter.evict_stale(now))
            .sum();
        SweepReport {
            counters: self.ddos.evict_stale(now, stale_after_ms),
            profiles: self.bots.evict_stale(now, stale_after_ms),
            blocks: self.registry.purge_expired(now),
            rate_windows,
        }
    }

    pub fn stats(&self) -> ShieldStats {
        ShieldStats {
            tracked_clients: self.ddos.len(),
            behavior_profiles: self.bots.len(),
            active_blocks: self.registry.len(),
            rate_windows: std::iter::once(&self.rate_limiter)
                .chain(self.route_limiters.iter())
                .map(RateLimiter::len)
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::LogAuditSink;
    use crate::models::RouteLimit;
    use crate::utils::ManualClock;
    use serde_json::json;

    const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0)";

    fn shield(config: ShieldConfig) -> (Shield, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let shield = Shield::with_clock(config, Arc::new(LogAuditSink), clock.clone()).unwrap();
        (shield, clock)
    }

    fn browser(ip: &str, path: &str) -> RequestDescriptor {
        RequestDescriptor::new("GET", path)
            .with_header("X-Forwarded-For", ip)
            .with_header("User-Agent", UA)
            .with_header("Accept", "text/html")
            .with_header("Accept-Language", "en")
            .with_header("Accept-Encoding", "gzip")
    }

    #[tokio::test]
    async fn test_clean_request_allowed_with_headers() {
        let (shield, _) = shield(ShieldConfig::default());
        let allowance = shield.process(&mut browser("1.1.1.1", "/")).await.unwrap();
        assert_eq!(allowance.client_id, "1.1.1.1");
        assert_eq!(allowance.fingerprint.len(), 64);
        let status = allowance.rate_limit.unwrap();
        assert_eq!((status.limit, status.remaining), (100, 99));
        assert_eq!(allowance.response_headers().len(), 3);
    }

    #[tokio::test]
    async fn test_blocked_client_rejected_first() {
        let (shield, clock) = shield(ShieldConfig::default());
        shield.block("2.2.2.2", 30_000, "manual");
        let err = shield.process(&mut browser("2.2.2.2", "/")).await.unwrap_err();
        assert_eq!(
            err,
            ShieldError::ClientBlocked { reason: "manual".into(), retry_after: 30 }
        );
        // the rejected request never reached the DDoS guard
        assert!(shield.violation_score("2.2.2.2").is_none());

        clock.advance(30_000);
        assert!(shield.process(&mut browser("2.2.2.2", "/")).await.is_ok());
    }

    #[tokio::test]
    async fn test_bot_user_agent_rejected() {
        let (shield, _) = shield(ShieldConfig::default());
        let mut req = browser("3.3.3.3", "/").with_header("User-Agent", "Scrapy/2.11");
        let err = shield.process(&mut req).await.unwrap_err();
        assert_eq!(err.rejection().status, 403);
        assert_eq!(err.code().as_str(), "BOT_DETECTED");
    }

    #[tokio::test]
    async fn test_injection_rejected_then_client_blocked() {
        let (shield, _) = shield(ShieldConfig::default());
        let mut req = browser("4.4.4.4", "/search").with_query("q", "' OR '1'='1");
        assert_eq!(
            shield.process(&mut req).await.unwrap_err(),
            ShieldError::InjectionDetected
        );
        let err = shield.process(&mut browser("4.4.4.4", "/")).await.unwrap_err();
        assert_eq!(err.code().as_str(), "IP_BLOCKED");
    }

    #[tokio::test]
    async fn test_script_sanitized_and_allowed() {
        let (shield, _) = shield(ShieldConfig::default());
        let mut req = RequestDescriptor::new("POST", "/comments")
            .with_header("X-Forwarded-For", "5.5.5.5")
            .with_header("User-Agent", UA)
            .with_body(json!({"text": "hi<script>x()</script>"}));
        let allowance = shield.process(&mut req).await.unwrap();
        assert!(allowance.sanitized);
        assert_eq!(req.body.unwrap()["text"], "hi");
    }

    #[tokio::test]
    async fn test_oversized_parameter_rejected() {
        let (shield, _) = shield(ShieldConfig::default());
        let mut req = browser("6.6.6.6", "/").with_body(json!({"q": "a".repeat(2000)}));
        let err = shield.process(&mut req).await.unwrap_err();
        assert_eq!(err.code().as_str(), "PARAMETERS_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_route_limit_applies_only_under_prefix() {
        let mut config = ShieldConfig::default();
        config.rate_limit.route_limits.push(RouteLimit {
            path_prefix: "/auth".into(),
            window_secs: 60,
            max_requests: 2,
        });
        let (shield, clock) = shield(config);
        for _ in 0..2 {
            clock.advance(2_000);
            let allowance = shield.process(&mut browser("7.7.7.7", "/auth/login")).await.unwrap();
            assert_eq!(allowance.rate_limit.unwrap().limit, 2);
        }
        clock.advance(2_000);
        let err = shield.process(&mut browser("7.7.7.7", "/auth/login")).await.unwrap_err();
        assert!(matches!(err, ShieldError::RateLimitExceeded { limit: 2, .. }));
        clock.advance(2_000);
        assert!(shield.process(&mut browser("7.7.7.7", "/home")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unblock_resets_scores_and_is_idempotent() {
        let (shield, _) = shield(ShieldConfig::default());
        let mut req = browser("8.8.8.8", "/").with_header("User-Agent", "Mozilla/5.0 nikto");
        shield.process(&mut req).await.unwrap();
        assert_eq!(shield.violation_score("8.8.8.8"), Some(2.0));
        shield.block("8.8.8.8", 60_000, "manual");

        assert!(shield.unblock("8.8.8.8"));
        assert!(shield.violation_score("8.8.8.8").is_none());
        assert!(!shield.unblock("8.8.8.8"));
        assert!(!shield.unblock("never-seen"));
        assert!(shield.block_status("8.8.8.8").is_none());
    }

    #[tokio::test]
    async fn test_disabled_stages_are_skipped() {
        let mut config = ShieldConfig::default();
        config.bot.enabled = false;
        config.payload.enabled = false;
        let (shield, _) = shield(config);
        let mut req = browser("9.9.9.9", "/")
            .with_header("User-Agent", "curl/8.0")
            .with_query("q", "1 or 1=1");
        assert!(shield.process(&mut req).await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_stage_becomes_internal_error() {
        let (base, _) = shield(ShieldConfig::default());
        let shield = base.with_rate_limit_key(Arc::new(|_: &RequestDescriptor, _: &str| -> String {
            panic!("key derivation failed")
        }));

        let err = shield.process(&mut browser("12.12.12.12", "/")).await.unwrap_err();
        assert!(matches!(err, ShieldError::Internal(_)));
        let rejection = err.rejection();
        assert_eq!(rejection.status, 500);
        assert_eq!(rejection.message, "Internal server error");
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_state() {
        let (shield, clock) = shield(ShieldConfig::default());
        shield.process(&mut browser("10.0.0.1", "/")).await.unwrap();
        shield.block("10.0.0.2", 1_000, "manual");
        assert_eq!(shield.stats().tracked_clients, 1);

        clock.advance(86_400_001);
        let report = shield.sweep();
        assert_eq!(report.counters, 1);
        assert_eq!(report.profiles, 1);
        assert_eq!(report.blocks, 1);
        assert_eq!(report.rate_windows, 1);
        assert_eq!(report.total(), 4);
        assert_eq!(shield.stats(), ShieldStats::default());
    }
}
