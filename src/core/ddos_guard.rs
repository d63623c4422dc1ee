//! Volumetric flood protection for the abuse shield.
//!
//! Each client gets a fixed counting window and a decaying violation score.
//! The score shrinks the client's request allowance exponentially and
//! lengthens the block it receives when it goes over, so repeat offenders are
//! throttled far harder than a one-off burst.

use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use log::{debug, warn};
use crate::core::block_registry::BlockRegistry;
use crate::core::patterns::{PatternError, PatternSet};
use crate::models::DdosConfig;

/// Per-client counter state
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCounter {
    /// Requests seen in the current window
    pub count: u32,
    /// Window start (milliseconds)
    pub window_start: u64,
    /// Decaying abuse score, never negative
    pub violation_score: f64,
    /// Time of the previous request, `None` on first sight
    pub last_request: Option<u64>,
    /// Duration of the most recent block this guard imposed (milliseconds)
    pub last_block_ms: u64,
}

impl ClientCounter {
    fn new(now: u64) -> Self {
        Self {
            count: 0,
            window_start: now,
            violation_score: 0.0,
            last_request: None,
            last_block_ms: 0,
        }
    }

    fn last_seen(&self) -> u64 {
        self.last_request.unwrap_or(self.window_start)
    }
}

/// Result of a DDoS check
#[derive(Debug, Clone, PartialEq)]
pub enum DdosVerdict {
    /// Let the request through
    Allow,
    /// Let the request through after waiting
    Throttle(Duration),
    /// Over the limit; the client has been blocked
    Triggered { retry_after: u64, block_ms: u64 },
}

/// DDoS guard implementation
pub struct DdosGuard {
    /// DDoS guard configuration
    config: DdosConfig,
    /// Compiled suspicious user-agent signatures
    suspicious_agents: PatternSet,
    /// Per-client counters
    counters: DashMap<String, ClientCounter>,
    /// Where over-limit clients are blocked
    registry: Arc<BlockRegistry>,
}

impl DdosGuard {
    /// Create a new DDoS guard instance
    pub fn new(config: DdosConfig, registry: Arc<BlockRegistry>) -> Result<Self, PatternError> {
        let suspicious_agents = PatternSet::compile(&config.suspicious_agents)?;
        Ok(Self {
            config,
            suspicious_agents,
            counters: DashMap::new(),
            registry,
        })
    }

    /// Limit for a client with the given violation score
    pub fn current_limit(&self, violation_score: f64) -> f64 {
        let shrunk = self.config.base_limit as f64 / 2f64.powf(violation_score);
        shrunk.max(self.config.min_limit as f64)
    }

    /// Block duration for a client with the given violation score
    pub fn block_duration(&self, violation_score: f64) -> u64 {
        let scaled = self.config.base_block_ms as f64 * 2f64.powf(violation_score);
        scaled.min(self.config.max_block_ms as f64) as u64
    }

    /// Count a request and decide whether it may proceed
    ///
    /// # Arguments
    ///
    /// * `client_id` - The resolved client identity
    /// * `user_agent` - The request's user agent, if any
    /// * `now` - Current time in milliseconds
    ///
    /// # Returns
    ///
    /// * `DdosVerdict::Allow` if the request should be allowed
    /// * `DdosVerdict::Throttle` if it should be allowed after a delay
    /// * `DdosVerdict::Triggered` if the client went over its limit and was blocked
    pub fn check(&self, client_id: &str, user_agent: Option<&str>, now: u64) -> DdosVerdict {
        let suspicious_agent = user_agent
            .map(|ua| self.suspicious_agents.is_match(ua))
            .unwrap_or(false);

        // The whole read-modify-write runs under the shard lock for this key.
        let (verdict, score) = {
            let mut counter = self
                .counters
                .entry(client_id.to_string())
                .or_insert_with(|| ClientCounter::new(now));

            if now.saturating_sub(counter.window_start) > self.config.window_ms {
                counter.count = 0;
                counter.window_start = now;
                counter.violation_score = (counter.violation_score - 1.0).max(0.0);
            }

            if let Some(last) = counter.last_request {
                if now.saturating_sub(last) < self.config.rapid_fire_gap_ms {
                    counter.violation_score += self.config.rapid_fire_penalty;
                }
            }
            if suspicious_agent {
                counter.violation_score += self.config.suspicious_agent_penalty;
            }
            counter.last_request = Some(now);

            let limit = self.current_limit(counter.violation_score);
            counter.count += 1;

            let verdict = if counter.count as f64 > limit {
                // each repeat offence at least doubles the previous block
                let block_ms = self
                    .block_duration(counter.violation_score)
                    .max(counter.last_block_ms.saturating_mul(2))
                    .min(self.config.max_block_ms);
                counter.last_block_ms = block_ms;
                DdosVerdict::Triggered {
                    retry_after: block_ms.div_ceil(1000),
                    block_ms,
                }
            } else if counter.violation_score > self.config.throttle_threshold {
                let delay = (self.config.throttle_step_ms as f64 * counter.violation_score)
                    .min(self.config.max_throttle_ms as f64);
                DdosVerdict::Throttle(Duration::from_millis(delay as u64))
            } else {
                DdosVerdict::Allow
            };
            (verdict, counter.violation_score)
        };

        match &verdict {
            DdosVerdict::Triggered { block_ms, .. } => {
                warn!(
                    "DDoS protection triggered for {} (violation score {:.1})",
                    client_id, score
                );
                self.registry.block(client_id, *block_ms, "ddos_protection", now);
            }
            DdosVerdict::Throttle(delay) => {
                debug!("Throttling {} by {:?} (violation score {:.1})", client_id, delay, score);
            }
            DdosVerdict::Allow => {}
        }
        verdict
    }

    /// Current violation score for a client
    pub fn violation_score(&self, client_id: &str) -> Option<f64> {
        self.counters.get(client_id).map(|c| c.violation_score)
    }

    /// Snapshot of a client's counter
    pub fn counter(&self, client_id: &str) -> Option<ClientCounter> {
        self.counters.get(client_id).map(|c| c.value().clone())
    }

    /// Forget everything about a client, including its escalation history
    ///
    /// # Arguments
    ///
    /// * `client_id` - The client to reset
    pub fn reset_detection(&self, client_id: &str) {
        self.counters.remove(client_id);
    }

    /// Evict counters idle for longer than `stale_after_ms`
    pub fn evict_stale(&self, now: u64, stale_after_ms: u64) -> usize {
        let mut removed = 0;
        self.counters.retain(|_, counter| {
            let keep = now.saturating_sub(counter.last_seen()) <= stale_after_ms;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
