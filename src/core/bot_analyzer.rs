//! Behavioral bot detection keyed by header fingerprint.
//!
//! Every fingerprint keeps a bounded request history. Each time a full sample
//! of new requests has accumulated, the sample is scored for URL repetition,
//! machine-speed timing and missing browser headers. Findings add to a
//! cumulative suspicion score; a clean sample lets it decay.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use dashmap::DashMap;
use log::{debug, warn};
use crate::core::block_registry::BlockRegistry;
use crate::core::fingerprint::header_digest;
use crate::core::patterns::{PatternError, PatternSet};
use crate::core::request::RequestDescriptor;
use crate::models::BotConfig;

/// Headers every mainstream browser sends.
pub const BROWSER_HEADERS: &[&str] = &["user-agent", "accept", "accept-language", "accept-encoding"];

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub timestamp: u64,
    pub path: String,
    pub method: String,
    pub header_digest: String,
}

#[derive(Debug, Clone)]
pub struct BehaviorProfile {
    /// Identity that produced this fingerprint
    pub client_id: String,
    /// Oldest first, capped at `history_size`
    pub history: VecDeque<RequestRecord>,
    pub suspicion_score: f64,
    /// Requests recorded since the last scored sample
    pending: usize,
}

impl BehaviorProfile {
    fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            history: VecDeque::new(),
            suspicion_score: 0.0,
            pending: 0,
        }
    }

    fn last_seen(&self) -> u64 {
        self.history.back().map(|r| r.timestamp).unwrap_or_default()
    }
}

/// Findings for one sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFindings {
    pub unique_url_ratio: f64,
    pub average_gap_ms: f64,
    pub missing_headers: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotVerdict {
    Allow,
    /// User agent matches a known bot signature
    BotDetected,
    /// Suspicion crossed the threshold; the client has been blocked
    Suspicious { retry_after: u64 },
}

pub struct BotBehaviorAnalyzer {
    config: BotConfig,
    signatures: PatternSet,
    allowed_crawlers: PatternSet,
    profiles: DashMap<String, BehaviorProfile>,
    registry: Arc<BlockRegistry>,
}

impl BotBehaviorAnalyzer {
    pub fn new(config: BotConfig, registry: Arc<BlockRegistry>) -> Result<Self, PatternError> {
        Ok(Self {
            signatures: PatternSet::compile(&config.bot_signatures)?,
            allowed_crawlers: PatternSet::compile(&config.allowed_crawlers)?,
            config,
            profiles: DashMap::new(),
            registry,
        })
    }

    /// True for a known bot signature that is not an allowed crawler.
    pub fn is_known_bot(&self, user_agent: &str) -> bool {
        self.signatures.is_match(user_agent) && !self.allowed_crawlers.is_match(user_agent)
    }

    pub fn analyze(
        &self,
        fingerprint: &str,
        client_id: &str,
        req: &RequestDescriptor,
        now: u64,
    ) -> BotVerdict {
        if req.user_agent().map(|ua| self.is_known_bot(ua)).unwrap_or(false) {
            debug!("Known bot signature from {}", client_id);
            return BotVerdict::BotDetected;
        }

        let record = RequestRecord {
            timestamp: now,
            path: req.path.clone(),
            method: req.method.clone(),
            header_digest: header_digest(req),
        };
        let missing_headers = BROWSER_HEADERS
            .iter()
            .filter(|name| req.header(name).map(str::trim).unwrap_or_default().is_empty())
            .count();

        let (findings, suspicion) = {
            let mut profile = self
                .profiles
                .entry(fingerprint.to_string())
                .or_insert_with(|| BehaviorProfile::new(client_id));

            profile.history.push_back(record);
            while profile.history.len() > self.config.history_size {
                profile.history.pop_front();
            }
            profile.pending += 1;
            if profile.pending < self.config.sample_size {
                return BotVerdict::Allow;
            }
            profile.pending = 0;

            let findings = self.score_sample(&profile.history, missing_headers);
            if findings.score > 0.0 {
                profile.suspicion_score += findings.score;
            } else {
                profile.suspicion_score =
                    (profile.suspicion_score - self.config.suspicion_decay).max(0.0);
            }
            (findings, profile.suspicion_score)
        };

        debug!(
            "Behavior sample for {}: ratio {:.2}, gap {:.0}ms, missing {} -> +{} (total {})",
            client_id,
            findings.unique_url_ratio,
            findings.average_gap_ms,
            findings.missing_headers,
            findings.score,
            suspicion
        );

        if suspicion > self.config.block_threshold {
            warn!("Suspicious behavior from {} (suspicion {})", client_id, suspicion);
            let entry = self
                .registry
                .block(client_id, self.config.block_ms, "bot_behavior", now);
            return BotVerdict::Suspicious {
                retry_after: entry.retry_after_secs(now),
            };
        }
        BotVerdict::Allow
    }

    /// Score the most recent `sample_size` records.
    fn score_sample(&self, history: &VecDeque<RequestRecord>, missing_headers: usize) -> SampleFindings {
        let sample: Vec<&RequestRecord> = history
            .iter()
            .skip(history.len().saturating_sub(self.config.sample_size))
            .collect();
        let mut findings = SampleFindings {
            missing_headers,
            ..Default::default()
        };
        if sample.is_empty() {
            return findings;
        }

        let distinct: HashSet<&str> = sample.iter().map(|r| r.path.as_str()).collect();
        findings.unique_url_ratio = distinct.len() as f64 / sample.len() as f64;
        if findings.unique_url_ratio < self.config.min_unique_url_ratio {
            findings.score += self.config.repetition_penalty;
        }

        if sample.len() > 1 {
            let span = sample[sample.len() - 1]
                .timestamp
                .saturating_sub(sample[0].timestamp);
            findings.average_gap_ms = span as f64 / (sample.len() - 1) as f64;
            if findings.average_gap_ms < self.config.min_average_gap_ms as f64 {
                findings.score += self.config.timing_penalty;
            }
        }

        if missing_headers > self.config.missing_headers_threshold {
            findings.score += self.config.missing_headers_penalty;
        }
        findings
    }

    pub fn suspicion_score(&self, fingerprint: &str) -> Option<f64> {
        self.profiles.get(fingerprint).map(|p| p.suspicion_score)
    }

    pub fn history_len(&self, fingerprint: &str) -> usize {
        self.profiles.get(fingerprint).map(|p| p.history.len()).unwrap_or_default()
    }

    /// Drop every profile produced by `client_id`.
    pub fn forget_client(&self, client_id: &str) -> usize {
        let mut removed = 0;
        self.profiles.retain(|_, profile| {
            let keep = profile.client_id != client_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Evict profiles with no request in the last `stale_after_ms`.
    pub fn evict_stale(&self, now: u64, stale_after_ms: u64) -> usize {
        let mut removed = 0;
        self.profiles.retain(|_, profile| {
            let keep = now.saturating_sub(profile.last_seen()) <= stale_after_ms;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
