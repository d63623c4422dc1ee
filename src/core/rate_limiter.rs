//! Adaptive rate limiting for the abuse shield.
//!
//! This module provides a sliding-window limiter that keeps the timestamps of
//! admitted requests per key. The effective ceiling is adjusted from the
//! timing of recent requests: machine-regular clients get a smaller quota,
//! clients with relaxed pacing a larger one.

use std::collections::VecDeque;
use std::sync::Arc;
use dashmap::DashMap;
use thiserror::Error;
use crate::core::error::ShieldError;
use crate::core::request::{RateLimitStatus, RequestDescriptor};
use crate::models::{RateLimitConfig, RouteLimit};
use crate::utils::format_rate_limit_key;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    ExceededLimit { retry_after: u64, limit: u32 },
}

impl From<RateLimitError> for ShieldError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::ExceededLimit { retry_after, limit } => {
                ShieldError::RateLimitExceeded { retry_after, limit }
            }
        }
    }
}

/// How a key's recent traffic looks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    /// Near-constant gaps between requests
    Automated,
    Normal,
    /// Slow, human-paced requests
    Trusted,
}

/// Derives the limiter key from a request and its resolved client identity
pub type KeyFn = Arc<dyn Fn(&RequestDescriptor, &str) -> String + Send + Sync>;

/// Rate limiter implementation backed by in-memory timestamp queues
pub struct RateLimiter {
    /// Key prefix separating this limiter's windows from others
    prefix: String,
    /// Only paths starting with this prefix are limited
    path_prefix: Option<String>,
    window_ms: u64,
    max_requests: u32,
    /// Rate limit configuration
    config: RateLimitConfig,
    windows: DashMap<String, VecDeque<u64>>,
    key_fn: KeyFn,
}

impl RateLimiter {
    /// Create a new rate limiter instance covering every path
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            prefix: "rate_limit".to_string(),
            path_prefix: None,
            window_ms: config.window_secs * 1000,
            max_requests: config.max_requests,
            config,
            windows: DashMap::new(),
            key_fn: default_key_fn(),
        }
    }

    /// Create a limiter that only applies under `route.path_prefix`
    pub fn for_route(config: RateLimitConfig, route: &RouteLimit) -> Self {
        Self {
            prefix: format_rate_limit_key("route_limit", &route.path_prefix),
            path_prefix: Some(route.path_prefix.clone()),
            window_ms: route.window_secs * 1000,
            max_requests: route.max_requests,
            config,
            windows: DashMap::new(),
            key_fn: default_key_fn(),
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.set_key_fn(key_fn);
        self
    }

    pub fn set_key_fn(&mut self, key_fn: KeyFn) {
        self.key_fn = key_fn;
    }

    pub fn applies_to(&self, path: &str) -> bool {
        self.path_prefix
            .as_deref()
            .map(|prefix| path.starts_with(prefix))
            .unwrap_or(true)
    }

    /// Storage key for a request
    pub fn key_for(&self, req: &RequestDescriptor, client_id: &str) -> String {
        format_rate_limit_key(&self.prefix, &(self.key_fn)(req, client_id))
    }

    /// Classify a key from its most recent timestamps
    pub fn classify(&self, timestamps: &VecDeque<u64>) -> TrafficClass {
        let sample = self.config.classification_sample;
        if timestamps.len() < sample {
            return TrafficClass::Normal;
        }
        let recent: Vec<u64> = timestamps.iter().skip(timestamps.len() - sample).copied().collect();
        let gaps: Vec<f64> = recent
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]) as f64)
            .collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean == 0.0 {
            return TrafficClass::Automated;
        }
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        if variance.sqrt() / mean <= self.config.automated_max_variation {
            TrafficClass::Automated
        } else if mean > self.config.trusted_min_average_gap_ms as f64 {
            TrafficClass::Trusted
        } else {
            TrafficClass::Normal
        }
    }

    /// Ceiling after adjusting for the traffic class
    pub fn effective_limit(&self, class: TrafficClass) -> u32 {
        let max = self.max_requests as f64;
        let adjusted = match class {
            TrafficClass::Automated => max * self.config.automated_multiplier,
            TrafficClass::Normal => max,
            TrafficClass::Trusted => max * self.config.trusted_multiplier,
        };
        (adjusted.floor() as u32).max(1)
    }

    /// Check if a request should be rate limited
    ///
    /// # Arguments
    ///
    /// * `key` - The key to rate limit, as returned by `key_for`
    /// * `now` - Current time in milliseconds
    ///
    /// # Returns
    ///
    /// * `Ok(RateLimitStatus)` with the remaining quota if the request is allowed
    /// * `Err(RateLimitError::ExceededLimit)` if the rate limit has been exceeded
    pub fn check_rate_limit(&self, key: &str, now: u64) -> Result<RateLimitStatus, RateLimitError> {
        let mut window = self.windows.entry(key.to_string()).or_default();

        while let Some(&oldest) = window.front() {
            if now.saturating_sub(oldest) >= self.window_ms {
                window.pop_front();
            } else {
                break;
            }
        }

        let limit = self.effective_limit(self.classify(&window));
        if window.len() >= limit as usize {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = (oldest + self.window_ms).saturating_sub(now).div_ceil(1000).max(1);
            return Err(RateLimitError::ExceededLimit { retry_after, limit });
        }

        window.push_back(now);
        let oldest = window.front().copied().unwrap_or(now);
        Ok(RateLimitStatus {
            limit,
            remaining: limit - window.len() as u32,
            reset_at_ms: oldest + self.window_ms,
        })
    }

    /// Reset the rate limit for a given key
    ///
    /// # Arguments
    ///
    /// * `key` - The key to reset the rate limit for
    pub fn reset_rate_limit(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Remove windows whose timestamps have all aged out
    pub fn evict_stale(&self, now: u64) -> usize {
        let window_ms = self.window_ms;
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let keep = window
                .back()
                .map(|last| now.saturating_sub(*last) < window_ms)
                .unwrap_or(false);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

fn default_key_fn() -> KeyFn {
    Arc::new(|_req: &RequestDescriptor, client_id: &str| client_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_secs: u64, max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_secs,
            max_requests,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_rate_limiter() {
        let limiter = limiter(60, 2);

        // First request should succeed
        assert!(limiter.check_rate_limit("test_key", 0).is_ok());

        // Second request should succeed
        assert!(limiter.check_rate_limit("test_key", 10).is_ok());

        // Third request should fail
        assert!(matches!(
            limiter.check_rate_limit("test_key", 20),
            Err(RateLimitError::ExceededLimit { .. })
        ));

        // Reset should allow new requests
        limiter.reset_rate_limit("test_key");
        assert!(limiter.check_rate_limit("test_key", 30).is_ok());
    }

    #[test]
    fn test_hundred_and_first_request_rejected() {
        let limiter = limiter(60, 100);
        let mut now = 1_000_000;
        for i in 0..100 {
            // jittered gaps so the key is not classified as automated
            now += if i % 2 == 0 { 50 } else { 150 };
            let status = limiter.check_rate_limit("client", now).unwrap();
            assert_eq!(status.remaining, 99 - i);
        }
        now += 50;
        let err = limiter.check_rate_limit("client", now).unwrap_err();
        let RateLimitError::ExceededLimit { retry_after, limit } = err;
        assert_eq!(limit, 100);
        // first request at 1_000_050, now is 1_010_050
        assert_eq!(retry_after, 50);
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(1, 2);
        assert!(limiter.check_rate_limit("k", 0).is_ok());
        assert!(limiter.check_rate_limit("k", 100).is_ok());
        assert!(limiter.check_rate_limit("k", 500).is_err());
        assert!(limiter.check_rate_limit("k", 1_000).is_ok());
    }

    #[test]
    fn test_classification() {
        let limiter = limiter(900, 100);
        let regular: VecDeque<u64> = (0..10).map(|i| i * 200).collect();
        assert_eq!(limiter.classify(&regular), TrafficClass::Automated);

        let relaxed: VecDeque<u64> = [0, 1_500, 4_000, 5_200, 8_000, 9_100, 12_000, 13_900, 15_000, 18_000]
            .into_iter()
            .collect();
        assert_eq!(limiter.classify(&relaxed), TrafficClass::Trusted);

        let short: VecDeque<u64> = (0..5).map(|i| i * 200).collect();
        assert_eq!(limiter.classify(&short), TrafficClass::Normal);

        assert_eq!(limiter.effective_limit(TrafficClass::Automated), 30);
        assert_eq!(limiter.effective_limit(TrafficClass::Trusted), 150);
    }

    #[test]
    fn test_metronome_client_gets_reduced_quota() {
        let limiter = limiter(900, 100);
        let mut admitted = 0;
        for i in 0..100u64 {
            if limiter.check_rate_limit("bot", i * 300).is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 30);
    }

    #[test]
    fn test_route_limiter_and_custom_key() {
        let route = RouteLimit {
            path_prefix: "/auth".into(),
            window_secs: 60,
            max_requests: 5,
        };
        let limiter = RateLimiter::for_route(RateLimitConfig::default(), &route)
            .with_key_fn(Arc::new(|req: &RequestDescriptor, _: &str| req.path.clone()));
        assert!(limiter.applies_to("/auth/login"));
        assert!(!limiter.applies_to("/public"));
        let req = RequestDescriptor::new("POST", "/auth/login");
        assert_eq!(limiter.key_for(&req, "1.2.3.4"), "route_limit:/auth:/auth/login");
    }

    #[test]
    fn test_evict_stale() {
        let limiter = limiter(60, 10);
        limiter.check_rate_limit("old", 0).unwrap();
        limiter.check_rate_limit("new", 100_000).unwrap();
        assert_eq!(limiter.evict_stale(100_000), 1);
        assert_eq!(limiter.len(), 1);
    }
}
