//! Injection scanning for query parameters and request bodies.
//!
//! SQL injection indicators reject the request and block the client for a
//! long time without any scoring. Script injection is stripped in place and
//! the request continues.

use std::sync::Arc;
use log::warn;
use serde_json::Value;
use crate::core::block_registry::BlockRegistry;
use crate::core::error::ShieldError;
use crate::core::patterns::{PatternError, PatternSet};
use crate::core::request::RequestDescriptor;
use crate::models::PayloadConfig;

pub struct PayloadInspector {
    config: PayloadConfig,
    sql: PatternSet,
    xss: PatternSet,
    registry: Arc<BlockRegistry>,
}

impl PayloadInspector {
    pub fn new(config: PayloadConfig, registry: Arc<BlockRegistry>) -> Result<Self, PatternError> {
        Ok(Self {
            sql: PatternSet::compile(&config.sql_patterns)?,
            xss: PatternSet::compile(&config.xss_patterns)?,
            config,
            registry,
        })
    }

    /// Scan and sanitize `req` in place.
    ///
    /// Returns whether anything was stripped. SQL indicators anywhere in the
    /// query or body fail with `InjectionDetected` after blocking the client.
    pub fn inspect(
        &self,
        client_id: &str,
        req: &mut RequestDescriptor,
        now: u64,
    ) -> Result<bool, ShieldError> {
        let sql_hit = req
            .query
            .iter()
            .any(|(name, value)| self.sql.is_match(name) || self.sql.is_match(value))
            || req
                .body
                .as_ref()
                .map(|body| self.contains_sql(body, 0))
                .unwrap_or(false);

        if sql_hit {
            warn!("SQL injection attempt from {} on {} {}", client_id, req.method, req.path);
            self.registry
                .block(client_id, self.config.injection_block_ms, "sql_injection", now);
            return Err(ShieldError::InjectionDetected);
        }

        let mut sanitized = false;
        for (_, value) in req.query.iter_mut() {
            if let Some(clean) = self.xss.strip(value) {
                *value = clean;
                sanitized = true;
            }
        }
        if let Some(body) = req.body.as_mut() {
            sanitized |= self.sanitize(body, 0);
        }
        if sanitized {
            warn!("Stripped script content from request by {} to {}", client_id, req.path);
            metrics::increment_counter!("shield_sanitized_payloads_total");
        }
        Ok(sanitized)
    }

    fn contains_sql(&self, value: &Value, depth: usize) -> bool {
        if depth > self.config.max_scan_depth {
            return false;
        }
        match value {
            Value::String(s) => self.sql.is_match(s),
            Value::Array(items) => items.iter().any(|v| self.contains_sql(v, depth + 1)),
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| self.sql.is_match(k) || self.contains_sql(v, depth + 1)),
            _ => false,
        }
    }

    fn sanitize(&self, value: &mut Value, depth: usize) -> bool {
        if depth > self.config.max_scan_depth {
            return false;
        }
        match value {
            Value::String(s) => match self.xss.strip(s) {
                Some(clean) => {
                    *s = clean;
                    true
                }
                None => false,
            },
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |acc, v| self.sanitize(v, depth + 1) | acc),
            Value::Object(map) => map
                .values_mut()
                .fold(false, |acc, v| self.sanitize(v, depth + 1) | acc),
            _ => false,
        }
    }
}
