//! Core functionality for the abuse shield.
//!
//! This module contains the protection pipeline and its stages: client
//! identity, the block registry, DDoS detection, behavioral bot analysis,
//! adaptive rate limiting, payload inspection and size limits.

pub mod audit;
pub mod block_registry;
pub mod bot_analyzer;
pub mod cleanup;
pub mod ddos_guard;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod patterns;
pub mod payload_inspector;
pub mod rate_limiter;
pub mod request;
pub mod shield;
pub mod size_guard;

pub use audit::{AuditEvent, AuditSink, LogAuditSink, RedisAuditSink, WebhookAuditSink};
pub use block_registry::{BlockEntry, BlockRegistry};
pub use cleanup::{CleanupHandle, CleanupScheduler};
pub use error::{Rejection, RejectionCode, ShieldError};
pub use rate_limiter::{KeyFn, RateLimiter};
pub use request::{Allowance, RateLimitStatus, RequestDescriptor};
pub use shield::{Shield, ShieldStats, SweepReport};
