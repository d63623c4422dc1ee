//! Expiring deny-list keyed by client identity.

use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use crate::core::audit::{AuditEvent, AuditSink};

/// An active block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEntry {
    /// Unix time (milliseconds) at which the block lapses
    pub expires_at: u64,
    pub reason: String,
    pub created_at: u64,
}

impl BlockEntry {
    /// Whole seconds left, rounded up.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now).div_ceil(1000)
    }
}

pub struct BlockRegistry {
    entries: DashMap<String, BlockEntry>,
    audit: Arc<dyn AuditSink>,
}

impl BlockRegistry {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            entries: DashMap::new(),
            audit,
        }
    }

    /// Active block for `id`. An expired entry is removed and reported as absent.
    pub fn lookup(&self, id: &str, now: u64) -> Option<BlockEntry> {
        let expired = match self.entries.get(id) {
            Some(entry) if entry.expires_at > now => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired && self.entries.remove_if(id, |_, e| e.expires_at <= now).is_some() {
            debug!("Block on {} expired", id);
        }
        None
    }

    pub fn is_blocked(&self, id: &str, now: u64) -> bool {
        self.lookup(id, now).is_some()
    }

    /// Block `id` for `duration_ms`. An existing block that outlives the new
    /// one is kept as is.
    pub fn block(&self, id: &str, duration_ms: u64, reason: &str, now: u64) -> BlockEntry {
        let fresh = BlockEntry {
            expires_at: now + duration_ms.max(1),
            reason: reason.to_string(),
            created_at: now,
        };
        let (entry, changed) = match self.entries.entry(id.to_string()) {
            Entry::Vacant(vacant) => (vacant.insert(fresh).value().clone(), true),
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.expires_at <= now {
                    *current = fresh;
                    (current.clone(), true)
                } else if current.expires_at < fresh.expires_at {
                    current.expires_at = fresh.expires_at;
                    current.reason = fresh.reason;
                    (current.clone(), true)
                } else {
                    (current.clone(), false)
                }
            }
        };

        if changed {
            warn!(
                "Blocked {} for {}ms ({})",
                id,
                entry.expires_at - now,
                entry.reason
            );
            metrics::increment_counter!("shield_blocks_total", "reason" => entry.reason.clone());
            self.audit
                .record(AuditEvent::blocked(id, &entry.reason, now, entry.expires_at));
        }
        entry
    }

    /// Remove any block on `id`. Unknown ids are a no-op.
    pub fn unblock(&self, id: &str, now: u64) -> bool {
        match self.entries.remove(id) {
            Some(_) => {
                warn!("Unblocked {}", id);
                self.audit.record(AuditEvent::unblocked(id, now));
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{AuditAction, LogAuditSink, MockAuditSink};

    fn registry() -> BlockRegistry {
        BlockRegistry::new(Arc::new(LogAuditSink))
    }

    #[test]
    fn test_block_and_expiry() {
        let registry = registry();
        let entry = registry.block("1.2.3.4", 60_000, "test", 1_000);
        assert_eq!(entry.expires_at, 61_000);
        assert!(registry.is_blocked("1.2.3.4", 60_999));
        assert!(!registry.is_blocked("1.2.3.4", 61_000));
        // expired entry was purged by the lookup
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_duration_is_still_in_the_future() {
        let registry = registry();
        let entry = registry.block("a", 0, "test", 5);
        assert!(entry.expires_at > 5);
    }

    #[test]
    fn test_shorter_block_does_not_shorten_existing() {
        let registry = registry();
        registry.block("a", 300_000, "ddos", 0);
        let entry = registry.block("a", 60_000, "bot_behavior", 1_000);
        assert_eq!(entry.expires_at, 300_000);
        assert_eq!(entry.reason, "ddos");
    }

    #[test]
    fn test_unblock_is_idempotent() {
        let registry = registry();
        assert!(!registry.unblock("never-seen", 0));
        registry.block("a", 1_000, "test", 0);
        assert!(registry.unblock("a", 10));
        assert!(!registry.unblock("a", 20));
        assert!(!registry.is_blocked("a", 30));
    }

    #[test]
    fn test_purge_expired() {
        let registry = registry();
        registry.block("a", 1_000, "test", 0);
        registry.block("b", 10_000, "test", 0);
        assert_eq!(registry.purge_expired(5_000), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("b", 5_000).unwrap().retry_after_secs(5_000), 5);
    }

    #[test]
    fn test_transitions_are_audited() {
        let mut audit = MockAuditSink::new();
        audit
            .expect_record()
            .withf(|e| e.action == AuditAction::Blocked && e.client_id == "a")
            .times(1)
            .return_const(());
        audit
            .expect_record()
            .withf(|e| e.action == AuditAction::Unblocked && e.client_id == "a")
            .times(1)
            .return_const(());

        let registry = BlockRegistry::new(Arc::new(audit));
        registry.block("a", 1_000, "test", 0);
        registry.unblock("a", 1);
        registry.unblock("a", 2);
    }
}
