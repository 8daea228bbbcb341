//! Bounded, expiring store for pending approvals.
//!
//! The store is the shared arbiter between the reply-handler path and the
//! expiry timer: every status transition goes through a per-key
//! compare-and-set so at most one terminal outcome is ever recorded.

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::error::EngineError;

/// How long a terminal or expired record lingers for late-reply lookups
/// before the sweeper removes it.
const TERMINAL_RETENTION_SECS: i64 = 60;

/// Outcome of a compare-and-set on one approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected status matched; the new status is recorded
    Updated,
    /// The record held a different status
    Conflict(ApprovalStatus),
    /// No record under that id
    Missing,
}

/// Keyed, bounded, TTL-enforcing store of [`PendingApproval`] records.
pub struct PendingStore {
    entries: DashMap<String, PendingApproval>,
    capacity: usize,
}

impl PendingStore {
    /// A store holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Insert a new pending record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StoreFull`] when the store is at capacity
    /// even after purging expired records.
    pub fn insert(&self, approval: PendingApproval) -> Result<(), EngineError> {
        if self.entries.len() >= self.capacity {
            self.sweep();
        }
        if self.entries.len() >= self.capacity {
            return Err(EngineError::StoreFull);
        }
        self.entries
            .insert(approval.approval_id.to_string(), approval);
        Ok(())
    }

    /// Fetch a record by full approval id, lazily transitioning an
    /// overdue `Pending` record to `Expired`.
    #[must_use]
    pub fn get(&self, approval_id: &str) -> Option<PendingApproval> {
        let mut entry = self.entries.get_mut(approval_id)?;
        Self::lazily_expire(&mut entry);
        Some(entry.clone())
    }

    /// Find a record whose 8-char short id matches.
    #[must_use]
    pub fn find_by_short_id(&self, short_id: &str) -> Option<PendingApproval> {
        for mut entry in self.entries.iter_mut() {
            if entry.short_id == short_id {
                Self::lazily_expire(&mut entry);
                return Some(entry.clone());
            }
        }
        None
    }

    /// Whether a live (non-terminal) record already uses the short id.
    #[must_use]
    pub fn short_id_in_use(&self, short_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.short_id == short_id && e.status == ApprovalStatus::Pending)
    }

    /// Atomically transition `approval_id` from `expected` to `next`.
    #[must_use]
    pub fn compare_and_set(
        &self,
        approval_id: &str,
        expected: ApprovalStatus,
        next: ApprovalStatus,
    ) -> CasOutcome {
        let Some(mut entry) = self.entries.get_mut(approval_id) else {
            return CasOutcome::Missing;
        };
        Self::lazily_expire(&mut entry);
        if entry.status != expected {
            return CasOutcome::Conflict(entry.status);
        }
        entry.status = next;
        debug!(approval_id, from = expected.as_str(), to = next.as_str(), "Approval status updated");
        CasOutcome::Updated
    }

    /// Records currently pending and unexpired.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingApproval> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| e.status == ApprovalStatus::Pending && e.expires_at > now)
            .map(|e| e.clone())
            .collect()
    }

    /// Number of records (any status) currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop records whose TTL (plus a short retention for late replies)
    /// has fully elapsed, and flip overdue `Pending` records to `Expired`.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.entries.retain(|_, approval| {
            if approval.status == ApprovalStatus::Pending && approval.expires_at <= now {
                approval.status = ApprovalStatus::Expired;
            }
            let drop_at = approval.expires_at + chrono::Duration::seconds(TERMINAL_RETENTION_SECS);
            drop_at > now
        });
    }

    fn lazily_expire(approval: &mut PendingApproval) {
        if approval.status == ApprovalStatus::Pending && approval.expires_at <= Utc::now() {
            approval.status = ApprovalStatus::Expired;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::RiskLevel;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use vigil_notify::ChannelTarget;

    fn approval(ttl_secs: i64) -> PendingApproval {
        let id = Uuid::new_v4();
        PendingApproval {
            approval_id: id,
            short_id: id.simple().to_string()[..8].to_string(),
            tool_name: "k8s_restart_pod".to_string(),
            params: BTreeMap::new(),
            risk: RiskLevel::Medium,
            description: "Restart Pod".to_string(),
            run_id: Uuid::new_v4(),
            target: ChannelTarget::new("slack", "C1"),
            requested_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            status: ApprovalStatus::Pending,
        }
    }

    #[test]
    fn test_insert_and_find_by_short_id() {
        let store = PendingStore::new(8);
        let a = approval(900);
        let short = a.short_id.clone();
        store.insert(a.clone()).unwrap();

        let found = store.find_by_short_id(&short).unwrap();
        assert_eq!(found.approval_id, a.approval_id);
        assert!(store.short_id_in_use(&short));
        assert!(store.find_by_short_id("ffffffff").is_none());
    }

    #[test]
    fn test_cas_allows_exactly_one_terminal_transition() {
        let store = PendingStore::new(8);
        let a = approval(900);
        let id = a.approval_id.to_string();
        store.insert(a).unwrap();

        assert_eq!(
            store.compare_and_set(&id, ApprovalStatus::Pending, ApprovalStatus::Executed),
            CasOutcome::Updated
        );
        assert_eq!(
            store.compare_and_set(&id, ApprovalStatus::Pending, ApprovalStatus::Rejected),
            CasOutcome::Conflict(ApprovalStatus::Executed)
        );
        assert_eq!(
            store.compare_and_set("missing", ApprovalStatus::Pending, ApprovalStatus::Expired),
            CasOutcome::Missing
        );
    }

    #[test]
    fn test_overdue_pending_reads_as_expired() {
        let store = PendingStore::new(8);
        let a = approval(-5);
        let id = a.approval_id.to_string();
        let short = a.short_id.clone();
        store.insert(a).unwrap();

        assert_eq!(store.get(&id).unwrap().status, ApprovalStatus::Expired);
        assert_eq!(
            store.find_by_short_id(&short).unwrap().status,
            ApprovalStatus::Expired
        );
        // A reply arriving after expiry loses the CAS.
        assert_eq!(
            store.compare_and_set(&id, ApprovalStatus::Pending, ApprovalStatus::Executed),
            CasOutcome::Conflict(ApprovalStatus::Expired)
        );
    }

    #[test]
    fn test_capacity_bound_after_purge() {
        let store = PendingStore::new(2);
        store.insert(approval(900)).unwrap();
        store.insert(approval(900)).unwrap();
        assert!(matches!(
            store.insert(approval(900)),
            Err(EngineError::StoreFull)
        ));

        // Long-expired records are purged to make room.
        let store = PendingStore::new(2);
        store.insert(approval(-120)).unwrap();
        store.insert(approval(900)).unwrap();
        store.insert(approval(900)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sweep_retains_recently_expired_for_late_replies() {
        let store = PendingStore::new(8);
        let recent = approval(-5);
        let recent_id = recent.approval_id.to_string();
        let ancient = approval(-3600);
        let ancient_id = ancient.approval_id.to_string();
        store.insert(recent).unwrap();
        store.insert(ancient).unwrap();

        store.sweep();
        assert_eq!(store.get(&recent_id).unwrap().status, ApprovalStatus::Expired);
        assert!(store.get(&ancient_id).is_none());
    }

    #[test]
    fn test_pending_listing_excludes_expired() {
        let store = PendingStore::new(8);
        store.insert(approval(900)).unwrap();
        store.insert(approval(-5)).unwrap();
        assert_eq!(store.pending().len(), 1);
    }
}
