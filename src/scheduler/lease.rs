use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A time-bounded assignment of one task to one client. Owned by the
/// scheduler; sessions hold only task-id back-references.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task_id: i64,
    pub client_id: Uuid,
    pub granted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Lease table keyed by task id. Plain map behind the scheduler's lock;
/// exactly one lease may exist per task.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<i64, Lease>,
}

impl LeaseTable {
    pub fn grant(&mut self, task_id: i64, client_id: Uuid, ttl: chrono::Duration) -> Lease {
        let now = Utc::now();
        let lease = Lease {
            task_id,
            client_id,
            granted_at: now,
            deadline: now + ttl,
        };
        self.leases.insert(task_id, lease.clone());
        lease
    }

    pub fn release(&mut self, task_id: i64) -> Option<Lease> {
        self.leases.remove(&task_id)
    }

    pub fn get(&self, task_id: i64) -> Option<&Lease> {
        self.leases.get(&task_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Remove and return every lease past `now`.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired: Vec<i64> = self
            .leases
            .values()
            .filter(|lease| lease.deadline <= now)
            .map(|lease| lease.task_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|task_id| self.leases.remove(&task_id))
            .collect()
    }

    /// Remove and return every lease held by `client_id`.
    pub fn take_client(&mut self, client_id: Uuid) -> Vec<Lease> {
        let held: Vec<i64> = self
            .leases
            .values()
            .filter(|lease| lease.client_id == client_id)
            .map(|lease| lease.task_id)
            .collect();
        held.into_iter()
            .filter_map(|task_id| self.leases.remove(&task_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_and_release() {
        let mut table = LeaseTable::default();
        let client = Uuid::new_v4();
        table.grant(1, client, chrono::Duration::seconds(60));
        assert_eq!(table.len(), 1);
        assert!(table.get(1).is_some());
        assert!(table.release(1).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn expiry_sweep() {
        let mut table = LeaseTable::default();
        let client = Uuid::new_v4();
        table.grant(1, client, chrono::Duration::seconds(-1));
        table.grant(2, client, chrono::Duration::seconds(600));
        let expired = table.take_expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn client_revocation() {
        let mut table = LeaseTable::default();
        let gone = Uuid::new_v4();
        let alive = Uuid::new_v4();
        table.grant(1, gone, chrono::Duration::seconds(600));
        table.grant(2, gone, chrono::Duration::seconds(600));
        table.grant(3, alive, chrono::Duration::seconds(600));
        let revoked = table.take_client(gone);
        assert_eq!(revoked.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.get(3).is_some());
    }
}
