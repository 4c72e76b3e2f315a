//! The foreign-cluster record store, the sole source of truth for
//! peering lifecycle state.
//!
//! Exactly one record exists per remote cluster. Records are created on
//! first discovery, mutated only through the lifecycle controller, and
//! removed once the operator drops the peering and teardown has finished.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fed_tunnel::ClusterId;

use crate::types::{ClusterIdentity, PeeringPhase, PeeringRequestRef};

/// Persisted state for one known remote cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignClusterRecord {
    /// The remote cluster's identity.
    pub identity: ClusterIdentity,
    /// Whether the operator wants this cluster peered.
    pub desired_join: bool,
    /// The remote cluster's API endpoint URL.
    pub api_endpoint: String,
    /// Current lifecycle phase.
    pub phase: PeeringPhase,
    /// Reference to the remote-side peering request, while one exists.
    pub peering_request: Option<PeeringRequestRef>,
    /// Whether the peering is fully established.
    pub joined: bool,
    /// When the phase last changed.
    pub last_transition: DateTime<Utc>,
    /// The most recent reconciliation error, if any.
    pub last_error: Option<String>,
    /// Consecutive failed reconciliation attempts.
    pub retry_attempts: u32,
    /// Earliest time the next retry may run, while cooling down.
    pub retry_not_before: Option<DateTime<Utc>>,
    /// Set when the attempt failed permanently (rejection, exhausted
    /// retries, capacity). Cleared when the desired join flag changes.
    pub terminal_failure: bool,
}

impl ForeignClusterRecord {
    /// Creates a freshly discovered record with no join intent.
    #[must_use]
    pub fn new(identity: ClusterIdentity, api_endpoint: impl Into<String>) -> Self {
        Self {
            identity,
            desired_join: false,
            api_endpoint: api_endpoint.into(),
            phase: PeeringPhase::Discovered,
            peering_request: None,
            joined: false,
            last_transition: Utc::now(),
            last_error: None,
            retry_attempts: 0,
            retry_not_before: None,
            terminal_failure: false,
        }
    }

    /// Sets the desired join flag.
    #[must_use]
    pub fn with_desired_join(mut self, desired: bool) -> Self {
        self.desired_join = desired;
        self
    }

    /// Moves the record to a new phase, stamping the transition time.
    pub fn transition_to(&mut self, phase: PeeringPhase) {
        if self.phase != phase {
            debug!(
                cluster = %self.identity.id,
                from = %self.phase,
                to = %phase,
                "phase transition"
            );
            self.phase = phase;
            self.last_transition = Utc::now();
        }
    }

    /// Records a reconciliation error.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Clears error and retry bookkeeping after a successful step.
    pub fn clear_failure_state(&mut self) {
        self.last_error = None;
        self.retry_attempts = 0;
        self.retry_not_before = None;
        self.terminal_failure = false;
    }

    /// Returns whether a retry cooldown is still in effect.
    #[must_use]
    pub fn in_cooldown(&self) -> bool {
        self.retry_not_before.is_some_and(|t| Utc::now() < t)
    }
}

/// Registry of foreign-cluster records, one per remote cluster.
#[derive(Debug, Default)]
pub struct ForeignClusterStore {
    records: RwLock<HashMap<ClusterId, ForeignClusterRecord>>,
}

impl ForeignClusterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for its cluster.
    pub fn upsert(&self, record: ForeignClusterRecord) {
        self.records
            .write()
            .insert(record.identity.id.clone(), record);
    }

    /// Returns a copy of the record for a cluster.
    #[must_use]
    pub fn get(&self, cluster: &ClusterId) -> Option<ForeignClusterRecord> {
        self.records.read().get(cluster).cloned()
    }

    /// Removes the record for a cluster, returning it if present.
    pub fn remove(&self, cluster: &ClusterId) -> Option<ForeignClusterRecord> {
        self.records.write().remove(cluster)
    }

    /// Applies a mutation to the record for a cluster.
    ///
    /// Returns false if no record exists.
    pub fn update<F>(&self, cluster: &ClusterId, mutate: F) -> bool
    where
        F: FnOnce(&mut ForeignClusterRecord),
    {
        let mut records = self.records.write();
        match records.get_mut(cluster) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }

    /// Flips the desired join flag, resetting any failure state so the
    /// new intent gets a fresh set of attempts.
    ///
    /// Returns false if no record exists.
    pub fn set_desired_join(&self, cluster: &ClusterId, desired: bool) -> bool {
        self.update(cluster, |record| {
            if record.desired_join != desired {
                record.desired_join = desired;
                record.clear_failure_state();
            }
        })
    }

    /// Returns copies of all records.
    #[must_use]
    pub fn all(&self) -> Vec<ForeignClusterRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of known remote clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(id: &str) -> ForeignClusterRecord {
        let identity = ClusterIdentity::new(id, format!("{id}-name")).expect("valid identity");
        ForeignClusterRecord::new(identity, "https://203.0.113.10:6443")
    }

    #[test]
    fn one_record_per_cluster() {
        let store = ForeignClusterStore::new();
        store.upsert(test_record("a"));
        store.upsert(test_record("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn new_record_starts_discovered() {
        let record = test_record("a");
        assert_eq!(record.phase, PeeringPhase::Discovered);
        assert!(!record.desired_join);
        assert!(!record.joined);
    }

    #[test]
    fn transition_stamps_time() {
        let mut record = test_record("a");
        let before = record.last_transition;
        std::thread::sleep(std::time::Duration::from_millis(5));

        record.transition_to(PeeringPhase::Authenticating);
        assert!(record.last_transition > before);
    }

    #[test]
    fn transition_to_same_phase_keeps_time() {
        let mut record = test_record("a");
        record.transition_to(PeeringPhase::Authenticating);
        let stamped = record.last_transition;

        record.transition_to(PeeringPhase::Authenticating);
        assert_eq!(record.last_transition, stamped);
    }

    #[test]
    fn update_mutates_in_place() {
        let store = ForeignClusterStore::new();
        store.upsert(test_record("a"));

        let cluster = ClusterId::new("a").expect("valid id");
        assert!(store.update(&cluster, |r| r.joined = true));
        assert!(store.get(&cluster).expect("record").joined);
    }

    #[test]
    fn update_unknown_cluster_returns_false() {
        let store = ForeignClusterStore::new();
        let cluster = ClusterId::new("ghost").expect("valid id");
        assert!(!store.update(&cluster, |r| r.joined = true));
    }

    #[test]
    fn flipping_desired_join_clears_failure_state() {
        let store = ForeignClusterStore::new();
        let mut record = test_record("a");
        record.record_error("boom");
        record.retry_attempts = 5;
        record.terminal_failure = true;
        store.upsert(record);

        let cluster = ClusterId::new("a").expect("valid id");
        store.set_desired_join(&cluster, true);

        let updated = store.get(&cluster).expect("record");
        assert!(updated.desired_join);
        assert!(updated.last_error.is_none());
        assert_eq!(updated.retry_attempts, 0);
        assert!(!updated.terminal_failure);
    }

    #[test]
    fn unchanged_desired_join_keeps_failure_state() {
        let store = ForeignClusterStore::new();
        let mut record = test_record("a").with_desired_join(true);
        record.terminal_failure = true;
        store.upsert(record);

        let cluster = ClusterId::new("a").expect("valid id");
        store.set_desired_join(&cluster, true);

        assert!(store.get(&cluster).expect("record").terminal_failure);
    }

    #[test]
    fn cooldown_reflects_not_before() {
        let mut record = test_record("a");
        assert!(!record.in_cooldown());

        record.retry_not_before = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(record.in_cooldown());

        record.retry_not_before = Some(Utc::now() - chrono::Duration::minutes(5));
        assert!(!record.in_cooldown());
    }

    #[test]
    fn remove_returns_record() {
        let store = ForeignClusterStore::new();
        store.upsert(test_record("a"));

        let cluster = ClusterId::new("a").expect("valid id");
        assert!(store.remove(&cluster).is_some());
        assert!(store.is_empty());
    }
}
