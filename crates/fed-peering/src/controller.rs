//! The peering lifecycle controller.
//!
//! Reconciliation is level-triggered: every pass recomputes the full
//! transition from the stored record plus live tunnel status, never from
//! in-memory history, so the controller can be restarted at any point.
//! Work is serialized per cluster through a bounded queue with a single
//! consuming worker per key; unrelated clusters reconcile concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fed_fabric::TunnelFabric;
use fed_tunnel::{ClusterId, TunnelDriver};

use crate::error::{PeeringError, Result};
use crate::handshake::{PeeringRequester, PeeringTransport};
use crate::store::{ForeignClusterRecord, ForeignClusterStore};
use crate::types::{ClusterIdentity, PeeringPhase};

/// Coalescing depth of each per-cluster work queue.
const QUEUE_DEPTH: usize = 8;

/// Retry policy applied when a cluster becomes unreachable.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Cooldown before the next automatic re-entry attempt.
    pub cooldown: Duration,
    /// Consecutive failures tolerated before the failure is persistent.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// State machine owner for all remote clusters' peering lifecycles.
pub struct PeeringController<D: TunnelDriver, T: PeeringTransport> {
    store: Arc<ForeignClusterStore>,
    fabric: Arc<TunnelFabric<D>>,
    requester: Arc<PeeringRequester<T>>,
    retry: RetryPolicy,
    queues: Arc<Mutex<HashMap<ClusterId, mpsc::Sender<()>>>>,
}

impl<D: TunnelDriver, T: PeeringTransport> Clone for PeeringController<D, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            fabric: Arc::clone(&self.fabric),
            requester: Arc::clone(&self.requester),
            retry: self.retry.clone(),
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<D: TunnelDriver, T: PeeringTransport> PeeringController<D, T> {
    /// Creates a controller over the given store, fabric, and requester.
    #[must_use]
    pub fn new(
        store: Arc<ForeignClusterStore>,
        fabric: Arc<TunnelFabric<D>>,
        requester: PeeringRequester<T>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fabric,
            requester: Arc::new(requester),
            retry,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The record store this controller owns.
    #[must_use]
    pub fn store(&self) -> &Arc<ForeignClusterStore> {
        &self.store
    }

    /// Registers a newly discovered cluster. An existing record is kept.
    pub fn discover(&self, identity: ClusterIdentity, api_endpoint: impl Into<String>) {
        if self.store.get(&identity.id).is_some() {
            return;
        }
        info!(cluster = %identity, "discovered remote cluster");
        self.store
            .upsert(ForeignClusterRecord::new(identity, api_endpoint));
    }

    /// Sets the desired join flag and queues a reconcile.
    ///
    /// Returns false if the cluster is unknown.
    pub fn set_desired_join(&self, cluster: &ClusterId, desired: bool) -> bool {
        if !self.store.set_desired_join(cluster, desired) {
            return false;
        }
        self.notify(cluster);
        true
    }

    /// Queues a level-triggered reconcile for the cluster.
    ///
    /// A full queue means a reconcile is already pending; the notification
    /// coalesces into it.
    pub fn notify(&self, cluster: &ClusterId) {
        let queues = self.queues.lock();
        match queues.get(cluster) {
            Some(sender) => {
                if let Err(mpsc::error::TrySendError::Full(())) = sender.try_send(()) {
                    debug!(cluster = %cluster, "reconcile already pending");
                }
            }
            None => debug!(cluster = %cluster, "no worker registered"),
        }
    }

    /// Creates the work queue and consuming worker for a cluster.
    ///
    /// One worker per cluster: returns `None` if one is already
    /// registered. The caller spawns the returned worker's `run` future.
    #[must_use]
    pub fn worker(&self, cluster: &ClusterId) -> Option<ClusterWorker<D, T>> {
        let mut queues = self.queues.lock();
        if queues.contains_key(cluster) {
            return None;
        }
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        queues.insert(cluster.clone(), tx);
        Some(ClusterWorker {
            controller: self.clone(),
            cluster: cluster.clone(),
            rx,
        })
    }

    /// Drops a cluster's work queue, ending its worker after the current
    /// pass.
    pub fn detach_worker(&self, cluster: &ClusterId) {
        self.queues.lock().remove(cluster);
    }

    /// Runs one reconciliation pass for a cluster.
    ///
    /// Recomputes the transition from the record and live tunnel status.
    /// Reconciliation outcomes (including failures) land on the record as
    /// phase and last error; the returned phase is the post-pass state.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCluster` if no record exists.
    pub async fn reconcile(&self, cluster: &ClusterId) -> Result<PeeringPhase> {
        let Some(record) = self.store.get(cluster) else {
            return Err(PeeringError::UnknownCluster(cluster.to_string()));
        };
        let established = self.fabric.is_established(cluster).await;

        if record.desired_join {
            Ok(self.reconcile_join(record, established).await)
        } else {
            Ok(self.reconcile_disjoin(record, established).await)
        }
    }

    /// Forward path: drive the cluster toward `Peered`.
    async fn reconcile_join(
        &self,
        mut record: ForeignClusterRecord,
        established: bool,
    ) -> PeeringPhase {
        if record.terminal_failure {
            debug!(cluster = %record.identity.id, "skipping reconcile, failure is persistent");
            return record.phase;
        }
        if record.in_cooldown() {
            debug!(cluster = %record.identity.id, "skipping reconcile, cooling down");
            return record.phase;
        }
        if record.phase == PeeringPhase::Peered && established {
            return PeeringPhase::Peered;
        }

        record.transition_to(PeeringPhase::Authenticating);
        self.persist(&record);

        let accepted = self.requester.request_peering(&record.api_endpoint).await;
        let (reference, accept) = match accepted {
            Ok(accepted) => accepted,
            Err(error) if error.is_transient() => {
                self.mark_unreachable(&mut record, &error.to_string());
                self.persist(&record);
                return record.phase;
            }
            Err(error) => {
                warn!(cluster = %record.identity.id, %error, "peering failed terminally");
                record.record_error(error.to_string());
                record.terminal_failure = true;
                self.persist(&record);
                return record.phase;
            }
        };

        record.peering_request = Some(reference);
        record.transition_to(PeeringPhase::Establishing);
        self.persist(&record);

        let outcome = self
            .fabric
            .establish(&record.identity.id, &record.identity.name, &accept.tunnel_half())
            .await;
        match outcome {
            Ok(()) => {
                record.joined = true;
                record.clear_failure_state();
                record.transition_to(PeeringPhase::Peered);
                self.persist(&record);
                info!(cluster = %record.identity, "cluster peered");
                PeeringPhase::Peered
            }
            Err(error) if error.is_transient() => {
                self.mark_unreachable(&mut record, &error.to_string());
                self.persist(&record);
                record.phase
            }
            Err(error) => {
                warn!(cluster = %record.identity.id, %error, "tunnel establishment failed terminally");
                record.record_error(error.to_string());
                record.terminal_failure = true;
                self.persist(&record);
                record.phase
            }
        }
    }

    /// Reverse path: unwind any partial or complete peering.
    async fn reconcile_disjoin(
        &self,
        mut record: ForeignClusterRecord,
        established: bool,
    ) -> PeeringPhase {
        let needs_teardown = established
            || record.joined
            || record.peering_request.is_some()
            || matches!(
                record.phase,
                PeeringPhase::Authenticating
                    | PeeringPhase::Establishing
                    | PeeringPhase::Peered
                    | PeeringPhase::Disjoining
                    | PeeringPhase::Unreachable
            );
        if !needs_teardown {
            return record.phase;
        }
        // Same failure bookkeeping as the forward path: a persistently
        // failing teardown pauses until the operator re-expresses the
        // intent, and a cooling-down one waits out the window.
        if record.terminal_failure {
            debug!(cluster = %record.identity.id, "skipping teardown, failure is persistent");
            return record.phase;
        }
        if record.in_cooldown() {
            return record.phase;
        }

        record.transition_to(PeeringPhase::Disjoining);
        self.persist(&record);

        match self.fabric.teardown(&record.identity.id).await {
            Ok(()) => {
                // Remote record removal is best-effort; its absence is fine.
                if let Some(reference) = record.peering_request.take() {
                    self.requester
                        .delete_remote_request(&record.api_endpoint, &reference)
                        .await;
                }
                record.joined = false;
                record.clear_failure_state();
                record.transition_to(PeeringPhase::Unknown);
                self.persist(&record);
                info!(cluster = %record.identity, "cluster disjoined");
                PeeringPhase::Unknown
            }
            Err(error) => {
                self.mark_unreachable(&mut record, &error.to_string());
                self.persist(&record);
                record.phase
            }
        }
    }

    fn mark_unreachable(&self, record: &mut ForeignClusterRecord, error: &str) {
        record.record_error(error);
        record.retry_attempts += 1;
        // The cooldown stamp is kept even past the attempt budget so any
        // path that still acts on the record stays paced.
        record.retry_not_before =
            Some(Utc::now() + chrono::Duration::from_std(self.retry.cooldown).unwrap_or_default());
        if record.retry_attempts >= self.retry.max_attempts {
            warn!(
                cluster = %record.identity.id,
                attempts = record.retry_attempts,
                error,
                "retries exhausted, failure is persistent"
            );
            record.terminal_failure = true;
        } else {
            debug!(
                cluster = %record.identity.id,
                attempt = record.retry_attempts,
                error,
                "cluster unreachable, cooling down"
            );
        }
        record.transition_to(PeeringPhase::Unreachable);
    }

    fn persist(&self, record: &ForeignClusterRecord) {
        self.store.upsert(record.clone());
    }
}

/// Single consumer of one cluster's work queue.
pub struct ClusterWorker<D: TunnelDriver, T: PeeringTransport> {
    controller: PeeringController<D, T>,
    cluster: ClusterId,
    rx: mpsc::Receiver<()>,
}

impl<D: TunnelDriver, T: PeeringTransport> ClusterWorker<D, T> {
    /// Consumes notifications until the queue is detached, running one
    /// reconcile pass per wakeup.
    pub async fn run(mut self) {
        while self.rx.recv().await.is_some() {
            if let Err(error) = self.controller.reconcile(&self.cluster).await {
                warn!(cluster = %self.cluster, %error, "reconcile failed");
            }
        }
        debug!(cluster = %self.cluster, "worker stopped");
    }
}
