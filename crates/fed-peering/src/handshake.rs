//! The cross-cluster peering handshake.
//!
//! The requesting side submits a peering request to the remote cluster's
//! API and retries transient failures with capped exponential backoff.
//! The accepting side consults local policy and, on approval, provisions
//! its half of the tunnel and returns it in the accept reply.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fed_tunnel::{ClusterId, Endpoint, KeyPair};

use crate::error::{HandshakeError, HandshakeResult};
use crate::types::{
    AcceptResponse, ClusterIdentity, PeeringRequestRecord, PeeringRequestRef, PeeringScope,
};

/// Remote-API boundary for the handshake exchange.
///
/// Implementations talk to the remote cluster's record store, addressed
/// by the foreign-cluster record's endpoint URL and authenticated by a
/// pre-provisioned identity.
#[allow(async_fn_in_trait)]
pub trait PeeringTransport {
    /// Creates a peering-request record on the remote cluster and waits
    /// for the accept/reject decision.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the remote API is unavailable or
    /// `Rejected` if remote policy denied the request.
    async fn submit_request(
        &self,
        endpoint: &str,
        request: &PeeringRequestRecord,
    ) -> HandshakeResult<(PeeringRequestRef, AcceptResponse)>;

    /// Looks up an existing request from `requestor` on the remote cluster.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the remote API is unavailable.
    async fn fetch_existing(
        &self,
        endpoint: &str,
        requestor: &ClusterId,
    ) -> HandshakeResult<Option<(PeeringRequestRef, AcceptResponse)>>;

    /// Deletes a request record on the remote cluster. Absence is success.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the remote API is unavailable.
    async fn withdraw_request(
        &self,
        endpoint: &str,
        reference: &PeeringRequestRef,
    ) -> HandshakeResult<()>;
}

/// Tuning for the requesting side's retry behavior.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Upper bound on any single remote call; elapsing counts as
    /// `Unreachable`.
    pub request_timeout: Duration,
    /// Backoff before the second attempt; doubles each retry.
    pub initial_backoff: Duration,
    /// Cap on the per-retry backoff.
    pub max_backoff: Duration,
    /// Total attempts before giving up with `Unreachable`.
    pub max_attempts: u32,
    /// Age beyond which a pending remote request is considered stale and
    /// replaced instead of reused.
    pub request_ttl: chrono::Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 4,
            request_ttl: chrono::Duration::minutes(30),
        }
    }
}

impl HandshakeConfig {
    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// The requesting side of the handshake.
pub struct PeeringRequester<T: PeeringTransport> {
    transport: T,
    local: ClusterIdentity,
    scope: PeeringScope,
    config: HandshakeConfig,
}

impl<T: PeeringTransport> PeeringRequester<T> {
    /// Creates a requester acting as `local` with the given scope.
    #[must_use]
    pub fn new(
        transport: T,
        local: ClusterIdentity,
        scope: PeeringScope,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            transport,
            local,
            scope,
            config,
        }
    }

    /// The local identity requests are sent as.
    #[must_use]
    pub fn local_identity(&self) -> &ClusterIdentity {
        &self.local
    }

    /// Requests a peering with the cluster behind `endpoint`.
    ///
    /// An unexpired request already pending on the remote side is reused
    /// rather than duplicated. Transient failures are retried with capped
    /// exponential backoff up to the configured attempt budget.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` immediately if remote policy denies the request,
    /// or `Unreachable` once the attempt budget is exhausted.
    pub async fn request_peering(
        &self,
        endpoint: &str,
    ) -> HandshakeResult<(PeeringRequestRef, AcceptResponse)> {
        if let Some(existing) = self.reusable_existing(endpoint).await {
            debug!(endpoint, "reusing pending peering request");
            return Ok(existing);
        }

        let request = PeeringRequestRecord::new(self.local.clone(), self.scope);
        let mut attempt = 0u32;

        loop {
            match self.bounded_submit(endpoint, &request).await {
                Ok(accepted) => {
                    info!(endpoint, request_id = %accepted.0.request_id, "peering request accepted");
                    return Ok(accepted);
                }
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        warn!(endpoint, attempts = attempt, "peering request attempts exhausted");
                        return Err(error);
                    }
                    let backoff = self.backoff_for(attempt);
                    debug!(endpoint, attempt, ?backoff, %error, "retrying peering request");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    warn!(endpoint, %error, "peering request failed terminally");
                    return Err(error);
                }
            }
        }
    }

    /// Deletes the remote request record. Best-effort: absence and
    /// unreachability are logged, never surfaced.
    pub async fn delete_remote_request(&self, endpoint: &str, reference: &PeeringRequestRef) {
        let call = self.transport.withdraw_request(endpoint, reference);
        match timeout(self.config.request_timeout, call).await {
            Ok(Ok(())) => {
                debug!(endpoint, request_id = %reference.request_id, "withdrew peering request");
            }
            Ok(Err(error)) => {
                debug!(endpoint, %error, "could not withdraw peering request");
            }
            Err(_) => {
                debug!(endpoint, "withdraw of peering request timed out");
            }
        }
    }

    /// Returns a pending unexpired remote request, withdrawing a stale one.
    async fn reusable_existing(
        &self,
        endpoint: &str,
    ) -> Option<(PeeringRequestRef, AcceptResponse)> {
        let call = self.transport.fetch_existing(endpoint, &self.local.id);
        let existing = match timeout(self.config.request_timeout, call).await {
            Ok(Ok(existing)) => existing?,
            // Lookup failures fall through to a fresh submit.
            Ok(Err(_)) | Err(_) => return None,
        };

        if existing.0.is_expired(self.config.request_ttl) {
            debug!(endpoint, request_id = %existing.0.request_id, "pending request expired, replacing");
            self.delete_remote_request(endpoint, &existing.0).await;
            return None;
        }
        Some(existing)
    }

    async fn bounded_submit(
        &self,
        endpoint: &str,
        request: &PeeringRequestRecord,
    ) -> HandshakeResult<(PeeringRequestRef, AcceptResponse)> {
        let call = self.transport.submit_request(endpoint, request);
        match timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Unreachable(
                "peering request timed out".to_string(),
            )),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.config
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.config.max_backoff)
    }
}

/// Accepting-side policy deciding whether a requestor may peer.
///
/// The policy source (allow-all, allow-list, or anything richer) is
/// external configuration.
pub trait PeeringPolicy: Send + Sync {
    /// Returns whether the requestor may peer with the given scope.
    fn allows(&self, requestor: &ClusterIdentity, scope: PeeringScope) -> bool;
}

/// Accepts every peering request.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl PeeringPolicy for AllowAll {
    fn allows(&self, _requestor: &ClusterIdentity, _scope: PeeringScope) -> bool {
        true
    }
}

/// Accepts requests only from an explicit set of cluster IDs.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    allowed: HashSet<ClusterId>,
}

impl AllowList {
    /// Creates an allow-list from the given cluster IDs.
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = ClusterId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl PeeringPolicy for AllowList {
    fn allows(&self, requestor: &ClusterIdentity, _scope: PeeringScope) -> bool {
        self.allowed.contains(&requestor.id)
    }
}

/// What the acceptor advertises as its half of the tunnel.
#[derive(Clone, Debug)]
pub struct AcceptorConfig {
    /// The accepting cluster's identity.
    pub identity: ClusterIdentity,
    /// The tunnel endpoint handed to requestors.
    pub endpoint: Endpoint,
    /// The pod/service ranges advertised to requestors.
    pub advertised_ranges: Vec<IpNet>,
}

/// One accepted request held on the accepting side.
#[derive(Clone, Debug)]
struct AcceptedRequest {
    record: PeeringRequestRecord,
    reference: PeeringRequestRef,
    response: AcceptResponse,
}

/// The accepting side of the handshake.
///
/// Holds the accepting cluster's tunnel keypair and the active request
/// records, at most one per requestor. A superseding request deletes the
/// old record instead of updating it in place, so a stale accept can
/// never be confused with the new request.
pub struct PeeringAcceptor {
    policy: Box<dyn PeeringPolicy>,
    config: AcceptorConfig,
    keypair: KeyPair,
    requests: Mutex<HashMap<ClusterId, AcceptedRequest>>,
}

impl PeeringAcceptor {
    /// Creates an acceptor with the given policy and a fresh tunnel keypair.
    #[must_use]
    pub fn new(policy: impl PeeringPolicy + 'static, config: AcceptorConfig) -> Self {
        Self {
            policy: Box::new(policy),
            config,
            keypair: KeyPair::generate(),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Handles an incoming peering request.
    ///
    /// On acceptance the reply carries the accepting side's tunnel half.
    /// An identical pending request returns the stored reply rather than
    /// creating a duplicate record.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` when local policy denies the requestor.
    pub fn on_peering_request(
        &self,
        request: &PeeringRequestRecord,
    ) -> HandshakeResult<(PeeringRequestRef, AcceptResponse)> {
        if !self.policy.allows(&request.requestor, request.scope) {
            info!(requestor = %request.requestor, "peering request denied by policy");
            return Err(HandshakeError::Rejected(format!(
                "policy denies peering with {}",
                request.requestor.id
            )));
        }

        let mut requests = self.requests.lock();

        if let Some(existing) = requests.get(&request.requestor.id) {
            if existing.record.scope == request.scope {
                debug!(requestor = %request.requestor, "returning existing accepted request");
                return Ok((existing.reference.clone(), existing.response.clone()));
            }
            // Superseded: delete, never update in place.
            requests.remove(&request.requestor.id);
        }

        let mut record = request.clone();
        record.accepted = true;

        let reference = PeeringRequestRef::new(self.config.identity.id.clone());
        let response = AcceptResponse {
            public_key: *self.keypair.public_key(),
            endpoint: self.config.endpoint.clone(),
            advertised_ranges: self.config.advertised_ranges.clone(),
        };

        info!(
            requestor = %request.requestor,
            scope = ?request.scope,
            request_id = %reference.request_id,
            "accepted peering request"
        );
        requests.insert(
            request.requestor.id.clone(),
            AcceptedRequest {
                record,
                reference: reference.clone(),
                response: response.clone(),
            },
        );
        Ok((reference, response))
    }

    /// Returns the pending request from `requestor`, if any.
    #[must_use]
    pub fn existing(&self, requestor: &ClusterId) -> Option<(PeeringRequestRef, AcceptResponse)> {
        self.requests
            .lock()
            .get(requestor)
            .map(|r| (r.reference.clone(), r.response.clone()))
    }

    /// Deletes the record with `request_id`. Absence is a no-op.
    pub fn delete_request(&self, request_id: Uuid) {
        self.requests
            .lock()
            .retain(|_, r| r.reference.request_id != request_id);
    }

    /// Number of active request records.
    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

/// In-memory transport for tests: an acceptor behind a reachability flag.
#[derive(Clone)]
pub struct FakePeeringTransport {
    acceptor: Arc<PeeringAcceptor>,
    reachable: Arc<RwLock<bool>>,
    submits: Arc<Mutex<u32>>,
}

impl FakePeeringTransport {
    /// Wraps an acceptor as the remote side.
    #[must_use]
    pub fn new(acceptor: PeeringAcceptor) -> Self {
        Self {
            acceptor: Arc::new(acceptor),
            reachable: Arc::new(RwLock::new(true)),
            submits: Arc::new(Mutex::new(0)),
        }
    }

    /// Toggles whether the remote API responds.
    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.write() = reachable;
    }

    /// Number of submit calls that reached the remote side.
    #[must_use]
    pub fn submit_count(&self) -> u32 {
        *self.submits.lock()
    }

    /// Number of active request records on the remote side.
    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.acceptor.active_request_count()
    }

    fn check_reachable(&self) -> HandshakeResult<()> {
        if *self.reachable.read() {
            Ok(())
        } else {
            Err(HandshakeError::Unreachable(
                "fake remote offline".to_string(),
            ))
        }
    }
}

impl PeeringTransport for FakePeeringTransport {
    async fn submit_request(
        &self,
        _endpoint: &str,
        request: &PeeringRequestRecord,
    ) -> HandshakeResult<(PeeringRequestRef, AcceptResponse)> {
        self.check_reachable()?;
        *self.submits.lock() += 1;
        self.acceptor.on_peering_request(request)
    }

    async fn fetch_existing(
        &self,
        _endpoint: &str,
        requestor: &ClusterId,
    ) -> HandshakeResult<Option<(PeeringRequestRef, AcceptResponse)>> {
        self.check_reachable()?;
        Ok(self.acceptor.existing(requestor))
    }

    async fn withdraw_request(
        &self,
        _endpoint: &str,
        reference: &PeeringRequestRef,
    ) -> HandshakeResult<()> {
        self.check_reachable()?;
        self.acceptor.delete_request(reference.request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> ClusterIdentity {
        ClusterIdentity::new(id, format!("{id}-name")).expect("valid identity")
    }

    fn acceptor_config() -> AcceptorConfig {
        AcceptorConfig {
            identity: identity("remote"),
            endpoint: "203.0.113.10:51820".parse().expect("valid endpoint"),
            advertised_ranges: vec!["10.244.0.0/16".parse().expect("valid cidr")],
        }
    }

    fn fast_config() -> HandshakeConfig {
        HandshakeConfig::default()
            .with_request_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
            .with_max_attempts(3)
    }

    fn requester(transport: FakePeeringTransport) -> PeeringRequester<FakePeeringTransport> {
        PeeringRequester::new(
            transport,
            identity("local"),
            PeeringScope::Bidirectional,
            fast_config(),
        )
    }

    // ==================== REQUESTER TESTS ====================

    #[tokio::test]
    async fn request_peering_returns_tunnel_half() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        let requester = requester(transport.clone());

        let (reference, response) = requester
            .request_peering("https://remote:6443")
            .await
            .expect("request");

        assert_eq!(reference.remote_cluster.as_str(), "remote");
        assert_eq!(response.advertised_ranges.len(), 1);
        assert_eq!(transport.active_request_count(), 1);
    }

    #[tokio::test]
    async fn pending_request_is_reused_not_duplicated() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        let requester = requester(transport.clone());

        let (first, _) = requester
            .request_peering("https://remote:6443")
            .await
            .expect("first");
        let (second, _) = requester
            .request_peering("https://remote:6443")
            .await
            .expect("second");

        assert_eq!(first.request_id, second.request_id);
        assert_eq!(transport.submit_count(), 1);
        assert_eq!(transport.active_request_count(), 1);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_not_retried() {
        let policy = AllowList::new([ClusterId::new("someone-else").expect("valid id")]);
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(policy, acceptor_config()));
        let requester = requester(transport.clone());

        let result = requester.request_peering("https://remote:6443").await;
        assert!(matches!(result, Err(HandshakeError::Rejected(_))));
        assert_eq!(transport.submit_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_exhausts_attempt_budget() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        transport.set_reachable(false);
        let requester = requester(transport.clone());

        let result = requester.request_peering("https://remote:6443").await;
        assert!(matches!(result, Err(HandshakeError::Unreachable(_))));
        // Submits never reached the remote side.
        assert_eq!(transport.submit_count(), 0);
    }

    #[tokio::test]
    async fn recovery_after_unreachable_succeeds() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        transport.set_reachable(false);
        let requester = requester(transport.clone());

        assert!(requester.request_peering("https://remote:6443").await.is_err());

        transport.set_reachable(true);
        assert!(requester.request_peering("https://remote:6443").await.is_ok());
    }

    #[tokio::test]
    async fn stale_pending_request_is_replaced() {
        let acceptor = PeeringAcceptor::new(AllowAll, acceptor_config());
        let transport = FakePeeringTransport::new(acceptor);
        let mut config = fast_config();
        config.request_ttl = chrono::Duration::zero();
        let requester = PeeringRequester::new(
            transport.clone(),
            identity("local"),
            PeeringScope::Bidirectional,
            config,
        );

        let (first, _) = requester
            .request_peering("https://remote:6443")
            .await
            .expect("first");
        // TTL of zero makes the pending request immediately stale.
        let (second, _) = requester
            .request_peering("https://remote:6443")
            .await
            .expect("second");

        assert_ne!(first.request_id, second.request_id);
        assert_eq!(transport.active_request_count(), 1);
    }

    #[tokio::test]
    async fn delete_remote_request_tolerates_absence() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        let requester = requester(transport);

        let ghost = PeeringRequestRef::new(ClusterId::new("remote").expect("valid id"));
        // Best-effort: no error either way.
        requester
            .delete_remote_request("https://remote:6443", &ghost)
            .await;
    }

    #[tokio::test]
    async fn delete_remote_request_tolerates_unreachable() {
        let transport = FakePeeringTransport::new(PeeringAcceptor::new(AllowAll, acceptor_config()));
        transport.set_reachable(false);
        let requester = requester(transport);

        let ghost = PeeringRequestRef::new(ClusterId::new("remote").expect("valid id"));
        requester
            .delete_remote_request("https://remote:6443", &ghost)
            .await;
    }

    // ==================== ACCEPTOR TESTS ====================

    #[test]
    fn acceptor_marks_request_accepted() {
        let acceptor = PeeringAcceptor::new(AllowAll, acceptor_config());
        let request = PeeringRequestRecord::new(identity("local"), PeeringScope::Bidirectional);

        acceptor.on_peering_request(&request).expect("accept");
        assert_eq!(acceptor.active_request_count(), 1);
    }

    #[test]
    fn superseding_scope_deletes_old_record() {
        let acceptor = PeeringAcceptor::new(AllowAll, acceptor_config());

        let first = PeeringRequestRecord::new(identity("local"), PeeringScope::Outbound);
        let (first_ref, _) = acceptor.on_peering_request(&first).expect("first");

        let second = PeeringRequestRecord::new(identity("local"), PeeringScope::Bidirectional);
        let (second_ref, _) = acceptor.on_peering_request(&second).expect("second");

        assert_ne!(first_ref.request_id, second_ref.request_id);
        assert_eq!(acceptor.active_request_count(), 1);
        assert!(acceptor.existing(&first.requestor.id).is_some());
    }

    #[test]
    fn allow_list_policy_filters_requestors() {
        let policy = AllowList::new([ClusterId::new("trusted").expect("valid id")]);
        let acceptor = PeeringAcceptor::new(policy, acceptor_config());

        let trusted = PeeringRequestRecord::new(identity("trusted"), PeeringScope::Bidirectional);
        assert!(acceptor.on_peering_request(&trusted).is_ok());

        let stranger = PeeringRequestRecord::new(identity("stranger"), PeeringScope::Bidirectional);
        assert!(matches!(
            acceptor.on_peering_request(&stranger),
            Err(HandshakeError::Rejected(_))
        ));
    }

    #[test]
    fn delete_request_is_idempotent() {
        let acceptor = PeeringAcceptor::new(AllowAll, acceptor_config());
        let request = PeeringRequestRecord::new(identity("local"), PeeringScope::Bidirectional);
        let (reference, _) = acceptor.on_peering_request(&request).expect("accept");

        acceptor.delete_request(reference.request_id);
        acceptor.delete_request(reference.request_id);
        assert_eq!(acceptor.active_request_count(), 0);
    }
}
