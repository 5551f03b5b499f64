//! Join request state machine.
//!
//! A request starts PENDING and ends APPROVED (after the `addMember`
//! transaction is confirmed) or REJECTED. Approval submits a transaction and
//! records its hash before waiting, so a failed wait can be resumed without
//! sending a second transaction.
//!
//! Decisions on one request are serialized twice: an in-process lock per id
//! makes concurrent callers of one service wait for each other, and an
//! approval claim stored on the request keeps approvers in other processes
//! out until the claim is released or its lease runs out.

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use teamsync_core::{
    member_metadata_uri, normalize_address, RequestId, RequestStatus, RoleCode, TeamId,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chain::{
    AddMemberCall, ChainClient, ChainEvent, EventKind, GasParams, TxHandle, TxReceipt, TxStatus,
};
use crate::config::WorkflowConfig;
use crate::error::{ChainError, WorkflowError};
use crate::membership::MembershipIndex;
use crate::storage::{JoinRequestRecord, NewJoinRequest, RequestFilter, RequestStats, Storage};

type Result<T> = std::result::Result<T, WorkflowError>;

const WEI_PER_GWEI: u128 = 1_000_000_000;

static CLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Claim token unique across processes sharing the store.
fn claim_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        CLAIM_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Creates and decides join requests.
pub struct JoinRequestService {
    storage: Storage,
    membership: MembershipIndex,
    client: Arc<dyn ChainClient>,
    config: WorkflowConfig,
    locks: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
}

impl JoinRequestService {
    /// Create a new service.
    pub fn new(storage: Storage, client: Arc<dyn ChainClient>, config: WorkflowConfig) -> Self {
        let membership = MembershipIndex::new(&storage);
        Self {
            storage,
            membership,
            client,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// File a PENDING request for `applicant` to join `team_id`.
    pub async fn create_join_request(
        &self,
        applicant: &str,
        team_id: TeamId,
        name: &str,
        role: RoleCode,
    ) -> Result<JoinRequestRecord> {
        let applicant = normalize_address(applicant)?;

        if self.membership.is_enrolled(&applicant).await? {
            return Err(WorkflowError::AlreadyMember(applicant.checksummed()));
        }
        if self
            .storage
            .find_pending_for_applicant(&applicant)
            .await?
            .is_some()
        {
            return Err(WorkflowError::DuplicatePendingRequest(applicant.checksummed()));
        }
        if self.storage.get_team(team_id).await?.is_none() {
            return Err(WorkflowError::TeamNotFound(team_id));
        }

        let request = self
            .storage
            .insert_join_request(&NewJoinRequest {
                applicant,
                team_id,
                name: name.to_string(),
                role,
            })
            .await?
            .ok_or_else(|| WorkflowError::DuplicatePendingRequest(applicant.checksummed()))?;

        info!(
            request_id = request.id,
            team_id,
            "Join request created for {}",
            applicant
        );
        Ok(request)
    }

    /// Approve or reject a PENDING request.
    ///
    /// Calls for the same id are serialized; a caller that waited behind a
    /// completed decision gets [`WorkflowError::RequestAlreadyProcessed`].
    /// While another process holds the approval claim, approving or rejecting
    /// fails with [`WorkflowError::ApprovalInProgress`].
    pub async fn handle_request(
        &self,
        request_id: RequestId,
        approve: bool,
        signer: &PrivateKeySigner,
    ) -> Result<JoinRequestRecord> {
        if approve {
            self.serialized(request_id, self.approve_locked(request_id, signer))
                .await
        } else {
            self.reject_request(request_id).await
        }
    }

    /// Reject a PENDING request. Never touches the chain.
    pub async fn reject_request(&self, request_id: RequestId) -> Result<JoinRequestRecord> {
        self.serialized(request_id, self.reject_locked(request_id))
            .await
    }

    /// Get a request by id.
    pub async fn get_request(&self, request_id: RequestId) -> Result<Option<JoinRequestRecord>> {
        Ok(self.storage.get_join_request(request_id).await?)
    }

    /// Requests matching `filter`, newest first.
    pub async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<JoinRequestRecord>> {
        Ok(self.storage.list_join_requests(filter).await?)
    }

    /// Number of requests matching `filter`.
    pub async fn count_requests(&self, filter: &RequestFilter) -> Result<u64> {
        Ok(self.storage.count_join_requests(filter).await?)
    }

    /// Per-status counts for a team.
    pub async fn team_request_stats(&self, team_id: TeamId) -> Result<RequestStats> {
        Ok(self.storage.join_request_stats(team_id).await?)
    }

    async fn serialized<F>(&self, request_id: RequestId, work: F) -> Result<JoinRequestRecord>
    where
        F: std::future::Future<Output = Result<JoinRequestRecord>>,
    {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(request_id).or_default())
        };

        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(&request_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&request_id);
        }

        result
    }

    async fn load_pending(&self, request_id: RequestId) -> Result<JoinRequestRecord> {
        let request = self
            .storage
            .get_join_request(request_id)
            .await?
            .ok_or(WorkflowError::RequestNotFound(request_id))?;

        if request.status.is_terminal() {
            return Err(WorkflowError::RequestAlreadyProcessed(request_id));
        }
        Ok(request)
    }

    async fn reject_locked(&self, request_id: RequestId) -> Result<JoinRequestRecord> {
        self.load_pending(request_id).await?;
        self.finish(request_id, RequestStatus::Rejected, None).await
    }

    async fn approve_locked(
        &self,
        request_id: RequestId,
        signer: &PrivateKeySigner,
    ) -> Result<JoinRequestRecord> {
        self.load_pending(request_id).await?;

        let claim = claim_token();
        let lease = i64::try_from(self.config.approval_lease_secs).unwrap_or(i64::MAX);
        if !self.storage.claim_approval(request_id, &claim, lease).await? {
            return Err(self.contended(request_id).await);
        }

        let result = self.approve_claimed(request_id, &claim, signer).await;
        if result.is_err() {
            if let Err(e) = self.storage.release_approval(request_id, &claim).await {
                warn!(request_id, "Failed to release approval claim: {:#}", e);
            }
        }
        result
    }

    async fn approve_claimed(
        &self,
        request_id: RequestId,
        claim: &str,
        signer: &PrivateKeySigner,
    ) -> Result<JoinRequestRecord> {
        // Re-read under the claim; an earlier holder may have sent a transaction.
        let request = self.load_pending(request_id).await?;

        let receipt = match request.approval_tx_hash {
            Some(tx_hash) => self.resume(&request, tx_hash, claim, signer).await?,
            None => self.submit_and_wait(&request, claim, signer).await?,
        };

        let logged = match self.client.extract_event(&receipt, EventKind::MemberAdded) {
            Ok(logged) => logged,
            Err(e) => {
                warn!(
                    request_id,
                    tx = %receipt.tx_hash,
                    block = receipt.block_number,
                    "addMember transaction succeeded without a MemberAdded event; \
                     retries will keep failing until an operator checks the team \
                     factory address or rejects the request"
                );
                return Err(e.into());
            }
        };
        if let ChainEvent::MemberAdded(added) = &logged.event {
            info!(
                request_id,
                member_id = added.member_id,
                block = receipt.block_number,
                "addMember confirmed for {}",
                request.applicant
            );
        }

        self.finish(request_id, RequestStatus::Approved, Some(claim))
            .await
    }

    /// Continue an approval whose transaction was already sent.
    async fn resume(
        &self,
        request: &JoinRequestRecord,
        tx_hash: B256,
        claim: &str,
        signer: &PrivateKeySigner,
    ) -> Result<TxReceipt> {
        match self.client.transaction_status(tx_hash).await? {
            TxStatus::Confirmed(receipt) => {
                info!(request_id = request.id, "Resuming with confirmed transaction {}", tx_hash);
                Ok(receipt)
            }
            TxStatus::Pending => {
                info!(request_id = request.id, "Transaction {} still pending, waiting", tx_hash);
                self.wait(request, TxHandle { tx_hash }, claim).await
            }
            TxStatus::Reverted | TxStatus::Unknown => {
                warn!(
                    request_id = request.id,
                    "Previous transaction {} reverted or dropped, resubmitting", tx_hash
                );
                self.record_tx(request.id, None, claim).await?;
                self.submit_and_wait(request, claim, signer).await
            }
        }
    }

    async fn submit_and_wait(
        &self,
        request: &JoinRequestRecord,
        claim: &str,
        signer: &PrivateKeySigner,
    ) -> Result<TxReceipt> {
        // The mirror may have caught up since the request was filed.
        if self.membership.is_enrolled(&request.applicant).await? {
            return Err(WorkflowError::AlreadyMember(request.applicant.checksummed()));
        }

        let call = AddMemberCall {
            member: request.applicant.address(),
            team_id: request.team_id,
            name: request.name.clone(),
            role: request.role,
            token_uri: member_metadata_uri(&request.applicant),
        };
        let gas = self.gas_params().await?;

        let handle = self
            .client
            .submit_add_member(signer, &call, &gas)
            .await?;
        self.record_tx(request.id, Some(handle.tx_hash), claim)
            .await?;

        self.wait(request, handle, claim).await
    }

    async fn wait(
        &self,
        request: &JoinRequestRecord,
        handle: TxHandle,
        claim: &str,
    ) -> Result<TxReceipt> {
        match self
            .client
            .wait_for_confirmation(&handle, self.config.confirmation_timeout())
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(e @ ChainError::TransactionFailed { .. }) => {
                self.record_tx(request.id, None, claim).await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_tx(
        &self,
        request_id: RequestId,
        tx_hash: Option<B256>,
        claim: &str,
    ) -> Result<()> {
        if self.storage.set_approval_tx(request_id, tx_hash, claim).await? {
            return Ok(());
        }

        if let Some(tx_hash) = tx_hash {
            warn!(
                request_id,
                "Approval claim lost after sending {}; transaction not recorded", tx_hash
            );
        }
        Err(self.contended(request_id).await)
    }

    /// Why a conditional update on a request did not apply.
    async fn contended(&self, request_id: RequestId) -> WorkflowError {
        match self.load_pending(request_id).await {
            Ok(_) => WorkflowError::ApprovalInProgress(request_id),
            Err(e) => e,
        }
    }

    async fn gas_params(&self) -> Result<GasParams> {
        let fees = self.client.estimate_fees().await?;

        let mut max_fee_per_gas = fees.max_fee_per_gas;
        if self.config.max_fee_per_gas_gwei > 0 {
            let cap = u128::from(self.config.max_fee_per_gas_gwei) * WEI_PER_GWEI;
            max_fee_per_gas = max_fee_per_gas.min(cap);
        }

        Ok(GasParams {
            gas_limit: self.config.gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas.min(max_fee_per_gas),
        })
    }

    async fn finish(
        &self,
        request_id: RequestId,
        to: RequestStatus,
        claim: Option<&str>,
    ) -> Result<JoinRequestRecord> {
        if !self
            .storage
            .transition_join_request(request_id, to, claim)
            .await?
        {
            return Err(self.contended(request_id).await);
        }

        info!(request_id, "Join request {}", to);

        self.storage
            .get_join_request(request_id)
            .await?
            .ok_or(WorkflowError::RequestNotFound(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::{ConfirmBehavior, FakeChainClient};
    use crate::chain::FeeEstimate;
    use crate::listener::apply::test_events::*;
    use crate::listener::EventSynchronizer;
    use crate::storage::test_util::temp_storage;
    use tempfile::NamedTempFile;

    const CAROL: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

    fn signer() -> PrivateKeySigner {
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap()
    }

    struct Harness {
        service: JoinRequestService,
        client: Arc<FakeChainClient>,
        storage: Storage,
        sync: EventSynchronizer,
        _db: NamedTempFile,
    }

    async fn harness(config: WorkflowConfig) -> Harness {
        let (storage, db) = temp_storage().await;
        let client = Arc::new(FakeChainClient::new());
        let sync = EventSynchronizer::new(storage.clone());

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0))
            .await
            .unwrap();

        Harness {
            service: JoinRequestService::new(storage.clone(), client.clone(), config),
            client,
            storage,
            sync,
            _db: db,
        }
    }

    async fn pending_request(h: &Harness) -> JoinRequestRecord {
        h.service
            .create_join_request(CAROL, 1, "Carol", 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;

        let rejected = h.service.handle_request(request.id, false, &signer()).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);

        let again = h.service.handle_request(request.id, false, &signer()).await;
        assert!(matches!(again, Err(WorkflowError::RequestAlreadyProcessed(id)) if id == request.id));

        let approve = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(approve, Err(WorkflowError::RequestAlreadyProcessed(_))));
        assert!(h.client.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_applicant_may_apply_again() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;
        h.service.reject_request(request.id).await.unwrap();

        let second = pending_request(&h).await;
        assert_ne!(second.id, request.id);
        assert_eq!(second.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_validations() {
        let h = harness(WorkflowConfig::default()).await;

        // Captain and member of team 1.
        let captain = h
            .service
            .create_join_request("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", 1, "Al", 1)
            .await;
        assert!(matches!(captain, Err(WorkflowError::AlreadyMember(_))));
        let member = h
            .service
            .create_join_request("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 1, "Bob", 1)
            .await;
        assert!(matches!(member, Err(WorkflowError::AlreadyMember(_))));
        assert_eq!(
            h.service.count_requests(&RequestFilter::default()).await.unwrap(),
            0
        );

        let invalid = h.service.create_join_request("0x1234", 1, "X", 1).await;
        assert!(matches!(invalid, Err(WorkflowError::InvalidAddress(_))));

        // Mixed case with a broken checksum.
        let bad_checksum = h
            .service
            .create_join_request("0x6d1EafbDa84661AC37b8398404197bAc1146380d", 1, "X", 1)
            .await;
        assert!(matches!(bad_checksum, Err(WorkflowError::InvalidAddress(_))));

        let no_team = h.service.create_join_request(CAROL, 42, "Carol", 1).await;
        assert!(matches!(no_team, Err(WorkflowError::TeamNotFound(42))));

        pending_request(&h).await;
        let duplicate = h
            .service
            .create_join_request("0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC", 1, "Carol", 2)
            .await;
        assert!(matches!(duplicate, Err(WorkflowError::DuplicatePendingRequest(_))));
        assert_eq!(
            h.service.count_requests(&RequestFilter::default()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_approve_submits_add_member() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;

        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert!(approved.approval_tx_hash.is_some());

        let submissions = h.client.submissions();
        assert_eq!(submissions.len(), 1);
        let call = &submissions[0];
        assert_eq!(call.member, request.applicant.address());
        assert_eq!(call.team_id, 1);
        assert_eq!(call.name, "Carol");
        assert_eq!(call.role, 1);
        assert_eq!(call.token_uri, "ipfs://member-CcCCcccc-metadata");

        let gas = h.client.submitted_gas()[0];
        assert_eq!(gas.gas_limit, 500_000);
        assert_eq!(gas.max_fee_per_gas, 30_000_000_000);
        assert_eq!(gas.max_priority_fee_per_gas, 1_000_000_000);

        let again = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(again, Err(WorkflowError::RequestAlreadyProcessed(_))));
        assert_eq!(h.client.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_fee_cap_applies() {
        let config = WorkflowConfig {
            max_fee_per_gas_gwei: 10,
            ..WorkflowConfig::default()
        };
        let h = harness(config).await;
        h.client.set_fees(FeeEstimate {
            max_fee_per_gas: 40_000_000_000,
            max_priority_fee_per_gas: 15_000_000_000,
        });
        let request = pending_request(&h).await;

        h.service.handle_request(request.id, true, &signer()).await.unwrap();

        let gas = h.client.submitted_gas()[0];
        assert_eq!(gas.max_fee_per_gas, 10_000_000_000);
        assert_eq!(gas.max_priority_fee_per_gas, 10_000_000_000);
    }

    #[tokio::test]
    async fn test_timeout_leaves_pending_then_resumes_without_resubmission() {
        let h = harness(WorkflowConfig::default()).await;
        h.client.set_confirm_behavior(ConfirmBehavior::Timeout);
        let request = pending_request(&h).await;

        let result = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Chain(ChainError::TransactionTimeout { .. }))
        ));
        assert!(result.as_ref().unwrap_err().is_retryable());

        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        let tx_hash = stored.approval_tx_hash.unwrap();

        // Still in the mempool: wait again, no second transaction.
        let result = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Chain(ChainError::TransactionTimeout { .. }))
        ));
        assert_eq!(h.client.submissions().len(), 1);

        // Mined after the caller gave up.
        h.client.mine_pending(tx_hash);
        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.approval_tx_hash, Some(tx_hash));
        assert_eq!(h.client.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_resubmitted() {
        let h = harness(WorkflowConfig::default()).await;
        h.client.set_confirm_behavior(ConfirmBehavior::Timeout);
        let request = pending_request(&h).await;

        h.service
            .handle_request(request.id, true, &signer())
            .await
            .unwrap_err();
        let first_hash = h
            .storage
            .get_join_request(request.id)
            .await
            .unwrap()
            .unwrap()
            .approval_tx_hash
            .unwrap();

        h.client.set_status(first_hash, TxStatus::Unknown);
        h.client.set_confirm_behavior(ConfirmBehavior::Confirm);

        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(h.client.submissions().len(), 2);
        assert_ne!(approved.approval_tx_hash, Some(first_hash));
    }

    #[tokio::test]
    async fn test_revert_clears_tx_hash() {
        let h = harness(WorkflowConfig::default()).await;
        h.client.set_confirm_behavior(ConfirmBehavior::Revert);
        let request = pending_request(&h).await;

        let result = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Chain(ChainError::TransactionFailed { .. }))
        ));

        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(stored.approval_tx_hash.is_none());

        h.client.set_confirm_behavior(ConfirmBehavior::Confirm);
        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(h.client.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_event_leaves_pending_without_resubmitting() {
        let h = harness(WorkflowConfig::default()).await;
        h.client.set_confirm_behavior(ConfirmBehavior::ConfirmWithoutEvent);
        let request = pending_request(&h).await;

        let result = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Chain(ChainError::EventNotFound { .. }))
        ));
        assert!(!result.as_ref().unwrap_err().is_retryable());

        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        let tx_hash = stored.approval_tx_hash.unwrap();

        // The confirmed receipt is reused; no second transaction is spent.
        let retry = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(
            retry,
            Err(WorkflowError::Chain(ChainError::EventNotFound { .. }))
        ));
        assert_eq!(h.client.submissions().len(), 1);
        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.approval_tx_hash, Some(tx_hash));

        // The claim was released, so the request can still be rejected.
        let rejected = h.service.reject_request(request.id).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn test_applicant_enrolled_before_approval() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;

        // Carol joins team 1 through some other path.
        h.sync
            .apply(&logged(member_added(0xcc, 1, 11), 3, 0))
            .await
            .unwrap();

        let result = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(result, Err(WorkflowError::AlreadyMember(_))));
        assert!(h.client.submissions().is_empty());

        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let h = harness(WorkflowConfig::default()).await;

        let result = h.service.handle_request(999, true, &signer()).await;
        assert!(matches!(result, Err(WorkflowError::RequestNotFound(999))));
        let result = h.service.reject_request(999).await;
        assert!(matches!(result, Err(WorkflowError::RequestNotFound(999))));
    }

    #[tokio::test]
    async fn test_concurrent_approvals_are_serialized() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;
        let signer = signer();

        let (a, b) = tokio::join!(
            h.service.handle_request(request.id, true, &signer),
            h.service.handle_request(request.id, true, &signer),
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(WorkflowError::RequestAlreadyProcessed(_)))));
        assert_eq!(h.client.submissions().len(), 1);
        assert!(h.service.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_approvals_from_separate_services_send_one_transaction() {
        let h = harness(WorkflowConfig::default()).await;
        let other = JoinRequestService::new(
            h.storage.clone(),
            h.client.clone(),
            WorkflowConfig::default(),
        );
        let request = pending_request(&h).await;
        let signer = signer();

        let (a, b) = tokio::join!(
            h.service.handle_request(request.id, true, &signer),
            other.handle_request(request.id, true, &signer),
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(WorkflowError::RequestAlreadyProcessed(_) | WorkflowError::ApprovalInProgress(_))
        )));
        assert_eq!(h.client.submissions().len(), 1);

        let stored = h.storage.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn test_claim_held_elsewhere_blocks_decisions() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;

        assert!(h
            .storage
            .claim_approval(request.id, "other-process", 300)
            .await
            .unwrap());

        let approve = h.service.handle_request(request.id, true, &signer()).await;
        assert!(matches!(approve, Err(WorkflowError::ApprovalInProgress(id)) if id == request.id));
        assert!(approve.unwrap_err().is_retryable());
        let reject = h.service.reject_request(request.id).await;
        assert!(matches!(reject, Err(WorkflowError::ApprovalInProgress(_))));
        assert!(h.client.submissions().is_empty());

        h.storage
            .release_approval(request.id, "other-process")
            .await
            .unwrap();
        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn test_expired_claim_is_taken_over() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;

        // Holder crashed; its lease is already over.
        h.storage
            .claim_approval(request.id, "crashed-process", -1)
            .await
            .unwrap();

        let approved = h.service.handle_request(request.id, true, &signer()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(h.client.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_read_queries() {
        let h = harness(WorkflowConfig::default()).await;
        let request = pending_request(&h).await;
        let other = h
            .service
            .create_join_request("0xdddddddddddddddddddddddddddddddddddddddd", 1, "Dan", 3)
            .await
            .unwrap();
        h.service.reject_request(other.id).await.unwrap();

        assert_eq!(
            h.service.get_request(request.id).await.unwrap().unwrap().name,
            "Carol"
        );
        let pending = RequestFilter {
            team_id: Some(1),
            status: Some(RequestStatus::Pending),
            ..Default::default()
        };
        assert_eq!(h.service.count_requests(&pending).await.unwrap(), 1);
        assert_eq!(h.service.list_requests(&pending).await.unwrap()[0].id, request.id);

        let stats = h.service.team_request_stats(1).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.rejected, 1);
    }
}
