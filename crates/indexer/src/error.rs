//! Error taxonomy for the chain adapter and the join request workflow.
//!
//! Storage and orchestration code returns `anyhow::Result`; the typed errors
//! here are the ones callers are expected to match on.

use alloy::primitives::B256;
use teamsync_core::{CoreError, RequestId, TeamId};
use thiserror::Error;

/// Failures surfaced by a [`ChainClient`](crate::chain::ChainClient).
#[derive(Error, Debug)]
pub enum ChainError {
    /// Transport or node-side RPC failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A log matched an event signature but its payload did not decode.
    #[error("Failed to decode {event} log: {reason}")]
    Decode {
        /// Event name.
        event: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// The node refused the transaction before it was broadcast.
    #[error("Transaction submission failed: {0}")]
    Submission(String),

    /// The transaction was mined but reverted.
    #[error("Transaction {tx_hash} reverted")]
    TransactionFailed {
        /// Hash of the reverted transaction.
        tx_hash: B256,
    },

    /// No confirmed receipt within the configured bound.
    #[error("Transaction {tx_hash} not confirmed after {waited_secs}s")]
    TransactionTimeout {
        /// Hash of the transaction still in flight.
        tx_hash: B256,
        /// How long the caller waited.
        waited_secs: u64,
    },

    /// The receipt does not contain the expected event.
    #[error("Event {event} not found in receipt of {tx_hash}")]
    EventNotFound {
        /// Event name that was expected.
        event: &'static str,
        /// Transaction whose logs were searched.
        tx_hash: B256,
    },

    /// The live subscription ended. Fatal for the sync loop.
    #[error("Live event subscription closed")]
    SubscriptionClosed,
}

/// Failures of the join request state machine.
///
/// Every variant leaves the request in the state it was in before the call.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Applicant address is malformed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Applicant is already a captain or a member of some team.
    #[error("Applicant {0} is already a member or captain of a team")]
    AlreadyMember(String),

    /// Applicant already has a PENDING request (for any team).
    #[error("Applicant {0} already has a pending request")]
    DuplicatePendingRequest(String),

    /// Target team is not present in the mirrored state.
    #[error("Team {0} not found")]
    TeamNotFound(TeamId),

    /// No request with this id.
    #[error("Join request {0} not found")]
    RequestNotFound(RequestId),

    /// The request already reached a terminal status.
    #[error("Join request {0} has already been processed")]
    RequestAlreadyProcessed(RequestId),

    /// Another caller holds the approval claim on this request.
    #[error("Join request {0} is being approved by another caller")]
    ApprovalInProgress(RequestId),

    /// Chain-side failure; the request stays PENDING and can be retried.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Store failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<CoreError> for WorkflowError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidAddress(input) => WorkflowError::InvalidAddress(input),
            other => WorkflowError::Storage(other.into()),
        }
    }
}

impl WorkflowError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Storage(_)
                | WorkflowError::ApprovalInProgress(_)
                | WorkflowError::Chain(
                    ChainError::Rpc(_)
                        | ChainError::Submission(_)
                        | ChainError::TransactionFailed { .. }
                        | ChainError::TransactionTimeout { .. }
                )
        )
    }
}
