//! Chain client adapter for the team factory contract.
//!
//! This module provides:
//! - Event type definitions and log decoding ([`events`])
//! - The [`ChainClient`] trait consumed by the synchronizer and the workflow
//! - An alloy-backed implementation over HTTP + WebSocket ([`provider`])

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use teamsync_core::{RoleCode, TeamId};

use crate::error::ChainError;

pub mod events;
pub mod provider;

#[cfg(test)]
pub(crate) mod fake;

pub use events::{
    ChainEvent, EventKind, LoggedEvent, MemberAddedEvent, MemberUriUpdate, TeamCreatedEvent,
    TeamDissolvedEvent, TeamUrisUpdatedEvent,
};
pub use provider::RpcChainClient;

/// Live event sequence. Yields `Err(ChainError::SubscriptionClosed)` once the
/// connection is lost; nothing is yielded after that.
pub type EventStream = BoxStream<'static, Result<LoggedEvent, ChainError>>;

/// Arguments of `addMember` on the team factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMemberCall {
    /// Account being added.
    pub member: Address,
    /// Target team.
    pub team_id: TeamId,
    /// Member display name.
    pub name: String,
    /// Role code.
    pub role: RoleCode,
    /// Metadata URI minted with the membership.
    pub token_uri: String,
}

/// EIP-1559 fee estimate from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    /// Max fee per gas (wei).
    pub max_fee_per_gas: u128,
    /// Max priority fee per gas (wei).
    pub max_priority_fee_per_gas: u128,
}

/// Gas parameters attached to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasParams {
    /// Gas limit.
    pub gas_limit: u64,
    /// Max fee per gas (wei).
    pub max_fee_per_gas: u128,
    /// Max priority fee per gas (wei).
    pub max_priority_fee_per_gas: u128,
}

/// Handle to a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    /// Transaction hash.
    pub tx_hash: B256,
}

/// A successful, confirmed transaction receipt.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Inclusion block.
    pub block_number: u64,
    /// Gas consumed.
    pub gas_used: u128,
    /// Logs emitted by the transaction.
    pub logs: Vec<Log>,
}

/// Point-in-time view of a previously submitted transaction.
#[derive(Debug, Clone)]
pub enum TxStatus {
    /// Mined successfully.
    Confirmed(TxReceipt),
    /// Mined and reverted.
    Reverted,
    /// Known to the node but not mined yet.
    Pending,
    /// Unknown to the node (dropped or never broadcast).
    Unknown,
}

/// Abstraction over the chain node.
///
/// The synchronizer and the join request workflow only talk to the chain
/// through this trait, so tests can substitute an in-memory double.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number known to the node.
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Open the live subscription for all four event kinds.
    ///
    /// The returned stream is infinite until the connection drops and cannot
    /// be restarted; open a new subscription instead.
    async fn subscribe(&self) -> Result<EventStream, ChainError>;

    /// Decoded events of one kind in an inclusive block range, ordered by
    /// block number then log index.
    async fn events_in_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LoggedEvent>, ChainError>;

    /// Current EIP-1559 fee estimate.
    async fn estimate_fees(&self) -> Result<FeeEstimate, ChainError>;

    /// Sign and broadcast `addMember`.
    async fn submit_add_member(
        &self,
        signer: &PrivateKeySigner,
        call: &AddMemberCall,
        gas: &GasParams,
    ) -> Result<TxHandle, ChainError>;

    /// Block until the transaction is confirmed, it reverts, or `timeout` elapses.
    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError>;

    /// Look up a transaction submitted earlier.
    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ChainError>;

    /// First event of `kind` in the receipt's logs.
    fn extract_event(&self, receipt: &TxReceipt, kind: EventKind) -> Result<LoggedEvent, ChainError> {
        events::first_event(&receipt.logs, kind).ok_or(ChainError::EventNotFound {
            event: kind.name(),
            tx_hash: receipt.tx_hash,
        })
    }
}
