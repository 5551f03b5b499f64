//! In-memory [`ChainClient`] for tests.

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::events::testing::rpc_log;
use super::events::{decode_logs, ChainEvent, EventKind, LoggedEvent, MemberAddedEvent};
use super::{
    AddMemberCall, ChainClient, EventStream, FeeEstimate, GasParams, TxHandle, TxReceipt,
    TxStatus,
};
use crate::error::ChainError;

/// What happens to the next submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmBehavior {
    /// Mined with a `MemberAdded` log.
    Confirm,
    /// Mined and reverted.
    Revert,
    /// Never mined within the wait.
    Timeout,
    /// Mined, but the receipt carries no `MemberAdded` log.
    ConfirmWithoutEvent,
}

struct FakeState {
    head: u64,
    logs: Vec<Log>,
    submissions: Vec<AddMemberCall>,
    gas: Vec<GasParams>,
    behavior: ConfirmBehavior,
    statuses: HashMap<B256, TxStatus>,
    in_flight: HashMap<B256, AddMemberCall>,
    range_queries: Vec<(EventKind, u64, u64)>,
    fees: FeeEstimate,
    next_member_id: u64,
}

type LiveItem = Result<LoggedEvent, ChainError>;

/// Chain double backed by a vector of logs and a channel for live events.
pub(crate) struct FakeChainClient {
    factory: Address,
    state: Mutex<FakeState>,
    live_tx: Mutex<Option<mpsc::UnboundedSender<LiveItem>>>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<LiveItem>>>,
}

impl FakeChainClient {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            factory: Address::repeat_byte(0xfa),
            state: Mutex::new(FakeState {
                head: 0,
                logs: Vec::new(),
                submissions: Vec::new(),
                gas: Vec::new(),
                behavior: ConfirmBehavior::Confirm,
                statuses: HashMap::new(),
                in_flight: HashMap::new(),
                range_queries: Vec::new(),
                fees: FeeEstimate {
                    max_fee_per_gas: 30_000_000_000,
                    max_priority_fee_per_gas: 1_000_000_000,
                },
                next_member_id: 100,
            }),
            live_tx: Mutex::new(Some(tx)),
            live_rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub(crate) fn set_fees(&self, fees: FeeEstimate) {
        self.state.lock().unwrap().fees = fees;
    }

    pub(crate) fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    /// Override what [`ChainClient::transaction_status`] reports.
    pub(crate) fn set_status(&self, tx_hash: B256, status: TxStatus) {
        self.state.lock().unwrap().statuses.insert(tx_hash, status);
    }

    /// Record a historical event. The head moves up to cover it.
    pub(crate) fn push_event(&self, event: ChainEvent, block_number: u64, log_index: u64) {
        let mut state = self.state.lock().unwrap();
        let tx_hash = synthetic_hash(block_number, log_index);
        state
            .logs
            .push(rpc_log(self.factory, &event, block_number, log_index, tx_hash));
        state.head = state.head.max(block_number);
    }

    /// Deliver an event on the live subscription.
    pub(crate) fn emit_live(&self, event: ChainEvent, block_number: u64, log_index: u64) {
        let logged = LoggedEvent {
            event,
            block_number,
            log_index,
            tx_hash: synthetic_hash(block_number, log_index),
        };
        if let Some(tx) = self.live_tx.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(Ok(logged));
        }
    }

    /// Drop the live connection.
    pub(crate) fn close_live(&self) {
        self.live_tx.lock().unwrap().take();
    }

    /// Mine a transaction left pending by [`ConfirmBehavior::Timeout`].
    pub(crate) fn mine_pending(&self, tx_hash: B256) {
        let mut state = self.state.lock().unwrap();
        let call = state
            .in_flight
            .remove(&tx_hash)
            .expect("no pending transaction with this hash");
        let block_number = state.head + 1;
        let receipt = self.mined_receipt(&mut state, &call, tx_hash, block_number);
        state.statuses.insert(tx_hash, TxStatus::Confirmed(receipt));
    }

    fn mined_receipt(
        &self,
        state: &mut FakeState,
        call: &AddMemberCall,
        tx_hash: B256,
        block_number: u64,
    ) -> TxReceipt {
        let member_id = state.next_member_id;
        state.next_member_id += 1;
        let event = ChainEvent::MemberAdded(MemberAddedEvent {
            member: call.member,
            team_id: call.team_id,
            name: call.name.clone(),
            role: call.role,
            member_id,
            token_uri: call.token_uri.clone(),
        });
        TxReceipt {
            tx_hash,
            block_number,
            gas_used: 120_000,
            logs: vec![rpc_log(self.factory, &event, block_number, 0, tx_hash)],
        }
    }

    pub(crate) fn submissions(&self) -> Vec<AddMemberCall> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub(crate) fn submitted_gas(&self) -> Vec<GasParams> {
        self.state.lock().unwrap().gas.clone()
    }

    pub(crate) fn range_queries(&self) -> Vec<(EventKind, u64, u64)> {
        self.state.lock().unwrap().range_queries.clone()
    }
}

fn synthetic_hash(block_number: u64, log_index: u64) -> B256 {
    B256::from(U256::from((block_number << 16) | log_index))
}

#[async_trait]
impl ChainClient for FakeChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn subscribe(&self) -> Result<EventStream, ChainError> {
        let rx = self
            .live_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ChainError::SubscriptionClosed)?;
        let closed = stream::once(async { Err(ChainError::SubscriptionClosed) });
        Ok(rx.chain(closed).boxed())
    }

    async fn events_in_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LoggedEvent>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.range_queries.push((kind, from_block, to_block));
        let logs: Vec<Log> = state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| b >= from_block && b <= to_block)
            })
            .cloned()
            .collect();
        Ok(decode_logs(&logs, kind))
    }

    async fn estimate_fees(&self) -> Result<FeeEstimate, ChainError> {
        Ok(self.state.lock().unwrap().fees)
    }

    async fn submit_add_member(
        &self,
        _signer: &PrivateKeySigner,
        call: &AddMemberCall,
        gas: &GasParams,
    ) -> Result<TxHandle, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(call.clone());
        state.gas.push(*gas);

        let tx_hash = B256::from(U256::from(0xabcd_0000u64 + state.submissions.len() as u64));
        let block_number = state.head + 1;

        let behavior = state.behavior;
        let status = match behavior {
            ConfirmBehavior::Confirm => {
                let receipt = self.mined_receipt(&mut state, call, tx_hash, block_number);
                TxStatus::Confirmed(receipt)
            }
            ConfirmBehavior::ConfirmWithoutEvent => TxStatus::Confirmed(TxReceipt {
                tx_hash,
                block_number,
                gas_used: 120_000,
                logs: Vec::new(),
            }),
            ConfirmBehavior::Revert => TxStatus::Reverted,
            ConfirmBehavior::Timeout => {
                state.in_flight.insert(tx_hash, call.clone());
                TxStatus::Pending
            }
        };
        state.statuses.insert(tx_hash, status);

        Ok(TxHandle { tx_hash })
    }

    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError> {
        let state = self.state.lock().unwrap();
        match state.statuses.get(&tx.tx_hash) {
            Some(TxStatus::Confirmed(receipt)) => Ok(receipt.clone()),
            Some(TxStatus::Reverted) => Err(ChainError::TransactionFailed { tx_hash: tx.tx_hash }),
            _ => Err(ChainError::TransactionTimeout {
                tx_hash: tx.tx_hash,
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(&tx_hash)
            .cloned()
            .unwrap_or(TxStatus::Unknown))
    }
}
