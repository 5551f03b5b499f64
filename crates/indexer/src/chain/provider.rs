//! Alloy-backed chain client.
//!
//! HTTP carries range queries, receipts, fee estimation and submissions; an
//! optional WebSocket connection carries the live log subscription.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use anyhow::Context;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::events::{decode_logs, EventKind, LoggedEvent, TeamFactory};
use super::{
    AddMemberCall, ChainClient, EventStream, FeeEstimate, GasParams, TxHandle, TxReceipt,
    TxStatus,
};
use crate::error::ChainError;

/// Chain client for the team factory contract.
#[derive(Clone)]
pub struct RpcChainClient {
    rpc_url: alloy::transports::http::reqwest::Url,
    provider: RootProvider<Http<Client>>,
    ws_provider: Option<RootProvider<PubSubFrontend>>,
    factory: Address,
    confirmations: u64,
    poll_interval: Duration,
}

impl RpcChainClient {
    /// Connect to the node.
    ///
    /// `ws_url` is only needed for [`ChainClient::subscribe`]; without it the
    /// client still serves backfill and the join request workflow.
    pub async fn new(
        rpc_url: &str,
        ws_url: Option<&str>,
        factory: Address,
        confirmations: u64,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let url: alloy::transports::http::reqwest::Url = rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;

        let provider = ProviderBuilder::new().on_http(url.clone());

        let ws_provider = match ws_url {
            Some(ws_url) => {
                let ws = ProviderBuilder::new()
                    .on_ws(WsConnect::new(ws_url))
                    .await
                    .with_context(|| format!("Failed to connect WebSocket: {}", ws_url))?;
                info!("WebSocket connection established");
                Some(ws)
            }
            None => None,
        };

        Ok(Self {
            rpc_url: url,
            provider,
            ws_provider,
            factory,
            confirmations,
            poll_interval,
        })
    }

    /// Poll until the receipt is `confirmations` deep or reverted.
    async fn poll_confirmation(&self, tx: &TxHandle) -> Result<TxReceipt, ChainError> {
        loop {
            let receipt = match self.provider.get_transaction_receipt(tx.tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!("Failed to get receipt for {}: {}, retrying...", tx.tx_hash, e);
                    None
                }
            };

            if let Some(receipt) = receipt {
                if !receipt.status() {
                    warn!(
                        "Transaction reverted: {} in block {} (gas used: {})",
                        receipt.transaction_hash,
                        receipt.block_number.unwrap_or_default(),
                        receipt.gas_used
                    );
                    return Err(ChainError::TransactionFailed {
                        tx_hash: tx.tx_hash,
                    });
                }

                let receipt = Self::receipt_from_rpc(&receipt)?;
                let head = self.latest_block().await?;
                let depth = head.saturating_sub(receipt.block_number);
                if depth >= self.confirmations {
                    info!(
                        "Transaction {} confirmed in block {} ({} confirmations)",
                        tx.tx_hash, receipt.block_number, depth
                    );
                    return Ok(receipt);
                }
                debug!(
                    "Waiting for confirmations: {}/{} (tx block: {})",
                    depth, self.confirmations, receipt.block_number
                );
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn receipt_from_rpc(receipt: &TransactionReceipt) -> Result<TxReceipt, ChainError> {
        let block_number = receipt
            .block_number
            .ok_or_else(|| ChainError::Rpc("Transaction receipt missing block number".into()))?;

        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number,
            gas_used: u128::from(receipt.gas_used),
            logs: receipt.inner.logs().to_vec(),
        })
    }
}

fn rpc_error<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> ChainError {
    move |e| ChainError::Rpc(format!("{}: {}", context, e))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(rpc_error("Failed to get block number"))
    }

    async fn subscribe(&self) -> Result<EventStream, ChainError> {
        let ws = self
            .ws_provider
            .as_ref()
            .ok_or_else(|| ChainError::Rpc("Live subscription requires network.ws_url".into()))?;

        let topics: Vec<B256> = EventKind::ALL.iter().map(EventKind::signature_hash).collect();
        let filter = Filter::new().address(self.factory).event_signature(topics);

        let subscription = ws
            .subscribe_logs(&filter)
            .await
            .map_err(rpc_error("Failed to subscribe to logs"))?;

        info!("Subscribed to team factory events at {}", self.factory);

        let events = subscription.into_stream().filter_map(|log: Log| async move {
            match LoggedEvent::from_log(&log) {
                Ok(Some(event)) => Some(Ok(event)),
                Ok(None) => None,
                Err(e) => {
                    warn!("Skipping undecodable live log: {}", e);
                    None
                }
            }
        });

        // The underlying stream ends when the socket drops; surface that.
        let closed = stream::once(async { Err(ChainError::SubscriptionClosed) });

        Ok(events.chain(closed).boxed())
    }

    async fn events_in_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LoggedEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.factory)
            .event_signature(kind.signature_hash())
            .from_block(from_block)
            .to_block(to_block);

        let logs: Vec<Log> = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(rpc_error("Failed to fetch logs from RPC"))?;

        debug!(
            "Fetched {} {} logs for blocks {}..={}",
            logs.len(),
            kind,
            from_block,
            to_block
        );

        Ok(decode_logs(&logs, kind))
    }

    async fn estimate_fees(&self) -> Result<FeeEstimate, ChainError> {
        let estimate = self
            .provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(rpc_error("Failed to estimate fees"))?;

        Ok(FeeEstimate {
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
        })
    }

    async fn submit_add_member(
        &self,
        signer: &PrivateKeySigner,
        call: &AddMemberCall,
        gas: &GasParams,
    ) -> Result<TxHandle, ChainError> {
        let wallet = EthereumWallet::from(signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());

        let contract = TeamFactory::new(self.factory, provider);

        let pending = contract
            .addMember(
                call.member,
                U256::from(call.team_id),
                call.name.clone(),
                call.role,
                call.token_uri.clone(),
            )
            .gas(gas.gas_limit)
            .max_fee_per_gas(gas.max_fee_per_gas)
            .max_priority_fee_per_gas(gas.max_priority_fee_per_gas)
            .send()
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        info!(
            "addMember transaction sent: {} (member={}, team={})",
            tx_hash, call.member, call.team_id
        );

        Ok(TxHandle { tx_hash })
    }

    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError> {
        let start = Instant::now();

        // Bounds the RPC calls too; a stalled node must not outlast the timeout.
        match tokio::time::timeout(timeout, self.poll_confirmation(tx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Transaction {} not confirmed within {}s",
                    tx.tx_hash,
                    timeout.as_secs()
                );
                Err(ChainError::TransactionTimeout {
                    tx_hash: tx.tx_hash,
                    waited_secs: start.elapsed().as_secs(),
                })
            }
        }
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_error("Failed to get transaction receipt"))?;

        if let Some(receipt) = receipt {
            if !receipt.status() {
                return Ok(TxStatus::Reverted);
            }
            return Ok(TxStatus::Confirmed(Self::receipt_from_rpc(&receipt)?));
        }

        let known = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(rpc_error("Failed to get transaction"))?;

        Ok(if known.is_some() {
            TxStatus::Pending
        } else {
            TxStatus::Unknown
        })
    }
}
