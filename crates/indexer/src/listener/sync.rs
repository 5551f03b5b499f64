//! Sync engine for historical backfill and the live subscription.

use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::apply::{ApplyTally, EventSynchronizer};
use crate::chain::{ChainClient, ChainEvent, EventKind, LoggedEvent};
use crate::config::SyncConfig;
use crate::error::ChainError;

/// Drives an [`EventSynchronizer`] from a [`ChainClient`].
pub struct SyncEngine {
    client: Arc<dyn ChainClient>,
    synchronizer: EventSynchronizer,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        client: Arc<dyn ChainClient>,
        synchronizer: EventSynchronizer,
        config: SyncConfig,
    ) -> Self {
        Self {
            client,
            synchronizer,
            config,
        }
    }

    /// The synchronizer this engine feeds.
    pub fn synchronizer(&self) -> &EventSynchronizer {
        &self.synchronizer
    }

    /// Run until the live subscription is lost.
    ///
    /// Catches up to the safe head first, then follows the subscription.
    /// Only returns on error; losing the subscription is reported as
    /// [`ChainError::SubscriptionClosed`].
    pub async fn run(&self) -> Result<()> {
        info!("Sync engine starting...");
        self.run_live().await
    }

    /// Subscribe, catch up, then apply live events in delivery order.
    ///
    /// The subscription is opened before catching up so nothing emitted in
    /// between is missed; events at or below the caught-up block are skipped.
    pub async fn run_live(&self) -> Result<()> {
        let mut stream = self
            .client
            .subscribe()
            .await
            .context("Failed to open live subscription")?;

        let mut synced = self.catch_up().await?;
        let caught_up = synced;
        info!("Caught up to block {}, following live events", synced);

        let storage = self.synchronizer.storage();

        while let Some(item) = stream.next().await {
            let event = item?;

            if event.block_number <= caught_up {
                debug!(
                    "Skipping live {} at block {} (already backfilled)",
                    event.event.kind(),
                    event.block_number
                );
                continue;
            }

            self.synchronizer.apply(&event).await.with_context(|| {
                format!(
                    "Failed to apply live {} at block {}",
                    event.event.kind(),
                    event.block_number
                )
            })?;

            // Later events may share this block, so only the previous one is complete.
            let complete = event.block_number - 1;
            if complete > synced {
                storage.update_sync_state(complete).await?;
                synced = complete;
            }
        }

        Err(ChainError::SubscriptionClosed.into())
    }

    /// Backfill from the stored cursor to `head - confirmations`.
    ///
    /// Returns the last block now mirrored.
    pub async fn catch_up(&self) -> Result<u64> {
        let sync_state = self.synchronizer.storage().get_sync_state().await?;
        let current_block = self.client.latest_block().await?;
        let safe_block = current_block.saturating_sub(self.config.confirmations);
        let last_synced = sync_state.last_block_number;

        info!(
            "Sync status: last={}, current={}, safe={}, confirmations={}",
            last_synced, current_block, safe_block, self.config.confirmations
        );

        if safe_block <= last_synced {
            return Ok(last_synced);
        }

        self.backfill(last_synced + 1, safe_block).await?;
        Ok(safe_block)
    }

    /// Apply every event in `[from, to]`, one `batch_size` window at a time.
    ///
    /// Each window is cut after every `TeamDissolved`. Within a segment all
    /// `TeamCreated` events are applied first, then all `MemberAdded`, then
    /// `TeamURIsUpdated` and `TeamDissolved` merged in chain order. The cursor
    /// advances after each window and never moves backwards. Re-running over
    /// the same range, or any older range, changes nothing.
    pub async fn backfill(&self, from: u64, to: u64) -> Result<ApplyTally> {
        let mut total = ApplyTally::default();
        if from > to {
            return Ok(total);
        }

        let batch_size = self.config.batch_size.max(1);
        let storage = self.synchronizer.storage();
        let mut start = from;

        loop {
            let end = start.saturating_add(batch_size - 1).min(to);

            info!(
                "Historical sync: processing blocks {} to {} ({} blocks)",
                start,
                end,
                end - start + 1
            );

            let events = self
                .window_events(start, end)
                .await
                .with_context(|| format!("Failed to fetch logs for blocks {} to {}", start, end))?;

            let mut tally = ApplyTally::default();
            for event in &events {
                let outcome = self.synchronizer.apply(event).await.with_context(|| {
                    format!(
                        "Failed to apply {} at block {} (log {})",
                        event.event.kind(),
                        event.block_number,
                        event.log_index
                    )
                })?;
                tally.add(&outcome);
            }

            info!(
                "Batch complete: {} applied, {} duplicate, {} dropped, {} missing",
                tally.applied, tally.duplicates, tally.dropped, tally.missing
            );

            if end > storage.get_sync_state().await?.last_block_number {
                storage.update_sync_state(end).await?;
            }

            total.applied += tally.applied;
            total.duplicates += tally.duplicates;
            total.dropped += tally.dropped;
            total.missing += tally.missing;

            if end >= to {
                break;
            }
            start = end + 1;
        }

        Ok(total)
    }

    async fn window_events(&self, from: u64, to: u64) -> Result<Vec<LoggedEvent>, ChainError> {
        let mut events = Vec::new();
        for kind in EventKind::ALL {
            events.extend(self.client.events_in_range(kind, from, to).await?);
        }
        Ok(phase_order(events))
    }
}

/// Order one window's events for application.
///
/// A dissolution frees its captain and members, who may enroll again later in
/// the same window, so phases never cross a dissolution.
fn phase_order(mut events: Vec<LoggedEvent>) -> Vec<LoggedEvent> {
    let mut cuts: Vec<(u64, u64)> = events
        .iter()
        .filter(|e| matches!(e.event, ChainEvent::TeamDissolved(_)))
        .map(LoggedEvent::position)
        .collect();
    cuts.sort_unstable();

    events.sort_by_key(|e| {
        let position = e.position();
        let segment = cuts.partition_point(|cut| *cut < position);
        let phase = match e.event {
            ChainEvent::TeamCreated(_) => 0,
            ChainEvent::MemberAdded(_) => 1,
            ChainEvent::TeamUrisUpdated(_) | ChainEvent::TeamDissolved(_) => 2,
        };
        (segment, phase, position)
    });
    events
}
