//! Sync state storage operations.

use super::{Storage, SyncState};
use anyhow::{Context, Result};
use sqlx::Row;

impl Storage {
    /// Get the current sync state.
    pub async fn get_sync_state(&self) -> Result<SyncState> {
        let row = sqlx::query(
            r#"
            SELECT last_block_number, chain_id, updated_at
            FROM sync_state
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch sync state")?;

        Ok(SyncState {
            last_block_number: row.get::<i64, _>("last_block_number") as u64,
            chain_id: row.get::<i64, _>("chain_id") as u64,
            updated_at: row.get("updated_at"),
        })
    }

    /// Record that every block up to and including `block_number` is mirrored.
    pub async fn update_sync_state(&self, block_number: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE sync_state
            SET last_block_number = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(block_number as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update sync state")?;

        Ok(())
    }

    /// Initialize sync state for a chain.
    ///
    /// Leaves an existing cursor alone when it belongs to the same chain; a
    /// different chain id is refused.
    pub async fn initialize_sync_state(&self, chain_id: u64, start_block: u64) -> Result<SyncState> {
        let current = self.get_sync_state().await?;

        if current.chain_id == chain_id {
            return Ok(current);
        }
        if current.chain_id != 0 {
            anyhow::bail!(
                "Database was synced against chain {} but config says chain {}",
                current.chain_id,
                chain_id
            );
        }

        let now = chrono::Utc::now().timestamp();
        let last_block = start_block.saturating_sub(1);

        sqlx::query(
            r#"
            UPDATE sync_state
            SET last_block_number = ?,
                chain_id = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(last_block as i64)
        .bind(chain_id as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to initialize sync state")?;

        self.get_sync_state().await
    }
}
