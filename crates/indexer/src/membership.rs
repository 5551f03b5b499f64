//! Membership lookups over the mirrored state.
//!
//! An address is *enrolled* when it captains a team or is a member of one.
//! The join request workflow uses this to refuse applicants who already
//! belong somewhere.

use anyhow::Result;
use sqlx::SqlitePool;
use teamsync_core::NormalizedAddress;

use crate::storage::Storage;

/// Read-only membership queries.
#[derive(Debug, Clone)]
pub struct MembershipIndex {
    pool: SqlitePool,
}

impl MembershipIndex {
    /// Build an index over the given storage.
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool().clone(),
        }
    }

    /// Whether `address` captains a mirrored team.
    pub async fn is_captain(&self, address: &NormalizedAddress) -> Result<bool> {
        self.exists("SELECT EXISTS(SELECT 1 FROM teams WHERE captain_address = ?)", address)
            .await
    }

    /// Whether `address` is a mirrored team member.
    pub async fn is_member(&self, address: &NormalizedAddress) -> Result<bool> {
        self.exists("SELECT EXISTS(SELECT 1 FROM members WHERE address = ?)", address)
            .await
    }

    /// Whether `address` is a captain or a member.
    pub async fn is_enrolled(&self, address: &NormalizedAddress) -> Result<bool> {
        self.exists(
            r#"
            SELECT EXISTS(SELECT 1 FROM teams WHERE captain_address = ?1)
                OR EXISTS(SELECT 1 FROM members WHERE address = ?1)
            "#,
            address,
        )
        .await
    }

    async fn exists(&self, sql: &'static str, address: &NormalizedAddress) -> Result<bool> {
        let found: bool = sqlx::query_scalar(sql)
            .bind(address.canonical())
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }
}
