//! Join request storage operations.

use super::{JoinRequestRecord, NewJoinRequest, RequestFilter, RequestStats, Storage};
use alloy::primitives::B256;
use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Row, Sqlite};
use teamsync_core::{NormalizedAddress, RequestId, RequestStatus, TeamId};

const SELECT_REQUEST: &str = r#"
    SELECT id, applicant, team_id, name, role, status,
           approval_tx_hash, created_at, updated_at
    FROM join_requests
"#;

impl Storage {
    /// Insert a PENDING join request.
    ///
    /// Returns `None` when the applicant already has a PENDING request.
    pub async fn insert_join_request(
        &self,
        request: &NewJoinRequest,
    ) -> Result<Option<JoinRequestRecord>> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO join_requests (applicant, team_id, name, role, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', ?, ?)
            "#,
        )
        .bind(request.applicant.canonical())
        .bind(request.team_id as i64)
        .bind(&request.name)
        .bind(request.role as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to insert join request"),
        };

        Ok(Some(JoinRequestRecord {
            id,
            applicant: request.applicant,
            team_id: request.team_id,
            name: request.name.clone(),
            role: request.role,
            status: RequestStatus::Pending,
            approval_tx_hash: None,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Get a join request by id.
    pub async fn get_join_request(&self, id: RequestId) -> Result<Option<JoinRequestRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_REQUEST))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_join_request).transpose()
    }

    /// The applicant's PENDING request, if any.
    pub async fn find_pending_for_applicant(
        &self,
        applicant: &NormalizedAddress,
    ) -> Result<Option<JoinRequestRecord>> {
        let row = sqlx::query(&format!(
            "{} WHERE applicant = ? AND status = 'PENDING'",
            SELECT_REQUEST
        ))
        .bind(applicant.canonical())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_join_request).transpose()
    }

    /// Requests matching `filter`, newest first.
    pub async fn list_join_requests(&self, filter: &RequestFilter) -> Result<Vec<JoinRequestRecord>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_REQUEST);
        push_filter(&mut query, filter);
        query.push(" ORDER BY id DESC");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
            if let Some(offset) = filter.offset {
                query.push(" OFFSET ").push_bind(offset as i64);
            }
        } else if let Some(offset) = filter.offset {
            query.push(" LIMIT -1 OFFSET ").push_bind(offset as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_join_request).collect()
    }

    /// Number of requests matching `filter`. Paging fields are ignored.
    pub async fn count_join_requests(&self, filter: &RequestFilter) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM join_requests");
        push_filter(&mut query, filter);

        let count: i64 = query.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Per-status counts for a team.
    pub async fn join_request_stats(&self, team_id: TeamId) -> Result<RequestStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM join_requests
            WHERE team_id = ?
            GROUP BY status
            "#,
        )
        .bind(team_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = RequestStats::default();
        for row in rows {
            let status: String = row.get("status");
            let total = row.get::<i64, _>("total") as u64;
            match status.parse::<RequestStatus>()? {
                RequestStatus::Pending => stats.pending = total,
                RequestStatus::Approved => stats.approved = total,
                RequestStatus::Rejected => stats.rejected = total,
            }
        }
        Ok(stats)
    }

    /// Claim a PENDING request for approval until `lease_secs` from now.
    ///
    /// Succeeds when no claim is held or the held claim has expired. Returns
    /// `false` when the request is not PENDING or another live claim holds it.
    pub async fn claim_approval(
        &self,
        id: RequestId,
        claim: &str,
        lease_secs: i64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE join_requests
            SET approval_claim = ?, approval_claim_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'PENDING'
              AND (approval_claim IS NULL OR approval_claim_expires_at <= ?)
            "#,
        )
        .bind(claim)
        .bind(now.saturating_add(lease_secs))
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to claim join request")?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop the approval claim if `claim` still holds it.
    pub async fn release_approval(&self, id: RequestId, claim: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE join_requests
            SET approval_claim = NULL, approval_claim_expires_at = NULL
            WHERE id = ? AND approval_claim = ?
            "#,
        )
        .bind(id)
        .bind(claim)
        .execute(&self.pool)
        .await
        .context("Failed to release join request claim")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record (or clear) the `addMember` transaction of a PENDING request.
    ///
    /// Requires `claim` to hold the approval claim. Returns `false` when the
    /// request is not PENDING or the claim was lost.
    pub async fn set_approval_tx(
        &self,
        id: RequestId,
        tx_hash: Option<B256>,
        claim: &str,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE join_requests
            SET approval_tx_hash = ?, updated_at = ?
            WHERE id = ? AND status = 'PENDING' AND approval_claim = ?
            "#,
        )
        .bind(tx_hash.as_ref().map(|h| h.as_slice()))
        .bind(now)
        .bind(id)
        .bind(claim)
        .execute(&self.pool)
        .await
        .context("Failed to record approval transaction")?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a PENDING request to a terminal status and drop any claim.
    ///
    /// A live approval claim blocks the transition unless `claim` holds it.
    /// Returns `false` (and writes nothing) when the request is not PENDING
    /// or is claimed by someone else.
    pub async fn transition_join_request(
        &self,
        id: RequestId,
        to: RequestStatus,
        claim: Option<&str>,
    ) -> Result<bool> {
        anyhow::ensure!(to.is_terminal(), "Cannot transition join request to {}", to);
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE join_requests
            SET status = ?, updated_at = ?,
                approval_claim = NULL, approval_claim_expires_at = NULL
            WHERE id = ? AND status = 'PENDING'
              AND (approval_claim IS NULL
                   OR approval_claim = ?
                   OR approval_claim_expires_at <= ?)
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(claim)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update join request status")?;

        Ok(result.rows_affected() > 0)
    }

    fn row_to_join_request(row: sqlx::sqlite::SqliteRow) -> Result<JoinRequestRecord> {
        let applicant: String = row.get("applicant");
        let status: String = row.get("status");
        let tx_hash: Option<Vec<u8>> = row.get("approval_tx_hash");

        let approval_tx_hash = match tx_hash {
            Some(bytes) if bytes.len() == 32 => Some(B256::from_slice(&bytes)),
            Some(bytes) => anyhow::bail!("Corrupt approval_tx_hash of length {}", bytes.len()),
            None => None,
        };

        Ok(JoinRequestRecord {
            id: row.get("id"),
            applicant: NormalizedAddress::parse(&applicant)
                .with_context(|| format!("Corrupt applicant address: {}", applicant))?,
            team_id: row.get::<i64, _>("team_id") as u64,
            name: row.get("name"),
            role: row.get::<i64, _>("role") as u8,
            status: status.parse()?,
            approval_tx_hash,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &RequestFilter) {
    let mut separator = " WHERE ";

    if let Some(team_id) = filter.team_id {
        query.push(separator).push("team_id = ").push_bind(team_id as i64);
        separator = " AND ";
    }
    if let Some(applicant) = &filter.applicant {
        query
            .push(separator)
            .push("applicant = ")
            .push_bind(applicant.canonical());
        separator = " AND ";
    }
    if let Some(status) = filter.status {
        query.push(separator).push("status = ").push_bind(status.as_str());
    }
}
