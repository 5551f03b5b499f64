//! Team and member storage operations.
//!
//! Only the event synchronizer writes these tables.

use super::{DissolveOutcome, MemberRecord, NewMember, NewTeam, Storage, TeamRecord, TeamWithMembers};
use anyhow::{Context, Result};
use sqlx::Row;
use teamsync_core::{MemberId, NormalizedAddress, TeamId};

impl Storage {
    /// Insert a team. Returns `false` when a team with this id already exists.
    pub async fn insert_team(&self, team: &NewTeam) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO teams (id, name, token_uri, captain_address, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(team.id as i64)
        .bind(&team.name)
        .bind(&team.token_uri)
        .bind(team.captain_address.canonical())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert team")?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert a member. Returns `false` when a member with this id already exists.
    pub async fn insert_member(&self, member: &NewMember) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO members (id, name, token_uri, address, role, team_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(member.id as i64)
        .bind(&member.name)
        .bind(&member.token_uri)
        .bind(member.address.canonical())
        .bind(member.role as i64)
        .bind(member.team_id as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert member")?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply a `TeamURIsUpdated` payload.
    ///
    /// Updates the team name (and URI when given) and the URI of each listed
    /// member that belongs to the team and carries a new value. Returns
    /// `false` when the team is not mirrored; nothing is written then.
    pub async fn update_team_uris(
        &self,
        team_id: TeamId,
        name: &str,
        team_uri: Option<&str>,
        member_uris: &[(MemberId, String)],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE teams
            SET name = ?,
                token_uri = COALESCE(?, token_uri)
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(team_uri)
        .bind(team_id as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to update team")?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (member_id, token_uri) in member_uris {
            sqlx::query("UPDATE members SET token_uri = ? WHERE id = ? AND team_id = ?")
                .bind(token_uri)
                .bind(*member_id as i64)
                .bind(team_id as i64)
                .execute(&mut *tx)
                .await
                .context("Failed to update member URI")?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Delete a team and all of its members atomically.
    ///
    /// The team id is recorded in `dissolved_teams` in the same transaction.
    /// Join requests are not touched.
    pub async fn dissolve_team(
        &self,
        team_id: TeamId,
        block_number: u64,
    ) -> Result<DissolveOutcome> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO dissolved_teams (id, captain_address, block_number, dissolved_at)
            SELECT id, captain_address, ?, ? FROM teams WHERE id = ?
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(block_number as i64)
        .bind(now)
        .bind(team_id as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to record dissolved team")?;

        let members = sqlx::query("DELETE FROM members WHERE team_id = ?")
            .bind(team_id as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to delete team members")?;

        let team = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(team_id as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to delete team")?;

        tx.commit().await.context("Failed to commit team dissolution")?;

        Ok(DissolveOutcome {
            team_deleted: team.rows_affected() > 0,
            members_deleted: members.rows_affected(),
        })
    }

    /// Whether `team_id` was dissolved.
    pub async fn is_team_dissolved(&self, team_id: TeamId) -> Result<bool> {
        let dissolved: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM dissolved_teams WHERE id = ?)")
                .bind(team_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(dissolved)
    }

    /// Get a team by id.
    pub async fn get_team(&self, team_id: TeamId) -> Result<Option<TeamRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, token_uri, captain_address, created_at
            FROM teams
            WHERE id = ?
            "#,
        )
        .bind(team_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_team_record).transpose()
    }

    /// Get a team by id together with its members.
    pub async fn get_team_with_members(&self, team_id: TeamId) -> Result<Option<TeamWithMembers>> {
        let Some(team) = self.get_team(team_id).await? else {
            return Ok(None);
        };
        let members = self.list_members(team_id).await?;
        Ok(Some(TeamWithMembers { team, members }))
    }

    /// Get the team captained by `captain`.
    pub async fn get_team_by_captain(
        &self,
        captain: &NormalizedAddress,
    ) -> Result<Option<TeamRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, token_uri, captain_address, created_at
            FROM teams
            WHERE captain_address = ?
            "#,
        )
        .bind(captain.canonical())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_team_record).transpose()
    }

    /// All teams ordered by id.
    pub async fn list_teams(&self) -> Result<Vec<TeamRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, token_uri, captain_address, created_at
            FROM teams
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_team_record).collect()
    }

    /// Number of mirrored teams.
    pub async fn count_teams(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Get a member by id.
    pub async fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, token_uri, address, role, team_id, created_at
            FROM members
            WHERE id = ?
            "#,
        )
        .bind(member_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_member_record).transpose()
    }

    /// Get the member row for an account.
    pub async fn get_member_by_address(
        &self,
        address: &NormalizedAddress,
    ) -> Result<Option<MemberRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, token_uri, address, role, team_id, created_at
            FROM members
            WHERE address = ?
            "#,
        )
        .bind(address.canonical())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_member_record).transpose()
    }

    /// Members of a team ordered by id.
    pub async fn list_members(&self, team_id: TeamId) -> Result<Vec<MemberRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, token_uri, address, role, team_id, created_at
            FROM members
            WHERE team_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(team_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_member_record).collect()
    }

    /// Number of members in a team.
    pub async fn count_members(&self, team_id: TeamId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM members WHERE team_id = ?")
            .bind(team_id as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn row_to_team_record(row: sqlx::sqlite::SqliteRow) -> Result<TeamRecord> {
        let captain: String = row.get("captain_address");

        Ok(TeamRecord {
            id: row.get::<i64, _>("id") as u64,
            name: row.get("name"),
            token_uri: row.get("token_uri"),
            captain_address: NormalizedAddress::parse(&captain)
                .with_context(|| format!("Corrupt captain address in teams: {}", captain))?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_member_record(row: sqlx::sqlite::SqliteRow) -> Result<MemberRecord> {
        let address: String = row.get("address");

        Ok(MemberRecord {
            id: row.get::<i64, _>("id") as u64,
            name: row.get("name"),
            token_uri: row.get("token_uri"),
            address: NormalizedAddress::parse(&address)
                .with_context(|| format!("Corrupt member address in members: {}", address))?,
            role: row.get::<i64, _>("role") as u8,
            team_id: row.get::<i64, _>("team_id") as u64,
            created_at: row.get("created_at"),
        })
    }
}
