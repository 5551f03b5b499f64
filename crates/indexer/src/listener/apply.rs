//! Applies decoded team factory events to the mirrored state.
//!
//! Every event is applied idempotently: re-delivering an event that was
//! already mirrored is a no-op reported as [`ApplyOutcome::Duplicate`]. That
//! includes creation and membership events of teams that were dissolved
//! since, which are recognized through the `dissolved_teams` record.

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use teamsync_core::{MemberId, NormalizedAddress, TeamId};
use tracing::{debug, info, warn};

use crate::chain::{
    ChainEvent, LoggedEvent, MemberAddedEvent, TeamCreatedEvent, TeamDissolvedEvent,
    TeamUrisUpdatedEvent,
};
use crate::membership::MembershipIndex;
use crate::storage::{NewMember, NewTeam, Storage};

/// Event that contradicts the mirrored state and was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// `TeamCreated` for a captain who already captains a team.
    CaptainAlreadyHasTeam {
        /// Offending captain
        captain: NormalizedAddress,
        /// Team id carried by the event
        team_id: TeamId,
    },
    /// `MemberAdded` for an address that is already a captain or member.
    AddressAlreadyEnrolled {
        /// Offending account
        address: NormalizedAddress,
        /// Member id carried by the event
        member_id: MemberId,
    },
    /// `MemberAdded` for a team that is not mirrored.
    UnknownTeam {
        /// Missing team
        team_id: TeamId,
        /// Member id carried by the event
        member_id: MemberId,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::CaptainAlreadyHasTeam { captain, team_id } => {
                write!(f, "captain {} already has a team (event team {})", captain, team_id)
            }
            Anomaly::AddressAlreadyEnrolled { address, member_id } => {
                write!(f, "address {} already enrolled (event member {})", address, member_id)
            }
            Anomaly::UnknownTeam { team_id, member_id } => {
                write!(f, "team {} not mirrored (event member {})", team_id, member_id)
            }
        }
    }
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed.
    Applied,
    /// The row was already present.
    Duplicate,
    /// The event contradicts the mirrored state and was dropped.
    Dropped(Anomaly),
    /// The team the event refers to is not mirrored.
    Missing,
}

/// Counters shared between the synchronizer and whoever reports on it.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    applied: AtomicU64,
    duplicates: AtomicU64,
    missing: AtomicU64,
    captain_already_has_team: AtomicU64,
    address_already_enrolled: AtomicU64,
    unknown_team: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events that changed state
    pub applied: u64,
    /// Re-delivered events
    pub duplicates: u64,
    /// Updates or dissolutions for unknown teams
    pub missing: u64,
    /// Dropped `TeamCreated` events
    pub captain_already_has_team: u64,
    /// Dropped `MemberAdded` events for enrolled addresses
    pub address_already_enrolled: u64,
    /// Dropped `MemberAdded` events for unknown teams
    pub unknown_team: u64,
}

impl MetricsSnapshot {
    /// Total dropped events.
    pub fn anomalies(&self) -> u64 {
        self.captain_already_has_team + self.address_already_enrolled + self.unknown_team
    }
}

impl SyncMetrics {
    fn record(&self, outcome: &ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Applied => &self.applied,
            ApplyOutcome::Duplicate => &self.duplicates,
            ApplyOutcome::Missing => &self.missing,
            ApplyOutcome::Dropped(Anomaly::CaptainAlreadyHasTeam { .. }) => {
                &self.captain_already_has_team
            }
            ApplyOutcome::Dropped(Anomaly::AddressAlreadyEnrolled { .. }) => {
                &self.address_already_enrolled
            }
            ApplyOutcome::Dropped(Anomaly::UnknownTeam { .. }) => &self.unknown_team,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            captain_already_has_team: self.captain_already_has_team.load(Ordering::Relaxed),
            address_already_enrolled: self.address_already_enrolled.load(Ordering::Relaxed),
            unknown_team: self.unknown_team.load(Ordering::Relaxed),
        }
    }
}

/// Per-batch outcome counts, for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyTally {
    /// Applied events
    pub applied: u64,
    /// Duplicates
    pub duplicates: u64,
    /// Dropped events
    pub dropped: u64,
    /// Events for unknown teams
    pub missing: u64,
}

impl ApplyTally {
    /// Count one outcome.
    pub fn add(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Dropped(_) => self.dropped += 1,
            ApplyOutcome::Missing => self.missing += 1,
        }
    }

    /// Number of events counted.
    pub fn total(&self) -> u64 {
        self.applied + self.duplicates + self.dropped + self.missing
    }
}

/// Applies events to [`Storage`], one at a time.
#[derive(Debug, Clone)]
pub struct EventSynchronizer {
    storage: Storage,
    membership: MembershipIndex,
    metrics: Arc<SyncMetrics>,
}

impl EventSynchronizer {
    /// Create a synchronizer writing to `storage`.
    pub fn new(storage: Storage) -> Self {
        let membership = MembershipIndex::new(&storage);
        Self {
            storage,
            membership,
            metrics: Arc::new(SyncMetrics::default()),
        }
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Apply one event. Storage failures are returned; the event was not applied.
    pub async fn apply(&self, logged: &LoggedEvent) -> Result<ApplyOutcome> {
        let outcome = match &logged.event {
            ChainEvent::TeamCreated(e) => self.on_team_created(e).await?,
            ChainEvent::MemberAdded(e) => self.on_member_added(e).await?,
            ChainEvent::TeamUrisUpdated(e) => self.on_team_uris_updated(e).await?,
            ChainEvent::TeamDissolved(e) => {
                self.on_team_dissolved(e, logged.block_number).await?
            }
        };

        self.metrics.record(&outcome);

        match &outcome {
            ApplyOutcome::Dropped(anomaly) => warn!(
                event = logged.event.kind().name(),
                block = logged.block_number,
                log_index = logged.log_index,
                tx = %logged.tx_hash,
                "State consistency anomaly, event dropped: {}",
                anomaly
            ),
            ApplyOutcome::Missing => warn!(
                event = logged.event.kind().name(),
                block = logged.block_number,
                team_id = logged.event.team_id(),
                "Event refers to a team that is not mirrored"
            ),
            ApplyOutcome::Duplicate => debug!(
                event = logged.event.kind().name(),
                block = logged.block_number,
                log_index = logged.log_index,
                "Event already applied"
            ),
            ApplyOutcome::Applied => {}
        }

        Ok(outcome)
    }

    async fn on_team_created(&self, event: &TeamCreatedEvent) -> Result<ApplyOutcome> {
        if self.storage.get_team(event.team_id).await?.is_some()
            || self.storage.is_team_dissolved(event.team_id).await?
        {
            return Ok(ApplyOutcome::Duplicate);
        }

        let captain = NormalizedAddress::from(event.captain);
        if self.membership.is_captain(&captain).await? {
            return Ok(ApplyOutcome::Dropped(Anomaly::CaptainAlreadyHasTeam {
                captain,
                team_id: event.team_id,
            }));
        }

        let inserted = self
            .storage
            .insert_team(&NewTeam {
                id: event.team_id,
                name: event.name.clone(),
                token_uri: event.token_uri.clone(),
                captain_address: captain,
            })
            .await?;

        if !inserted {
            return Ok(ApplyOutcome::Duplicate);
        }

        info!("Team {} created: {} (captain {})", event.team_id, event.name, captain);
        Ok(ApplyOutcome::Applied)
    }

    async fn on_member_added(&self, event: &MemberAddedEvent) -> Result<ApplyOutcome> {
        if self.storage.get_member(event.member_id).await?.is_some()
            || self.storage.is_team_dissolved(event.team_id).await?
        {
            return Ok(ApplyOutcome::Duplicate);
        }

        let address = NormalizedAddress::from(event.member);
        if self.membership.is_enrolled(&address).await? {
            return Ok(ApplyOutcome::Dropped(Anomaly::AddressAlreadyEnrolled {
                address,
                member_id: event.member_id,
            }));
        }

        if self.storage.get_team(event.team_id).await?.is_none() {
            return Ok(ApplyOutcome::Dropped(Anomaly::UnknownTeam {
                team_id: event.team_id,
                member_id: event.member_id,
            }));
        }

        let inserted = self
            .storage
            .insert_member(&NewMember {
                id: event.member_id,
                name: event.name.clone(),
                token_uri: event.token_uri.clone(),
                address,
                role: event.role,
                team_id: event.team_id,
            })
            .await?;

        if !inserted {
            return Ok(ApplyOutcome::Duplicate);
        }

        info!(
            "Member {} added to team {}: {} (role {})",
            event.member_id, event.team_id, address, event.role
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn on_team_uris_updated(&self, event: &TeamUrisUpdatedEvent) -> Result<ApplyOutcome> {
        let member_uris: Vec<(MemberId, String)> = event
            .members
            .iter()
            .filter_map(|m| m.token_uri.clone().map(|uri| (m.member_id, uri)))
            .collect();

        let updated = self
            .storage
            .update_team_uris(
                event.team_id,
                &event.team_name,
                event.team_uri.as_deref(),
                &member_uris,
            )
            .await?;

        if !updated {
            return Ok(ApplyOutcome::Missing);
        }

        info!(
            "Team {} metadata updated: {} ({} member URIs)",
            event.team_id,
            event.team_name,
            member_uris.len()
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn on_team_dissolved(
        &self,
        event: &TeamDissolvedEvent,
        block_number: u64,
    ) -> Result<ApplyOutcome> {
        let outcome = self.storage.dissolve_team(event.team_id, block_number).await?;

        if !outcome.team_deleted {
            if self.storage.is_team_dissolved(event.team_id).await? {
                return Ok(ApplyOutcome::Duplicate);
            }
            return Ok(ApplyOutcome::Missing);
        }

        info!(
            "Team {} dissolved: {} members removed, {} wei returned to {}",
            event.team_id,
            outcome.members_deleted,
            event.returned_amount,
            NormalizedAddress::from(event.captain)
        );
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
pub(crate) mod test_events {
    //! Event builders shared by listener and workflow tests.

    use super::*;
    use crate::chain::MemberUriUpdate;
    use alloy::primitives::{Address, B256, U256};

    pub(crate) fn team_created(captain: u8, team_id: TeamId, name: &str, uri: &str) -> ChainEvent {
        ChainEvent::TeamCreated(TeamCreatedEvent {
            captain: Address::repeat_byte(captain),
            team_id,
            name: name.to_string(),
            token_uri: uri.to_string(),
        })
    }

    pub(crate) fn member_added(member: u8, team_id: TeamId, member_id: MemberId) -> ChainEvent {
        ChainEvent::MemberAdded(MemberAddedEvent {
            member: Address::repeat_byte(member),
            team_id,
            name: format!("Member {}", member_id),
            role: 2,
            member_id,
            token_uri: format!("ipfs://member-{}", member_id),
        })
    }

    pub(crate) fn uris_updated(
        team_id: TeamId,
        name: &str,
        members: &[(MemberId, Option<&str>)],
    ) -> ChainEvent {
        ChainEvent::TeamUrisUpdated(TeamUrisUpdatedEvent {
            team_id,
            team_name: name.to_string(),
            team_uri: None,
            members: members
                .iter()
                .map(|(member_id, uri)| MemberUriUpdate {
                    member_id: *member_id,
                    token_uri: uri.map(str::to_string),
                })
                .collect(),
        })
    }

    pub(crate) fn dissolved(team_id: TeamId, captain: u8) -> ChainEvent {
        ChainEvent::TeamDissolved(TeamDissolvedEvent {
            team_id,
            captain: Address::repeat_byte(captain),
            returned_amount: U256::from(1_000_000_000_000_000u64),
        })
    }

    pub(crate) fn logged(event: ChainEvent, block_number: u64, log_index: u64) -> LoggedEvent {
        LoggedEvent {
            event,
            block_number,
            log_index,
            tx_hash: B256::repeat_byte(block_number as u8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_events::*;
    use super::*;
    use crate::storage::test_util::temp_storage;
    use alloy::primitives::Address;

    fn addr(byte: u8) -> NormalizedAddress {
        NormalizedAddress::from(Address::repeat_byte(byte))
    }

    #[tokio::test]
    async fn test_team_created_then_member_added() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        let outcome = sync
            .apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let outcome = sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let view = storage.get_team_with_members(1).await.unwrap().unwrap();
        assert_eq!(view.team.name, "Red");
        assert_eq!(view.team.token_uri, "ipfs://r");
        assert_eq!(
            view.team.captain_address.canonical(),
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.members[0].id, 10);
        assert_eq!(view.members[0].role, 2);
        assert_eq!(view.members[0].address, addr(0xbb));
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        let created = logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0);
        let added = logged(member_added(0xbb, 1, 10), 2, 0);
        sync.apply(&created).await.unwrap();
        sync.apply(&added).await.unwrap();

        assert_eq!(sync.apply(&created).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(sync.apply(&added).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(storage.count_teams().await.unwrap(), 1);
        assert_eq!(storage.count_members(1).await.unwrap(), 1);

        let snapshot = sync.metrics().snapshot();
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.duplicates, 2);
        assert_eq!(snapshot.anomalies(), 0);
    }

    #[tokio::test]
    async fn test_second_team_for_captain_is_dropped() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        let outcome = sync
            .apply(&logged(team_created(0xaa, 2, "Blue", "ipfs://b"), 2, 0))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ApplyOutcome::Dropped(Anomaly::CaptainAlreadyHasTeam {
                captain: addr(0xaa),
                team_id: 2
            })
        );
        assert!(storage.get_team(2).await.unwrap().is_none());
        assert_eq!(sync.metrics().snapshot().captain_already_has_team, 1);
    }

    #[tokio::test]
    async fn test_enrolled_address_is_dropped() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        sync.apply(&logged(team_created(0xab, 2, "Blue", "ipfs://b"), 1, 1))
            .await
            .unwrap();
        sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0)).await.unwrap();

        // Already a member of team 1.
        let outcome = sync.apply(&logged(member_added(0xbb, 2, 11), 3, 0)).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Dropped(Anomaly::AddressAlreadyEnrolled { member_id: 11, .. })
        ));

        // Captain of team 1.
        let outcome = sync.apply(&logged(member_added(0xaa, 2, 12), 3, 1)).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Dropped(Anomaly::AddressAlreadyEnrolled { member_id: 12, .. })
        ));

        assert_eq!(storage.count_members(2).await.unwrap(), 0);
        assert_eq!(sync.metrics().snapshot().address_already_enrolled, 2);
    }

    #[tokio::test]
    async fn test_member_for_unknown_team_is_dropped() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        let outcome = sync.apply(&logged(member_added(0xbb, 7, 10), 1, 0)).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Dropped(Anomaly::UnknownTeam {
                team_id: 7,
                member_id: 10
            })
        );
        assert!(storage.get_member(10).await.unwrap().is_none());
        assert_eq!(sync.metrics().snapshot().unknown_team, 1);
    }

    #[tokio::test]
    async fn test_uris_updated() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0)).await.unwrap();

        let outcome = sync
            .apply(&logged(
                uris_updated(1, "Crimson", &[(10, Some("ipfs://m10-v2")), (99, Some("ipfs://x"))]),
                3,
                0,
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let view = storage.get_team_with_members(1).await.unwrap().unwrap();
        assert_eq!(view.team.name, "Crimson");
        assert_eq!(view.team.token_uri, "ipfs://r");
        assert_eq!(view.members[0].token_uri, "ipfs://m10-v2");

        // Ids only, as the contract emits them.
        let outcome = sync
            .apply(&logged(uris_updated(1, "Scarlet", &[(10, None)]), 4, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        let view = storage.get_team_with_members(1).await.unwrap().unwrap();
        assert_eq!(view.team.name, "Scarlet");
        assert_eq!(view.members[0].token_uri, "ipfs://m10-v2");

        let outcome = sync
            .apply(&logged(uris_updated(5, "Ghost", &[]), 5, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Missing);
    }

    #[tokio::test]
    async fn test_dissolve_cascades_and_frees_addresses() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());
        let membership = MembershipIndex::new(&storage);

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0)).await.unwrap();
        sync.apply(&logged(member_added(0xbc, 1, 11), 2, 1)).await.unwrap();

        let outcome = sync.apply(&logged(dissolved(1, 0xaa), 3, 0)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert!(storage.get_team(1).await.unwrap().is_none());
        assert!(storage.list_members(1).await.unwrap().is_empty());
        assert!(!membership.is_enrolled(&addr(0xaa)).await.unwrap());
        assert!(!membership.is_enrolled(&addr(0xbb)).await.unwrap());

        let outcome = sync.apply(&logged(dissolved(1, 0xaa), 3, 0)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        let outcome = sync.apply(&logged(dissolved(8, 0xa8), 3, 1)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Missing);

        // The captain can found a new team afterwards.
        let outcome = sync
            .apply(&logged(team_created(0xaa, 2, "Red II", "ipfs://r2"), 4, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_dissolved_team_history_replays_as_duplicate() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        let created = logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0);
        let added = logged(member_added(0xbb, 1, 10), 2, 0);
        sync.apply(&created).await.unwrap();
        sync.apply(&added).await.unwrap();
        sync.apply(&logged(dissolved(1, 0xaa), 3, 0)).await.unwrap();

        assert_eq!(sync.apply(&created).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(sync.apply(&added).await.unwrap(), ApplyOutcome::Duplicate);
        assert!(storage.get_team(1).await.unwrap().is_none());
        assert!(storage.get_member(10).await.unwrap().is_none());

        // Freed addresses can still enroll under new ids.
        let outcome = sync
            .apply(&logged(team_created(0xbb, 2, "Blue", "ipfs://b"), 4, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let snapshot = sync.metrics().snapshot();
        assert_eq!(snapshot.duplicates, 2);
        assert_eq!(snapshot.anomalies(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_returned() {
        let (storage, _db) = temp_storage().await;
        let sync = EventSynchronizer::new(storage.clone());

        sync.apply(&logged(team_created(0xaa, 1, "Red", "ipfs://r"), 1, 0))
            .await
            .unwrap();
        sync.apply(&logged(member_added(0xbb, 1, 10), 2, 0)).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER fail_team_delete BEFORE DELETE ON teams \
             BEGIN SELECT RAISE(ABORT, 'injected'); END;",
        )
        .execute(storage.pool())
        .await
        .unwrap();

        assert!(sync.apply(&logged(dissolved(1, 0xaa), 3, 0)).await.is_err());
        assert_eq!(storage.count_members(1).await.unwrap(), 1);
        assert_eq!(sync.metrics().snapshot().applied, 2);
    }

    #[test]
    fn test_tally() {
        let mut tally = ApplyTally::default();
        tally.add(&ApplyOutcome::Applied);
        tally.add(&ApplyOutcome::Duplicate);
        tally.add(&ApplyOutcome::Missing);
        tally.add(&ApplyOutcome::Dropped(Anomaly::UnknownTeam {
            team_id: 1,
            member_id: 2,
        }));
        assert_eq!(tally.total(), 4);
        assert_eq!(tally.dropped, 1);
    }
}
