//! Event type definitions for the team factory contract.

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use std::fmt;
use teamsync_core::{MemberId, RoleCode, TeamId};
use tracing::warn;

use crate::error::ChainError;

// Bindings for the team factory (events consumed by the mirror, plus the one
// function the join request workflow calls).
sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract TeamFactory {
        event TeamCreated(
            address indexed captain,
            uint256 indexed teamId,
            string name,
            string tokenURI
        );

        event MemberAdded(
            address indexed member,
            uint256 indexed teamId,
            string name,
            uint8 role,
            uint256 memberId,
            string tokenURI
        );

        event TeamURIsUpdated(
            uint256 indexed teamId,
            string teamName,
            uint256[] memberIds
        );

        event TeamDissolved(
            uint256 indexed teamId,
            address indexed captain,
            uint256 returnedAmount
        );

        function addMember(
            address member,
            uint256 teamId,
            string name,
            uint8 role,
            string tokenURI
        ) external;
    }
}

/// The four inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `TeamCreated`
    TeamCreated,
    /// `MemberAdded`
    MemberAdded,
    /// `TeamURIsUpdated`
    TeamUrisUpdated,
    /// `TeamDissolved`
    TeamDissolved,
}

impl EventKind {
    /// All kinds, in the order backfill applies them.
    pub const ALL: [EventKind; 4] = [
        EventKind::TeamCreated,
        EventKind::MemberAdded,
        EventKind::TeamUrisUpdated,
        EventKind::TeamDissolved,
    ];

    /// Solidity event name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TeamCreated => "TeamCreated",
            EventKind::MemberAdded => "MemberAdded",
            EventKind::TeamUrisUpdated => "TeamURIsUpdated",
            EventKind::TeamDissolved => "TeamDissolved",
        }
    }

    /// Topic0 of the event.
    pub fn signature_hash(&self) -> B256 {
        match self {
            EventKind::TeamCreated => TeamFactory::TeamCreated::SIGNATURE_HASH,
            EventKind::MemberAdded => TeamFactory::MemberAdded::SIGNATURE_HASH,
            EventKind::TeamUrisUpdated => TeamFactory::TeamURIsUpdated::SIGNATURE_HASH,
            EventKind::TeamDissolved => TeamFactory::TeamDissolved::SIGNATURE_HASH,
        }
    }

    /// Kind whose signature matches `topic0`, if any.
    pub fn from_topic(topic0: &B256) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.signature_hash() == *topic0)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of `TeamCreated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamCreatedEvent {
    /// Captain account
    pub captain: Address,
    /// Chain-assigned team id
    pub team_id: TeamId,
    /// Team display name
    pub name: String,
    /// Team metadata URI
    pub token_uri: String,
}

/// Payload of `MemberAdded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddedEvent {
    /// Member account
    pub member: Address,
    /// Owning team
    pub team_id: TeamId,
    /// Member display name
    pub name: String,
    /// Role code
    pub role: RoleCode,
    /// Chain-assigned member id
    pub member_id: MemberId,
    /// Member metadata URI
    pub token_uri: String,
}

/// One member touched by `TeamURIsUpdated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUriUpdate {
    /// Member id
    pub member_id: MemberId,
    /// New URI, when the payload carries one
    pub token_uri: Option<String>,
}

/// Payload of `TeamURIsUpdated`.
///
/// The contract event carries the team name and the affected member ids; URI
/// values are only present when a producer supplies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamUrisUpdatedEvent {
    /// Team id
    pub team_id: TeamId,
    /// New team display name
    pub team_name: String,
    /// New team URI, when present
    pub team_uri: Option<String>,
    /// Members whose URIs were regenerated
    pub members: Vec<MemberUriUpdate>,
}

/// Payload of `TeamDissolved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamDissolvedEvent {
    /// Team id
    pub team_id: TeamId,
    /// Captain account
    pub captain: Address,
    /// Deposit returned to the captain (wei)
    pub returned_amount: U256,
}

/// A decoded team factory event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// `TeamCreated`
    TeamCreated(TeamCreatedEvent),
    /// `MemberAdded`
    MemberAdded(MemberAddedEvent),
    /// `TeamURIsUpdated`
    TeamUrisUpdated(TeamUrisUpdatedEvent),
    /// `TeamDissolved`
    TeamDissolved(TeamDissolvedEvent),
}

impl ChainEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::TeamCreated(_) => EventKind::TeamCreated,
            ChainEvent::MemberAdded(_) => EventKind::MemberAdded,
            ChainEvent::TeamUrisUpdated(_) => EventKind::TeamUrisUpdated,
            ChainEvent::TeamDissolved(_) => EventKind::TeamDissolved,
        }
    }

    /// Team the event refers to.
    pub fn team_id(&self) -> TeamId {
        match self {
            ChainEvent::TeamCreated(e) => e.team_id,
            ChainEvent::MemberAdded(e) => e.team_id,
            ChainEvent::TeamUrisUpdated(e) => e.team_id,
            ChainEvent::TeamDissolved(e) => e.team_id,
        }
    }
}

/// Decoded event with its chain coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    /// Decoded payload
    pub event: ChainEvent,
    /// Block number where the event occurred
    pub block_number: u64,
    /// Log index within the block
    pub log_index: u64,
    /// Transaction hash
    pub tx_hash: B256,
}

impl LoggedEvent {
    /// Ordering key within a chain: block number, then log index.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Decode a log if its topic0 is one of the four team factory events.
    ///
    /// Returns `Ok(None)` for logs of other events.
    pub fn from_log(log: &Log) -> Result<Option<Self>, ChainError> {
        let Some(kind) = log.topics().first().and_then(EventKind::from_topic) else {
            return Ok(None);
        };
        Self::decode(log, kind).map(Some)
    }

    /// Decode a log as the given kind.
    pub fn decode(log: &Log, kind: EventKind) -> Result<Self, ChainError> {
        let event = match kind {
            EventKind::TeamCreated => {
                let data = TeamFactory::TeamCreated::decode_log(&log.inner, true)
                    .map_err(|e| decode_error(kind, e))?;
                ChainEvent::TeamCreated(TeamCreatedEvent {
                    captain: data.captain,
                    team_id: to_u64(kind, "teamId", data.teamId)?,
                    name: data.name.clone(),
                    token_uri: data.tokenURI.clone(),
                })
            }
            EventKind::MemberAdded => {
                let data = TeamFactory::MemberAdded::decode_log(&log.inner, true)
                    .map_err(|e| decode_error(kind, e))?;
                ChainEvent::MemberAdded(MemberAddedEvent {
                    member: data.member,
                    team_id: to_u64(kind, "teamId", data.teamId)?,
                    name: data.name.clone(),
                    role: data.role,
                    member_id: to_u64(kind, "memberId", data.memberId)?,
                    token_uri: data.tokenURI.clone(),
                })
            }
            EventKind::TeamUrisUpdated => {
                let data = TeamFactory::TeamURIsUpdated::decode_log(&log.inner, true)
                    .map_err(|e| decode_error(kind, e))?;
                let members = data
                    .memberIds
                    .iter()
                    .map(|id| {
                        Ok(MemberUriUpdate {
                            member_id: to_u64(kind, "memberIds", *id)?,
                            token_uri: None,
                        })
                    })
                    .collect::<Result<Vec<_>, ChainError>>()?;
                ChainEvent::TeamUrisUpdated(TeamUrisUpdatedEvent {
                    team_id: to_u64(kind, "teamId", data.teamId)?,
                    team_name: data.teamName.clone(),
                    team_uri: None,
                    members,
                })
            }
            EventKind::TeamDissolved => {
                let data = TeamFactory::TeamDissolved::decode_log(&log.inner, true)
                    .map_err(|e| decode_error(kind, e))?;
                ChainEvent::TeamDissolved(TeamDissolvedEvent {
                    team_id: to_u64(kind, "teamId", data.teamId)?,
                    captain: data.captain,
                    returned_amount: data.returnedAmount,
                })
            }
        };

        let block_number = log.block_number.ok_or_else(|| missing(kind, "block_number"))?;
        let log_index = log.log_index.ok_or_else(|| missing(kind, "log_index"))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| missing(kind, "transaction_hash"))?;

        Ok(Self {
            event,
            block_number,
            log_index,
            tx_hash,
        })
    }
}

/// Decode every log matching `kind`, sorted by block number then log index.
///
/// Logs that fail to decode are skipped with a warning.
pub fn decode_logs(logs: &[Log], kind: EventKind) -> Vec<LoggedEvent> {
    let topic = kind.signature_hash();
    let mut events: Vec<LoggedEvent> = logs
        .iter()
        .filter(|log| log.topics().first() == Some(&topic))
        .filter_map(|log| match LoggedEvent::decode(log, kind) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Failed to parse {} event: {}", kind, e);
                None
            }
        })
        .collect();
    events.sort_by_key(LoggedEvent::position);
    events
}

/// First event of `kind` among `logs`, in log order.
pub fn first_event(logs: &[Log], kind: EventKind) -> Option<LoggedEvent> {
    let topic = kind.signature_hash();
    logs.iter()
        .filter(|log| log.topics().first() == Some(&topic))
        .find_map(|log| LoggedEvent::decode(log, kind).ok())
}

fn to_u64(kind: EventKind, field: &str, value: U256) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::Decode {
        event: kind.name(),
        reason: format!("{} does not fit in u64: {}", field, value),
    })
}

fn decode_error(kind: EventKind, err: alloy::sol_types::Error) -> ChainError {
    ChainError::Decode {
        event: kind.name(),
        reason: err.to_string(),
    }
}

fn missing(kind: EventKind, field: &str) -> ChainError {
    ChainError::Decode {
        event: kind.name(),
        reason: format!("log missing {}", field),
    }
}
