//! Database types for the storage layer.

use alloy::primitives::B256;
use serde::Serialize;
use teamsync_core::{MemberId, NormalizedAddress, RequestId, RequestStatus, RoleCode, TeamId};

/// A mirrored team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    /// Chain-assigned team id
    pub id: TeamId,

    /// Display name (updated by `TeamURIsUpdated`)
    pub name: String,

    /// Team metadata URI
    pub token_uri: String,

    /// Captain, unique across teams
    pub captain_address: NormalizedAddress,

    /// Unix timestamp when the row was mirrored
    pub created_at: i64,
}

/// A mirrored team member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    /// Chain-assigned member id
    pub id: MemberId,

    /// Display name
    pub name: String,

    /// Member metadata URI
    pub token_uri: String,

    /// Member account, unique across members
    pub address: NormalizedAddress,

    /// Role code
    pub role: RoleCode,

    /// Owning team
    pub team_id: TeamId,

    /// Unix timestamp when the row was mirrored
    pub created_at: i64,
}

/// A team together with its members, ordered by member id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamWithMembers {
    /// Team row
    #[serde(flatten)]
    pub team: TeamRecord,

    /// Member rows
    pub members: Vec<MemberRecord>,
}

/// Fields of a `MemberAdded` event as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    /// Chain-assigned member id
    pub id: MemberId,
    /// Display name
    pub name: String,
    /// Metadata URI
    pub token_uri: String,
    /// Member account
    pub address: NormalizedAddress,
    /// Role code
    pub role: RoleCode,
    /// Owning team
    pub team_id: TeamId,
}

/// Fields of a `TeamCreated` event as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTeam {
    /// Chain-assigned team id
    pub id: TeamId,
    /// Display name
    pub name: String,
    /// Metadata URI
    pub token_uri: String,
    /// Captain account
    pub captain_address: NormalizedAddress,
}

/// Result of deleting a team and its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DissolveOutcome {
    /// Whether the team row existed
    pub team_deleted: bool,
    /// Number of member rows removed
    pub members_deleted: u64,
}

/// A join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestRecord {
    /// Store-assigned id
    pub id: RequestId,

    /// Applicant account
    pub applicant: NormalizedAddress,

    /// Target team (may no longer exist)
    pub team_id: TeamId,

    /// Requested display name
    pub name: String,

    /// Requested role
    pub role: RoleCode,

    /// Current status
    pub status: RequestStatus,

    /// `addMember` transaction submitted for this request, if any
    pub approval_tx_hash: Option<B256>,

    /// Unix timestamp of creation
    pub created_at: i64,

    /// Unix timestamp of the last change
    pub updated_at: i64,
}

/// Input for a new join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJoinRequest {
    /// Applicant account
    pub applicant: NormalizedAddress,
    /// Target team
    pub team_id: TeamId,
    /// Requested display name
    pub name: String,
    /// Requested role
    pub role: RoleCode,
}

/// Filter for listing join requests. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    /// Only requests for this team
    pub team_id: Option<TeamId>,
    /// Only requests by this applicant
    pub applicant: Option<NormalizedAddress>,
    /// Only requests in this status
    pub status: Option<RequestStatus>,
    /// Maximum rows returned
    pub limit: Option<u32>,
    /// Rows skipped before the first returned
    pub offset: Option<u32>,
}

/// Per-status request counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    /// PENDING requests
    pub pending: u64,
    /// APPROVED requests
    pub approved: u64,
    /// REJECTED requests
    pub rejected: u64,
}

impl RequestStats {
    /// Sum over all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.approved + self.rejected
    }
}

/// Sync state record (singleton).
///
/// Tracks the synchronizer's progress through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Last fully processed block number
    pub last_block_number: u64,

    /// Chain ID (for safety)
    pub chain_id: u64,

    /// Unix timestamp of last update
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> NormalizedAddress {
        NormalizedAddress::from(alloy::primitives::Address::repeat_byte(byte))
    }

    #[test]
    fn test_team_with_members_serializes_camel_case() {
        let team = TeamWithMembers {
            team: TeamRecord {
                id: 1,
                name: "Red".to_string(),
                token_uri: "ipfs://r".to_string(),
                captain_address: addr(0xaa),
                created_at: 0,
            },
            members: vec![MemberRecord {
                id: 10,
                name: "Bob".to_string(),
                token_uri: "ipfs://b".to_string(),
                address: addr(0xbb),
                role: 2,
                team_id: 1,
                created_at: 0,
            }],
        };

        let json = serde_json::to_value(&team).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(
            json["captainAddress"],
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
        assert_eq!(json["tokenUri"], "ipfs://r");
        assert_eq!(json["members"][0]["teamId"], 1);
        assert_eq!(json["members"][0]["role"], 2);
    }

    #[test]
    fn test_request_stats_total() {
        let stats = RequestStats {
            pending: 2,
            approved: 1,
            rejected: 3,
        };
        assert_eq!(stats.total(), 6);
    }
}
