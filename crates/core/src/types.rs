//! Core domain types for the team registry mirror.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Team id assigned by the contract.
pub type TeamId = u64;

/// Member id assigned by the contract.
pub type MemberId = u64;

/// Locally assigned join request id.
pub type RequestId = i64;

/// Role code carried by members and join requests.
pub type RoleCode = u8;

/// Lifecycle status of a join request.
///
/// `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Awaiting an administrative decision.
    Pending,
    /// Add-member transaction confirmed on chain.
    Approved,
    /// Declined without touching the chain.
    Rejected,
}

impl RequestStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RequestStatus; 3] = [
        RequestStatus::Pending,
        RequestStatus::Approved,
        RequestStatus::Rejected,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Rejected => "REJECTED",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = CoreError;

    /// Parsing is case-insensitive, matching how status filters arrive from callers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RequestStatus::Pending),
            "APPROVED" => Ok(RequestStatus::Approved),
            "REJECTED" => Ok(RequestStatus::Rejected),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// Deterministic metadata URI attached to an add-member transaction.
///
/// Built from the first eight hex digits of the checksummed address, so the
/// same applicant always maps to the same URI.
pub fn member_metadata_uri(applicant: &crate::NormalizedAddress) -> String {
    let checksummed = applicant.checksummed();
    format!("ipfs://member-{}-metadata", &checksummed[2..10])
}
