//! Account address normalization.
//!
//! Chain events and user input carry addresses in whatever casing the producer
//! chose. Everything that compares or stores addresses goes through
//! [`NormalizedAddress`], which keeps two forms apart:
//!
//! - the EIP-55 checksummed form, used for display and for contract calls
//! - the lower-cased canonical form, used as the storage and lookup key
//!
//! Accepted input is 40 hex digits with an optional `0x` or `0X` prefix.
//! All-lowercase and all-uppercase digits are accepted as-is; mixed-case input
//! must carry a valid checksum.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

const ADDRESS_HEX_LEN: usize = 40;

/// A validated account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedAddress(Address);

impl NormalizedAddress {
    /// Validate and normalize an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if body.len() != ADDRESS_HEX_LEN || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidAddress(input.to_string()));
        }

        let address =
            Address::from_str(body).map_err(|_| CoreError::InvalidAddress(input.to_string()))?;

        let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            let checksummed = address.to_checksum(None);
            if &checksummed[2..] != body {
                return Err(CoreError::InvalidAddress(input.to_string()));
            }
        }

        Ok(Self(address))
    }

    /// The underlying 20-byte address.
    pub const fn address(&self) -> Address {
        self.0
    }

    /// EIP-55 checksummed display form (`0xAbC...`).
    pub fn checksummed(&self) -> String {
        self.0.to_checksum(None)
    }

    /// Lower-cased canonical form (`0xabc...`), the storage key.
    pub fn canonical(&self) -> String {
        format!("{:#x}", self.0)
    }
}

impl From<Address> for NormalizedAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl FromStr for NormalizedAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed())
    }
}

impl Serialize for NormalizedAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for NormalizedAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Validate an address and return its normalized form.
///
/// # Example
///
/// ```
/// use teamsync_core::normalize_address;
///
/// let addr = normalize_address("0x6D1EAFBDA84661AC37B8398404197BAC1146380D").unwrap();
/// assert_eq!(addr.canonical(), "0x6d1eafbda84661ac37b8398404197bac1146380d");
/// assert_eq!(addr.checksummed(), "0x6d1EafbDa84661AC37b8398404197bAc1146380D");
/// ```
pub fn normalize_address(input: &str) -> Result<NormalizedAddress> {
    NormalizedAddress::parse(input)
}
