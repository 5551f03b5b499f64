//! # Teamsync Core
//!
//! Domain primitives shared by the team registry mirror:
//!
//! - **Address normalization**: validation plus checksummed display form and
//!   lower-cased canonical storage key
//! - **Domain types**: team/member ids, role codes, join request status
//! - **Errors**: [`CoreError`]

#![warn(missing_docs)]

pub mod address;
pub mod error;
pub mod types;

pub use address::{normalize_address, NormalizedAddress};
pub use error::{CoreError, Result};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{Address, B256};
