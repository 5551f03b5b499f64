//! Team factory mirror and join request workflow.
//!
//! This crate provides:
//! - A chain adapter for the team factory contract (alloy, HTTP + WebSocket)
//! - An event synchronizer that mirrors teams and members into SQLite
//! - Historical backfill and live subscription driving the synchronizer
//! - The off-chain join request state machine, which approves requests by
//!   sending `addMember` transactions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  teamsync-indexer                    │
//! │                                      │
//! │  ┌─────────────────┐                 │
//! │  │   SyncEngine    │ ← Ethereum RPC  │
//! │  │  (tokio task)   │   TeamCreated, MemberAdded,
//! │  └────────┬────────┘   TeamURIsUpdated, TeamDissolved
//! │           │                          │
//! │  ┌────────▼──────────┐               │
//! │  │ EventSynchronizer │               │
//! │  └────────┬──────────┘               │
//! │           │                          │
//! │      ┌────▼──────┐                   │
//! │      │  Storage  │ ← SQLite          │
//! │      │  teams,   │                   │
//! │      │  members, │                   │
//! │      │  requests │                   │
//! │      └────▲──────┘                   │
//! │           │                          │
//! │  ┌────────┴───────────┐              │
//! │  │ JoinRequestService │ → addMember  │
//! │  └────────────────────┘   (on-chain) │
//! └──────────────────────────────────────┘
//! ```
//!
//! Mirrored tables are written only by the synchronizer. The workflow only
//! writes join requests; an approved member shows up in the mirror once the
//! synchronizer sees the `MemberAdded` event.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod config;
pub mod error;
pub mod listener;
pub mod membership;
pub mod storage;
pub mod workflow;

pub use error::{ChainError, WorkflowError};
pub use teamsync_core::{types::*, *};
