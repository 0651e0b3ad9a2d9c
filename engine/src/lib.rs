// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # walletd Engine: Balance Consistency & Reorg Resolution
//!
//! The engine behind the walletd UTXO indexer. It owns the part of the
//! wallet service that has to be exactly right: turning a transaction's
//! inputs and outputs into per-address and per-wallet balance deltas,
//! moving funds from locked to unlocked as time and height locks expire,
//! and putting everything back together when the chain reorganizes.
//!
//! ## Architecture
//!
//! - **balance**: Authority vectors, `Balance`, `TokenBalanceMap` and the
//!   address/wallet aggregator built on top of them.
//! - **transaction**: Prepared transaction types and persisted UTXO rows.
//! - **lock**: Lock detection and the locked → unlocked transition.
//! - **reorg**: Latest-valid-block search, the void cascade, balance
//!   rebuild and the consistency check.
//! - **ingest**: Applying an accepted transaction to the store.
//! - **event**: Validated event boundary and the bounded dedupe cache.
//! - **storage**: The store contract and its sled implementation.
//! - **alert**: Operator alert channel.
//! - **engine**: The facade the orchestrator talks to.
//! - **config**: Protocol constants and engine tunables.
//!
//! ## Ground Rules
//!
//! 1. All balance math goes through `merge`. No ad-hoc `+=` on aggregates.
//! 2. The engine is synchronous and single-threaded. Serializing reorgs
//!    is the caller's job.
//! 3. A reorg either runs to its fixpoint or fails as a whole.

pub mod alert;
pub mod balance;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod lock;
pub mod reorg;
pub mod storage;
pub mod transaction;

/// Crate version, reported by the daemon.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use engine::LedgerEngine;
pub use error::{EngineError, EngineResult};
