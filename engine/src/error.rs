//! Error types for the engine.
//!
//! [`EngineError`] splits into three families:
//!
//! - **Data errors** (`MissingDecodedScript`, `InvalidTokenData`,
//!   `InvalidAuthorities`): the upstream transaction is malformed. Fatal
//!   for that transaction only; never retried.
//! - **Invariant violations** (`AlreadyUnlocked`, `BalanceMismatch`,
//!   `NoValidBlock`): the engine caught itself, or its caller, in an
//!   inconsistent state. Always fatal.
//! - **External errors** (`Store`, `Oracle`, `BlockNotFound`): surfaced
//!   as-is. Retrying is the orchestrator's call, not ours.

use thiserror::Error;

use crate::reorg::validate::BalanceMismatch;
use crate::reorg::OracleError;
use crate::storage::db::DbError;
use crate::transaction::TxId;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An output (or an input that must resolve) has no decoded address.
    #[error("missing decoded script for {tx_id}:{index}")]
    MissingDecodedScript {
        /// Transaction carrying the undecodable script.
        tx_id: TxId,
        /// Position of the output within the transaction.
        index: u32,
    },

    /// A `token_data` byte points outside the transaction's token list.
    #[error("invalid token_data {token_data} in {tx_id}: only {tokens} custom tokens declared")]
    InvalidTokenData {
        /// Transaction carrying the bad byte.
        tx_id: TxId,
        /// The offending `token_data`.
        token_data: u8,
        /// Number of custom tokens the transaction declares.
        tokens: usize,
    },

    /// An authority trit vector longer than the fixed width.
    #[error("authority vector of length {0} exceeds the fixed width")]
    InvalidAuthorities(usize),

    /// A UTXO that is already unlocked was asked to unlock again.
    #[error("utxo {tx_id}:{index} is already unlocked")]
    AlreadyUnlocked {
        /// Transaction that created the UTXO.
        tx_id: TxId,
        /// Output index of the UTXO.
        index: u32,
    },

    /// Rebuilt aggregates disagree with the transaction history. The
    /// ledger is corrupt; an alert has already been raised.
    #[error("balance mismatch on {} address/token pair(s)", .0.len())]
    BalanceMismatch(Vec<BalanceMismatch>),

    /// The latest-valid-block search found no valid block at all.
    #[error("no valid block found at or below height {0}")]
    NoValidBlock(u32),

    /// The store has no block at a height it reported as populated.
    #[error("no block stored at height {0}")]
    BlockNotFound(u32),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// Canonical-chain oracle failure.
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;
