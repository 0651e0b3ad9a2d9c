//! # Reorg Resolver
//!
//! Puts the ledger back together after the canonical chain changes.
//!
//! ## Architecture
//!
//! ```text
//!   Locate ──────────▶ Cascade ──────────▶ Rebuild ──▶ Validate
//!   search.rs          cascade.rs          rebuild.rs   validate.rs
//!   binary search      worklist over the   recompute    history sum ==
//!   over heights       consumes edge       aggregates   aggregate
//! ```
//!
//! - **Locate** asks a [`ChainOracle`] which stored blocks are still
//!   canonical and finds the highest one.
//! - **Cascade** voids the orphaned blocks and everything that spent their
//!   outputs, transitively, and reopens the outputs those transactions had
//!   consumed.
//! - **Rebuild** drops the aggregates of every touched address and
//!   recomputes them from the post-cascade UTXO set.
//! - **Validate** checks every touched address against its transaction
//!   history and raises a critical alert on disagreement.
//!
//! A reorg runs to its fixpoint or fails as a whole. There is no rollback
//! within a wave; a failed reorg is retried from the top by the caller.

pub mod cascade;
pub mod rebuild;
pub mod search;
pub mod validate;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::alert::{raise, Alert, AlertSink, Severity};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::storage::LedgerStore;
use crate::transaction::TxId;

pub use cascade::{cascade_void, handle_voided_tx_list, void_closure, CascadeOutcome, VoidWorklist};
pub use rebuild::{rebuild_balances, RebuildOutcome};
pub use search::{latest_valid_height, search_for_latest_valid_block};
pub use validate::{check_address_balances, validate_address_balances, BalanceMismatch};

// ---------------------------------------------------------------------------
// Chain Oracle
// ---------------------------------------------------------------------------

/// Errors reported by a [`ChainOracle`].
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle does not know transaction {0}")]
    UnknownTransaction(TxId),
}

/// Canonical-chain truth, usually the fullnode.
///
/// Must answer from the canonical chain, never from local state: the
/// local store is exactly what is being questioned.
pub trait ChainOracle {
    fn is_tx_voided(&self, tx_id: &str) -> Result<bool, OracleError>;
}

// ---------------------------------------------------------------------------
// handle_reorg
// ---------------------------------------------------------------------------

/// Summary of a processed reorg.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReorgOutcome {
    /// Best height before the reorg.
    pub previous_height: u32,
    /// Height of the latest block that is still canonical.
    pub valid_height: u32,
    /// Blocks whose rows were deleted.
    pub removed_blocks: Vec<TxId>,
    /// Every transaction voided by the cascade, blocks included.
    pub voided: Vec<TxId>,
    /// Transactions sent back to the mempool.
    pub demoted: Vec<TxId>,
    /// Aggregates that were rebuilt.
    pub rebuilt: RebuildOutcome,
}

impl ReorgOutcome {
    pub fn depth(&self) -> u32 {
        self.previous_height.saturating_sub(self.valid_height)
    }
}

/// Processes a chain reorganization end to end.
///
/// 1. Locate the latest valid block `h`.
/// 2. Delete the block rows above `h` and void those blocks, cascading
///    through everything that spent their outputs.
/// 3. Send the surviving transactions confirmed above `h` back to the
///    mempool.
/// 4. Rebuild and validate the touched aggregates.
///
/// A reorg deeper than [`EngineConfig::reorg_warning_depth`] raises a
/// major alert and is processed anyway.
///
/// # Errors
///
/// Store and oracle errors as-is; [`crate::EngineError::NoValidBlock`] if
/// no stored block is canonical; [`crate::EngineError::BalanceMismatch`]
/// if validation fails after the rebuild.
pub fn handle_reorg<S, A, O>(
    store: &S,
    alerts: &A,
    oracle: &O,
    config: &EngineConfig,
) -> EngineResult<ReorgOutcome>
where
    S: LedgerStore,
    A: AlertSink,
    O: ChainOracle,
{
    let Some(previous_height) = store.get_latest_height()? else {
        info!("reorg requested on an empty chain, nothing to do");
        return Ok(ReorgOutcome::default());
    };

    let valid_block = search_for_latest_valid_block(store, oracle)?;
    let valid_height = valid_block.height;
    let depth = previous_height.saturating_sub(valid_height);

    info!(
        previous_height,
        valid_height,
        depth,
        block = %valid_block.tx_id,
        "located latest valid block"
    );

    if depth > config.reorg_warning_depth {
        warn!(depth, threshold = config.reorg_warning_depth, "deep reorg detected");
        raise(
            alerts,
            Alert::new(
                "Reorg above threshold",
                format!("A reorg of {depth} blocks was detected."),
                Severity::Major,
                json!({
                    "previous_height": previous_height,
                    "valid_height": valid_height,
                    "depth": depth,
                }),
            ),
        );
    }

    let after = store.get_txs_after_height(valid_height)?;
    let removed_blocks: Vec<TxId> = after
        .iter()
        .filter(|tx| tx.is_block())
        .map(|tx| tx.tx_id.clone())
        .collect();

    store.delete_blocks_after_height(valid_height)?;
    let cascade = cascade_void(store, &removed_blocks)?;

    let demoted = demote_survivors(store, valid_height, &removed_blocks)?;

    let rebuilt = rebuild_balances(store, &cascade.affected_utxos)?;
    validate_address_balances(store, alerts, &rebuilt.addresses)?;

    info!(
        removed_blocks = removed_blocks.len(),
        voided = cascade.voided.len(),
        demoted = demoted.len(),
        addresses = rebuilt.addresses.len(),
        "reorg processed"
    );

    Ok(ReorgOutcome {
        previous_height,
        valid_height,
        removed_blocks,
        voided: cascade.voided,
        demoted,
        rebuilt,
    })
}

// ---------------------------------------------------------------------------
// handle_voided
// ---------------------------------------------------------------------------

/// Summary of a single-transaction void.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoidOutcome {
    pub cascade: CascadeOutcome,
    pub rebuilt: RebuildOutcome,
}

/// Voids one transaction (typically a mempool transaction that lost a
/// conflict) and everything downstream of it, then rebuilds and validates
/// the touched aggregates.
pub fn handle_voided<S, A>(store: &S, alerts: &A, tx_id: &str) -> EngineResult<VoidOutcome>
where
    S: LedgerStore,
    A: AlertSink,
{
    let cascade = cascade_void(store, &[tx_id.to_string()])?;
    let rebuilt = rebuild_balances(store, &cascade.affected_utxos)?;
    validate_address_balances(store, alerts, &rebuilt.addresses)?;

    info!(
        tx_id,
        voided = cascade.voided.len(),
        addresses = rebuilt.addresses.len(),
        "voided transaction processed"
    );
    Ok(VoidOutcome { cascade, rebuilt })
}

/// Transactions still confirmed above `height` after the cascade lost the
/// blocks that confirmed them. They are not voided, only unconfirmed.
fn demote_survivors<S: LedgerStore>(
    store: &S,
    height: u32,
    removed_blocks: &[TxId],
) -> EngineResult<Vec<TxId>> {
    let demoted: Vec<TxId> = store
        .get_txs_after_height(height)?
        .into_iter()
        .filter(|tx| !tx.voided && !tx.is_block() && !removed_blocks.contains(&tx.tx_id))
        .map(|tx| tx.tx_id)
        .collect();

    if !demoted.is_empty() {
        store.remove_txs_height(&demoted)?;
    }
    Ok(demoted)
}
