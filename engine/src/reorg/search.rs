//! Locate phase: the latest stored block that is still canonical.
//!
//! Relies on validity being monotone in height: every block below the
//! fork point is valid and every block above it is not. Under that
//! precondition a plain binary search needs `O(log n)` oracle calls. If
//! the precondition does not hold the answer is some valid block, not
//! necessarily the highest.

use tracing::debug;

use super::ChainOracle;
use crate::error::{EngineError, EngineResult};
use crate::storage::LedgerStore;
use crate::transaction::Block;

/// Highest height in `[start, end]` for which `is_valid` holds, assuming
/// monotone validity. `None` if no probed height was valid.
///
/// Probing is fallible so that oracle and store errors surface unchanged.
pub fn latest_valid_height<E, F>(start: u32, end: u32, mut is_valid: F) -> Result<Option<u32>, E>
where
    F: FnMut(u32) -> Result<bool, E>,
{
    let mut low = i64::from(start);
    let mut high = i64::from(end);
    let mut best = None;

    while low <= high {
        let mid = low + (high - low) / 2;
        // low..=high stays inside start..=end, both u32
        let height = mid as u32;
        if is_valid(height)? {
            best = Some(height);
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }

    Ok(best)
}

/// Binary search over `[0, best height]` for the latest block the oracle
/// does not consider voided.
///
/// # Errors
///
/// - [`EngineError::NoValidBlock`] if the chain is empty or no probed
///   block is valid.
/// - [`EngineError::BlockNotFound`] if a height inside the stored range
///   has no block row.
pub fn search_for_latest_valid_block<S, O>(store: &S, oracle: &O) -> EngineResult<Block>
where
    S: LedgerStore,
    O: ChainOracle,
{
    let best_height = store.get_latest_height()?.ok_or(EngineError::NoValidBlock(0))?;

    let mut probes = 0u32;
    let found = latest_valid_height(0, best_height, |height| -> EngineResult<bool> {
        probes += 1;
        let block = store
            .get_block_by_height(height)?
            .ok_or(EngineError::BlockNotFound(height))?;
        let voided = oracle.is_tx_voided(&block.tx_id)?;
        debug!(height, block = %block.tx_id, voided, "probed block");
        Ok(!voided)
    })?;

    let height = found.ok_or(EngineError::NoValidBlock(best_height))?;
    debug!(height, probes, "latest valid block located");

    store
        .get_block_by_height(height)?
        .ok_or(EngineError::BlockNotFound(height))
}
