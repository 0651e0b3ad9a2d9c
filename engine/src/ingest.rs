//! Applying an accepted transaction to the store.
//!
//! The aggregate delta is computed before anything is written, so a
//! malformed transaction fails without leaving partial state behind.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::balance::{address_balance_map, wallet_balance_map, wallet_balances_for_tx, WalletBalance};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::lock::{mark_locked_outputs, unlock_heightlocked_utxos};
use crate::storage::LedgerStore;
use crate::transaction::{Address, Block, DbTxOutput, Transaction, Tx, WalletId};

/// Stores `tx`, its outputs and spends, and updates every aggregate it
/// touches. Returns what the transaction did to each tracked wallet.
///
/// A transaction that is already stored only has its height refreshed
/// (mempool → confirmed, or the reverse). A voided one is stored again
/// from scratch: its row, outputs and history rows are overwritten as
/// live, and its delta is applied on top of the post-cascade aggregates.
///
/// For a block at height `h`, reward outputs get a height lock of
/// `h + reward_spend_min_blocks`, and rewards whose lock is reached at `h`
/// are unlocked.
///
/// # Errors
///
/// Data errors from the aggregator, before any write. Store errors as-is.
pub fn apply_transaction<S: LedgerStore>(
    store: &S,
    tx: &Transaction,
    now: u64,
    config: &EngineConfig,
) -> EngineResult<BTreeMap<WalletId, WalletBalance>> {
    if let Some(mut stored) = store
        .get_transactions_by_id(std::slice::from_ref(&tx.tx_id))?
        .into_iter()
        .next()
    {
        if stored.voided {
            info!(tx_id = %tx.tx_id, height = ?tx.height, "voided id delivered again, storing as new");
        } else {
            if stored.height != tx.height {
                debug!(tx_id = %tx.tx_id, from = ?stored.height, to = ?tx.height, "updating height");
                stored.height = tx.height;
                store.add_or_update_tx(&stored)?;
            }
            return Ok(BTreeMap::new());
        }
    }

    let is_block = tx.is_block();
    let mut prepared = tx.clone();
    mark_locked_outputs(&mut prepared.outputs, now, is_block);

    let address_map = address_balance_map(&prepared.tx_id, &prepared.inputs, &prepared.outputs)?;

    store.add_or_update_tx(&Tx::from(&prepared))?;
    let block_height = prepared.height.filter(|_| is_block);
    if let Some(height) = block_height {
        store.add_block(&Block {
            tx_id: prepared.tx_id.clone(),
            height,
        })?;
    }

    let heightlock = block_height.map(|h| h.saturating_add(config.reward_spend_min_blocks));
    let utxos: Vec<DbTxOutput> = prepared
        .outputs
        .iter()
        .enumerate()
        .filter_map(|(index, output)| {
            DbTxOutput::from_output(&prepared.tx_id, index as u32, output, heightlock)
        })
        .collect();
    store.add_utxos(&utxos)?;
    store.update_tx_outputs_spent_by(&prepared.inputs, &prepared.tx_id)?;

    store.add_address_tx_history(&prepared.tx_id, prepared.timestamp, &address_map)?;
    store.update_address_balances(&address_map)?;

    let addresses: Vec<Address> = address_map.keys().cloned().collect();
    let wallets = store.get_address_wallet_info(&addresses)?;
    let wallet_map = wallet_balance_map(&wallets, &address_map);
    store.add_wallet_tx_history(&prepared.tx_id, prepared.timestamp, &wallet_map)?;
    store.update_wallet_balances(&wallet_map)?;

    info!(
        tx_id = %prepared.tx_id,
        block = is_block,
        height = ?prepared.height,
        outputs = utxos.len(),
        addresses = addresses.len(),
        wallets = wallet_map.len(),
        "transaction applied"
    );

    if let Some(height) = block_height {
        unlock_heightlocked_utxos(store, height, now)?;
    }

    wallet_balances_for_tx(&prepared, &wallets)
}
