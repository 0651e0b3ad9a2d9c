//! # Storage
//!
//! The engine never talks to a database directly. Everything it reads or
//! writes goes through [`LedgerStore`], and [`LedgerDb`] is the sled-backed
//! implementation shipped with the crate.
//!
//! ```text
//! records.rs: balance and history rows
//! db.rs     : LedgerDb: sled trees, bincode values, secondary indexes
//! ```
//!
//! ## Contract Notes
//!
//! - Multi-step engine operations (cascade, rebuild, unlock) issue several
//!   store calls in a row. The store does not wrap them in a transaction;
//!   the caller serializes reorgs and unlocks.
//! - `update_*_locked_balance` moves value from the locked bucket to the
//!   unlocked one. It never just adds to unlocked.
//! - Marking something that is already in the target state is a no-op,
//!   except where the engine checks first (unlocks).

pub mod db;
pub mod records;

use std::collections::{BTreeMap, HashMap};

use crate::balance::TokenBalanceMap;
use crate::transaction::{Address, Block, DbTxOutput, Tx, TxId, TxInput, UtxoKey, WalletId};

pub use db::{DbError, DbResult, LedgerDb};
pub use records::{
    AddressBalance, AddressTotalBalance, AddressTxHistory, Wallet, WalletTokenBalance,
    WalletTxHistory,
};

/// Persistence operations the engine depends on.
pub trait LedgerStore {
    // -- Chain ----------------------------------------------------------------

    /// Height of the highest stored block, `None` on an empty chain.
    fn get_latest_height(&self) -> DbResult<Option<u32>>;

    fn get_block_by_height(&self, height: u32) -> DbResult<Option<Block>>;

    fn add_block(&self, block: &Block) -> DbResult<()>;

    /// Removes every block row above `height`.
    fn delete_blocks_after_height(&self, height: u32) -> DbResult<()>;

    // -- Transactions ---------------------------------------------------------

    fn add_or_update_tx(&self, tx: &Tx) -> DbResult<()>;

    /// Rows for the ids that exist, in the order given.
    fn get_transactions_by_id(&self, tx_ids: &[TxId]) -> DbResult<Vec<Tx>>;

    /// Transactions (and blocks) confirmed above `height`.
    fn get_txs_after_height(&self, height: u32) -> DbResult<Vec<Tx>>;

    /// Sends the given transactions back to the mempool (`height = None`).
    fn remove_txs_height(&self, tx_ids: &[TxId]) -> DbResult<()>;

    /// Marks transactions voided. Returns how many were not voided before.
    fn mark_txs_as_voided(&self, tx_ids: &[TxId]) -> DbResult<usize>;

    // -- UTXOs ----------------------------------------------------------------

    fn add_utxos(&self, utxos: &[DbTxOutput]) -> DbResult<()>;

    fn get_utxos(&self, keys: &[UtxoKey]) -> DbResult<Vec<DbTxOutput>>;

    /// Every output created by the given transactions.
    fn get_tx_outputs(&self, tx_ids: &[TxId]) -> DbResult<Vec<DbTxOutput>>;

    /// Every output spent by the given transactions.
    fn get_tx_outputs_by_spent(&self, tx_ids: &[TxId]) -> DbResult<Vec<DbTxOutput>>;

    /// Records `tx_id` as the spender of each input's output.
    fn update_tx_outputs_spent_by(&self, inputs: &[TxInput], tx_id: &str) -> DbResult<()>;

    /// Clears `spent_by` on the given outputs.
    fn unspend_utxos(&self, keys: &[UtxoKey]) -> DbResult<()>;

    fn mark_utxos_as_voided(&self, keys: &[UtxoKey]) -> DbResult<()>;

    /// Flips `locked` to `false` on the given outputs.
    fn mark_utxos_unlocked(&self, keys: &[UtxoKey]) -> DbResult<()>;

    /// Locked, non-voided outputs without a height lock whose timelock is
    /// `<= now`.
    fn get_expired_timelocks_utxos(&self, now: u64) -> DbResult<Vec<DbTxOutput>>;

    /// Locked, non-voided outputs whose height lock is `<= height` and
    /// whose timelock, if any, is `<= now`.
    fn get_utxos_locked_at_height(&self, now: u64, height: u32) -> DbResult<Vec<DbTxOutput>>;

    // -- Wallet membership ----------------------------------------------------

    fn add_wallet_addresses(&self, wallet_id: &str, addresses: &[Address]) -> DbResult<()>;

    /// Wallets owning the given addresses. Untracked addresses are absent.
    fn get_address_wallet_info(&self, addresses: &[Address]) -> DbResult<HashMap<Address, Wallet>>;

    // -- History --------------------------------------------------------------

    fn add_address_tx_history(
        &self,
        tx_id: &str,
        timestamp: u64,
        balances: &BTreeMap<Address, TokenBalanceMap>,
    ) -> DbResult<()>;

    fn add_wallet_tx_history(
        &self,
        tx_id: &str,
        timestamp: u64,
        balances: &BTreeMap<WalletId, TokenBalanceMap>,
    ) -> DbResult<()>;

    fn mark_address_tx_history_as_voided(&self, tx_ids: &[TxId]) -> DbResult<()>;

    fn mark_wallet_tx_history_as_voided(&self, tx_ids: &[TxId]) -> DbResult<()>;

    // -- Aggregates -----------------------------------------------------------

    /// Applies an accepted transaction's deltas to address aggregates.
    fn update_address_balances(&self, balances: &BTreeMap<Address, TokenBalanceMap>) -> DbResult<()>;

    /// Applies an accepted transaction's deltas to wallet aggregates.
    fn update_wallet_balances(&self, balances: &BTreeMap<WalletId, TokenBalanceMap>) -> DbResult<()>;

    /// Moves the unlocked gain in `balances` out of the locked bucket of
    /// each address. With `update_timelocks`, also recomputes the earliest
    /// pending timelock from the remaining locked outputs.
    fn update_address_locked_balance(
        &self,
        balances: &BTreeMap<Address, TokenBalanceMap>,
        update_timelocks: bool,
    ) -> DbResult<()>;

    /// Wallet counterpart of [`LedgerStore::update_address_locked_balance`].
    fn update_wallet_locked_balance(
        &self,
        balances: &BTreeMap<WalletId, TokenBalanceMap>,
        update_timelocks: bool,
    ) -> DbResult<()>;

    fn fetch_address_balance(&self, addresses: &[Address]) -> DbResult<Vec<AddressBalance>>;

    fn fetch_wallet_balance(&self, wallet_ids: &[WalletId]) -> DbResult<Vec<WalletTokenBalance>>;

    /// Per address/token sum of the non-voided history.
    fn fetch_address_tx_history_sum(&self, addresses: &[Address]) -> DbResult<Vec<AddressTotalBalance>>;

    /// Discards and recomputes the aggregates of `addresses` from their
    /// current UTXO set. Tokens touched by `tx_ids` keep a row even when
    /// they drop to zero.
    fn rebuild_address_balances_from_utxos(&self, addresses: &[Address], tx_ids: &[TxId]) -> DbResult<()>;

    /// Recomputes wallet aggregates from their member address aggregates.
    fn rebuild_wallet_balances(&self, wallet_ids: &[WalletId]) -> DbResult<()>;
}
