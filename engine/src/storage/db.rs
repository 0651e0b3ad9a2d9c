//! # LedgerDb: sled-backed Ledger Store
//!
//! Persists everything the engine reads and writes in named sled trees.
//! Values are bincode; composite keys join their text parts with a `0x00`
//! byte (ids and addresses never contain NUL).
//!
//! ## Tree Layout
//!
//! | Tree               | Key                                 | Value                      |
//! |--------------------|-------------------------------------|----------------------------|
//! | `txs`              | `tx_id`                             | `bincode(Tx)`              |
//! | `blocks`           | `height` (4B BE)                    | `bincode(Block)`           |
//! | `utxos`            | `tx_id ∅ index` (4B BE)             | `bincode(DbTxOutput)`      |
//! | `spent_index`      | `spender ∅ utxo key`                | utxo key                   |
//! | `address_utxos`    | `address ∅ token ∅ utxo key`        | utxo key                   |
//! | `locked_utxos`     | utxo key                            | utxo key                   |
//! | `address_history`  | `address ∅ tx_id ∅ token`           | `bincode(AddressTxHistory)`|
//! | `tx_addresses`     | `tx_id ∅ address`                   | address                    |
//! | `wallet_history`   | `wallet ∅ tx_id ∅ token`            | `bincode(WalletTxHistory)` |
//! | `tx_wallets`       | `tx_id ∅ wallet`                    | wallet id                  |
//! | `address_balances` | `address ∅ token`                   | `bincode(AddressBalance)`  |
//! | `wallet_balances`  | `wallet ∅ token`                    | `bincode(WalletTokenBalance)` |
//! | `address_wallets`  | `address`                           | `bincode(Wallet)`          |
//! | `wallet_addresses` | `wallet ∅ address`                  | address                    |
//!
//! Block heights are big-endian so that sled's byte order is numeric order.
//! Index values carry the primary key so lookups never parse composite
//! keys back apart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use tracing::debug;

use super::records::{
    AddressBalance, AddressTotalBalance, AddressTxHistory, Wallet, WalletTokenBalance,
    WalletTxHistory,
};
use super::LedgerStore;
use crate::balance::{Authorities, Balance, TokenBalanceMap};
use crate::reorg::rebuild::{
    address_balances_from_utxos, locked_summary, min_expiry, wallet_balances_from_addresses,
};
use crate::transaction::{
    Address, Block, DbTxOutput, TokenId, Tx, TxId, TxInput, UtxoKey, WalletId,
};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Keys & Codec
// ---------------------------------------------------------------------------

const SEP: u8 = 0x00;

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part);
    }
    key
}

/// `join(parts)` plus a trailing separator, for prefix scans.
fn prefix(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = join(parts);
    key.push(SEP);
    key
}

fn utxo_key(tx_id: &str, index: u32) -> Vec<u8> {
    let mut key = prefix(&[tx_id.as_bytes()]);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn utf8(bytes: &[u8]) -> DbResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// LedgerDb
// ---------------------------------------------------------------------------

/// Persistent ledger store.
///
/// sled trees are lock-free for readers and serialize writers per key, so
/// `LedgerDb` can be shared behind an `Arc`. Individual calls are not
/// atomic across trees; see the module docs of [`crate::storage`].
#[derive(Debug, Clone)]
pub struct LedgerDb {
    db: Db,
    txs: Tree,
    blocks: Tree,
    utxos: Tree,
    spent_index: Tree,
    address_utxos: Tree,
    locked_utxos: Tree,
    address_history: Tree,
    tx_addresses: Tree,
    wallet_history: Tree,
    tx_wallets: Tree,
    address_balances: Tree,
    wallet_balances: Tree,
    address_wallets: Tree,
    wallet_addresses: Tree,
}

impl LedgerDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            txs: db.open_tree("txs")?,
            blocks: db.open_tree("blocks")?,
            utxos: db.open_tree("utxos")?,
            spent_index: db.open_tree("spent_index")?,
            address_utxos: db.open_tree("address_utxos")?,
            locked_utxos: db.open_tree("locked_utxos")?,
            address_history: db.open_tree("address_history")?,
            tx_addresses: db.open_tree("tx_addresses")?,
            wallet_history: db.open_tree("wallet_history")?,
            tx_wallets: db.open_tree("tx_wallets")?,
            address_balances: db.open_tree("address_balances")?,
            wallet_balances: db.open_tree("wallet_balances")?,
            address_wallets: db.open_tree("address_wallets")?,
            wallet_addresses: db.open_tree("wallet_addresses")?,
            db,
        })
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of stored transactions (blocks included).
    pub fn transaction_count(&self) -> usize {
        self.txs.len()
    }

    /// Number of stored outputs, spent and voided ones included.
    pub fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    /// Full history of an address, voided rows included.
    pub fn get_address_history(&self, address: &str) -> DbResult<Vec<AddressTxHistory>> {
        self.scan_values(&self.address_history, &prefix(&[address.as_bytes()]))
    }

    // -- Internal helpers ---------------------------------------------------

    fn get_value<T: DeserializeOwned>(&self, tree: &Tree, key: &[u8]) -> DbResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_values<T: DeserializeOwned>(&self, tree: &Tree, prefix: &[u8]) -> DbResult<Vec<T>> {
        let mut values = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (_key, value) = entry?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    /// Raw index values (primary keys or ids) under `prefix`.
    fn scan_index(&self, tree: &Tree, prefix: &[u8]) -> DbResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (_key, value) = entry?;
            keys.push(value.to_vec());
        }
        Ok(keys)
    }

    fn load_utxo(&self, key: &[u8]) -> DbResult<Option<DbTxOutput>> {
        self.get_value(&self.utxos, key)
    }

    fn load_utxos_by_keys(&self, keys: &[Vec<u8>]) -> DbResult<Vec<DbTxOutput>> {
        let mut utxos = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(utxo) = self.load_utxo(key)? {
                utxos.push(utxo);
            }
        }
        Ok(utxos)
    }

    fn put_utxo(&self, utxo: &DbTxOutput) -> DbResult<()> {
        self.utxos
            .insert(utxo_key(&utxo.tx_id, utxo.index), encode(utxo)?)?;
        Ok(())
    }

    /// Loads, edits and stores each existing utxo. Missing keys are skipped.
    fn modify_utxos<F>(&self, keys: &[UtxoKey], mut edit: F) -> DbResult<()>
    where
        F: FnMut(&mut DbTxOutput, &[u8]) -> DbResult<()>,
    {
        for key in keys {
            let raw = utxo_key(&key.tx_id, key.index);
            let Some(mut utxo) = self.load_utxo(&raw)? else {
                debug!(tx_id = %key.tx_id, index = key.index, "utxo not found, skipping");
                continue;
            };
            edit(&mut utxo, &raw)?;
            self.put_utxo(&utxo)?;
        }
        Ok(())
    }

    fn address_token_utxos(&self, address: &str, token: &str) -> DbResult<Vec<DbTxOutput>> {
        let keys = self.scan_index(
            &self.address_utxos,
            &prefix(&[address.as_bytes(), token.as_bytes()]),
        )?;
        self.load_utxos_by_keys(&keys)
    }

    fn wallet_members(&self, wallet_id: &str) -> DbResult<Vec<Address>> {
        self.scan_index(&self.wallet_addresses, &prefix(&[wallet_id.as_bytes()]))?
            .iter()
            .map(|raw| utf8(raw))
            .collect()
    }

    fn wallet_token_utxos(&self, wallet_id: &str, token: &str) -> DbResult<Vec<DbTxOutput>> {
        let mut utxos = Vec::new();
        for address in self.wallet_members(wallet_id)? {
            utxos.extend(self.address_token_utxos(&address, token)?);
        }
        Ok(utxos)
    }

    fn locked_utxos(&self) -> DbResult<Vec<DbTxOutput>> {
        let keys = self.scan_index(&self.locked_utxos, &[])?;
        self.load_utxos_by_keys(&keys)
    }

    fn address_balance(&self, address: &str, token: &str) -> DbResult<AddressBalance> {
        let key = join(&[address.as_bytes(), token.as_bytes()]);
        Ok(self
            .get_value(&self.address_balances, &key)?
            .unwrap_or_else(|| AddressBalance::new(address, token)))
    }

    fn put_address_balance(&self, row: &AddressBalance) -> DbResult<()> {
        let key = join(&[row.address.as_bytes(), row.token_id.as_bytes()]);
        self.address_balances.insert(key, encode(row)?)?;
        Ok(())
    }

    fn wallet_balance(&self, wallet_id: &str, token: &str) -> DbResult<WalletTokenBalance> {
        let key = join(&[wallet_id.as_bytes(), token.as_bytes()]);
        Ok(self
            .get_value(&self.wallet_balances, &key)?
            .unwrap_or_else(|| WalletTokenBalance::new(wallet_id, token)))
    }

    fn put_wallet_balance(&self, row: &WalletTokenBalance) -> DbResult<()> {
        let key = join(&[row.wallet_id.as_bytes(), row.token_id.as_bytes()]);
        self.wallet_balances.insert(key, encode(row)?)?;
        Ok(())
    }

    fn remove_prefix(&self, tree: &Tree, prefix: &[u8]) -> DbResult<()> {
        let mut batch = Batch::default();
        for entry in tree.scan_prefix(prefix) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }
}

/// Authorities after applying `delta` to the persisted bitmask `current`.
/// A consumed authority forces a recount from the surviving outputs.
fn apply_authorities(
    current: u8,
    delta: &Authorities,
    recount: impl FnOnce() -> DbResult<u8>,
) -> DbResult<u8> {
    if delta.has_negative_value() {
        recount()
    } else {
        Ok(current | delta.to_bits())
    }
}

/// OR of the unspent, unlocked authority outputs in `utxos`.
fn unlocked_authorities_of(utxos: &[DbTxOutput]) -> u8 {
    utxos
        .iter()
        .filter(|u| !u.locked && u.is_unspent())
        .fold(0, |acc, u| acc | u.authorities)
}

/// Applies an accepted-transaction delta to an aggregate row. Shared by the
/// address and wallet paths, which only differ in where outputs come from.
struct AggregateFields<'a> {
    unlocked_balance: &'a mut i128,
    locked_balance: &'a mut i128,
    unlocked_authorities: &'a mut u8,
    locked_authorities: &'a mut u8,
    timelock_expires: &'a mut Option<u64>,
}

impl AggregateFields<'_> {
    fn apply_unlock(
        &mut self,
        delta: &Balance,
        outputs: &[DbTxOutput],
        update_timelocks: bool,
    ) {
        *self.unlocked_balance += delta.unlocked_amount;
        *self.locked_balance -= delta.unlocked_amount;
        *self.unlocked_authorities |= delta.unlocked_authorities.to_bits();
        let (locked_authorities, expires) = locked_summary(outputs);
        *self.locked_authorities = locked_authorities;
        if update_timelocks {
            *self.timelock_expires = expires;
        }
    }
}

impl LedgerStore for LedgerDb {
    // -- Chain ----------------------------------------------------------------

    fn get_latest_height(&self) -> DbResult<Option<u32>> {
        match self.blocks.last()? {
            Some((_key, value)) => {
                let block: Block = decode(&value)?;
                Ok(Some(block.height))
            }
            None => Ok(None),
        }
    }

    fn get_block_by_height(&self, height: u32) -> DbResult<Option<Block>> {
        self.get_value(&self.blocks, &height.to_be_bytes())
    }

    fn add_block(&self, block: &Block) -> DbResult<()> {
        self.blocks.insert(block.height.to_be_bytes(), encode(block)?)?;
        Ok(())
    }

    fn delete_blocks_after_height(&self, height: u32) -> DbResult<()> {
        let Some(start) = height.checked_add(1) else {
            return Ok(());
        };
        let mut batch = Batch::default();
        for entry in self.blocks.range(start.to_be_bytes()..) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        self.blocks.apply_batch(batch)?;
        Ok(())
    }

    // -- Transactions ---------------------------------------------------------

    fn add_or_update_tx(&self, tx: &Tx) -> DbResult<()> {
        self.txs.insert(tx.tx_id.as_bytes(), encode(tx)?)?;
        Ok(())
    }

    fn get_transactions_by_id(&self, tx_ids: &[TxId]) -> DbResult<Vec<Tx>> {
        let mut txs = Vec::with_capacity(tx_ids.len());
        for tx_id in tx_ids {
            if let Some(tx) = self.get_value(&self.txs, tx_id.as_bytes())? {
                txs.push(tx);
            }
        }
        Ok(txs)
    }

    fn get_txs_after_height(&self, height: u32) -> DbResult<Vec<Tx>> {
        let mut txs = Vec::new();
        for entry in self.txs.iter() {
            let (_key, value) = entry?;
            let tx: Tx = decode(&value)?;
            if tx.height.is_some_and(|h| h > height) {
                txs.push(tx);
            }
        }
        Ok(txs)
    }

    fn remove_txs_height(&self, tx_ids: &[TxId]) -> DbResult<()> {
        for mut tx in self.get_transactions_by_id(tx_ids)? {
            tx.height = None;
            self.add_or_update_tx(&tx)?;
        }
        Ok(())
    }

    fn mark_txs_as_voided(&self, tx_ids: &[TxId]) -> DbResult<usize> {
        let mut newly_voided = 0;
        for mut tx in self.get_transactions_by_id(tx_ids)? {
            if tx.voided {
                continue;
            }
            tx.voided = true;
            self.add_or_update_tx(&tx)?;
            newly_voided += 1;
        }
        Ok(newly_voided)
    }

    // -- UTXOs ----------------------------------------------------------------

    fn add_utxos(&self, utxos: &[DbTxOutput]) -> DbResult<()> {
        let mut utxo_batch = Batch::default();
        let mut address_batch = Batch::default();
        let mut locked_batch = Batch::default();
        let mut spent_batch = Batch::default();

        for utxo in utxos {
            let key = utxo_key(&utxo.tx_id, utxo.index);
            utxo_batch.insert(key.clone(), encode(utxo)?);

            let mut address_key = prefix(&[utxo.address.as_bytes(), utxo.token_id.as_bytes()]);
            address_key.extend_from_slice(&key);
            address_batch.insert(address_key, key.clone());

            if utxo.locked && !utxo.voided {
                locked_batch.insert(key.clone(), key.clone());
            }
            if let Some(spender) = &utxo.spent_by {
                let mut spent_key = prefix(&[spender.as_bytes()]);
                spent_key.extend_from_slice(&key);
                spent_batch.insert(spent_key, key);
            }
        }

        self.utxos.apply_batch(utxo_batch)?;
        self.address_utxos.apply_batch(address_batch)?;
        self.locked_utxos.apply_batch(locked_batch)?;
        self.spent_index.apply_batch(spent_batch)?;
        Ok(())
    }

    fn get_utxos(&self, keys: &[UtxoKey]) -> DbResult<Vec<DbTxOutput>> {
        let raw: Vec<Vec<u8>> = keys.iter().map(|k| utxo_key(&k.tx_id, k.index)).collect();
        self.load_utxos_by_keys(&raw)
    }

    fn get_tx_outputs(&self, tx_ids: &[TxId]) -> DbResult<Vec<DbTxOutput>> {
        let mut utxos = Vec::new();
        for tx_id in tx_ids {
            utxos.extend(self.scan_values::<DbTxOutput>(&self.utxos, &prefix(&[tx_id.as_bytes()]))?);
        }
        Ok(utxos)
    }

    fn get_tx_outputs_by_spent(&self, tx_ids: &[TxId]) -> DbResult<Vec<DbTxOutput>> {
        let mut utxos = Vec::new();
        for tx_id in tx_ids {
            let keys = self.scan_index(&self.spent_index, &prefix(&[tx_id.as_bytes()]))?;
            utxos.extend(self.load_utxos_by_keys(&keys)?);
        }
        Ok(utxos)
    }

    fn update_tx_outputs_spent_by(&self, inputs: &[TxInput], tx_id: &str) -> DbResult<()> {
        let keys: Vec<UtxoKey> = inputs
            .iter()
            .map(|input| UtxoKey {
                tx_id: input.tx_id.clone(),
                index: input.index,
            })
            .collect();
        self.modify_utxos(&keys, |utxo, raw| {
            if let Some(previous) = utxo.spent_by.replace(tx_id.to_string()) {
                let mut stale = prefix(&[previous.as_bytes()]);
                stale.extend_from_slice(raw);
                self.spent_index.remove(stale)?;
            }
            let mut spent_key = prefix(&[tx_id.as_bytes()]);
            spent_key.extend_from_slice(raw);
            self.spent_index.insert(spent_key, raw)?;
            Ok(())
        })
    }

    fn unspend_utxos(&self, keys: &[UtxoKey]) -> DbResult<()> {
        self.modify_utxos(keys, |utxo, raw| {
            if let Some(spender) = utxo.spent_by.take() {
                let mut spent_key = prefix(&[spender.as_bytes()]);
                spent_key.extend_from_slice(raw);
                self.spent_index.remove(spent_key)?;
            }
            Ok(())
        })
    }

    fn mark_utxos_as_voided(&self, keys: &[UtxoKey]) -> DbResult<()> {
        self.modify_utxos(keys, |utxo, raw| {
            utxo.voided = true;
            self.locked_utxos.remove(raw)?;
            Ok(())
        })
    }

    fn mark_utxos_unlocked(&self, keys: &[UtxoKey]) -> DbResult<()> {
        self.modify_utxos(keys, |utxo, raw| {
            utxo.locked = false;
            self.locked_utxos.remove(raw)?;
            Ok(())
        })
    }

    fn get_expired_timelocks_utxos(&self, now: u64) -> DbResult<Vec<DbTxOutput>> {
        Ok(self
            .locked_utxos()?
            .into_iter()
            .filter(|u| u.locked && !u.voided && u.heightlock.is_none())
            .filter(|u| u.timelock.is_some_and(|t| t <= now))
            .collect())
    }

    fn get_utxos_locked_at_height(&self, now: u64, height: u32) -> DbResult<Vec<DbTxOutput>> {
        Ok(self
            .locked_utxos()?
            .into_iter()
            .filter(|u| u.locked && !u.voided)
            .filter(|u| u.heightlock.is_some_and(|h| h <= height))
            .filter(|u| u.timelock.map_or(true, |t| t <= now))
            .collect())
    }

    // -- Wallet membership ----------------------------------------------------

    fn add_wallet_addresses(&self, wallet_id: &str, addresses: &[Address]) -> DbResult<()> {
        let wallet = encode(&Wallet::new(wallet_id))?;
        for address in addresses {
            self.address_wallets.insert(address.as_bytes(), wallet.clone())?;
            self.wallet_addresses.insert(
                join(&[wallet_id.as_bytes(), address.as_bytes()]),
                address.as_bytes(),
            )?;
        }
        Ok(())
    }

    fn get_address_wallet_info(&self, addresses: &[Address]) -> DbResult<HashMap<Address, Wallet>> {
        let mut map = HashMap::new();
        for address in addresses {
            if let Some(wallet) = self.get_value::<Wallet>(&self.address_wallets, address.as_bytes())? {
                map.insert(address.clone(), wallet);
            }
        }
        Ok(map)
    }

    // -- History --------------------------------------------------------------

    fn add_address_tx_history(
        &self,
        tx_id: &str,
        timestamp: u64,
        balances: &BTreeMap<Address, TokenBalanceMap>,
    ) -> DbResult<()> {
        for (address, tokens) in balances {
            for (token, balance) in tokens.iter() {
                let row = AddressTxHistory {
                    address: address.clone(),
                    tx_id: tx_id.to_string(),
                    token_id: token.clone(),
                    balance: balance.total(),
                    timestamp,
                    voided: false,
                };
                self.address_history.insert(
                    join(&[address.as_bytes(), tx_id.as_bytes(), token.as_bytes()]),
                    encode(&row)?,
                )?;
            }
            self.tx_addresses.insert(
                join(&[tx_id.as_bytes(), address.as_bytes()]),
                address.as_bytes(),
            )?;
        }
        Ok(())
    }

    fn add_wallet_tx_history(
        &self,
        tx_id: &str,
        timestamp: u64,
        balances: &BTreeMap<WalletId, TokenBalanceMap>,
    ) -> DbResult<()> {
        for (wallet_id, tokens) in balances {
            for (token, balance) in tokens.iter() {
                let row = WalletTxHistory {
                    wallet_id: wallet_id.clone(),
                    tx_id: tx_id.to_string(),
                    token_id: token.clone(),
                    balance: balance.total(),
                    timestamp,
                    voided: false,
                };
                self.wallet_history.insert(
                    join(&[wallet_id.as_bytes(), tx_id.as_bytes(), token.as_bytes()]),
                    encode(&row)?,
                )?;
            }
            self.tx_wallets.insert(
                join(&[tx_id.as_bytes(), wallet_id.as_bytes()]),
                wallet_id.as_bytes(),
            )?;
        }
        Ok(())
    }

    fn mark_address_tx_history_as_voided(&self, tx_ids: &[TxId]) -> DbResult<()> {
        for tx_id in tx_ids {
            for raw in self.scan_index(&self.tx_addresses, &prefix(&[tx_id.as_bytes()]))? {
                let history_prefix = prefix(&[raw.as_slice(), tx_id.as_bytes()]);
                for entry in self.address_history.scan_prefix(&history_prefix) {
                    let (key, value) = entry?;
                    let mut row: AddressTxHistory = decode(&value)?;
                    row.voided = true;
                    self.address_history.insert(key, encode(&row)?)?;
                }
            }
        }
        Ok(())
    }

    fn mark_wallet_tx_history_as_voided(&self, tx_ids: &[TxId]) -> DbResult<()> {
        for tx_id in tx_ids {
            for raw in self.scan_index(&self.tx_wallets, &prefix(&[tx_id.as_bytes()]))? {
                let history_prefix = prefix(&[raw.as_slice(), tx_id.as_bytes()]);
                for entry in self.wallet_history.scan_prefix(&history_prefix) {
                    let (key, value) = entry?;
                    let mut row: WalletTxHistory = decode(&value)?;
                    row.voided = true;
                    self.wallet_history.insert(key, encode(&row)?)?;
                }
            }
        }
        Ok(())
    }

    // -- Aggregates -----------------------------------------------------------

    fn update_address_balances(&self, balances: &BTreeMap<Address, TokenBalanceMap>) -> DbResult<()> {
        for (address, tokens) in balances {
            for (token, delta) in tokens.iter() {
                let mut row = self.address_balance(address, token)?;
                row.total_received += delta.total_amount_sent;
                row.unlocked_balance += delta.unlocked_amount;
                row.locked_balance += delta.locked_amount;
                row.unlocked_authorities = apply_authorities(
                    row.unlocked_authorities,
                    &delta.unlocked_authorities,
                    || Ok(unlocked_authorities_of(&self.address_token_utxos(address, token)?)),
                )?;
                row.locked_authorities |= delta.locked_authorities.to_bits();
                row.timelock_expires = min_expiry(row.timelock_expires, delta.lock_expires);
                row.transactions += 1;
                self.put_address_balance(&row)?;
            }
        }
        Ok(())
    }

    fn update_wallet_balances(&self, balances: &BTreeMap<WalletId, TokenBalanceMap>) -> DbResult<()> {
        for (wallet_id, tokens) in balances {
            for (token, delta) in tokens.iter() {
                let mut row = self.wallet_balance(wallet_id, token)?;
                row.total_received += delta.total_amount_sent;
                row.unlocked_balance += delta.unlocked_amount;
                row.locked_balance += delta.locked_amount;
                row.unlocked_authorities = apply_authorities(
                    row.unlocked_authorities,
                    &delta.unlocked_authorities,
                    || Ok(unlocked_authorities_of(&self.wallet_token_utxos(wallet_id, token)?)),
                )?;
                row.locked_authorities |= delta.locked_authorities.to_bits();
                row.timelock_expires = min_expiry(row.timelock_expires, delta.lock_expires);
                row.transactions += 1;
                self.put_wallet_balance(&row)?;
            }
        }
        Ok(())
    }

    fn update_address_locked_balance(
        &self,
        balances: &BTreeMap<Address, TokenBalanceMap>,
        update_timelocks: bool,
    ) -> DbResult<()> {
        for (address, tokens) in balances {
            for (token, delta) in tokens.iter() {
                let mut row = self.address_balance(address, token)?;
                let outputs = self.address_token_utxos(address, token)?;
                AggregateFields {
                    unlocked_balance: &mut row.unlocked_balance,
                    locked_balance: &mut row.locked_balance,
                    unlocked_authorities: &mut row.unlocked_authorities,
                    locked_authorities: &mut row.locked_authorities,
                    timelock_expires: &mut row.timelock_expires,
                }
                .apply_unlock(delta, &outputs, update_timelocks);
                self.put_address_balance(&row)?;
            }
        }
        Ok(())
    }

    fn update_wallet_locked_balance(
        &self,
        balances: &BTreeMap<WalletId, TokenBalanceMap>,
        update_timelocks: bool,
    ) -> DbResult<()> {
        for (wallet_id, tokens) in balances {
            for (token, delta) in tokens.iter() {
                let mut row = self.wallet_balance(wallet_id, token)?;
                let outputs = self.wallet_token_utxos(wallet_id, token)?;
                AggregateFields {
                    unlocked_balance: &mut row.unlocked_balance,
                    locked_balance: &mut row.locked_balance,
                    unlocked_authorities: &mut row.unlocked_authorities,
                    locked_authorities: &mut row.locked_authorities,
                    timelock_expires: &mut row.timelock_expires,
                }
                .apply_unlock(delta, &outputs, update_timelocks);
                self.put_wallet_balance(&row)?;
            }
        }
        Ok(())
    }

    fn fetch_address_balance(&self, addresses: &[Address]) -> DbResult<Vec<AddressBalance>> {
        let mut rows = Vec::new();
        for address in addresses {
            rows.extend(self.scan_values::<AddressBalance>(
                &self.address_balances,
                &prefix(&[address.as_bytes()]),
            )?);
        }
        Ok(rows)
    }

    fn fetch_wallet_balance(&self, wallet_ids: &[WalletId]) -> DbResult<Vec<WalletTokenBalance>> {
        let mut rows = Vec::new();
        for wallet_id in wallet_ids {
            rows.extend(self.scan_values::<WalletTokenBalance>(
                &self.wallet_balances,
                &prefix(&[wallet_id.as_bytes()]),
            )?);
        }
        Ok(rows)
    }

    fn fetch_address_tx_history_sum(&self, addresses: &[Address]) -> DbResult<Vec<AddressTotalBalance>> {
        let mut sums = Vec::new();
        for address in addresses {
            let mut per_token: BTreeMap<TokenId, AddressTotalBalance> = BTreeMap::new();
            for row in self.get_address_history(address)? {
                if row.voided {
                    continue;
                }
                let sum = per_token
                    .entry(row.token_id.clone())
                    .or_insert_with(|| AddressTotalBalance {
                        address: address.clone(),
                        token_id: row.token_id.clone(),
                        balance: 0,
                        transactions: 0,
                    });
                sum.balance += row.balance;
                sum.transactions += 1;
            }
            sums.extend(per_token.into_values());
        }
        Ok(sums)
    }

    fn rebuild_address_balances_from_utxos(&self, addresses: &[Address], tx_ids: &[TxId]) -> DbResult<()> {
        let affected_outputs = self.get_tx_outputs(tx_ids)?;

        for address in addresses {
            let keep_tokens: Vec<TokenId> = affected_outputs
                .iter()
                .filter(|u| &u.address == address)
                .map(|u| u.token_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let keys = self.scan_index(&self.address_utxos, &prefix(&[address.as_bytes()]))?;
            let utxos = self.load_utxos_by_keys(&keys)?;
            let history = self.get_address_history(address)?;

            self.remove_prefix(&self.address_balances, &prefix(&[address.as_bytes()]))?;
            for row in address_balances_from_utxos(address, &utxos, &history, &keep_tokens) {
                self.put_address_balance(&row)?;
            }
        }
        Ok(())
    }

    fn rebuild_wallet_balances(&self, wallet_ids: &[WalletId]) -> DbResult<()> {
        for wallet_id in wallet_ids {
            let members = self.wallet_members(wallet_id)?;
            let member_balances = self.fetch_address_balance(&members)?;
            let history: Vec<WalletTxHistory> =
                self.scan_values(&self.wallet_history, &prefix(&[wallet_id.as_bytes()]))?;

            self.remove_prefix(&self.wallet_balances, &prefix(&[wallet_id.as_bytes()]))?;
            for row in wallet_balances_from_addresses(wallet_id, &member_balances, &history) {
                self.put_wallet_balance(&row)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
