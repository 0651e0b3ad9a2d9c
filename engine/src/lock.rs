//! # Lock Transitions
//!
//! Outputs start out locked when they carry a future timelock or, for
//! block rewards, a height lock. Unlocking moves value from the locked
//! bucket of an aggregate to the unlocked one; it never just credits
//! unlocked.
//!
//! ```text
//!   locked utxos ──synthesize unlocked outputs──▶ address_balance_map
//!        │                                              │ gain
//!        ▼                                              ▼
//!   mark_utxos_unlocked            update_{address,wallet}_locked_balance
//! ```
//!
//! Unlocking a UTXO twice is an error, not a no-op: the second move would
//! take value out of the locked bucket that is no longer there.

use serde::Serialize;
use tracing::{debug, info};

use crate::balance::{address_balance_map, wallet_balance_map};
use crate::config::TOKEN_AUTHORITY_MASK;
use crate::error::{EngineError, EngineResult};
use crate::storage::LedgerStore;
use crate::transaction::{Address, DbTxOutput, DecodedScript, TxOutput, UtxoKey};

/// Sets `locked` on each output.
///
/// Height-locked outputs (block rewards) are locked regardless of `now`.
/// Everything else is locked while its timelock is in the future.
pub fn mark_locked_outputs(outputs: &mut [TxOutput], now: u64, has_height_lock: bool) {
    for output in outputs {
        let timelock = output
            .decoded
            .as_ref()
            .and_then(|decoded| decoded.timelock)
            .unwrap_or(0);
        output.locked = has_height_lock || timelock > now;
    }
}

/// What an unlock pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UnlockSummary {
    pub utxos: usize,
    pub addresses: usize,
    pub wallets: usize,
}

/// Unlocked stand-in for a locked UTXO, fed through the aggregator to get
/// the gain.
fn unlocked_output(utxo: &DbTxOutput) -> TxOutput {
    let (value, token_data) = if utxo.is_authority() {
        (u64::from(utxo.authorities), TOKEN_AUTHORITY_MASK | 1)
    } else {
        (utxo.value, 0)
    };
    TxOutput {
        value,
        token_data,
        token: utxo.token_id.clone(),
        decoded: Some(DecodedScript {
            address: utxo.address.clone(),
            timelock: utxo.timelock,
        }),
        locked: false,
        spent_by: None,
    }
}

/// Unlocks `utxos` and moves their value into the unlocked buckets of the
/// owning addresses and wallets.
///
/// With `update_timelocks`, the earliest pending timelock of every touched
/// aggregate is recomputed from what is still locked.
///
/// # Errors
///
/// [`EngineError::AlreadyUnlocked`] if any UTXO is unlocked, either in the
/// given rows or in the store. Nothing is written in that case.
pub fn unlock_utxos<S: LedgerStore>(
    store: &S,
    utxos: &[DbTxOutput],
    update_timelocks: bool,
) -> EngineResult<UnlockSummary> {
    if utxos.is_empty() {
        return Ok(UnlockSummary::default());
    }

    let keys: Vec<UtxoKey> = utxos.iter().map(DbTxOutput::key).collect();
    let persisted = store.get_utxos(&keys)?;
    if let Some(unlocked) = utxos.iter().chain(&persisted).find(|utxo| !utxo.locked) {
        return Err(EngineError::AlreadyUnlocked {
            tx_id: unlocked.tx_id.clone(),
            index: unlocked.index,
        });
    }

    let synthetic: Vec<TxOutput> = utxos.iter().map(unlocked_output).collect();
    let gains = address_balance_map("", &[], &synthetic)?;

    store.mark_utxos_unlocked(&keys)?;
    store.update_address_locked_balance(&gains, update_timelocks)?;

    let addresses: Vec<Address> = gains.keys().cloned().collect();
    let wallets = store.get_address_wallet_info(&addresses)?;
    let wallet_gains = wallet_balance_map(&wallets, &gains);
    store.update_wallet_locked_balance(&wallet_gains, update_timelocks)?;

    debug!(
        utxos = utxos.len(),
        addresses = addresses.len(),
        wallets = wallet_gains.len(),
        update_timelocks,
        "unlocked utxos"
    );

    Ok(UnlockSummary {
        utxos: utxos.len(),
        addresses: addresses.len(),
        wallets: wallet_gains.len(),
    })
}

/// Unlocks every UTXO whose timelock expired at or before `now`.
pub fn unlock_timelocked_utxos<S: LedgerStore>(store: &S, now: u64) -> EngineResult<UnlockSummary> {
    let expired = store.get_expired_timelocks_utxos(now)?;
    if expired.is_empty() {
        return Ok(UnlockSummary::default());
    }
    info!(now, count = expired.len(), "unlocking expired timelocks");
    unlock_utxos(store, &expired, true)
}

/// Unlocks block rewards whose height lock is reached at `height`, provided
/// any timelock they also carry has passed.
pub fn unlock_heightlocked_utxos<S: LedgerStore>(
    store: &S,
    height: u32,
    now: u64,
) -> EngineResult<UnlockSummary> {
    let ready = store.get_utxos_locked_at_height(now, height)?;
    if ready.is_empty() {
        return Ok(UnlockSummary::default());
    }
    info!(height, count = ready.len(), "unlocking height-locked rewards");
    unlock_utxos(store, &ready, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{Balance, TokenBalanceMap};
    use crate::config::{HTR_TOKEN_ID, TOKEN_MELT_MASK};
    use crate::storage::LedgerDb;
    use std::collections::BTreeMap;

    const T: u64 = 1_700_000_000;

    fn output(timelock: Option<u64>) -> TxOutput {
        TxOutput {
            value: 100,
            token_data: 0,
            token: HTR_TOKEN_ID.into(),
            decoded: Some(DecodedScript { address: "A".into(), timelock }),
            locked: false,
            spent_by: None,
        }
    }

    fn locked_utxo(tx_id: &str, value: u64, timelock: Option<u64>) -> DbTxOutput {
        DbTxOutput {
            tx_id: tx_id.into(),
            index: 0,
            token_id: HTR_TOKEN_ID.into(),
            address: "A".into(),
            value,
            authorities: 0,
            timelock,
            heightlock: None,
            locked: true,
            spent_by: None,
            voided: false,
        }
    }

    /// Stores `utxos` and credits their locked amounts the way ingestion does.
    fn seed(db: &LedgerDb, utxos: &[DbTxOutput]) {
        db.add_utxos(utxos).unwrap();
        for utxo in utxos {
            let mut tokens = TokenBalanceMap::new();
            let balance = if utxo.is_authority() {
                Balance {
                    locked_authorities: crate::balance::Authorities::from_bits(utxo.authorities),
                    lock_expires: utxo.timelock,
                    ..Balance::zero()
                }
            } else {
                Balance {
                    total_amount_sent: i128::from(utxo.value),
                    locked_amount: i128::from(utxo.value),
                    lock_expires: utxo.timelock,
                    ..Balance::zero()
                }
            };
            tokens.set(utxo.token_id.clone(), balance);
            let delta = BTreeMap::from([(utxo.address.clone(), tokens)]);
            db.add_address_tx_history(&utxo.tx_id, 0, &delta).unwrap();
            db.update_address_balances(&delta).unwrap();
        }
    }

    fn row(db: &LedgerDb) -> crate::storage::AddressBalance {
        db.fetch_address_balance(&["A".to_string()]).unwrap().remove(0)
    }

    #[test]
    fn timelock_decides_lock_state() {
        let mut outputs = vec![output(Some(T)), output(None)];
        mark_locked_outputs(&mut outputs, T - 1, false);
        assert!(outputs[0].locked);
        assert!(!outputs[1].locked);

        mark_locked_outputs(&mut outputs, T, false);
        assert!(!outputs[0].locked);
    }

    #[test]
    fn height_lock_ignores_time() {
        let mut outputs = vec![output(None)];
        mark_locked_outputs(&mut outputs, u64::MAX, true);
        assert!(outputs[0].locked);
    }

    #[test]
    fn expired_timelock_moves_exactly_the_locked_amount() {
        let db = LedgerDb::open_temporary().unwrap();
        seed(&db, &[locked_utxo("t1", 100, Some(T))]);
        assert_eq!(row(&db).locked_balance, 100);
        assert_eq!(row(&db).timelock_expires, Some(T));

        let summary = unlock_timelocked_utxos(&db, T + 1).unwrap();
        assert_eq!(summary.utxos, 1);

        let after = row(&db);
        assert_eq!(after.locked_balance, 0);
        assert_eq!(after.unlocked_balance, 100);
        assert_eq!(after.timelock_expires, None);
    }

    #[test]
    fn remaining_locks_keep_their_expiry() {
        let db = LedgerDb::open_temporary().unwrap();
        seed(&db, &[locked_utxo("t1", 100, Some(T)), locked_utxo("t2", 7, Some(T + 50))]);

        unlock_timelocked_utxos(&db, T + 1).unwrap();
        let after = row(&db);
        assert_eq!(after.unlocked_balance, 100);
        assert_eq!(after.locked_balance, 7);
        assert_eq!(after.timelock_expires, Some(T + 50));
    }

    #[test]
    fn unlocking_twice_fails() {
        let db = LedgerDb::open_temporary().unwrap();
        let utxo = locked_utxo("t1", 100, Some(T));
        seed(&db, &[utxo.clone()]);

        unlock_utxos(&db, &[utxo.clone()], true).unwrap();
        let err = unlock_utxos(&db, &[utxo], true).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyUnlocked { ref tx_id, index: 0 } if tx_id == "t1"));
        assert_eq!(row(&db).unlocked_balance, 100);
    }

    #[test]
    fn authority_unlock_moves_bits() {
        let db = LedgerDb::open_temporary().unwrap();
        let melt = DbTxOutput {
            authorities: TOKEN_MELT_MASK,
            value: u64::from(TOKEN_MELT_MASK),
            ..locked_utxo("t1", 0, Some(T))
        };
        seed(&db, &[melt]);
        assert_eq!(row(&db).locked_authorities, TOKEN_MELT_MASK);

        unlock_timelocked_utxos(&db, T).unwrap();
        let after = row(&db);
        assert_eq!(after.unlocked_authorities, TOKEN_MELT_MASK);
        assert_eq!(after.locked_authorities, 0);
        assert_eq!(after.total(), 0);
    }

    #[test]
    fn wallet_aggregates_follow() {
        let db = LedgerDb::open_temporary().unwrap();
        db.add_wallet_addresses("w1", &["A".to_string()]).unwrap();
        let utxo = locked_utxo("t1", 40, Some(T));
        seed(&db, &[utxo.clone()]);
        let mut tokens = TokenBalanceMap::new();
        tokens.set(
            HTR_TOKEN_ID,
            Balance { total_amount_sent: 40, locked_amount: 40, lock_expires: Some(T), ..Balance::zero() },
        );
        db.update_wallet_balances(&BTreeMap::from([("w1".to_string(), tokens)])).unwrap();

        let summary = unlock_utxos(&db, &[utxo], true).unwrap();
        assert_eq!(summary.wallets, 1);
        let wallet = db.fetch_wallet_balance(&["w1".to_string()]).unwrap().remove(0);
        assert_eq!(wallet.unlocked_balance, 40);
        assert_eq!(wallet.locked_balance, 0);
        assert_eq!(wallet.timelock_expires, None);
    }

    #[test]
    fn height_unlock_waits_for_pending_timelock() {
        let db = LedgerDb::open_temporary().unwrap();
        let reward = DbTxOutput { heightlock: Some(10), ..locked_utxo("b1", 64, Some(T)) };
        seed(&db, &[reward]);

        assert_eq!(unlock_heightlocked_utxos(&db, 10, T - 1).unwrap().utxos, 0);
        assert_eq!(unlock_heightlocked_utxos(&db, 9, T).unwrap().utxos, 0);
        assert_eq!(unlock_heightlocked_utxos(&db, 10, T).unwrap().utxos, 1);
        assert_eq!(row(&db).unlocked_balance, 64);
    }

    #[test]
    fn empty_unlock_is_a_no_op() {
        let db = LedgerDb::open_temporary().unwrap();
        assert_eq!(unlock_utxos(&db, &[], true).unwrap(), UnlockSummary::default());
    }
}
