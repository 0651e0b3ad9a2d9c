//! Rebuilding aggregates from UTXOs after a cascade.
//!
//! The cascade changes spend relationships retroactively, so the affected
//! aggregates are not patched. They are dropped and recomputed from the
//! post-cascade UTXO set. The math lives here as pure functions so that
//! every store computes it the same way.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::error::EngineResult;
use crate::storage::{AddressBalance, AddressTxHistory, LedgerStore, WalletTokenBalance, WalletTxHistory};
use crate::transaction::{Address, DbTxOutput, TokenId, TxId, WalletId};

/// Addresses and transactions touched by a cascade.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    pub addresses: Vec<Address>,
    pub tx_ids: Vec<TxId>,
    pub wallet_ids: Vec<WalletId>,
}

/// Distinct addresses and transaction ids among `utxos`, sorted.
pub fn affected_addresses_and_txs(utxos: &[DbTxOutput]) -> (Vec<Address>, Vec<TxId>) {
    let addresses: BTreeSet<&Address> = utxos.iter().map(|utxo| &utxo.address).collect();
    let tx_ids: BTreeSet<&TxId> = utxos.iter().map(|utxo| &utxo.tx_id).collect();
    (
        addresses.into_iter().cloned().collect(),
        tx_ids.into_iter().cloned().collect(),
    )
}

/// Recomputes every token aggregate of `address`.
///
/// - amounts: non-authority, non-voided, unspent outputs, split by `locked`
/// - authorities: OR of the same set's authority outputs
/// - `timelock_expires`: earliest timelock among the locked ones
/// - `transactions`: non-voided history rows
/// - `total_received`: every non-voided non-authority output, spent or not
///
/// Tokens in `keep_tokens` get a row even if everything above is zero.
pub fn address_balances_from_utxos(
    address: &str,
    utxos: &[DbTxOutput],
    history: &[AddressTxHistory],
    keep_tokens: &[TokenId],
) -> Vec<AddressBalance> {
    let mut rows: BTreeMap<TokenId, AddressBalance> = BTreeMap::new();

    for utxo in utxos.iter().filter(|u| u.address == address && !u.voided) {
        let row = address_row(&mut rows, address, &utxo.token_id);
        let value = i128::from(utxo.value);
        if !utxo.is_authority() {
            row.total_received += value;
        }
        if utxo.spent_by.is_some() {
            continue;
        }
        match (utxo.locked, utxo.is_authority()) {
            (true, true) => row.locked_authorities |= utxo.authorities,
            (true, false) => row.locked_balance += value,
            (false, true) => row.unlocked_authorities |= utxo.authorities,
            (false, false) => row.unlocked_balance += value,
        }
        if utxo.locked {
            row.timelock_expires = min_expiry(row.timelock_expires, utxo.timelock);
        }
    }

    for entry in history.iter().filter(|h| h.address == address && !h.voided) {
        address_row(&mut rows, address, &entry.token_id).transactions += 1;
    }

    for token in keep_tokens {
        address_row(&mut rows, address, token);
    }

    rows.into_values().collect()
}

fn address_row<'a>(
    rows: &'a mut BTreeMap<TokenId, AddressBalance>,
    address: &str,
    token: &TokenId,
) -> &'a mut AddressBalance {
    rows.entry(token.clone())
        .or_insert_with(|| AddressBalance::new(address, token.clone()))
}

/// Recomputes the aggregates of one wallet from its member addresses.
pub fn wallet_balances_from_addresses(
    wallet_id: &str,
    member_balances: &[AddressBalance],
    history: &[WalletTxHistory],
) -> Vec<WalletTokenBalance> {
    let mut rows: BTreeMap<TokenId, WalletTokenBalance> = BTreeMap::new();

    for balance in member_balances {
        let row = rows
            .entry(balance.token_id.clone())
            .or_insert_with(|| WalletTokenBalance::new(wallet_id, balance.token_id.clone()));
        row.unlocked_balance += balance.unlocked_balance;
        row.locked_balance += balance.locked_balance;
        row.unlocked_authorities |= balance.unlocked_authorities;
        row.locked_authorities |= balance.locked_authorities;
        row.timelock_expires = min_expiry(row.timelock_expires, balance.timelock_expires);
        row.total_received += balance.total_received;
    }

    for entry in history.iter().filter(|h| h.wallet_id == wallet_id && !h.voided) {
        rows.entry(entry.token_id.clone())
            .or_insert_with(|| WalletTokenBalance::new(wallet_id, entry.token_id.clone()))
            .transactions += 1;
    }

    rows.into_values().collect()
}

/// OR of authorities and earliest timelock among locked, unspent,
/// non-voided outputs.
pub fn locked_summary<'a>(utxos: impl IntoIterator<Item = &'a DbTxOutput>) -> (u8, Option<u64>) {
    utxos
        .into_iter()
        .filter(|u| u.locked && u.is_unspent())
        .fold((0u8, None), |(authorities, expires), utxo| {
            (authorities | utxo.authorities, min_expiry(expires, utxo.timelock))
        })
}

/// Earliest of two optional expiries. `None` only when both are `None`.
pub fn min_expiry(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Rebuilds the aggregates of every address (and owning wallet) that
/// appears in `affected`.
pub fn rebuild_balances<S: LedgerStore>(
    store: &S,
    affected: &[DbTxOutput],
) -> EngineResult<RebuildOutcome> {
    let (addresses, tx_ids) = affected_addresses_and_txs(affected);
    if addresses.is_empty() {
        return Ok(RebuildOutcome::default());
    }

    store.rebuild_address_balances_from_utxos(&addresses, &tx_ids)?;

    let wallets = store.get_address_wallet_info(&addresses)?;
    let wallet_ids: Vec<WalletId> = wallets
        .values()
        .map(|wallet| wallet.wallet_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    store.rebuild_wallet_balances(&wallet_ids)?;

    debug!(
        addresses = addresses.len(),
        txs = tx_ids.len(),
        wallets = wallet_ids.len(),
        "rebuilt balances from utxos"
    );

    Ok(RebuildOutcome {
        addresses,
        tx_ids,
        wallet_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HTR_TOKEN_ID;

    fn utxo(tx: &str, index: u32, value: u64) -> DbTxOutput {
        DbTxOutput {
            tx_id: tx.into(),
            index,
            token_id: HTR_TOKEN_ID.into(),
            address: "A".into(),
            value,
            authorities: 0,
            timelock: None,
            heightlock: None,
            locked: false,
            spent_by: None,
            voided: false,
        }
    }

    fn history(tx: &str, balance: i128, voided: bool) -> AddressTxHistory {
        AddressTxHistory {
            address: "A".into(),
            tx_id: tx.into(),
            token_id: HTR_TOKEN_ID.into(),
            balance,
            timestamp: 0,
            voided,
        }
    }

    #[test]
    fn rebuild_splits_buckets_and_skips_spent_and_voided() {
        let spent = DbTxOutput { spent_by: Some("t9".into()), ..utxo("t1", 0, 50) };
        let voided = DbTxOutput { voided: true, ..utxo("t2", 0, 1_000) };
        let locked = DbTxOutput { locked: true, timelock: Some(500), ..utxo("t3", 0, 30) };
        let locked_later = DbTxOutput { locked: true, timelock: Some(900), ..utxo("t3", 1, 5) };
        let mint = DbTxOutput { authorities: 0b01, value: 0b01, ..utxo("t4", 0, 0) };
        let utxos = vec![spent, voided, locked, locked_later, mint, utxo("t5", 0, 20)];

        let rows = address_balances_from_utxos(
            "A",
            &utxos,
            &[history("t1", 50, false), history("t2", 1_000, true)],
            &[],
        );
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.unlocked_balance, 20);
        assert_eq!(row.locked_balance, 35);
        assert_eq!(row.timelock_expires, Some(500));
        assert_eq!(row.unlocked_authorities, 0b01);
        assert_eq!(row.locked_authorities, 0);
        assert_eq!(row.total_received, 50 + 30 + 5 + 20);
        assert_eq!(row.transactions, 1);
    }

    #[test]
    fn kept_tokens_get_zero_rows() {
        let rows = address_balances_from_utxos("A", &[], &[], &["t1".to_string()]);
        assert_eq!(rows, vec![AddressBalance::new("A", "t1")]);
    }

    #[test]
    fn wallet_rows_sum_member_addresses() {
        let a = AddressBalance {
            unlocked_balance: 10,
            locked_balance: 5,
            timelock_expires: Some(70),
            unlocked_authorities: 0b01,
            ..AddressBalance::new("A", HTR_TOKEN_ID)
        };
        let b = AddressBalance {
            unlocked_balance: 1,
            timelock_expires: Some(40),
            unlocked_authorities: 0b10,
            ..AddressBalance::new("B", HTR_TOKEN_ID)
        };
        let hist = WalletTxHistory {
            wallet_id: "w".into(),
            tx_id: "t".into(),
            token_id: HTR_TOKEN_ID.into(),
            balance: 16,
            timestamp: 0,
            voided: false,
        };
        let rows = wallet_balances_from_addresses("w", &[a, b], &[hist]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total(), 16);
        assert_eq!(rows[0].timelock_expires, Some(40));
        assert_eq!(rows[0].unlocked_authorities, 0b11);
        assert_eq!(rows[0].transactions, 1);
    }

    #[test]
    fn affected_sets_are_distinct_and_sorted() {
        let mut other = utxo("t1", 1, 1);
        other.address = "B".into();
        let (addresses, txs) = affected_addresses_and_txs(&[utxo("t2", 0, 1), utxo("t1", 0, 1), other]);
        assert_eq!(addresses, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(txs, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn locked_summary_ignores_spent_outputs() {
        let locked = DbTxOutput { locked: true, timelock: Some(10), authorities: 0b10, ..utxo("t", 0, 0b10) };
        let spent = DbTxOutput { locked: true, timelock: Some(1), spent_by: Some("x".into()), ..utxo("t", 1, 3) };
        assert_eq!(locked_summary([&locked, &spent]), (0b10, Some(10)));
        assert_eq!(locked_summary(std::iter::empty::<&DbTxOutput>()), (0, None));
    }

    #[test]
    fn min_expiry_prefers_present_values() {
        assert_eq!(min_expiry(None, Some(0)), Some(0));
        assert_eq!(min_expiry(Some(3), Some(2)), Some(2));
        assert_eq!(min_expiry(None, None), None);
    }
}
