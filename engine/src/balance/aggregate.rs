//! Address and wallet level aggregation of a transaction.
//!
//! ```text
//! inputs/outputs ──from_tx_*──▶ per-address TokenBalanceMap
//!                                      │ address → wallet
//!                                      ▼
//!                              per-wallet TokenBalanceMap
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::authorities::AuthorityFlags;
use super::token_map::TokenBalanceMap;
use crate::error::EngineResult;
use crate::storage::records::Wallet;
use crate::transaction::{Address, TokenId, Transaction, TxId, TxInput, TxOutput, WalletId};

/// Folds a transaction's inputs and outputs into per-address deltas.
///
/// Inputs without a decoded address are skipped. Outputs must all decode.
///
/// # Errors
///
/// [`crate::EngineError::MissingDecodedScript`] for the first output
/// without a decoded address.
pub fn address_balance_map(
    tx_id: &str,
    inputs: &[TxInput],
    outputs: &[TxOutput],
) -> EngineResult<BTreeMap<Address, TokenBalanceMap>> {
    let mut map: BTreeMap<Address, TokenBalanceMap> = BTreeMap::new();

    for input in inputs {
        let Some(decoded) = input.decoded.as_ref() else {
            continue;
        };
        let delta = TokenBalanceMap::from_tx_input(input);
        let entry = map.entry(decoded.address.clone()).or_default();
        *entry = entry.merge(&delta);
    }

    for (index, output) in outputs.iter().enumerate() {
        let delta = TokenBalanceMap::from_tx_output(tx_id, index as u32, output)?;
        // from_tx_output already rejected undecoded outputs
        if let Some(decoded) = output.decoded.as_ref() {
            let entry = map.entry(decoded.address.clone()).or_default();
            *entry = entry.merge(&delta);
        }
    }

    Ok(map)
}

/// Folds per-address deltas into per-wallet deltas. Addresses that belong
/// to no wallet are dropped.
pub fn wallet_balance_map(
    address_wallet_map: &HashMap<Address, Wallet>,
    address_balance_map: &BTreeMap<Address, TokenBalanceMap>,
) -> BTreeMap<WalletId, TokenBalanceMap> {
    let mut map: BTreeMap<WalletId, TokenBalanceMap> = BTreeMap::new();
    for (address, balances) in address_balance_map {
        let Some(wallet) = address_wallet_map.get(address) else {
            continue;
        };
        let entry = map.entry(wallet.wallet_id.clone()).or_default();
        *entry = entry.merge(balances);
    }
    map
}

// ---------------------------------------------------------------------------
// WalletBalance
// ---------------------------------------------------------------------------

/// One token line of a [`WalletBalance`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalanceEntry {
    pub token_id: TokenId,
    pub total_amount_sent: i128,
    pub locked_amount: i128,
    pub unlocked_amount: i128,
    pub locked_authorities: AuthorityFlags,
    pub unlocked_authorities: AuthorityFlags,
    pub lock_expires: Option<u64>,
    pub total: i128,
}

/// What a single transaction did to a single wallet. Consumed by the
/// notification layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub tx_id: TxId,
    pub wallet_id: WalletId,
    /// Distinct wallet addresses the transaction touched, first-seen order.
    pub addresses: Vec<Address>,
    /// Token lines sorted by descending `|total|`. Ties keep first-seen
    /// order.
    pub wallet_balance_for_tx: Vec<TokenBalanceEntry>,
}

/// Per-wallet summary of `tx`.
///
/// # Errors
///
/// Same as [`address_balance_map`].
pub fn wallet_balances_for_tx(
    tx: &Transaction,
    address_wallet_map: &HashMap<Address, Wallet>,
) -> EngineResult<BTreeMap<WalletId, WalletBalance>> {
    let per_address = address_balance_map(&tx.tx_id, &tx.inputs, &tx.outputs)?;

    let mut per_wallet: BTreeMap<WalletId, (Vec<Address>, TokenBalanceMap)> = BTreeMap::new();
    for address in touched_addresses(tx) {
        let (Some(wallet), Some(balances)) =
            (address_wallet_map.get(address), per_address.get(address))
        else {
            continue;
        };
        let (addresses, map) = per_wallet.entry(wallet.wallet_id.clone()).or_default();
        addresses.push(address.clone());
        *map = map.merge(balances);
    }

    Ok(per_wallet
        .into_iter()
        .map(|(wallet_id, (addresses, map))| {
            let balance = WalletBalance {
                tx_id: tx.tx_id.clone(),
                wallet_id: wallet_id.clone(),
                addresses,
                wallet_balance_for_tx: sorted_entries(&map),
            };
            (wallet_id, balance)
        })
        .collect())
}

/// Decoded addresses of `tx`, inputs first, each once in first-seen order.
fn touched_addresses(tx: &Transaction) -> Vec<&Address> {
    let decoded = tx
        .inputs
        .iter()
        .filter_map(|input| input.decoded.as_ref())
        .chain(tx.outputs.iter().filter_map(|output| output.decoded.as_ref()));

    let mut order: Vec<&Address> = Vec::new();
    for script in decoded {
        if !order.contains(&&script.address) {
            order.push(&script.address);
        }
    }
    order
}

fn sorted_entries(map: &TokenBalanceMap) -> Vec<TokenBalanceEntry> {
    let mut entries: Vec<TokenBalanceEntry> = map
        .iter()
        .map(|(token_id, balance)| TokenBalanceEntry {
            token_id: token_id.clone(),
            total_amount_sent: balance.total_amount_sent,
            locked_amount: balance.locked_amount,
            unlocked_amount: balance.unlocked_amount,
            locked_authorities: balance.locked_authorities.to_json(),
            unlocked_authorities: balance.unlocked_authorities.to_json(),
            lock_expires: balance.lock_expires,
            total: balance.total(),
        })
        .collect();
    // sort_by is stable
    entries.sort_by(|a, b| b.total.abs().cmp(&a.total.abs()));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HTR_TOKEN_ID, TRANSACTION_VERSION};
    use crate::transaction::DecodedScript;
    use crate::EngineError;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn output(address: &str, token: &str, value: u64) -> TxOutput {
        TxOutput {
            value,
            token_data: 0,
            token: token.to_string(),
            decoded: Some(DecodedScript::new(address)),
            locked: false,
            spent_by: None,
        }
    }

    fn input(address: &str, token: &str, value: u64) -> TxInput {
        TxInput {
            tx_id: "prev".into(),
            index: 0,
            value,
            token_data: 0,
            token: token.to_string(),
            decoded: Some(DecodedScript::new(address)),
        }
    }

    fn wallets(pairs: &[(&str, &str)]) -> HashMap<Address, Wallet> {
        pairs
            .iter()
            .map(|(address, wallet)| (address.to_string(), Wallet::new(*wallet)))
            .collect()
    }

    #[test]
    fn folds_inputs_and_outputs_per_address() {
        let inputs = vec![input("A", HTR_TOKEN_ID, 100)];
        let outputs = vec![output("B", HTR_TOKEN_ID, 60), output("A", HTR_TOKEN_ID, 40)];

        let map = address_balance_map("tx", &inputs, &outputs).unwrap();
        assert_eq!(map["A"].get(HTR_TOKEN_ID).unlocked_amount, -60);
        assert_eq!(map["A"].get(HTR_TOKEN_ID).total_amount_sent, 40);
        assert_eq!(map["B"].get(HTR_TOKEN_ID).unlocked_amount, 60);
    }

    #[test]
    fn undecoded_inputs_are_skipped() {
        let mut orphan = input("A", HTR_TOKEN_ID, 10);
        orphan.decoded = None;
        let map = address_balance_map("tx", &[orphan], &[]).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn undecoded_outputs_fail() {
        let mut bad = output("A", HTR_TOKEN_ID, 10);
        bad.decoded = None;
        let outputs = vec![output("B", HTR_TOKEN_ID, 1), bad];
        let err = address_balance_map("tx", &[], &outputs).unwrap_err();
        assert!(matches!(err, EngineError::MissingDecodedScript { index: 1, .. }));
    }

    #[test]
    fn folding_order_does_not_matter() {
        let mut inputs = vec![
            input("A", HTR_TOKEN_ID, 10),
            input("B", "t1", 7),
            input("A", "t1", 3),
        ];
        let mut outputs = vec![
            output("A", HTR_TOKEN_ID, 4),
            output("C", "t1", 10),
            output("B", HTR_TOKEN_ID, 6),
        ];
        let expected = address_balance_map("tx", &inputs, &outputs).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            inputs.shuffle(&mut rng);
            outputs.shuffle(&mut rng);
            assert_eq!(address_balance_map("tx", &inputs, &outputs).unwrap(), expected);
        }
    }

    #[test]
    fn wallet_map_drops_unknown_addresses() {
        let outputs = vec![
            output("A", HTR_TOKEN_ID, 5),
            output("B", HTR_TOKEN_ID, 7),
            output("X", HTR_TOKEN_ID, 100),
        ];
        let per_address = address_balance_map("tx", &[], &outputs).unwrap();
        let per_wallet = wallet_balance_map(&wallets(&[("A", "w1"), ("B", "w1")]), &per_address);

        assert_eq!(per_wallet.len(), 1);
        assert_eq!(per_wallet["w1"].get(HTR_TOKEN_ID).unlocked_amount, 12);
    }

    #[test]
    fn wallet_balances_sort_tokens_by_magnitude() {
        let tx = Transaction {
            tx_id: "tx1".into(),
            version: TRANSACTION_VERSION,
            timestamp: 0,
            height: None,
            inputs: vec![input("A", "t2", 500)],
            outputs: vec![
                output("A", HTR_TOKEN_ID, 10),
                output("B", "t1", 10),
                output("B", "t3", 30),
                output("C", HTR_TOKEN_ID, 99),
            ],
            tokens: vec!["t1".into(), "t2".into(), "t3".into()],
        };
        let map = wallets(&[("A", "w1"), ("B", "w1"), ("C", "w2")]);

        let balances = wallet_balances_for_tx(&tx, &map).unwrap();
        let w1 = &balances["w1"];
        assert_eq!(w1.addresses, vec!["A".to_string(), "B".to_string()]);

        let order: Vec<&str> = w1
            .wallet_balance_for_tx
            .iter()
            .map(|entry| entry.token_id.as_str())
            .collect();
        // t2 (-500) first, then t3 (30), then the tie 00/t1 in first-seen order.
        assert_eq!(order, vec!["t2", "t3", HTR_TOKEN_ID, "t1"]);
        assert_eq!(w1.wallet_balance_for_tx[0].total, -500);

        assert_eq!(balances["w2"].addresses, vec!["C".to_string()]);
        assert_eq!(balances["w2"].wallet_balance_for_tx[0].total, 99);
    }

    #[test]
    fn ties_follow_transaction_order_not_address_names() {
        let tx = Transaction {
            tx_id: "tx2".into(),
            version: TRANSACTION_VERSION,
            timestamp: 0,
            height: None,
            inputs: vec![],
            outputs: vec![output("Z", "t1", 10), output("A", HTR_TOKEN_ID, 10)],
            tokens: vec!["t1".into()],
        };
        let map = wallets(&[("A", "w1"), ("Z", "w1")]);

        let w1 = &wallet_balances_for_tx(&tx, &map).unwrap()["w1"];
        assert_eq!(w1.addresses, vec!["Z".to_string(), "A".to_string()]);
        let order: Vec<&str> = w1
            .wallet_balance_for_tx
            .iter()
            .map(|entry| entry.token_id.as_str())
            .collect();
        assert_eq!(order, vec!["t1", HTR_TOKEN_ID]);
    }
}
