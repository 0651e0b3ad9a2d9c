//! Post-rebuild consistency check.
//!
//! For every address/token, the aggregate must equal the sum of the
//! non-voided history: `unlocked + locked == Σ history.balance`, and the
//! stored transaction count must match the number of history rows. The
//! comparison is a pure function over two snapshots;
//! [`validate_address_balances`] fetches them and handles the alert.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::alert::{raise, Alert, AlertSink, Severity};
use crate::error::{EngineError, EngineResult};
use crate::storage::{AddressBalance, AddressTotalBalance, LedgerStore};
use crate::transaction::{Address, TokenId};

/// One address/token whose aggregate disagrees with its history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMismatch {
    pub address: Address,
    pub token_id: TokenId,
    /// Sum of the non-voided history.
    pub expected: i128,
    pub unlocked: i128,
    pub locked: i128,
    pub expected_transactions: u64,
    pub actual_transactions: u64,
}

/// Compares aggregates against history sums over the union of their
/// address/token keys. A key missing on one side counts as zero there.
pub fn check_address_balances(
    balances: &[AddressBalance],
    history_sums: &[AddressTotalBalance],
) -> Result<(), Vec<BalanceMismatch>> {
    let mut pairs: BTreeMap<(&str, &str), (Option<&AddressBalance>, Option<&AddressTotalBalance>)> =
        BTreeMap::new();
    for balance in balances {
        pairs
            .entry((balance.address.as_str(), balance.token_id.as_str()))
            .or_default()
            .0 = Some(balance);
    }
    for sum in history_sums {
        pairs
            .entry((sum.address.as_str(), sum.token_id.as_str()))
            .or_default()
            .1 = Some(sum);
    }

    let mismatches: Vec<BalanceMismatch> = pairs
        .into_iter()
        .filter_map(|((address, token_id), (balance, sum))| {
            let unlocked = balance.map_or(0, |b| b.unlocked_balance);
            let locked = balance.map_or(0, |b| b.locked_balance);
            let actual_transactions = balance.map_or(0, |b| b.transactions);
            let expected = sum.map_or(0, |s| s.balance);
            let expected_transactions = sum.map_or(0, |s| s.transactions);

            let consistent =
                unlocked + locked == expected && actual_transactions == expected_transactions;
            (!consistent).then(|| BalanceMismatch {
                address: address.to_string(),
                token_id: token_id.to_string(),
                expected,
                unlocked,
                locked,
                expected_transactions,
                actual_transactions,
            })
        })
        .collect();

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(mismatches)
    }
}

/// Fetches aggregates and history sums for `addresses` and checks them.
///
/// # Errors
///
/// [`EngineError::BalanceMismatch`] after raising a critical alert.
pub fn validate_address_balances<S, A>(
    store: &S,
    alerts: &A,
    addresses: &[Address],
) -> EngineResult<()>
where
    S: LedgerStore,
    A: AlertSink,
{
    if addresses.is_empty() {
        return Ok(());
    }

    let balances = store.fetch_address_balance(addresses)?;
    let history_sums = store.fetch_address_tx_history_sum(addresses)?;

    check_address_balances(&balances, &history_sums).map_err(|mismatches| {
        for mismatch in &mismatches {
            error!(
                address = %mismatch.address,
                token = %mismatch.token_id,
                expected = %mismatch.expected,
                unlocked = %mismatch.unlocked,
                locked = %mismatch.locked,
                "balance does not match transaction history"
            );
        }
        raise(
            alerts,
            Alert::new(
                "Balance mismatch after rebuild",
                format!(
                    "{} address/token aggregate(s) disagree with their transaction history.",
                    mismatches.len()
                ),
                Severity::Critical,
                json!({ "mismatches": &mismatches }),
            ),
        );
        EngineError::BalanceMismatch(mismatches)
    })
}
