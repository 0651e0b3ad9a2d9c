//! Token → [`Balance`] maps and the two primitive constructors.
//!
//! [`TokenBalanceMap::from_tx_output`] and [`TokenBalanceMap::from_tx_input`]
//! are the only places where raw values become balances. Everything else
//! is `merge`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::authorities::Authorities;
use super::balance::Balance;
use crate::error::{EngineError, EngineResult};
use crate::transaction::{TokenId, TxInput, TxOutput};

/// Balances keyed by token, iterated in the order tokens were first seen.
///
/// A missing token reads as the zero [`Balance`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenBalanceMap {
    balances: HashMap<TokenId, Balance>,
    order: Vec<TokenId>,
}

impl TokenBalanceMap {
    /// The empty map, identity of [`TokenBalanceMap::merge`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the balance for `token`, or zero if it was never touched.
    pub fn get(&self, token: &str) -> Balance {
        self.balances.get(token).cloned().unwrap_or_default()
    }

    /// Replaces the balance for `token`.
    pub fn set(&mut self, token: impl Into<TokenId>, balance: Balance) {
        let token = token.into();
        if !self.balances.contains_key(&token) {
            self.order.push(token.clone());
        }
        self.balances.insert(token, balance);
    }

    /// Iterates `(token, balance)` in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&TokenId, &Balance)> {
        self.order
            .iter()
            .filter_map(move |token| self.balances.get(token).map(|b| (token, b)))
    }

    /// Tokens in first-seen order.
    pub fn tokens(&self) -> &[TokenId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Per-token union of two maps. Tokens only in `other` are appended
    /// after the tokens of `self`.
    pub fn merge(&self, other: &TokenBalanceMap) -> TokenBalanceMap {
        let mut merged = self.clone();
        for (token, balance) in other.iter() {
            let combined = merged.get(token).merge(balance);
            merged.set(token.clone(), combined);
        }
        merged
    }

    /// Single-entry map for what `output` adds to its address.
    ///
    /// # Errors
    ///
    /// [`EngineError::MissingDecodedScript`] if the output has no decoded
    /// address. `tx_id` and `index` only label the error.
    pub fn from_tx_output(tx_id: &str, index: u32, output: &TxOutput) -> EngineResult<Self> {
        let decoded = output
            .decoded
            .as_ref()
            .ok_or_else(|| EngineError::MissingDecodedScript {
                tx_id: tx_id.to_string(),
                index,
            })?;

        let value = i128::from(output.value);
        let balance = match (output.locked, output.is_authority()) {
            (true, true) => Balance {
                locked_authorities: authorities_of(output.value),
                lock_expires: decoded.timelock,
                ..Balance::zero()
            },
            (true, false) => Balance {
                total_amount_sent: value,
                locked_amount: value,
                lock_expires: decoded.timelock,
                ..Balance::zero()
            },
            (false, true) => Balance {
                unlocked_authorities: authorities_of(output.value),
                ..Balance::zero()
            },
            (false, false) => Balance {
                total_amount_sent: value,
                unlocked_amount: value,
                ..Balance::zero()
            },
        };

        let mut map = Self::new();
        map.set(output.token.clone(), balance);
        Ok(map)
    }

    /// Single-entry negative delta for what `input` takes away.
    ///
    /// Spent authorities show up as `-1` trits; they cancel against an
    /// authority output of the same transaction when the authority is
    /// passed along.
    pub fn from_tx_input(input: &TxInput) -> Self {
        let balance = if input.is_authority() {
            Balance {
                unlocked_authorities: authorities_of(input.value).to_negative(),
                ..Balance::zero()
            }
        } else {
            Balance {
                unlocked_amount: -i128::from(input.value),
                ..Balance::zero()
            }
        };

        let mut map = Self::new();
        map.set(input.token.clone(), balance);
        map
    }
}

impl PartialEq for TokenBalanceMap {
    fn eq(&self, other: &Self) -> bool {
        self.balances == other.balances
    }
}

impl Eq for TokenBalanceMap {}

fn authorities_of(value: u64) -> Authorities {
    Authorities::from_bits((value & 0xFF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HTR_TOKEN_ID, TOKEN_AUTHORITY_MASK, TOKEN_MINT_MASK};
    use crate::transaction::DecodedScript;

    fn output(value: u64, token_data: u8, locked: bool) -> TxOutput {
        TxOutput {
            value,
            token_data,
            token: HTR_TOKEN_ID.to_string(),
            decoded: Some(DecodedScript::with_timelock("addr1", 1_000)),
            locked,
            spent_by: None,
        }
    }

    fn input(value: u64, token_data: u8) -> TxInput {
        TxInput {
            tx_id: "prev".into(),
            index: 0,
            value,
            token_data,
            token: HTR_TOKEN_ID.to_string(),
            decoded: Some(DecodedScript::new("addr1")),
        }
    }

    #[test]
    fn missing_token_reads_as_zero() {
        let map = TokenBalanceMap::new();
        assert_eq!(map.get("nope"), Balance::zero());
        assert!(map.is_empty());
    }

    #[test]
    fn unlocked_output_credits_unlocked_bucket() {
        let map = TokenBalanceMap::from_tx_output("tx", 0, &output(100, 0, false)).unwrap();
        let balance = map.get(HTR_TOKEN_ID);
        assert_eq!(balance.unlocked_amount, 100);
        assert_eq!(balance.total_amount_sent, 100);
        assert_eq!(balance.locked_amount, 0);
        assert_eq!(balance.lock_expires, None);
    }

    #[test]
    fn locked_output_credits_locked_bucket_with_expiry() {
        let map = TokenBalanceMap::from_tx_output("tx", 0, &output(100, 0, true)).unwrap();
        let balance = map.get(HTR_TOKEN_ID);
        assert_eq!(balance.locked_amount, 100);
        assert_eq!(balance.unlocked_amount, 0);
        assert_eq!(balance.total_amount_sent, 100);
        assert_eq!(balance.lock_expires, Some(1_000));
    }

    #[test]
    fn authority_outputs_carry_no_amount() {
        let data = TOKEN_AUTHORITY_MASK | 1;
        let unlocked = TokenBalanceMap::from_tx_output("tx", 0, &output(0b11, data, false)).unwrap();
        let balance = unlocked.get(HTR_TOKEN_ID);
        assert_eq!(balance.total(), 0);
        assert_eq!(balance.unlocked_authorities, Authorities::from_bits(0b11));

        let locked = TokenBalanceMap::from_tx_output("tx", 0, &output(0b01, data, true)).unwrap();
        let balance = locked.get(HTR_TOKEN_ID);
        assert_eq!(balance.total(), 0);
        assert_eq!(balance.locked_authorities, Authorities::from_bits(0b01));
    }

    #[test]
    fn output_without_decoded_script_fails() {
        let mut out = output(5, 0, false);
        out.decoded = None;
        let err = TokenBalanceMap::from_tx_output("tx9", 3, &out).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingDecodedScript { ref tx_id, index: 3 } if tx_id == "tx9"
        ));
    }

    #[test]
    fn plain_input_is_negative_unlocked_delta() {
        let balance = TokenBalanceMap::from_tx_input(&input(40, 0)).get(HTR_TOKEN_ID);
        assert_eq!(balance.unlocked_amount, -40);
        assert_eq!(balance.total_amount_sent, 0);
    }

    #[test]
    fn authority_input_is_negative_trit() {
        let data = TOKEN_AUTHORITY_MASK | 1;
        let balance = TokenBalanceMap::from_tx_input(&input(TOKEN_MINT_MASK as u64, data))
            .get(HTR_TOKEN_ID);
        assert!(balance.unlocked_authorities.has_negative_value());
        assert_eq!(balance.unlocked_authorities.to_integer(), -1);
        assert_eq!(balance.total(), 0);
    }

    #[test]
    fn spending_and_recreating_nets_to_zero() {
        let spent = TokenBalanceMap::from_tx_input(&input(250, 0));
        let created = TokenBalanceMap::from_tx_output("tx", 0, &output(250, 0, false)).unwrap();
        assert_eq!(spent.merge(&created).get(HTR_TOKEN_ID).total(), 0);
    }

    #[test]
    fn passing_an_authority_along_cancels_out() {
        let data = TOKEN_AUTHORITY_MASK | 1;
        let spent = TokenBalanceMap::from_tx_input(&input(0b01, data));
        let created = TokenBalanceMap::from_tx_output("tx", 0, &output(0b01, data, false)).unwrap();
        let net = spent.merge(&created).get(HTR_TOKEN_ID);
        assert!(net.unlocked_authorities.is_zero());
    }

    #[test]
    fn merge_preserves_first_seen_order_and_identity() {
        let mut a = TokenBalanceMap::new();
        a.set("t1", Balance { unlocked_amount: 1, ..Balance::zero() });
        let mut b = TokenBalanceMap::new();
        b.set("t2", Balance { unlocked_amount: 2, ..Balance::zero() });
        b.set("t1", Balance { unlocked_amount: 3, ..Balance::zero() });

        let merged = a.merge(&b);
        assert_eq!(merged.tokens(), &["t1".to_string(), "t2".to_string()]);
        assert_eq!(merged.get("t1").unlocked_amount, 4);
        assert_eq!(a.merge(&TokenBalanceMap::new()), a);
        assert_eq!(TokenBalanceMap::new().merge(&a), a);
    }
}
