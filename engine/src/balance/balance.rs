//! Per-token balance with locked and unlocked buckets.
//!
//! A [`Balance`] is either an absolute aggregate (what an address holds)
//! or a delta (what one input/output/transaction changes). The same type
//! serves both so that deltas fold straight into aggregates.

use serde::{Deserialize, Serialize};

use super::authorities::Authorities;

/// Locked/unlocked amounts and authorities for a single token.
///
/// Amounts are `i128` so that deltas can go negative and sums of `u64`
/// values never overflow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Amount received. Inputs never touch it.
    pub total_amount_sent: i128,
    pub locked_amount: i128,
    pub unlocked_amount: i128,
    pub locked_authorities: Authorities,
    pub unlocked_authorities: Authorities,
    /// Earliest pending timelock expiry, if any locked value carries one.
    /// `Some(0)` is a real value and is kept distinct from `None`.
    pub lock_expires: Option<u64>,
}

impl Balance {
    /// The zero balance, identity of [`Balance::merge`].
    pub fn zero() -> Self {
        Self::default()
    }

    /// `locked_amount + unlocked_amount`.
    pub fn total(&self) -> i128 {
        self.locked_amount + self.unlocked_amount
    }

    /// All authorities, locked or not.
    pub fn authorities(&self) -> Authorities {
        self.unlocked_authorities.merge(&self.locked_authorities)
    }

    /// Returns `true` if this balance is the zero balance.
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// Sums amounts, merges authorities and keeps the earliest expiry.
    pub fn merge(&self, other: &Balance) -> Balance {
        let lock_expires = match (self.lock_expires, other.lock_expires) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Balance {
            total_amount_sent: self.total_amount_sent + other.total_amount_sent,
            locked_amount: self.locked_amount + other.locked_amount,
            unlocked_amount: self.unlocked_amount + other.unlocked_amount,
            locked_authorities: self.locked_authorities.merge(&other.locked_authorities),
            unlocked_authorities: self.unlocked_authorities.merge(&other.unlocked_authorities),
            lock_expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_authorities(rng: &mut StdRng) -> Authorities {
        let trits: Vec<i8> = (0..8).map(|_| rng.gen_range(0..=1)).collect();
        Authorities::from_trits(&trits).unwrap()
    }

    fn random_balance(rng: &mut StdRng) -> Balance {
        Balance {
            total_amount_sent: rng.gen_range(0..1_000_000),
            locked_amount: rng.gen_range(-1_000_000..1_000_000),
            unlocked_amount: rng.gen_range(-1_000_000..1_000_000),
            locked_authorities: random_authorities(rng),
            unlocked_authorities: random_authorities(rng),
            lock_expires: if rng.gen_bool(0.5) {
                Some(rng.gen_range(0..10_000))
            } else {
                None
            },
        }
    }

    #[test]
    fn total_is_locked_plus_unlocked() {
        let balance = Balance {
            locked_amount: 30,
            unlocked_amount: 12,
            ..Balance::zero()
        };
        assert_eq!(balance.total(), 42);
    }

    #[test]
    fn merge_adds_amounts() {
        let a = Balance {
            total_amount_sent: 10,
            unlocked_amount: 10,
            ..Balance::zero()
        };
        let b = Balance {
            locked_amount: 5,
            unlocked_amount: -3,
            ..Balance::zero()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.total_amount_sent, 10);
        assert_eq!(merged.unlocked_amount, 7);
        assert_eq!(merged.locked_amount, 5);
        assert_eq!(merged.total(), 12);
    }

    #[test]
    fn merge_keeps_earliest_expiry() {
        let a = Balance { lock_expires: Some(50), ..Balance::zero() };
        let b = Balance { lock_expires: Some(20), ..Balance::zero() };
        let none = Balance::zero();

        assert_eq!(a.merge(&b).lock_expires, Some(20));
        assert_eq!(a.merge(&none).lock_expires, Some(50));
        assert_eq!(none.merge(&b).lock_expires, Some(20));
        assert_eq!(none.merge(&none).lock_expires, None);
    }

    #[test]
    fn zero_expiry_is_not_absent() {
        let zero_lock = Balance { lock_expires: Some(0), ..Balance::zero() };
        let later = Balance { lock_expires: Some(100), ..Balance::zero() };
        assert_eq!(zero_lock.merge(&later).lock_expires, Some(0));
        assert_eq!(zero_lock.merge(&Balance::zero()).lock_expires, Some(0));
        assert!(!zero_lock.is_zero());
    }

    #[test]
    fn authorities_combine_both_buckets() {
        let balance = Balance {
            locked_authorities: Authorities::from_bits(0b01),
            unlocked_authorities: Authorities::from_bits(0b10),
            ..Balance::zero()
        };
        assert_eq!(balance.authorities(), Authorities::from_bits(0b11));
    }

    #[test]
    fn merge_laws_hold_for_random_balances() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..500 {
            let b1 = random_balance(&mut rng);
            let b2 = random_balance(&mut rng);
            let b3 = random_balance(&mut rng);

            assert_eq!(b1.merge(&b2), b2.merge(&b1), "commutativity");
            assert_eq!(
                b1.merge(&b2).merge(&b3),
                b1.merge(&b2.merge(&b3)),
                "associativity"
            );
            assert_eq!(b1.merge(&Balance::zero()), b1, "identity");
        }
    }
}
