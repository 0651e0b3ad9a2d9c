//! # Balance Algebra
//!
//! Balances in walletd are never edited in place. Every input and every
//! output of a transaction is turned into a tiny signed delta, and deltas
//! are combined with `merge` until they describe a whole address, a whole
//! wallet, or a whole unlock run.
//!
//! ```text
//! authorities.rs: signed trit vector for mint/melt capabilities
//! balance.rs    : per-token locked/unlocked amounts and authorities
//! token_map.rs  : token → Balance, built from single inputs/outputs
//! aggregate.rs  : folds a transaction into address and wallet deltas
//! ```
//!
//! `merge` is commutative, and the zero value is its identity. Amounts are
//! associative too. Authority trits saturate, so a fold that first
//! saturates a bit and then cancels it can depend on order; deltas from a
//! single transaction never do both for the same bit.

pub mod aggregate;
pub mod authorities;
#[allow(clippy::module_inception)]
pub mod balance;
pub mod token_map;

pub use aggregate::{
    address_balance_map, wallet_balance_map, wallet_balances_for_tx, TokenBalanceEntry,
    WalletBalance,
};
pub use authorities::{Authorities, AuthorityFlags};
pub use balance::Balance;
pub use token_map::TokenBalanceMap;
