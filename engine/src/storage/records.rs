//! Read-model rows kept alongside transactions and UTXOs.

use serde::{Deserialize, Serialize};

use crate::transaction::{Address, TokenId, TxId, WalletId};

/// Wallet an address belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
}

impl Wallet {
    pub fn new(wallet_id: impl Into<WalletId>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
        }
    }
}

/// Aggregate balance of one token on one address.
///
/// Authorities are persisted as bitmasks; an absolute value never holds a
/// consumed (`-1`) authority.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalance {
    pub address: Address,
    pub token_id: TokenId,
    pub unlocked_balance: i128,
    pub locked_balance: i128,
    pub unlocked_authorities: u8,
    pub locked_authorities: u8,
    pub timelock_expires: Option<u64>,
    /// Number of non-voided transactions that touched this address/token.
    pub transactions: u64,
    pub total_received: i128,
}

impl AddressBalance {
    pub fn new(address: impl Into<Address>, token_id: impl Into<TokenId>) -> Self {
        Self {
            address: address.into(),
            token_id: token_id.into(),
            ..Self::default()
        }
    }

    pub fn total(&self) -> i128 {
        self.unlocked_balance + self.locked_balance
    }
}

/// Aggregate balance of one token across all addresses of a wallet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTokenBalance {
    pub wallet_id: WalletId,
    pub token_id: TokenId,
    pub unlocked_balance: i128,
    pub locked_balance: i128,
    pub unlocked_authorities: u8,
    pub locked_authorities: u8,
    pub timelock_expires: Option<u64>,
    pub transactions: u64,
    pub total_received: i128,
}

impl WalletTokenBalance {
    pub fn new(wallet_id: impl Into<WalletId>, token_id: impl Into<TokenId>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            token_id: token_id.into(),
            ..Self::default()
        }
    }

    pub fn total(&self) -> i128 {
        self.unlocked_balance + self.locked_balance
    }
}

/// Net effect of one transaction on one address/token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTxHistory {
    pub address: Address,
    pub tx_id: TxId,
    pub token_id: TokenId,
    pub balance: i128,
    pub timestamp: u64,
    pub voided: bool,
}

/// Net effect of one transaction on one wallet/token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTxHistory {
    pub wallet_id: WalletId,
    pub tx_id: TxId,
    pub token_id: TokenId,
    pub balance: i128,
    pub timestamp: u64,
    pub voided: bool,
}

/// Sum of the non-voided history of one address/token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTotalBalance {
    pub address: Address,
    pub token_id: TokenId,
    pub balance: i128,
    pub transactions: u64,
}
