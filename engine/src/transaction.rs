//! # Transaction & UTXO Types
//!
//! The engine only ever sees transactions that already went through the
//! event boundary ([`crate::event`]): token indexes resolved to token ids,
//! scripts decoded to addresses. Two shapes live here:
//!
//! - **Prepared**: [`Transaction`], [`TxInput`], [`TxOutput`]. What a
//!   newly accepted vertex looks like when it reaches the aggregator.
//! - **Persisted**: [`Tx`], [`Block`], [`DbTxOutput`]. What the store
//!   keeps and hands back during unlocks and reorgs.

use serde::{Deserialize, Serialize};

use crate::config::{is_block_version, TOKEN_AUTHORITY_MASK, TOKEN_INDEX_MASK};

/// Hex-encoded transaction (or block) hash.
pub type TxId = String;

/// Base58 address decoded from an output script.
pub type Address = String;

/// Wallet identifier assigned by the wallet registry.
pub type WalletId = String;

/// Hex-encoded token uid. The native token is [`crate::config::HTR_TOKEN_ID`].
pub type TokenId = String;

// ---------------------------------------------------------------------------
// Prepared transaction
// ---------------------------------------------------------------------------

/// Result of decoding an output script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedScript {
    /// Address the script pays to.
    pub address: Address,
    /// Absolute unix timestamp before which the output cannot be spent.
    pub timelock: Option<u64>,
}

impl DecodedScript {
    /// Decoded script without a timelock.
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            timelock: None,
        }
    }

    /// Decoded script locked until `timelock`.
    pub fn with_timelock(address: impl Into<Address>, timelock: u64) -> Self {
        Self {
            address: address.into(),
            timelock: Some(timelock),
        }
    }
}

/// A transaction input, resolved against the output it spends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Transaction that created the spent output.
    pub tx_id: TxId,
    /// Index of the spent output.
    pub index: u32,
    /// Amount, or authority bitmask when `token_data` has the authority bit.
    pub value: u64,
    /// Raw token_data byte of the spent output.
    pub token_data: u8,
    /// Resolved token id.
    pub token: TokenId,
    /// Decoded script of the spent output. Inputs without one are skipped
    /// by the aggregator.
    pub decoded: Option<DecodedScript>,
}

impl TxInput {
    /// Returns `true` if the spent output carries authorities.
    pub fn is_authority(&self) -> bool {
        self.token_data & TOKEN_AUTHORITY_MASK != 0
    }
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount, or authority bitmask when `token_data` has the authority bit.
    pub value: u64,
    /// Raw token_data byte.
    pub token_data: u8,
    /// Resolved token id.
    pub token: TokenId,
    /// Decoded script. Every output must have one.
    pub decoded: Option<DecodedScript>,
    /// Whether the value is currently time or height locked.
    pub locked: bool,
    /// Transaction that spent this output, if any.
    pub spent_by: Option<TxId>,
}

impl TxOutput {
    /// Returns `true` if this output carries authorities.
    pub fn is_authority(&self) -> bool {
        self.token_data & TOKEN_AUTHORITY_MASK != 0
    }

    /// Index into the transaction's token list encoded in `token_data`.
    pub fn token_index(&self) -> u8 {
        self.token_data & TOKEN_INDEX_MASK
    }
}

/// A transaction as accepted from the fullnode, ready for aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash.
    pub tx_id: TxId,
    /// Vertex version; see [`crate::config`].
    pub version: u16,
    /// Unix timestamp of the vertex.
    pub timestamp: u64,
    /// Height of the block that confirmed it (or its own height for
    /// blocks). `None` while in the mempool.
    pub height: Option<u32>,
    /// Resolved inputs.
    pub inputs: Vec<TxInput>,
    /// Outputs in index order.
    pub outputs: Vec<TxOutput>,
    /// Custom tokens referenced by `token_data` indexes `1..`.
    pub tokens: Vec<TokenId>,
}

impl Transaction {
    /// Returns `true` if this vertex is a block.
    pub fn is_block(&self) -> bool {
        is_block_version(self.version)
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Persisted transaction row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub tx_id: TxId,
    /// `None` means the transaction sits in the mempool.
    pub height: Option<u32>,
    pub timestamp: u64,
    pub version: u16,
    /// Set permanently once the transaction is voided.
    pub voided: bool,
}

impl Tx {
    /// Returns `true` if this row is a block.
    pub fn is_block(&self) -> bool {
        is_block_version(self.version)
    }
}

impl From<&Transaction> for Tx {
    fn from(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.tx_id.clone(),
            height: tx.height,
            timestamp: tx.timestamp,
            version: tx.version,
            voided: false,
        }
    }
}

/// Persisted block row, keyed by height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub tx_id: TxId,
    pub height: u32,
}

/// Primary key of a UTXO.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoKey {
    pub tx_id: TxId,
    pub index: u32,
}

/// Persisted output row. Lives on after being spent (`spent_by` set) and
/// after being voided (`voided` set) so that rebuilds and audits can see
/// the full history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTxOutput {
    pub tx_id: TxId,
    pub index: u32,
    pub token_id: TokenId,
    pub address: Address,
    /// Amount. For authority outputs this is the raw bitmask.
    pub value: u64,
    /// Authority bitmask, `0` for plain outputs.
    pub authorities: u8,
    pub timelock: Option<u64>,
    pub heightlock: Option<u32>,
    pub locked: bool,
    pub spent_by: Option<TxId>,
    pub voided: bool,
}

impl DbTxOutput {
    /// Builds the persisted row for output `index` of `tx`.
    ///
    /// Returns `None` for outputs without a decoded address; the aggregator
    /// has already rejected those by the time rows are written.
    pub fn from_output(
        tx_id: &str,
        index: u32,
        output: &TxOutput,
        heightlock: Option<u32>,
    ) -> Option<Self> {
        let decoded = output.decoded.as_ref()?;
        let authorities = if output.is_authority() {
            (output.value & 0xFF) as u8
        } else {
            0
        };
        Some(Self {
            tx_id: tx_id.to_string(),
            index,
            token_id: output.token.clone(),
            address: decoded.address.clone(),
            value: output.value,
            authorities,
            timelock: decoded.timelock,
            heightlock,
            locked: output.locked,
            spent_by: output.spent_by.clone(),
            voided: false,
        })
    }

    /// Primary key of this row.
    pub fn key(&self) -> UtxoKey {
        UtxoKey {
            tx_id: self.tx_id.clone(),
            index: self.index,
        }
    }

    /// Returns `true` if this output carries authorities.
    pub fn is_authority(&self) -> bool {
        self.authorities > 0
    }

    /// Returns `true` if the output is neither spent nor voided.
    pub fn is_unspent(&self) -> bool {
        self.spent_by.is_none() && !self.voided
    }
}
