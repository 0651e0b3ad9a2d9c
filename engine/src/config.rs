//! # Protocol Constants & Engine Configuration
//!
//! Every magic number the engine depends on lives here. The token_data
//! layout and the authority bit positions are fixed by the ledger itself;
//! the tunables at the bottom are deployment choices and come with sane
//! defaults.

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Token id of the native token. Outputs with token index `0` carry it.
pub const HTR_TOKEN_ID: &str = "00";

/// High bit of `token_data`: set when the output carries authorities
/// instead of an amount.
pub const TOKEN_AUTHORITY_MASK: u8 = 0b1000_0000;

/// Low seven bits of `token_data`: index into the transaction's token list
/// (`0` is the native token, `i` is `tokens[i - 1]`).
pub const TOKEN_INDEX_MASK: u8 = 0b0111_1111;

/// Authority bit granting the right to mint more of a token.
pub const TOKEN_MINT_MASK: u8 = 0b01;

/// Authority bit granting the right to melt (destroy) a token.
pub const TOKEN_MELT_MASK: u8 = 0b10;

/// Width of an authority vector. Room for eight capability flags, two of
/// which (mint and melt) are currently assigned.
pub const AUTHORITIES_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Vertex Versions
// ---------------------------------------------------------------------------

/// Regular block.
pub const BLOCK_VERSION: u16 = 0;

/// Regular transaction.
pub const TRANSACTION_VERSION: u16 = 1;

/// Transaction that creates a new custom token.
pub const CREATE_TOKEN_TX_VERSION: u16 = 2;

/// Block merge-mined with another chain.
pub const MERGED_MINED_BLOCK_VERSION: u16 = 3;

/// Returns `true` if `version` identifies a block rather than a transaction.
pub fn is_block_version(version: u16) -> bool {
    matches!(version, BLOCK_VERSION | MERGED_MINED_BLOCK_VERSION)
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Number of blocks a block reward stays locked after the block that
/// created it.
pub const DEFAULT_REWARD_SPEND_MIN_BLOCKS: u32 = 300;

/// Reorgs deeper than this many blocks raise an operator alert.
pub const DEFAULT_REORG_WARNING_DEPTH: u32 = 3;

/// Capacity of the recently-seen transaction cache.
pub const DEFAULT_TX_CACHE_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunables for a [`LedgerEngine`](crate::engine::LedgerEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Reorg depth above which an alert is raised. The reorg itself is
    /// processed either way.
    pub reorg_warning_depth: u32,

    /// Height lock applied to block reward outputs, in blocks.
    pub reward_spend_min_blocks: u32,

    /// How many recently accepted transaction ids to remember for
    /// duplicate-event suppression.
    pub tx_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reorg_warning_depth: DEFAULT_REORG_WARNING_DEPTH,
            reward_spend_min_blocks: DEFAULT_REWARD_SPEND_MIN_BLOCKS,
            tx_cache_capacity: DEFAULT_TX_CACHE_CAPACITY,
        }
    }
}
