//! # Event Boundary
//!
//! Fullnode events arrive as JSON. They are parsed into [`LedgerEvent`]
//! and validated here; past this module the engine only deals with
//! [`Transaction`] values whose token indexes are already resolved.
//!
//! [`RecentTxCache`] remembers recently accepted transaction ids so a
//! replayed `VERTEX_ACCEPTED` does not get applied twice.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{HTR_TOKEN_ID, TOKEN_INDEX_MASK};
use crate::error::{EngineError, EngineResult};
use crate::transaction::{DecodedScript, TokenId, Transaction, TxId, TxInput, TxOutput};

// ---------------------------------------------------------------------------
// Raw events
// ---------------------------------------------------------------------------

/// One event from the fullnode feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEvent {
    /// A new vertex entered the DAG, or an existing one got confirmed.
    VertexAccepted(RawVertex),
    /// A mempool transaction lost a conflict.
    VertexVoided { tx_id: TxId },
    /// The best chain changed.
    Reorg,
}

/// Input as sent by the fullnode. `token_data` indexes into the spending
/// transaction's token list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInput {
    pub tx_id: TxId,
    pub index: u32,
    pub value: u64,
    pub token_data: u8,
    #[serde(default)]
    pub decoded: Option<DecodedScript>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    pub value: u64,
    pub token_data: u8,
    #[serde(default)]
    pub decoded: Option<DecodedScript>,
    #[serde(default)]
    pub spent_by: Option<TxId>,
}

/// Vertex payload of [`LedgerEvent::VertexAccepted`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVertex {
    pub tx_id: TxId,
    pub version: u16,
    pub timestamp: u64,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub inputs: Vec<RawInput>,
    #[serde(default)]
    pub outputs: Vec<RawOutput>,
    #[serde(default)]
    pub tokens: Vec<TokenId>,
}

impl RawVertex {
    /// Resolves token indexes and produces the engine's [`Transaction`].
    ///
    /// Outputs start unlocked; lock state is decided at ingestion.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidTokenData`] for a token index beyond the
    /// declared token list.
    pub fn into_transaction(self) -> EngineResult<Transaction> {
        let resolve = |token_data: u8| resolve_token(&self.tx_id, &self.tokens, token_data);

        let inputs = self
            .inputs
            .iter()
            .map(|input| {
                Ok(TxInput {
                    tx_id: input.tx_id.clone(),
                    index: input.index,
                    value: input.value,
                    token_data: input.token_data,
                    token: resolve(input.token_data)?,
                    decoded: input.decoded.clone(),
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let outputs = self
            .outputs
            .iter()
            .map(|output| {
                Ok(TxOutput {
                    value: output.value,
                    token_data: output.token_data,
                    token: resolve(output.token_data)?,
                    decoded: output.decoded.clone(),
                    locked: false,
                    spent_by: output.spent_by.clone(),
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Transaction {
            tx_id: self.tx_id,
            version: self.version,
            timestamp: self.timestamp,
            height: self.height,
            inputs,
            outputs,
            tokens: self.tokens,
        })
    }
}

/// `0` is the native token, `i` is `tokens[i - 1]`.
fn resolve_token(tx_id: &str, tokens: &[TokenId], token_data: u8) -> EngineResult<TokenId> {
    let index = usize::from(token_data & TOKEN_INDEX_MASK);
    if index == 0 {
        return Ok(HTR_TOKEN_ID.to_string());
    }
    tokens
        .get(index - 1)
        .cloned()
        .ok_or_else(|| EngineError::InvalidTokenData {
            tx_id: tx_id.to_string(),
            token_data,
            tokens: tokens.len(),
        })
}

// ---------------------------------------------------------------------------
// RecentTxCache
// ---------------------------------------------------------------------------

/// Bounded set of recently seen transaction ids.
///
/// Insertion ordered; inserting a new id at capacity evicts the oldest.
/// Re-inserting a known id does not refresh it.
#[derive(Debug, Clone)]
pub struct RecentTxCache {
    seen: HashSet<TxId>,
    order: VecDeque<TxId>,
    capacity: usize,
}

impl RecentTxCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records `tx_id`. Returns `false` if it was already cached.
    pub fn insert(&mut self, tx_id: &str) -> bool {
        if self.seen.contains(tx_id) {
            return false;
        }
        if self.capacity == 0 {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(tx_id.to_string());
        self.order.push_back(tx_id.to_string());
        true
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.seen.contains(tx_id)
    }

    /// Forgets `tx_id`, e.g. after it was voided.
    pub fn remove(&mut self, tx_id: &str) {
        if self.seen.remove(tx_id) {
            self.order.retain(|id| id != tx_id);
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
