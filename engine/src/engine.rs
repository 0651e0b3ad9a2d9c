//! # LedgerEngine
//!
//! The facade the sync orchestrator talks to. It owns the store, the
//! alert sink, the tunables and the dedupe cache, and routes each
//! [`LedgerEvent`] to the matching operation.
//!
//! The engine is synchronous. Callers must not run two reorgs, or a reorg
//! and an unlock, against the same store at the same time.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::alert::AlertSink;
use crate::balance::WalletBalance;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event::{LedgerEvent, RawVertex, RecentTxCache};
use crate::ingest;
use crate::lock::{self, UnlockSummary};
use crate::reorg::{self, ChainOracle, ReorgOutcome, VoidOutcome};
use crate::storage::LedgerStore;
use crate::transaction::{Address, Transaction, WalletId};

/// Result of [`LedgerEngine::handle_event`].
#[derive(Debug)]
pub enum EventOutcome {
    /// The vertex was applied; per-wallet effect for notifications.
    Applied(BTreeMap<WalletId, WalletBalance>),
    /// The same delivery was seen recently and skipped.
    Duplicate,
    Voided(VoidOutcome),
    Reorged(ReorgOutcome),
}

pub struct LedgerEngine<S, A> {
    store: S,
    alerts: A,
    config: EngineConfig,
    recent: Mutex<RecentTxCache>,
}

impl<S: LedgerStore, A: AlertSink> LedgerEngine<S, A> {
    pub fn new(store: S, alerts: A, config: EngineConfig) -> Self {
        let recent = Mutex::new(RecentTxCache::new(config.tx_cache_capacity));
        Self {
            store,
            alerts,
            config,
            recent,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn alerts(&self) -> &A {
        &self.alerts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatches one fullnode event.
    ///
    /// A vertex delivery is identified by its id and height, so a mempool
    /// transaction that later gets confirmed is not mistaken for a replay.
    pub fn handle_event<O: ChainOracle>(
        &self,
        event: LedgerEvent,
        now: u64,
        oracle: &O,
    ) -> EngineResult<EventOutcome> {
        match event {
            LedgerEvent::VertexAccepted(vertex) => {
                let key = delivery_key(&vertex);
                if !self.recent.lock().insert(&key) {
                    debug!(tx_id = %vertex.tx_id, "skipping replayed vertex");
                    return Ok(EventOutcome::Duplicate);
                }
                let tx = match vertex.into_transaction() {
                    Ok(tx) => tx,
                    Err(e) => {
                        self.recent.lock().remove(&key);
                        return Err(e);
                    }
                };
                match self.apply_transaction(&tx, now) {
                    Ok(balances) => Ok(EventOutcome::Applied(balances)),
                    Err(e) => {
                        self.recent.lock().remove(&key);
                        Err(e)
                    }
                }
            }
            LedgerEvent::VertexVoided { tx_id } => self.handle_voided(&tx_id).map(EventOutcome::Voided),
            LedgerEvent::Reorg => self.handle_reorg(oracle).map(EventOutcome::Reorged),
        }
    }

    pub fn apply_transaction(
        &self,
        tx: &Transaction,
        now: u64,
    ) -> EngineResult<BTreeMap<WalletId, WalletBalance>> {
        ingest::apply_transaction(&self.store, tx, now, &self.config)
    }

    pub fn unlock_timelocked_utxos(&self, now: u64) -> EngineResult<UnlockSummary> {
        lock::unlock_timelocked_utxos(&self.store, now)
    }

    pub fn unlock_heightlocked_utxos(&self, height: u32, now: u64) -> EngineResult<UnlockSummary> {
        lock::unlock_heightlocked_utxos(&self.store, height, now)
    }

    pub fn handle_voided(&self, tx_id: &str) -> EngineResult<VoidOutcome> {
        let outcome = reorg::handle_voided(&self.store, &self.alerts, tx_id)?;
        // A voided id may come back later as a new transaction.
        self.recent.lock().clear();
        Ok(outcome)
    }

    pub fn handle_reorg<O: ChainOracle>(&self, oracle: &O) -> EngineResult<ReorgOutcome> {
        let outcome = reorg::handle_reorg(&self.store, &self.alerts, oracle, &self.config)?;
        // Demoted and voided transactions will be delivered again.
        self.recent.lock().clear();
        Ok(outcome)
    }

    /// Checks the aggregates of `addresses` against their history.
    pub fn validate_addresses(&self, addresses: &[Address]) -> EngineResult<()> {
        reorg::validate_address_balances(&self.store, &self.alerts, addresses)
    }

    /// Current best height, if any block is stored.
    pub fn best_height(&self) -> EngineResult<Option<u32>> {
        Ok(self.store.get_latest_height()?)
    }
}

fn delivery_key(vertex: &RawVertex) -> String {
    match vertex.height {
        Some(height) => format!("{}@{}", vertex.tx_id, height),
        None => vertex.tx_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::event::{RawInput, RawOutput};
    use crate::reorg::OracleError;
    use crate::storage::LedgerDb;
    use crate::transaction::DecodedScript;

    struct NoVoids;

    impl ChainOracle for NoVoids {
        fn is_tx_voided(&self, _tx_id: &str) -> Result<bool, OracleError> {
            Ok(false)
        }
    }

    fn engine() -> LedgerEngine<LedgerDb, RecordingAlertSink> {
        LedgerEngine::new(
            LedgerDb::open_temporary().unwrap(),
            RecordingAlertSink::new(),
            EngineConfig::default(),
        )
    }

    fn vertex(tx_id: &str, inputs: Vec<RawInput>, outputs: Vec<(&str, u64)>) -> RawVertex {
        RawVertex {
            tx_id: tx_id.into(),
            version: 1,
            timestamp: 1,
            height: None,
            inputs,
            outputs: outputs
                .into_iter()
                .map(|(address, value)| RawOutput {
                    value,
                    token_data: 0,
                    decoded: Some(DecodedScript::new(address)),
                    spent_by: None,
                })
                .collect(),
            tokens: vec![],
        }
    }

    #[test]
    fn replayed_vertex_is_skipped() {
        let engine = engine();
        let event = LedgerEvent::VertexAccepted(vertex("t1", vec![], vec![("A", 10)]));

        assert!(matches!(engine.handle_event(event.clone(), 0, &NoVoids).unwrap(), EventOutcome::Applied(_)));
        assert!(matches!(engine.handle_event(event, 0, &NoVoids).unwrap(), EventOutcome::Duplicate));
        assert_eq!(
            engine.store().fetch_address_balance(&["A".to_string()]).unwrap()[0].unlocked_balance,
            10
        );
    }

    #[test]
    fn confirmation_is_not_a_replay() {
        let engine = engine();
        let mut raw = vertex("t1", vec![], vec![("A", 10)]);
        engine.handle_event(LedgerEvent::VertexAccepted(raw.clone()), 0, &NoVoids).unwrap();
        raw.height = Some(3);
        assert!(matches!(
            engine.handle_event(LedgerEvent::VertexAccepted(raw), 0, &NoVoids).unwrap(),
            EventOutcome::Applied(_)
        ));
        let stored = engine.store().get_transactions_by_id(&["t1".to_string()]).unwrap();
        assert_eq!(stored[0].height, Some(3));
    }

    #[test]
    fn failed_vertex_can_be_retried() {
        let engine = engine();
        let mut bad = vertex("t1", vec![], vec![("A", 10)]);
        bad.outputs[0].token_data = 1;
        let event = LedgerEvent::VertexAccepted(bad);
        assert!(engine.handle_event(event.clone(), 0, &NoVoids).is_err());
        assert!(engine.handle_event(event, 0, &NoVoids).is_err());
    }

    #[test]
    fn voided_event_reopens_inputs() {
        let engine = engine();
        engine
            .handle_event(LedgerEvent::VertexAccepted(vertex("t1", vec![], vec![("A", 10)])), 0, &NoVoids)
            .unwrap();
        let spend = RawInput {
            tx_id: "t1".into(),
            index: 0,
            value: 10,
            token_data: 0,
            decoded: Some(DecodedScript::new("A")),
        };
        engine
            .handle_event(LedgerEvent::VertexAccepted(vertex("t2", vec![spend], vec![("B", 10)])), 0, &NoVoids)
            .unwrap();

        let outcome = engine
            .handle_event(LedgerEvent::VertexVoided { tx_id: "t2".into() }, 0, &NoVoids)
            .unwrap();
        let EventOutcome::Voided(voided) = outcome else {
            panic!("expected a void outcome");
        };
        assert_eq!(voided.cascade.voided, vec!["t2".to_string()]);

        let rows = engine
            .store()
            .fetch_address_balance(&["A".to_string(), "B".to_string()])
            .unwrap();
        assert_eq!(rows[0].unlocked_balance, 10);
        assert_eq!(rows[1].unlocked_balance, 0);
        assert!(engine.alerts().alerts().is_empty());
    }

    #[test]
    fn reorg_on_empty_chain_is_a_no_op() {
        let engine = engine();
        let outcome = engine.handle_event(LedgerEvent::Reorg, 0, &NoVoids).unwrap();
        assert!(matches!(outcome, EventOutcome::Reorged(ref r) if r.depth() == 0));
        assert_eq!(engine.best_height().unwrap(), None);
    }

    #[test]
    fn voided_vertex_can_be_delivered_again() {
        let engine = engine();
        let event = LedgerEvent::VertexAccepted(vertex("t1", vec![], vec![("A", 10)]));
        engine.handle_event(event.clone(), 0, &NoVoids).unwrap();
        engine
            .handle_event(LedgerEvent::VertexVoided { tx_id: "t1".into() }, 0, &NoVoids)
            .unwrap();

        assert!(matches!(engine.handle_event(event, 0, &NoVoids).unwrap(), EventOutcome::Applied(_)));
        let row = &engine.store().fetch_address_balance(&["A".to_string()]).unwrap()[0];
        assert_eq!(row.unlocked_balance, 10);
        engine.validate_addresses(&["A".to_string()]).unwrap();
    }
}
