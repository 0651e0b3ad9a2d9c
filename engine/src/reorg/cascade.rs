//! Cascade phase: voiding transactions and everything downstream of them.
//!
//! The transaction DAG is walked breadth-first along the *consumes* edge.
//! Each wave is processed by [`handle_voided_tx_list`] in a fixed order,
//! and the next wave is whatever spent an output of the current one.
//!
//! ```text
//!   wave 0: seeds ──▶ void, reopen their inputs, void their outputs
//!   wave 1: spenders of wave-0 outputs ──▶ same
//!   ...     until no new spender shows up
//! ```
//!
//! [`VoidWorklist`] tracks every id ever queued, so a transaction is
//! processed at most once per cascade even if several waves point at it.

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::{debug, info};

use crate::error::EngineResult;
use crate::storage::LedgerStore;
use crate::transaction::{DbTxOutput, TxId, UtxoKey};

// ---------------------------------------------------------------------------
// VoidWorklist
// ---------------------------------------------------------------------------

/// FIFO of transactions to void, with a visited set.
#[derive(Debug, Default)]
pub struct VoidWorklist {
    queue: VecDeque<TxId>,
    seen: HashSet<TxId>,
}

impl VoidWorklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `tx_id` unless it was queued before. Returns whether it was
    /// queued now.
    pub fn push(&mut self, tx_id: TxId) -> bool {
        if self.seen.insert(tx_id.clone()) {
            self.queue.push_back(tx_id);
            true
        } else {
            false
        }
    }

    pub fn extend<I: IntoIterator<Item = TxId>>(&mut self, tx_ids: I) {
        for tx_id in tx_ids {
            self.push(tx_id);
        }
    }

    /// Takes everything currently queued as one wave.
    pub fn next_wave(&mut self) -> Vec<TxId> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of distinct ids ever queued.
    pub fn visited(&self) -> usize {
        self.seen.len()
    }
}

/// Every transaction reachable from `seeds`, in breadth-first order, each
/// exactly once. `void_wave` handles one wave and returns its spenders.
/// Terminates on cyclic input too.
pub fn void_closure<F, E>(seeds: &[TxId], mut void_wave: F) -> Result<Vec<TxId>, E>
where
    F: FnMut(&[TxId]) -> Result<Vec<TxId>, E>,
{
    let mut worklist = VoidWorklist::new();
    worklist.extend(seeds.iter().cloned());

    let mut order = Vec::new();
    while !worklist.is_empty() {
        let wave = worklist.next_wave();
        worklist.extend(void_wave(&wave)?);
        order.extend(wave);
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Store-backed cascade
// ---------------------------------------------------------------------------

/// Everything a finished cascade touched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Voided transactions in processing order.
    pub voided: Vec<TxId>,
    /// Outputs created or reopened by the voided transactions, as they
    /// were before the cascade touched them.
    pub affected_utxos: Vec<DbTxOutput>,
}

/// Voids one wave of transactions.
///
/// Steps, in this order:
/// 1. mark the transactions voided
/// 2. mark their wallet and address history rows voided
/// 3. load the outputs they created
/// 4. load the outputs they spent and clear `spent_by` on them
/// 5. mark the created outputs voided
/// 6. collect the spenders of the created outputs as the next wave
///
/// Returns the next wave and the outputs from steps 3 and 4.
pub fn handle_voided_tx_list<S: LedgerStore>(
    store: &S,
    tx_ids: &[TxId],
) -> EngineResult<(Vec<TxId>, Vec<DbTxOutput>)> {
    if tx_ids.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let newly_voided = store.mark_txs_as_voided(tx_ids)?;
    if newly_voided < tx_ids.len() {
        debug!(
            requested = tx_ids.len(),
            newly_voided,
            "some transactions were already voided"
        );
    }

    store.mark_wallet_tx_history_as_voided(tx_ids)?;
    store.mark_address_tx_history_as_voided(tx_ids)?;

    let tx_outputs = store.get_tx_outputs(tx_ids)?;

    let spent_outputs = store.get_tx_outputs_by_spent(tx_ids)?;
    let spent_keys: Vec<UtxoKey> = spent_outputs.iter().map(DbTxOutput::key).collect();
    store.unspend_utxos(&spent_keys)?;

    let output_keys: Vec<UtxoKey> = tx_outputs.iter().map(DbTxOutput::key).collect();
    store.mark_utxos_as_voided(&output_keys)?;

    let next_wave: Vec<TxId> = tx_outputs
        .iter()
        .filter_map(|utxo| utxo.spent_by.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    debug!(
        wave = tx_ids.len(),
        created = tx_outputs.len(),
        reopened = spent_outputs.len(),
        next = next_wave.len(),
        "voided transaction wave"
    );

    let mut affected = tx_outputs;
    affected.extend(spent_outputs);
    Ok((next_wave, affected))
}

/// Runs [`handle_voided_tx_list`] wave after wave until no new spender
/// shows up.
pub fn cascade_void<S: LedgerStore>(store: &S, seeds: &[TxId]) -> EngineResult<CascadeOutcome> {
    let mut affected_utxos = Vec::new();
    let mut waves = 0usize;
    let voided = void_closure(seeds, |wave| -> EngineResult<Vec<TxId>> {
        let (next_wave, affected) = handle_voided_tx_list(store, wave)?;
        affected_utxos.extend(affected);
        waves += 1;
        Ok(next_wave)
    })?;
    let outcome = CascadeOutcome { voided, affected_utxos };

    if !outcome.voided.is_empty() {
        info!(
            seeds = seeds.len(),
            voided = outcome.voided.len(),
            waves,
            "void cascade reached fixpoint"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HTR_TOKEN_ID, TRANSACTION_VERSION};
    use crate::storage::LedgerDb;
    use crate::transaction::{DecodedScript, Tx, TxInput};
    use std::collections::HashMap;
    use std::convert::Infallible;

    fn ids(names: &[&str]) -> Vec<TxId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn worklist_dedupes() {
        let mut worklist = VoidWorklist::new();
        assert!(worklist.push("a".into()));
        assert!(!worklist.push("a".into()));
        worklist.extend(ids(&["b", "a"]));
        assert_eq!(worklist.next_wave(), ids(&["a", "b"]));
        assert!(worklist.is_empty());
        assert!(!worklist.push("b".into()));
        assert_eq!(worklist.visited(), 2);
    }

    fn spenders<'a>(
        edges: &'a HashMap<&str, Vec<&str>>,
    ) -> impl FnMut(&[TxId]) -> Result<Vec<TxId>, Infallible> + 'a {
        move |wave: &[TxId]| {
            Ok(wave
                .iter()
                .flat_map(|tx| edges.get(tx.as_str()).map(|v| ids(v)).unwrap_or_default())
                .collect())
        }
    }

    #[test]
    fn closure_follows_chain_breadth_first() {
        let edges: HashMap<&str, Vec<&str>> =
            HashMap::from([("t1", vec!["t2", "t4"]), ("t2", vec!["t3"]), ("t4", vec!["t3"])]);
        let order = void_closure(&ids(&["t1"]), spenders(&edges)).unwrap();
        assert_eq!(order, ids(&["t1", "t2", "t4", "t3"]));
    }

    #[test]
    fn closure_terminates_on_cycles() {
        let edges: HashMap<&str, Vec<&str>> = HashMap::from([("a", vec!["b"]), ("b", vec!["a"])]);
        let order = void_closure(&ids(&["a"]), spenders(&edges)).unwrap();
        assert_eq!(order, ids(&["a", "b"]));
    }

    #[test]
    fn closure_stops_at_first_error() {
        let mut calls = 0;
        let err = void_closure(&ids(&["a"]), |_| {
            calls += 1;
            Err::<Vec<TxId>, _>("store down")
        })
        .unwrap_err();
        assert_eq!(err, "store down");
        assert_eq!(calls, 1);
    }

    // -- Store-backed -------------------------------------------------------

    fn utxo(tx_id: &str, index: u32, spent_by: Option<&str>) -> DbTxOutput {
        DbTxOutput {
            tx_id: tx_id.into(),
            index,
            token_id: HTR_TOKEN_ID.into(),
            address: "A".into(),
            value: 10,
            authorities: 0,
            timelock: None,
            heightlock: None,
            locked: false,
            spent_by: spent_by.map(String::from),
            voided: false,
        }
    }

    fn spend(tx_id: &str, index: u32) -> TxInput {
        TxInput {
            tx_id: tx_id.into(),
            index,
            value: 10,
            token_data: 0,
            token: HTR_TOKEN_ID.into(),
            decoded: Some(DecodedScript::new("A")),
        }
    }

    fn add_tx(db: &LedgerDb, tx_id: &str) {
        db.add_or_update_tx(&Tx {
            tx_id: tx_id.into(),
            height: None,
            timestamp: 0,
            version: TRANSACTION_VERSION,
            voided: false,
        })
        .unwrap();
    }

    /// T1 -> T2 -> T3, plus T4 spending an unrelated output of T0.
    fn dag() -> LedgerDb {
        let db = LedgerDb::open_temporary().unwrap();
        for tx in ["t0", "t1", "t2", "t3", "t4"] {
            add_tx(&db, tx);
        }
        db.add_utxos(&[utxo("t0", 0, None), utxo("t1", 0, None), utxo("t2", 0, None), utxo("t3", 0, None), utxo("t4", 0, None)])
            .unwrap();
        db.update_tx_outputs_spent_by(&[spend("t1", 0)], "t2").unwrap();
        db.update_tx_outputs_spent_by(&[spend("t2", 0)], "t3").unwrap();
        db.update_tx_outputs_spent_by(&[spend("t0", 0)], "t4").unwrap();
        db
    }

    #[test]
    fn cascade_voids_the_whole_chain_only() {
        let db = dag();
        let outcome = cascade_void(&db, &ids(&["t1"])).unwrap();
        assert_eq!(outcome.voided, ids(&["t1", "t2", "t3"]));

        let txs = db.get_transactions_by_id(&ids(&["t1", "t2", "t3", "t4", "t0"])).unwrap();
        let voided: Vec<bool> = txs.iter().map(|t| t.voided).collect();
        assert_eq!(voided, vec![true, true, true, false, false]);

        let outputs = db.get_tx_outputs(&ids(&["t1", "t2", "t3"])).unwrap();
        assert!(outputs.iter().all(|u| u.voided));
        assert!(outputs.iter().all(|u| u.spent_by.is_none()));

        let unrelated = db.get_tx_outputs(&ids(&["t0"])).unwrap();
        assert_eq!(unrelated[0].spent_by.as_deref(), Some("t4"));
        assert!(!unrelated[0].voided);
    }

    #[test]
    fn wave_reports_spenders_and_affected_outputs() {
        let db = dag();
        let (next, affected) = handle_voided_tx_list(&db, &ids(&["t2"])).unwrap();
        assert_eq!(next, ids(&["t3"]));
        let keys: Vec<UtxoKey> = affected.iter().map(DbTxOutput::key).collect();
        assert!(keys.contains(&UtxoKey { tx_id: "t2".into(), index: 0 }));
        assert!(keys.contains(&UtxoKey { tx_id: "t1".into(), index: 0 }));

        let reopened = &db.get_tx_outputs(&ids(&["t1"])).unwrap()[0];
        assert!(reopened.spent_by.is_none());
        assert!(!reopened.voided);
    }

    #[test]
    fn revoiding_is_harmless() {
        let db = dag();
        cascade_void(&db, &ids(&["t3"])).unwrap();
        let again = cascade_void(&db, &ids(&["t3"])).unwrap();
        assert_eq!(again.voided, ids(&["t3"]));
        assert!(!db.get_transactions_by_id(&ids(&["t2"])).unwrap()[0].voided);
    }

    #[test]
    fn empty_seed_is_a_no_op() {
        let db = dag();
        assert_eq!(cascade_void(&db, &[]).unwrap(), CascadeOutcome::default());
    }
}
