//! The ingest pipeline.
//!
//! Transaction notifications arrive as state transitions
//! {seen, safe, confirmed, unsafe, cancelled, reverted}. Processing is
//! deferred until a tx is safe (or confirmed, for txs that went unsafe
//! first). A reverted tx is only recorded: the reorg usually returns it
//! as safe-again or confirmed-again, where the applied-tx history makes
//! the replay a no-op. Compensation runs when the network cancels a tx
//! for good.
//!
//! Work is serialized per contract: each controlled contract gets a
//! worker task with a bounded queue; txs for different contracts run in
//! parallel. Shutdown drains every worker, flushes the holdings cache,
//! and leaves scheduler state persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use covenant_core::bitcoin::{Address, Hash32, Transaction};

use crate::dispatch::{DispatchCause, Dispatcher};
use crate::external::{ExternalError, TxRetriever};
use crate::handlers::HandlerError;
use crate::inspector::{InspectError, InspectorTx};
use crate::scheduler::Job;
use crate::store::UNCONFIRMED;

/// Queue depth per contract worker.
const WORKER_QUEUE_DEPTH: usize = 64;

/// A tx's ingest state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Unlikely to be double-spent; act on it.
    Safe,
    /// Mined at the given height.
    Confirmed(i32),
    /// A conflicting spend appeared; hold.
    Unsafe,
    /// Double-spent away; never coming back.
    Cancelled,
    /// The block holding it was reorged away.
    Reverted,
}

enum WorkerTask {
    Process(InspectorTx),
    Reprocess(Job),
    Revert(InspectorTx),
    Barrier(oneshot::Sender<()>),
}

/// The pipeline.
pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    retriever: Arc<dyn TxRetriever>,
    pending: Mutex<Vec<InspectorTx>>,
    unsafe_txs: Mutex<Vec<InspectorTx>>,
    reverted: Mutex<Vec<Hash32>>,
    workers: tokio::sync::Mutex<HashMap<Address, mpsc::Sender<WorkerTask>>>,
    shutdown: watch::Receiver<bool>,
}

impl Pipeline {
    /// Builds the pipeline.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        retriever: Arc<dyn TxRetriever>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Pipeline {
            dispatcher,
            retriever,
            pending: Mutex::new(Vec::new()),
            unsafe_txs: Mutex::new(Vec::new()),
            reverted: Mutex::new(Vec::new()),
            workers: tokio::sync::Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Handles a newly seen transaction. Returns true when the tx is
    /// tokenized and relevant to a controlled contract.
    pub fn handle_tx(&self, tx: Transaction) -> Result<bool, InspectError> {
        let ctx = self.dispatcher.context();
        let mut itx = InspectorTx::from_tx(tx, ctx.is_test);

        if !itx.is_tokenized() {
            debug!(tx = %itx.txid, "not a protocol tx");
            return Ok(false);
        }

        // Ancestor retrieval is a network call; transient failures get a
        // bounded retry before the tx is dropped back to the source.
        let mut attempts = 0;
        loop {
            match itx.promote(self.retriever.as_ref(), ctx.net) {
                Ok(()) => break,
                Err(InspectError::AncestorUnavailable(hash, ExternalError::Transient(reason)))
                    if attempts < 3 =>
                {
                    attempts += 1;
                    warn!(tx = %itx.txid, ancestor = %hash, reason, attempts, "ancestor fetch retry");
                    std::thread::sleep(std::time::Duration::from_millis(50 * attempts));
                }
                Err(e) => return Err(e),
            }
        }

        let relevant = ctx.wallet.addresses().iter().any(|a| itx.is_relevant(a));
        if !relevant {
            debug!(tx = %itx.txid, "protocol tx not for this agent");
            return Ok(false);
        }

        info!(tx = %itx.txid, "tx seen");
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if !pending.iter().any(|p| p.txid == itx.txid) {
            pending.push(itx);
        }
        Ok(true)
    }

    fn take_pending(&self, txid: &Hash32) -> Option<InspectorTx> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let index = pending.iter().position(|p| p.txid == *txid)?;
        Some(pending.remove(index))
    }

    fn take_unsafe(&self, txid: &Hash32) -> Option<InspectorTx> {
        let mut unsafe_txs = self.unsafe_txs.lock().expect("unsafe lock poisoned");
        let index = unsafe_txs.iter().position(|p| p.txid == *txid)?;
        Some(unsafe_txs.remove(index))
    }

    fn remove_from_reverted(&self, txid: &Hash32) -> bool {
        let mut reverted = self.reverted.lock().expect("reverted lock poisoned");
        match reverted.iter().position(|id| id == txid) {
            Some(index) => {
                reverted.remove(index);
                true
            }
            None => false,
        }
    }

    /// Handles a state transition for a previously seen tx.
    pub async fn handle_tx_state(&self, txid: Hash32, state: TxState) -> Result<(), HandlerError> {
        let ctx = self.dispatcher.context();
        match state {
            TxState::Safe => {
                if self.remove_from_reverted(&txid) {
                    debug!(tx = %txid, "safe again after reorg");
                    return Ok(());
                }
                if let Some(itx) = self.take_pending(&txid) {
                    ctx.tx_index.add(&txid, UNCONFIRMED)?;
                    self.enqueue(WorkerTask::Process(itx)).await;
                } else {
                    debug!(tx = %txid, "safe tx not pending");
                }
            }
            TxState::Confirmed(height) => {
                if self.remove_from_reverted(&txid) {
                    debug!(tx = %txid, "reconfirmed after reorg");
                    ctx.tx_index.add(&txid, height)?;
                    return Ok(());
                }
                ctx.tx_index.add(&txid, height)?;
                if let Some(itx) = self
                    .take_pending(&txid)
                    .or_else(|| self.take_unsafe(&txid))
                {
                    self.enqueue(WorkerTask::Process(itx)).await;
                } else {
                    debug!(tx = %txid, "confirm for already processed tx");
                }
            }
            TxState::Unsafe => {
                if let Some(itx) = self.take_pending(&txid) {
                    let mut unsafe_txs = self.unsafe_txs.lock().expect("unsafe lock poisoned");
                    unsafe_txs.push(itx);
                } else {
                    // Only not-yet-processed txs should go unsafe.
                    error!(tx = %txid, "unsafe tx not found");
                }
            }
            TxState::Cancelled => {
                self.remove_from_reverted(&txid);
                if self.take_pending(&txid).is_some() || self.take_unsafe(&txid).is_some() {
                    debug!(tx = %txid, "cancelled before processing");
                    return Ok(());
                }
                // Processed and then double-spent: undo.
                if let Ok(itx) = ctx.tx_cache.get(&txid) {
                    self.enqueue(WorkerTask::Revert(itx)).await;
                } else {
                    warn!(tx = %txid, "cancelled tx unknown");
                }
            }
            TxState::Reverted => {
                // Recorded only; nothing is undone yet. Safe-again or
                // confirmed-again resolves it with state intact, and a
                // permanent loss arrives as a cancellation.
                let mut reverted = self.reverted.lock().expect("reverted lock poisoned");
                reverted.push(txid);
            }
        }
        Ok(())
    }

    /// Routes a fired scheduler job to its contract's worker.
    pub async fn handle_job(&self, job: Job) {
        self.enqueue(WorkerTask::Reprocess(job)).await;
    }

    /// The worker key for a task: the first controlled contract it
    /// touches.
    fn worker_key(&self, task: &WorkerTask) -> Option<Address> {
        let ctx = self.dispatcher.context();
        match task {
            WorkerTask::Process(itx) | WorkerTask::Revert(itx) => itx
                .contract_addresses()
                .into_iter()
                .find(|a| ctx.wallet.controls(a))
                .or_else(|| {
                    itx.inputs
                        .iter()
                        .map(|i| i.address.clone())
                        .find(|a| ctx.wallet.controls(a))
                }),
            WorkerTask::Reprocess(job) => Some(job.contract.clone()),
            WorkerTask::Barrier(_) => None,
        }
    }

    async fn enqueue(&self, task: WorkerTask) {
        let Some(contract) = self.worker_key(&task) else {
            debug!("task resolves to no controlled contract; dropped");
            return;
        };

        let sender = {
            let mut workers = self.workers.lock().await;
            workers
                .entry(contract.clone())
                .or_insert_with(|| self.spawn_worker(contract.clone()))
                .clone()
        };

        if sender.send(task).await.is_err() {
            error!(contract = %contract, "worker queue closed");
        }
    }

    fn spawn_worker(&self, contract: Address) -> mpsc::Sender<WorkerTask> {
        let (tx, mut rx) = mpsc::channel::<WorkerTask>(WORKER_QUEUE_DEPTH);
        let dispatcher = Arc::clone(&self.dispatcher);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Drain what is already queued, then stop.
                            while let Ok(task) = rx.try_recv() {
                                run_task(&dispatcher, &contract, task);
                            }
                            break;
                        }
                        continue;
                    }
                };
                run_task(&dispatcher, &contract, task);
            }
            debug!(contract = %contract, "worker stopped");
        });

        tx
    }

    /// Waits until every worker has drained its queue.
    pub async fn drain(&self) {
        let senders: Vec<mpsc::Sender<WorkerTask>> = {
            let workers = self.workers.lock().await;
            workers.values().cloned().collect()
        };
        let mut receipts = Vec::new();
        for sender in senders {
            let (ack, receipt) = oneshot::channel();
            if sender.send(WorkerTask::Barrier(ack)).await.is_ok() {
                receipts.push(receipt);
            }
        }
        for receipt in receipts {
            let _ = receipt.await;
        }
    }
}

fn run_task(dispatcher: &Dispatcher, contract: &Address, task: WorkerTask) {
    let result = match task {
        WorkerTask::Process(itx) => {
            let r = dispatcher.dispatch(DispatchCause::See, &itx);
            if r.is_ok() {
                debug!(contract = %contract, tx = %itx.txid, "processed");
            }
            r
        }
        WorkerTask::Reprocess(job) => dispatcher.reprocess(&job.contract, &job.payload),
        WorkerTask::Revert(itx) => dispatcher.dispatch(DispatchCause::Revert, &itx),
        WorkerTask::Barrier(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(HandlerError::Fatal(reason)) => {
            // Invariant violations must not commit; refuse, log, and exit
            // rather than diverge silently.
            error!(contract = %contract, reason, "fatal invariant violation");
            std::process::exit(crate::config::EXIT_ERROR);
        }
        Err(e) => warn!(contract = %contract, error = %e, "task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_states_are_distinct() {
        assert_ne!(TxState::Safe, TxState::Confirmed(0));
        assert_ne!(TxState::Cancelled, TxState::Reverted);
    }
}
