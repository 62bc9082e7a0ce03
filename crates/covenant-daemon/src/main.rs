//! covenantd — the smart-contract agent daemon.
//!
//! Takes no arguments; all configuration comes from `COVENANT_*`
//! environment variables. Initialization order matters and is fixed:
//! store → wallet → scheduler → pipeline → ingest. Teardown reverses it:
//! the pipeline drains, the holdings cache flushes, and scheduler state is
//! already persisted.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use covenant_core::bitcoin::Address;
use covenant_core::protocol::Timestamp;

use covenant_daemon::config::{Config, EXIT_CONFIG, EXIT_ERROR, EXIT_OK};
use covenant_daemon::dispatch::Dispatcher;
use covenant_daemon::external::{MemoryBroadcaster, MemoryHeaders, MemoryTxSource};
use covenant_daemon::handlers::HandlerContext;
use covenant_daemon::holdings::{run_flusher, HoldingsCache};
use covenant_daemon::pipeline::Pipeline;
use covenant_daemon::scheduler::{JobPayload, Scheduler};
use covenant_daemon::storage::FilesystemStorage;
use covenant_daemon::store::{Repositories, TxCache, TxIndex};
use covenant_daemon::wallet::Wallet;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    let code = match runtime.block_on(run(config)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "daemon failed");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Store.
    let storage = Arc::new(
        FilesystemStorage::open(&config.storage_root).context("open storage root")?,
    );
    let repos = Arc::new(Repositories::new(storage.clone()));
    let tx_index = Arc::new(TxIndex::new(storage.clone()));
    let tx_cache = Arc::new(TxCache::new(storage.clone(), config.net, config.is_test));

    // Wallet.
    let wallet = Arc::new(Wallet::new());
    for wif in config.contract_wifs() {
        let address = wallet.register(&wif, config.net).context("register key")?;
        info!(contract = %address, "contract key registered");
    }

    // Scheduler. Overdue jobs fire as soon as the dispatch loop starts;
    // finalizers that missed their cut-off beyond the grace window are
    // flagged so the operator can see the vote closed late.
    let scheduler = Arc::new(Scheduler::load(storage.clone()).context("load scheduler")?);
    info!(jobs = scheduler.pending().len(), "scheduler loaded");
    let now = Timestamp::now();
    let mut missed_finalizers = 0usize;
    for job in scheduler.pending() {
        if let JobPayload::FinalizeVote { vote_tx_id } = &job.payload {
            if job.due.plus_secs(config.vote_grace_secs) < now {
                warn!(vote = %vote_tx_id, "vote finalizer missed its cut-off beyond the grace window");
                missed_finalizers += 1;
            }
        }
    }
    if missed_finalizers > 0 {
        warn!(missed = missed_finalizers, "overdue vote finalizers will run immediately");
    }

    // Collaborator endpoints. The spynode/RPC wiring lives outside this
    // crate; the daemon is handed channels by its host process. The
    // in-memory endpoints stand in until the host connects them.
    let retriever = Arc::new(MemoryTxSource::new());
    let headers = Arc::new(MemoryHeaders::new(0));
    let broadcaster = Arc::new(MemoryBroadcaster::new());

    let fee_address = Address::decode(&config.fees.fee_address).ok();

    let (holdings, flusher_feed) = HoldingsCache::new(Arc::clone(&repos));

    let ctx = Arc::new(HandlerContext {
        net: config.net,
        is_test: config.is_test,
        fees: config.fees.clone(),
        fee_address,
        transfer_timeout_secs: config.transfer_timeout_secs,
        oracle_recency_blocks: config.oracle_recency_blocks,
        repos,
        tx_cache,
        tx_index,
        wallet,
        holdings: Arc::clone(&holdings),
        scheduler: Arc::clone(&scheduler),
        headers,
        broadcaster,
    });

    // Pipeline.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&ctx)));
    let pipeline = Arc::new(Pipeline::new(dispatcher, retriever, shutdown_rx.clone()));

    let flusher = tokio::spawn(run_flusher(Arc::clone(&holdings), flusher_feed));

    // Scheduler dispatch loop feeds fired jobs back through the pipeline.
    let (job_tx, mut job_rx) = tokio::sync::mpsc::channel(64);
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(job_tx, shutdown_rx.clone()));
    let job_pipeline = Arc::clone(&pipeline);
    let job_pump = tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            job_pipeline.handle_job(job).await;
        }
    });

    info!("covenantd running");

    // Ingest runs until a shutdown signal.
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM"),
        _ = sigint.recv() => info!("SIGINT"),
    }

    // Teardown: drain workers, flush holdings; scheduler state is already
    // durable.
    info!("shutting down");
    shutdown_tx.send(true).ok();
    pipeline.drain().await;
    ctx.holdings
        .flush_all()
        .context("final holdings flush")?;

    scheduler_task.abort();
    job_pump.abort();
    flusher.abort();

    info!("shutdown complete");
    Ok(())
}
