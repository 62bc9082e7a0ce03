//! Shared harness for the scenario tests.
//!
//! Each [`TestAgent`] is a full agent over in-memory storage. Agents share
//! one transaction source standing in for the chain; [`pump`] moves
//! broadcast responses back through every agent until the network goes
//! quiet, which is enough to run whole request/response conversations —
//! including the multi-contract settlement boomerang — deterministically.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use covenant_core::bitcoin::{Address, Hash32, Network, OutPoint, PrivateKey, Transaction, TxInput, TxOutput};
use covenant_core::protocol::{self, Action, Timestamp};

use covenant_daemon::config::FeeConfig;
use covenant_daemon::dispatch::Dispatcher;
use covenant_daemon::external::{MemoryBroadcaster, MemoryHeaders, MemoryTxSource};
use covenant_daemon::handlers::HandlerContext;
use covenant_daemon::holdings::{HoldingKey, HoldingsCache};
use covenant_daemon::inspector::InspectorTx;
use covenant_daemon::scheduler::Scheduler;
use covenant_daemon::storage::MemoryStorage;
use covenant_daemon::store::{Repositories, TxCache, TxIndex};
use covenant_daemon::wallet::Wallet;

static UNIQUE: AtomicU64 = AtomicU64::new(1);

/// A deterministic key from a seed byte.
pub fn key(seed: u8) -> PrivateKey {
    let mut bytes = [seed; 32];
    bytes[0] = 1;
    PrivateKey::from_bytes(&bytes, Network::Test).unwrap()
}

/// One agent with its own storage and wallet, on a shared chain view.
pub struct TestAgent {
    pub ctx: Arc<HandlerContext>,
    pub dispatcher: Dispatcher,
    pub broadcaster: Arc<MemoryBroadcaster>,
    pub headers: Arc<MemoryHeaders>,
    pub source: Arc<MemoryTxSource>,
    pub contract_key: PrivateKey,
    pub contract: Address,
}

impl TestAgent {
    /// Builds an agent controlling the contract key derived from `seed`.
    pub fn new(seed: u8, source: Arc<MemoryTxSource>) -> TestAgent {
        let storage = Arc::new(MemoryStorage::new());
        let repos = Arc::new(Repositories::new(storage.clone()));
        let tx_index = Arc::new(TxIndex::new(storage.clone()));
        let tx_cache = Arc::new(TxCache::new(storage.clone(), Network::Test, true));
        let scheduler = Arc::new(Scheduler::load(storage.clone()).unwrap());
        let (holdings, _feed) = HoldingsCache::new(Arc::clone(&repos));

        let wallet = Arc::new(Wallet::new());
        let contract_key = key(seed);
        let contract = wallet
            .register(&contract_key.to_wif(), Network::Test)
            .unwrap();

        let broadcaster = Arc::new(MemoryBroadcaster::new());
        let headers = Arc::new(MemoryHeaders::new(100));

        let ctx = Arc::new(HandlerContext {
            net: Network::Test,
            is_test: true,
            fees: FeeConfig {
                fee_address: String::new(),
                fee_rate: 1,
                dust_limit: 546,
            },
            fee_address: Some(key(0xFE).address()),
            transfer_timeout_secs: 60,
            oracle_recency_blocks: 12,
            repos,
            tx_cache,
            tx_index,
            wallet,
            holdings,
            scheduler,
            headers: headers.clone(),
            broadcaster: broadcaster.clone(),
        });

        TestAgent {
            dispatcher: Dispatcher::new(Arc::clone(&ctx)),
            ctx,
            broadcaster,
            headers,
            source,
            contract_key,
            contract,
        }
    }

    /// Runs one chain tx through this agent if it is relevant.
    pub fn process(&self, tx: &Transaction) {
        let mut itx = InspectorTx::from_tx(tx.clone(), true);
        if !itx.is_tokenized() {
            return;
        }
        itx.promote(self.source.as_ref(), Network::Test).unwrap();
        let relevant = self
            .ctx
            .wallet
            .addresses()
            .iter()
            .any(|a| itx.is_relevant(a));
        if !relevant {
            return;
        }
        self.dispatcher.process_tx(&itx).unwrap();
    }

    /// Reads a finalized holding balance.
    pub fn balance(&self, asset: &Hash32, party: &Address) -> u64 {
        self.ctx
            .holdings
            .get(&HoldingKey {
                contract: self.contract.clone(),
                asset: *asset,
                party: party.clone(),
            })
            .unwrap()
            .finalized_balance
    }

    /// Reads a holding's pending-debit total.
    pub fn pending_debits(&self, asset: &Hash32, party: &Address) -> u64 {
        self.ctx
            .holdings
            .get(&HoldingKey {
                contract: self.contract.clone(),
                asset: *asset,
                party: party.clone(),
            })
            .unwrap()
            .pending_debit_total()
    }
}

/// Creates a confirmed funding output for `owner` and registers it on the
/// chain view.
pub fn fund(source: &MemoryTxSource, owner: &Address, value: u64) -> OutPoint {
    let nonce = UNIQUE.fetch_add(1, Ordering::Relaxed);
    let mut tx = Transaction::new();
    tx.inputs.push(TxInput::new(OutPoint {
        txid: Hash32::hash(&nonce.to_le_bytes()),
        index: 0,
    }));
    tx.outputs.push(TxOutput {
        value,
        lock_script: owner.locking_script(),
    });
    let outpoint = OutPoint {
        txid: tx.txid(),
        index: 0,
    };
    source.add(tx);
    outpoint
}

/// Builds a request tx: the senders' funding inputs in order, the listed
/// payments, then the data output carrying `action`.
pub fn request_tx(
    source: &MemoryTxSource,
    senders: &[&PrivateKey],
    pays: &[(Address, u64)],
    action: &Action,
) -> Transaction {
    let mut tx = Transaction::new();
    for sender in senders {
        let outpoint = fund(source, &sender.address(), 1_000_000);
        tx.inputs.push(TxInput::new(outpoint));
    }
    for (address, value) in pays {
        tx.outputs.push(TxOutput {
            value: *value,
            lock_script: address.locking_script(),
        });
    }
    tx.outputs.push(TxOutput {
        value: 0,
        lock_script: protocol::serialize(action, true).unwrap(),
    });
    source.add(tx.clone());
    tx
}

/// Delivers a tx to every agent, then pumps broadcast responses around
/// until the network is quiet. Returns everything that was broadcast.
pub fn deliver_and_pump(agents: &[&TestAgent], tx: &Transaction) -> Vec<Transaction> {
    for agent in agents {
        agent.process(tx);
    }
    pump(agents)
}

/// Pumps broadcast responses through every agent until quiet.
pub fn pump(agents: &[&TestAgent]) -> Vec<Transaction> {
    let mut all = Vec::new();
    loop {
        let mut fresh = Vec::new();
        for agent in agents {
            fresh.extend(agent.broadcaster.drain());
        }
        if fresh.is_empty() {
            break;
        }
        // Everything broadcast lands on the shared chain view before
        // anyone processes it.
        for tx in &fresh {
            agents[0].source.add(tx.clone());
        }
        for tx in &fresh {
            for agent in agents {
                agent.process(tx);
            }
        }
        all.extend(fresh);
    }
    all
}

/// Finds the first action of a given predicate among broadcast txs.
pub fn find_action(
    txs: &[Transaction],
    predicate: impl Fn(&Action) -> bool,
) -> Option<(usize, Action)> {
    for (i, tx) in txs.iter().enumerate() {
        for output in &tx.outputs {
            if let Ok(action) = protocol::deserialize(&output.lock_script, true) {
                if predicate(&action) {
                    return Some((i, action));
                }
            }
        }
    }
    None
}

/// A generously funded timestamp in the future.
pub fn future() -> Timestamp {
    Timestamp::now().plus_secs(3_600)
}
