//! kestreld: chain-state node daemon.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_chainstate::flatfiles::FlatFileStore;
use kestrel_chainstate::notify::{ChainListener, CommandExecutor, Listeners};
use kestrel_chainstate::state::{set_reindex_flag, ChainOptions, ChainState};
use kestrel_chainstate::warnings::WarningChannel;
use kestrel_consensus::constants::{
    DEFAULT_COIN_CACHE_SIZE, DEFAULT_FREE_RELAY_LIMIT, MIN_RELAY_TX_FEE,
};
use kestrel_consensus::{chain_params, Hash256, Network};
use kestrel_node::fee_estimator::{write_file_atomic, FeeEstimator};
use kestrel_node::handlers::NodeHandle;
use kestrel_node::mempool::Mempool;
use kestrel_node::miner::mine_loop;
use kestrel_primitives::{hash256_to_hex, hex_to_bytes};
use kestrel_script::EcdsaVerifier;
use kestrel_storage::fjall::{FjallOptions, FjallStore};
use kestrel_storage::memory::MemoryStore;
use kestrel_storage::KeyValueStore;

const DEFAULT_DATA_DIR: &str = "data";
const MEMPOOL_FILE_NAME: &str = "mempool.dat";
const FEE_ESTIMATES_FILE_NAME: &str = "fee_estimates.dat";
const BLOCK_FILE_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
const MAX_BLOCK_RECORD: u32 = 2 * 1024 * 1024;
const PERSIST_INTERVAL_SECS: u64 = 60;
const DEFAULT_FEE_ESTIMATOR_MAX_SAMPLES: usize = 10_000;

#[derive(Clone, Copy, Debug)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

struct Config {
    backend: Backend,
    data_dir: PathBuf,
    network: Network,
    txindex: bool,
    reindex: bool,
    mine: bool,
    payout_script: Vec<u8>,
    min_relay_fee: i64,
    free_relay_limit: i64,
    coin_cache_entries: usize,
    verify_level: u32,
    verify_depth: i32,
    db_cache_mb: Option<u64>,
    block_notify: Option<String>,
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config {
        backend: Backend::Fjall,
        data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        network: Network::Mainnet,
        txindex: false,
        reindex: false,
        mine: false,
        payout_script: vec![0x51],
        min_relay_fee: MIN_RELAY_TX_FEE,
        free_relay_limit: DEFAULT_FREE_RELAY_LIMIT,
        coin_cache_entries: DEFAULT_COIN_CACHE_SIZE,
        verify_level: 3,
        verify_depth: 288,
        db_cache_mb: None,
        block_notify: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = args.next().ok_or("--backend requires a value")?;
                config.backend =
                    Backend::parse(&value).ok_or_else(|| format!("unknown backend {value}"))?;
            }
            "--data-dir" => {
                config.data_dir = PathBuf::from(args.next().ok_or("--data-dir requires a value")?);
            }
            "--network" => {
                let value = args.next().ok_or("--network requires a value")?;
                config.network =
                    Network::parse(&value).ok_or_else(|| format!("unknown network {value}"))?;
            }
            "--txindex" => config.txindex = true,
            "--reindex" => config.reindex = true,
            "--mine" => config.mine = true,
            "--payout-script" => {
                let value = args.next().ok_or("--payout-script requires a value")?;
                config.payout_script =
                    hex_to_bytes(&value).ok_or("--payout-script expects hex")?;
            }
            "--min-relay-fee" => {
                let value = args.next().ok_or("--min-relay-fee requires a value")?;
                config.min_relay_fee = value
                    .parse()
                    .map_err(|_| format!("invalid fee {value}"))?;
            }
            "--limit-free-relay" => {
                let value = args.next().ok_or("--limit-free-relay requires a value")?;
                config.free_relay_limit = value
                    .parse()
                    .map_err(|_| format!("invalid limit {value}"))?;
            }
            "--coin-cache" => {
                let value = args.next().ok_or("--coin-cache requires a value")?;
                config.coin_cache_entries = value
                    .parse()
                    .map_err(|_| format!("invalid cache size {value}"))?;
            }
            "--verify-level" => {
                let value = args.next().ok_or("--verify-level requires a value")?;
                config.verify_level = value
                    .parse()
                    .map_err(|_| format!("invalid level {value}"))?;
            }
            "--verify-depth" => {
                let value = args.next().ok_or("--verify-depth requires a value")?;
                config.verify_depth = value
                    .parse()
                    .map_err(|_| format!("invalid depth {value}"))?;
            }
            "--db-cache-mb" => {
                let value = args.next().ok_or("--db-cache-mb requires a value")?;
                config.db_cache_mb =
                    Some(value.parse().map_err(|_| format!("invalid size {value}"))?);
            }
            "--block-notify" => {
                config.block_notify =
                    Some(args.next().ok_or("--block-notify requires a value")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(config)
}

fn print_usage() {
    println!("kestreld [options]");
    println!("  --backend <memory|fjall>   storage backend (default fjall)");
    println!("  --data-dir <path>          data directory (default {DEFAULT_DATA_DIR})");
    println!("  --network <mainnet|testnet|regtest>");
    println!("  --txindex                  maintain a txid -> block position index");
    println!("  --reindex                  wipe db/blocks for --data-dir and restart from genesis");
    println!("  --mine                     run a mining thread (regtest)");
    println!("  --payout-script <hex>      miner coinbase output script");
    println!("  --min-relay-fee <n>        relay fee floor per 1000 bytes");
    println!("  --limit-free-relay <n>     free relay budget, kB per minute");
    println!("  --coin-cache <n>           coin records kept in memory before a flush");
    println!("  --verify-level <0-4>       startup chain verification level");
    println!("  --verify-depth <n>         blocks to verify at startup");
    println!("  --db-cache-mb <n>          fjall block cache size");
    println!("  --block-notify <cmd>       run command on new tip, %s = block hash");
}

/// Prints tip changes as they land.
struct LogListener;

impl ChainListener for LogListener {
    fn tip_changed(&self, hash: &Hash256, height: i32) {
        println!("tip: {} height {height}", hash256_to_hex(hash));
    }

    fn double_spend_detected(&self, pool_txid: &Hash256, confirmed_txid: &Hash256) {
        eprintln!(
            "double spend: pool tx {} conflicts with confirmed {}",
            hash256_to_hex(pool_txid),
            hash256_to_hex(confirmed_txid)
        );
    }
}

/// Runs the operator's command on each new tip, off the chain lock.
/// Fire-and-forget: overflowing commands are dropped, and no ordering
/// is guaranteed across invocations.
struct BlockNotify {
    executor: Arc<CommandExecutor>,
    command: String,
}

impl ChainListener for BlockNotify {
    fn tip_changed(&self, hash: &Hash256, _height: i32) {
        let command = self.command.replace("%s", &hash256_to_hex(hash));
        self.executor.fire(move || {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status();
            if let Err(err) = status {
                eprintln!("block notify failed: {err}");
            }
        });
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            print_usage();
            std::process::exit(2);
        }
    };
    if let Err(err) = run(config).await {
        eprintln!("kestreld: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    let net_dir = config.data_dir.join(config.network.as_str());
    std::fs::create_dir_all(&net_dir).map_err(|err| err.to_string())?;

    if config.reindex {
        // Teacher semantics: a reindex wipes and resyncs from genesis.
        let flag = net_dir.join("reindex.flag");
        std::fs::write(&flag, b"1").map_err(|err| err.to_string())?;
        for sub in ["db", "blocks"] {
            let path = net_dir.join(sub);
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(|err| err.to_string())?;
            }
        }
        std::fs::remove_file(&flag).map_err(|err| err.to_string())?;
        println!("reindex: wiped chain state under {}", net_dir.display());
    }

    match config.backend {
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            run_node(config, net_dir, store).await
        }
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: config.db_cache_mb.map(|mb| mb * 1024 * 1024),
                ..FjallOptions::default()
            };
            let store = Arc::new(
                FjallStore::open_with_options(net_dir.join("db"), options)
                    .map_err(|err| err.to_string())?,
            );
            run_node(config, net_dir, store).await
        }
    }
}

async fn run_node<S: KeyValueStore + 'static>(
    config: Config,
    net_dir: PathBuf,
    store: Arc<S>,
) -> Result<(), String> {
    let params = chain_params(config.network);
    if config.reindex {
        set_reindex_flag(store.as_ref(), false).map_err(|err| err.to_string())?;
    }

    let blocks_dir = net_dir.join("blocks");
    let blocks = FlatFileStore::open(&blocks_dir, "blk", BLOCK_FILE_MAGIC, MAX_BLOCK_RECORD)
        .map_err(|err| err.to_string())?;
    let undo = FlatFileStore::open(&blocks_dir, "rev", BLOCK_FILE_MAGIC, MAX_BLOCK_RECORD)
        .map_err(|err| err.to_string())?;

    let chain = ChainState::open(
        Arc::clone(&store),
        params,
        Arc::new(EcdsaVerifier::new()),
        blocks,
        undo,
        ChainOptions {
            check_scripts: true,
            txindex: config.txindex,
            coin_cache_target: config.coin_cache_entries,
        },
    )
    .map_err(|err| err.to_string())?;
    let interrupt = chain.interrupt_handle();
    println!(
        "chain state open: height {} tip {}",
        chain.height(),
        chain
            .tip_hash()
            .map(|hash| hash256_to_hex(&hash))
            .unwrap_or_default()
    );

    let chain = Arc::new(Mutex::new(chain));
    if config.verify_level > 0 && config.verify_depth > 0 {
        let mut guard = chain.lock().map_err(|_| "chain lock poisoned")?;
        guard
            .verify_chain(config.verify_level, config.verify_depth)
            .map_err(|err| format!("chain verification failed: {err}"))?;
        println!(
            "verified last {} blocks at level {}",
            config.verify_depth, config.verify_level
        );
        let warning = guard.warnings().get(WarningChannel::StatusBar);
        if !warning.is_empty() {
            eprintln!("warning: {warning}");
        }
    }

    let mempool = Arc::new(Mutex::new(Mempool::new(
        config.min_relay_fee,
        config.free_relay_limit,
    )));
    let fee_estimator = Arc::new(Mutex::new(
        FeeEstimator::load(
            &net_dir.join(FEE_ESTIMATES_FILE_NAME),
            DEFAULT_FEE_ESTIMATOR_MAX_SAMPLES,
        )
        .unwrap_or_else(|err| {
            eprintln!("fee estimates not loaded: {err}");
            FeeEstimator::new(DEFAULT_FEE_ESTIMATOR_MAX_SAMPLES)
        }),
    ));

    let executor = Arc::new(CommandExecutor::new(64));
    let mut listeners = Listeners::new();
    listeners.register(Arc::new(LogListener));
    if let Some(command) = config.block_notify.clone() {
        listeners.register(Arc::new(BlockNotify {
            executor: Arc::clone(&executor),
            command,
        }));
    }
    let handle = Arc::new(NodeHandle::new(
        Arc::clone(&chain),
        Arc::clone(&mempool),
        listeners,
    ));

    load_mempool(&net_dir, &handle, &fee_estimator);

    let miner = if config.mine {
        let handle = Arc::clone(&handle);
        let interrupt = Arc::clone(&interrupt);
        let payout = config.payout_script.clone();
        Some(std::thread::spawn(move || {
            mine_loop(handle.as_ref(), payout, interrupt.as_ref());
        }))
    } else {
        None
    };

    // Periodic persistence until the shutdown signal lands.
    let mut ticker = tokio::time::interval(Duration::from_secs(PERSIST_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                persist(&net_dir, &chain, &mempool, &fee_estimator);
            }
        }
    }

    interrupt.store(true, Ordering::Relaxed);
    if let Some(miner) = miner {
        let _ = miner.join();
    }
    persist(&net_dir, &chain, &mempool, &fee_estimator);
    if let Ok(mut guard) = chain.lock() {
        guard.flush().map_err(|err| err.to_string())?;
    }
    println!("shutdown complete");
    Ok(())
}

fn load_mempool<S: KeyValueStore>(
    net_dir: &std::path::Path,
    handle: &NodeHandle<S>,
    fee_estimator: &Mutex<FeeEstimator>,
) {
    let path = net_dir.join(MEMPOOL_FILE_NAME);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    let entries = match Mempool::entries_from_bytes(&bytes) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("mempool.dat not loaded: {err}");
            return;
        }
    };
    let now = now_secs();
    let mut loaded = 0usize;
    for (tx, _) in entries {
        let accepted = {
            let Ok(mut chain) = handle.chain.lock() else { return };
            let Ok(mut pool) = handle.mempool.lock() else { return };
            pool.accept(&mut chain, tx, false, now).ok()
        };
        if let Some(accepted) = accepted {
            loaded += 1;
            if let (Ok(mut estimator), Ok(pool)) =
                (fee_estimator.lock(), handle.mempool.lock())
            {
                if let Some(entry) = pool.get(&accepted.txid) {
                    estimator.observe_tx(entry.fee, entry.size);
                }
            }
        }
    }
    if loaded > 0 {
        println!("loaded {loaded} mempool transactions");
    }
}

fn persist<S: KeyValueStore>(
    net_dir: &std::path::Path,
    chain: &Mutex<ChainState<S>>,
    mempool: &Mutex<Mempool>,
    fee_estimator: &Mutex<FeeEstimator>,
) {
    if let Ok(pool) = mempool.lock() {
        if let Err(err) = write_file_atomic(&net_dir.join(MEMPOOL_FILE_NAME), &pool.to_bytes()) {
            eprintln!("mempool persist failed: {err}");
        }
    }
    if let Ok(estimator) = fee_estimator.lock() {
        if let Err(err) = estimator.save(&net_dir.join(FEE_ESTIMATES_FILE_NAME)) {
            eprintln!("fee estimate persist failed: {err}");
        }
    }
    if let Ok(mut guard) = chain.lock() {
        if let Err(err) = guard.flush() {
            eprintln!("chain flush failed: {err}");
        }
    }
}
