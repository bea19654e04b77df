#![allow(clippy::result_large_err)]
//! voltx bench
//!
//! Drives a concurrent read/write/free workload against volumes on the
//! in-memory store, optionally crashes the store and verifies that every
//! acknowledged sync write is recovered from the intent log, then prints
//! per-volume statistics as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voltx_common::{DEFAULT_BLOCK_SIZE, Dispatcher, VolumeConfig};
use voltx_store::MemoryStore;
use voltx_volume::{VolumeManager, VolumeRef, VolumeStats};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "voltx-bench", about = "voltx volume workload driver")]
struct Args {
    /// JSON volume configuration; defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Intent log directory (overrides the configuration)
    #[arg(long, env = "VOLTX_LOG_DIR", default_value = "./voltx-bench-log")]
    log_dir: PathBuf,

    /// Number of volumes
    #[arg(long, default_value_t = 2)]
    volumes: usize,

    /// Volume size in bytes
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    volume_size: u64,

    /// Volume block size in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u64,

    /// Concurrent workers per volume
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 1000)]
    ops: usize,

    /// Largest I/O in bytes
    #[arg(long, default_value_t = 128 * 1024)]
    max_io: u64,

    /// Percentage of writes issued with sync
    #[arg(long, default_value_t = 25)]
    sync_percent: u32,

    /// Crash the store after the workload and verify recovery
    #[arg(long)]
    crash: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    total_ops: usize,
    recovered_writes: Option<usize>,
    volumes: Vec<VolumeStats>,
}

/// Last acknowledged sync write of a worker, re-read after a crash
#[derive(Debug, Clone)]
struct SyncedWrite {
    volume: String,
    offset: u64,
    data: Bytes,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<VolumeConfig>(&text)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => VolumeConfig::default(),
    };
    config.intent_log.dir.clone_from(&args.log_dir);
    std::fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("create log dir {}", args.log_dir.display()))?;
    remove_stale_logs(&args.log_dir)?;
    if args.max_io == 0 || args.max_io > args.volume_size {
        bail!("--max-io must be in 1..={}", args.volume_size);
    }

    let store = MemoryStore::new();
    let manager = Arc::new(VolumeManager::new(
        Arc::new(store.clone()),
        config.clone(),
        Dispatcher::current(),
    ));

    // ── Volumes ───────────────────────────────────────────────────────────────
    let mut volumes = Vec::with_capacity(args.volumes);
    for i in 0..args.volumes {
        let name = format!("bench/vol{i}");
        let vref = manager
            .create_volume(&name, args.volume_size, args.block_size)
            .with_context(|| format!("create volume {name}"))?;
        manager
            .open(&vref, false, false)
            .with_context(|| format!("open volume {name}"))?;
        volumes.push(vref);
    }

    // ── Workload ──────────────────────────────────────────────────────────────
    info!(
        "Running {} workers x {} ops on {} volumes",
        args.workers, args.ops, args.volumes
    );
    let started = Instant::now();
    let mut tasks = Vec::new();
    for vref in &volumes {
        for worker in 0..args.workers {
            let manager = Arc::clone(&manager);
            let vref = vref.clone();
            let params = WorkerParams::from_args(&args, worker);
            tasks.push(tokio::spawn(
                async move { run_worker(&manager, &vref, params).await },
            ));
        }
    }
    let mut synced = Vec::new();
    for task in tasks {
        if let Some(write) = task.await.context("join worker")?? {
            synced.push(write);
        }
    }
    let elapsed = started.elapsed();
    info!("Workload finished in {:?}", elapsed);

    // ── Crash and recovery ────────────────────────────────────────────────────
    let (manager, recovered) = if args.crash {
        for vref in &volumes {
            store
                .simulate_crash(&vref.name())
                .with_context(|| format!("crash {}", vref.name()))?;
        }
        drop(volumes);
        drop(manager);

        let manager = Arc::new(VolumeManager::new(
            Arc::new(store.clone()),
            config,
            Dispatcher::current(),
        ));
        let recovered = verify_recovery(&manager, &synced).await?;
        info!("Recovered {} acknowledged sync writes", recovered);
        (manager, Some(recovered))
    } else {
        (manager, None)
    };

    let report = Report {
        elapsed_ms: elapsed.as_millis(),
        total_ops: args.volumes * args.workers * args.ops,
        recovered_writes: recovered,
        volumes: manager
            .list()
            .iter()
            .map(|name| manager.stats(name))
            .collect::<Result<_, _>>()?,
    };
    manager.shutdown();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// The in-memory store starts empty, so logs of earlier runs must not be
/// replayed into it
fn remove_stale_logs(dir: &std::path::Path) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "wal") {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale log {}", path.display()))?;
        }
    }
    Ok(())
}

// ── Workers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct WorkerParams {
    /// Region the worker writes and frees; reads go anywhere
    region_offset: u64,
    region_len: u64,
    volume_size: u64,
    ops: usize,
    max_io: u64,
    sync_percent: u32,
}

impl WorkerParams {
    fn from_args(args: &Args, worker: usize) -> Self {
        let region_len = (args.volume_size / args.workers.max(1) as u64).max(1);
        Self {
            region_offset: region_len * worker as u64,
            region_len,
            volume_size: args.volume_size,
            ops: args.ops,
            max_io: args.max_io,
            sync_percent: args.sync_percent,
        }
    }
}

async fn run_worker(
    manager: &VolumeManager,
    vref: &VolumeRef,
    params: WorkerParams,
) -> Result<Option<SyncedWrite>> {
    let mut last_sync = None;
    for _ in 0..params.ops {
        let (choice, len, sync, fill) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..100u32),
                rng.gen_range(1..=params.max_io),
                rng.gen_range(0..100u32) < params.sync_percent,
                rng.r#gen::<u8>(),
            )
        };

        match choice {
            0..60 => {
                let len = len.min(params.region_len);
                let offset = params.region_offset
                    + rand::thread_rng().gen_range(0..=params.region_len - len);
                let data = Bytes::from(vec![fill; usize::try_from(len)?]);
                manager
                    .write_async(vref, offset, data.clone(), sync)
                    .await
                    .with_context(|| format!("write [{offset}, +{len})"))?;
                forget_overlapping(&mut last_sync, offset, len);
                if sync {
                    last_sync = Some(SyncedWrite {
                        volume: vref.name(),
                        offset,
                        data,
                    });
                }
            }
            60..95 => {
                let offset = rand::thread_rng().gen_range(0..params.volume_size);
                manager
                    .read_async(vref, offset, len)
                    .await
                    .with_context(|| format!("read [{offset}, +{len})"))?;
            }
            _ => {
                let len = len.min(params.region_len);
                let offset = params.region_offset
                    + rand::thread_rng().gen_range(0..=params.region_len - len);
                manager
                    .free_range_async(vref, offset, len, false)
                    .await
                    .with_context(|| format!("free [{offset}, +{len})"))?;
                forget_overlapping(&mut last_sync, offset, len);
            }
        }
    }
    Ok(last_sync)
}

/// Drop the tracked sync write if a later operation touched it
fn forget_overlapping(last_sync: &mut Option<SyncedWrite>, offset: u64, len: u64) {
    if let Some(write) = last_sync
        && offset < write.offset + write.data.len() as u64
        && write.offset < offset + len
    {
        *last_sync = None;
    }
}

async fn verify_recovery(manager: &VolumeManager, synced: &[SyncedWrite]) -> Result<usize> {
    let mut names: Vec<&str> = synced.iter().map(|w| w.volume.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    for name in names {
        let vref = manager
            .create_minor(name)
            .with_context(|| format!("register {name} after crash"))?;
        manager.open(&vref, true, false)?;
    }

    for write in synced {
        let vref = manager.lookup(&write.volume)?;
        let data = manager
            .read_async(&vref, write.offset, write.data.len() as u64)
            .await?;
        if data != write.data {
            bail!(
                "{} [{}, +{}) lost an acknowledged sync write",
                write.volume,
                write.offset,
                write.data.len()
            );
        }
    }
    Ok(synced.len())
}
