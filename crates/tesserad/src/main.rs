//! `tesserad`: command-line front end for the Tessera dedup engine.
//!
//! Every command opens the configured key-value store, runs one engine
//! operation and exits, except `run`, which keeps sweeping and auditing
//! in the background until interrupted.
//!
//! # Usage
//!
//! ```text
//! tesserad put build.log                    # store a file, print its manifest id
//! tesserad put < build.log                  # store stdin
//! tesserad get <id> -o build.log            # rebuild a payload
//! tesserad show <id>                        # print a manifest
//! tesserad discard <id>                     # drop a manifest
//! tesserad sweep --all                      # reclaim unreferenced chunks
//! tesserad audit --dry-run                  # report reference count drift
//! tesserad run                              # background sweeps and audits
//! tesserad benchmark -n 200 -s 65536        # in-memory throughput test
//! ```

mod config;
mod telemetry;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tessera_engine::{DriftReport, Tessera};
use tessera_kv::{FjallKv, KvStore, MemoryKv};
use tessera_types::{Manifest, ManifestId};
use tracing::{info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "tesserad",
    version,
    about = "Content-addressable deduplicating payload store"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the key namespace.
    #[arg(short = 'p', long, global = true)]
    key_prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a payload and print its manifest id.
    Put {
        /// File to store. Reads stdin when omitted.
        input: Option<PathBuf>,
    },

    /// Rebuild a payload from its manifest.
    Get {
        /// Manifest id.
        id: String,

        /// Output file. Writes to stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a manifest.
    Show {
        /// Manifest id.
        id: String,
    },

    /// Drop a manifest and release its chunk references.
    Discard {
        /// Manifest id.
        id: String,
    },

    /// Reclaim chunks whose reference count is zero.
    Sweep {
        /// Hashes examined in one batch (defaults to `gc.batch_size`).
        #[arg(short, long)]
        batch: Option<usize>,

        /// Keep sweeping until every reference key was examined once.
        #[arg(short, long)]
        all: bool,
    },

    /// Recompute reference counts from the committed manifests.
    Audit {
        /// Report drift without repairing it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Sweep on the configured interval and audit periodically.
    Run {
        /// Seconds between audits.
        #[arg(long, default_value = "3600")]
        audit_interval: u64,
    },

    /// Run a quick store/reconstruct benchmark (in-memory).
    Benchmark {
        /// Number of payloads to store.
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// Size of each payload in bytes.
        #[arg(short, long, default_value = "65536")]
        size: usize,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    // CLI args override config file values.
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(prefix) = cli.key_prefix {
        config.engine.key_prefix = prefix;
    }

    telemetry::init(&config.log);

    let engine = || open_engine(&config);
    match cli.command {
        Commands::Put { input } => {
            let engine = engine()?;
            let manifest = cmd_put(&engine, input.as_deref()).await?;
            println!("{}", manifest.id);
        }
        Commands::Get { id, output } => {
            cmd_get(&engine()?, parse_id(&id)?, output.as_deref()).await?;
        }
        Commands::Show { id } => {
            let manifest = engine()?.manifest(parse_id(&id)?).await?;
            print_manifest(&manifest);
        }
        Commands::Discard { id } => {
            let id = parse_id(&id)?;
            engine()?.discard(id).await?;
            println!("discarded {id}");
        }
        Commands::Sweep { batch, all } => {
            let engine = engine()?;
            let report = if all {
                engine.sweep_all().await?
            } else {
                engine
                    .sweep(batch.unwrap_or(engine.config().gc.batch_size))
                    .await?
            };
            println!(
                "scanned {}, reclaimed {}, skipped {}{}",
                report.scanned,
                report.reclaimed,
                report.skipped,
                if report.finished_pass {
                    " (pass complete)"
                } else {
                    ""
                }
            );
        }
        Commands::Audit { dry_run } => {
            let report = engine()?.audit(dry_run).await?;
            print_report(&report);
        }
        Commands::Run { audit_interval } => {
            cmd_run(Arc::new(engine()?), Duration::from_secs(audit_interval.max(1))).await?;
        }
        Commands::Benchmark { count, size } => cmd_benchmark(&config, count, size).await?,
    }
    Ok(())
}

/// Open the configured key-value backend.
fn open_kv(config: &CliConfig) -> Result<Arc<dyn KvStore>> {
    if config.is_memory() {
        warn!("memory backend: nothing survives this process");
        return Ok(Arc::new(MemoryKv::new()));
    }
    if config.storage.backend != "fjall" {
        bail!("unknown storage backend {:?}", config.storage.backend);
    }

    std::fs::create_dir_all(&config.storage.data_dir)
        .context("failed to create data directory")?;
    let kv = FjallKv::open(config.storage.data_dir.join("kv"))
        .context("failed to open key-value store")?;
    Ok(Arc::new(kv))
}

fn open_engine(config: &CliConfig) -> Result<Tessera> {
    let engine_config = config.engine_config()?;
    let kv = open_kv(config)?;
    Ok(Tessera::new(engine_config, kv)?)
}

fn parse_id(s: &str) -> Result<ManifestId> {
    s.parse()
        .with_context(|| format!("invalid manifest id {s:?}"))
}

// -----------------------------------------------------------------------
// tesserad put / get
// -----------------------------------------------------------------------

async fn cmd_put(engine: &Tessera, input: Option<&Path>) -> Result<Manifest> {
    let payload = match input {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let manifest = engine.store(&payload).await?;
    info!(
        id = %manifest.id,
        size = manifest.total_size,
        chunks = manifest.chunk_count(),
        "payload stored"
    );
    Ok(manifest)
}

async fn cmd_get(engine: &Tessera, id: ManifestId, output: Option<&Path>) -> Result<()> {
    let manifest = engine.manifest(id).await?;
    let payload = engine.reconstruct(&manifest).await?;

    match output {
        Some(path) => std::fs::write(path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&payload)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn print_manifest(manifest: &Manifest) {
    println!("id:       {}", manifest.id);
    println!("version:  {}", manifest.version);
    println!("size:     {} bytes", manifest.total_size);
    println!("checksum: {}", manifest.checksum);
    println!("created:  {}", manifest.created_at);
    println!("chunks:   {}", manifest.chunk_count());
    for (i, chunk) in manifest.chunks.iter().enumerate() {
        println!("  {i:>5}  {:>12}  {:>8}  {}", chunk.offset, chunk.size, chunk.hash);
    }
}

fn print_report(report: &DriftReport) {
    println!("Audit{}", if report.dry_run { " (dry run)" } else { "" });
    println!("  manifests:       {}", report.manifests_scanned);
    println!("  hashes:          {}", report.hashes_checked);
    println!("  under-counted:   {}", report.under_counted);
    println!("  over-counted:    {}", report.over_counted);
    println!("  skipped (busy):  {}", report.unstable_skipped);
    println!("  orphans adopted: {}", report.orphan_counters_created);
    println!("  intents live:    {}", report.intents_live);
    println!("  intents reaped:  {}", report.intents_reaped);
    for hash in &report.dangling {
        println!("  dangling: {hash}");
    }
    for drift in &report.repairs {
        println!(
            "  drift: {} expected {} found {}",
            drift.hash, drift.expected, drift.actual
        );
    }
}

// -----------------------------------------------------------------------
// tesserad run
// -----------------------------------------------------------------------

async fn cmd_run(engine: Arc<Tessera>, audit_interval: Duration) -> Result<()> {
    info!(
        prefix = %engine.config().key_prefix,
        sweep_interval_secs = engine.config().gc.interval_secs,
        audit_interval_secs = audit_interval.as_secs(),
        "starting background maintenance"
    );

    let gc = engine.gc_scheduler().start();

    // The first tick fires immediately, settling anything a crash left behind.
    let mut audits = tokio::time::interval(audit_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
            _ = audits.tick() => {
                match engine.audit(false).await {
                    Ok(report) if report.is_clean() => {}
                    Ok(report) => warn!(
                        repairs = report.repairs.len(),
                        dangling = report.dangling.len(),
                        reaped = report.intents_reaped,
                        "audit repaired drift"
                    ),
                    Err(e) => warn!(error = %e, "audit failed"),
                }
            }
        }
    }

    let passes = gc.passes();
    let reclaimed = gc.reclaimed();
    gc.shutdown().await;
    info!(passes, reclaimed, "background maintenance stopped");
    Ok(())
}

// -----------------------------------------------------------------------
// tesserad benchmark
// -----------------------------------------------------------------------

async fn cmd_benchmark(config: &CliConfig, count: usize, size: usize) -> Result<()> {
    let engine_config = config.engine_config()?;

    println!("Tessera Benchmark");
    println!("  payloads: {count}");
    println!("  size:     {size} bytes each");
    println!(
        "  chunking: min={} avg={} max={}",
        engine_config.chunking.min_size,
        engine_config.chunking.avg_size,
        engine_config.chunking.max_size
    );
    println!();

    // In-memory setup, measures pure engine throughput.
    let engine = Tessera::new(engine_config, Arc::new(MemoryKv::new()))?;

    // Every payload is the same base with a small edit, like successive
    // builds of one project.
    let base = generate_bench_data(size);
    let payloads: Vec<Vec<u8>> = (0..count).map(|i| edited(&base, i)).collect();
    let total_bytes = count as u64 * size as u64;

    // --- Store ---
    print!("Storing {count} payloads... ");
    let start = Instant::now();
    let mut manifests = Vec::with_capacity(count);
    for payload in &payloads {
        manifests.push(engine.store(payload).await?);
    }
    let write_dur = start.elapsed();
    let write_mbs = total_bytes as f64 / write_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({write_mbs:.1} MB/s)", write_dur.as_secs_f64());

    // --- Reconstruct ---
    print!("Reconstructing {count} payloads... ");
    let start = Instant::now();
    for manifest in &manifests {
        let _ = engine.reconstruct(manifest).await?;
    }
    let read_dur = start.elapsed();
    let read_mbs = total_bytes as f64 / read_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({read_mbs:.1} MB/s)", read_dur.as_secs_f64());

    let stats = engine.stats();
    println!();
    println!("Summary:");
    println!("  Store throughput:       {write_mbs:.1} MB/s");
    println!("  Reconstruct throughput: {read_mbs:.1} MB/s");
    println!(
        "  Chunks reused:          {:.1}%",
        stats.dedup_ratio() * 100.0
    );
    println!(
        "  Total data:             {:.1} MB",
        total_bytes as f64 / 1_048_576.0
    );

    Ok(())
}

/// Generate deterministic test data for benchmarking.
fn generate_bench_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Copy `base` with 16 bytes overwritten at a position derived from `seed`.
fn edited(base: &[u8], seed: usize) -> Vec<u8> {
    let mut out = base.to_vec();
    if out.is_empty() {
        return out;
    }
    let at = seed.wrapping_mul(2_654_435_761) % out.len();
    let end = (at + 16).min(out.len());
    for (i, b) in out[at..end].iter_mut().enumerate() {
        *b = (seed as u8).wrapping_add(i as u8);
    }
    out
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
