use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fmq::{Descriptor, Flavor, FlavorKind, FmqError, MessageQueue, Synchronized, Unsynchronized};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fmq-reader.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReaderConfig {
    flavor: FlavorKind,
    descriptor_path: PathBuf,
    /// Quanta the writer sends. Synchronized runs must receive all of them.
    messages: usize,
    batch: usize,
    /// Give up once no data arrived for this long.
    idle_timeout_ms: u64,
    /// How long to wait for the writer to publish the descriptor.
    attach_timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> ReaderConfig {
        ReaderConfig {
            flavor: FlavorKind::Synchronized,
            descriptor_path: PathBuf::from("fmq-queue.toml"),
            messages: 10_000_000,
            batch: 64,
            idle_timeout_ms: 2_000,
            attach_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    received: usize,
    mismatches: usize,
    overflows: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fmq=info,reader_bench=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    if cfg.batch == 0 {
        return Err("batch must be positive".into());
    }
    let desc = wait_for_descriptor(&cfg.descriptor_path, Duration::from_millis(cfg.attach_timeout_ms))?;
    let stats = match cfg.flavor {
        FlavorKind::Synchronized => run::<Synchronized>(&cfg, &desc)?,
        FlavorKind::Unsynchronized => run::<Unsynchronized>(&cfg, &desc)?,
    };
    info!(
        received = stats.received,
        overflows = stats.overflows,
        mismatches = stats.mismatches,
        "reader done"
    );

    if stats.mismatches > 0 {
        return Err(format!("{} quanta out of sequence", stats.mismatches).into());
    }
    if cfg.flavor == FlavorKind::Synchronized && stats.received != cfg.messages {
        return Err(format!("received {} of {} quanta", stats.received, cfg.messages).into());
    }
    Ok(())
}

fn wait_for_descriptor(path: &Path, timeout: Duration) -> Result<Descriptor, Box<dyn Error>> {
    let start = Instant::now();
    loop {
        match Descriptor::load(path) {
            Ok(desc) => return Ok(desc),
            // the file may not exist yet or be half written
            Err(e) if start.elapsed() < timeout => {
                debug!(error = %e, "descriptor not ready");
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn run<F: Flavor>(cfg: &ReaderConfig, desc: &Descriptor) -> Result<Stats, Box<dyn Error>> {
    let mut queue = MessageQueue::<u16, F>::attach(desc)?;
    if cfg.batch > queue.quantum_count() {
        return Err(format!("batch must be in 1..={}", queue.quantum_count()).into());
    }
    info!(os_id = desc.os_id(), flavor = ?F::KIND, "attached");

    let timeout = Some(Duration::from_millis(cfg.idle_timeout_ms));
    let mut buff = vec![0u16; cfg.batch];
    // an Unsynchronized reader may join mid-stream
    let mut expected = (F::KIND == FlavorKind::Synchronized).then(|| 0u16);
    let mut stats = Stats::default();
    let start = Instant::now();

    while stats.received < cfg.messages {
        let n = cfg.batch.min(cfg.messages - stats.received);
        match queue.read_blocking(&mut buff[..n], timeout) {
            Ok(()) => {}
            Err(FmqError::Overflow { lag, resync_to }) => {
                warn!(lag, resync_to, "lapped by the writer");
                stats.overflows += 1;
                expected = None;
                continue;
            }
            Err(FmqError::Timeout) => {
                info!(received = stats.received, "no data within the idle timeout");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        for v in &buff[..n] {
            if let Some(e) = expected {
                if *v != e {
                    stats.mismatches += 1;
                }
            }
            expected = Some(v.wrapping_add(1));
        }
        stats.received += n;
        if stats.received % 1_000_000 < n {
            debug!(received = stats.received, "progress");
        }
    }

    let duration = start.elapsed();
    let per_sec = stats.received as f64 / duration.as_secs_f64().max(f64::EPSILON);
    info!(?duration, "{}K quanta read/s", (per_sec / 1000f64) as u64);
    Ok(stats)
}
