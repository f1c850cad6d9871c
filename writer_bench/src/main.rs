use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fmq::{Flavor, FlavorKind, FmqError, MessageQueue, QueueConfig, Synchronized, Unsynchronized};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fmq-writer.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriterConfig {
    flavor: FlavorKind,
    queue: QueueConfig,
    /// Where the descriptor is published for readers.
    descriptor_path: PathBuf,
    messages: usize,
    batch: usize,
    timeout_ms: u64,
    /// Pause between publishing the descriptor and the first write.
    startup_delay_ms: u64,
    /// How long to keep the region alive for readers after the last write.
    linger_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> WriterConfig {
        WriterConfig {
            flavor: FlavorKind::Synchronized,
            queue: QueueConfig::default(),
            descriptor_path: PathBuf::from("fmq-queue.toml"),
            messages: 10_000_000,
            batch: 64,
            timeout_ms: 1_000,
            startup_delay_ms: 0,
            linger_ms: 5_000,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fmq=info,writer_bench=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    if cfg.batch == 0 || cfg.batch > cfg.queue.quantum_count {
        return Err(format!("batch must be in 1..={}", cfg.queue.quantum_count).into());
    }

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let res = match cfg.flavor {
        FlavorKind::Synchronized => run::<Synchronized>(&cfg, &term),
        FlavorKind::Unsynchronized => run::<Unsynchronized>(&cfg, &term),
    };
    if let Err(e) = fs::remove_file(&cfg.descriptor_path) {
        debug!(error = %e, "descriptor already gone");
    }
    res
}

fn run<F: Flavor>(cfg: &WriterConfig, term: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let mut queue = MessageQueue::<u16, F>::create(&cfg.queue)?;
    queue.descriptor().save(&cfg.descriptor_path)?;
    info!(path = %cfg.descriptor_path.display(), os_id = queue.descriptor().os_id(), "published descriptor");
    thread::sleep(Duration::from_millis(cfg.startup_delay_ms));

    let timeout = Some(Duration::from_millis(cfg.timeout_ms));
    let mut batch = vec![0u16; cfg.batch];
    let start = Instant::now();
    let mut written = 0usize;
    while written < cfg.messages {
        if term.load(Ordering::Relaxed) {
            warn!(written, "interrupted");
            break;
        }
        let n = cfg.batch.min(cfg.messages - written);
        for (i, slot) in batch[..n].iter_mut().enumerate() {
            *slot = (written + i) as u16;
        }
        match queue.write_blocking(&batch[..n], timeout) {
            Ok(()) => written += n,
            Err(FmqError::Timeout) => warn!(written, "queue stayed full, is a reader attached?"),
            Err(e) => return Err(e.into()),
        }
        if written % 1_000_000 < n {
            debug!(written, "progress");
        }
    }

    let duration = start.elapsed();
    let per_sec = written as f64 / duration.as_secs_f64().max(f64::EPSILON);
    info!(written, ?duration, "{}K quanta write/s", (per_sec / 1000f64) as u64);

    // Unsynchronized writers have no view of reader progress, so they
    // always wait out the full linger period.
    let deadline = Instant::now() + Duration::from_millis(cfg.linger_ms);
    while Instant::now() < deadline && !term.load(Ordering::Relaxed) {
        if F::KIND == FlavorKind::Synchronized && queue.available_to_read() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    info!(pending = queue.available_to_read(), "writer done");
    Ok(())
}
