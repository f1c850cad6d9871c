//! Runs writer_bench and reader_bench as two separate processes against the
//! same queue, once per flavor.

use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::{Child, Command};

use tempfile::Builder;

struct Scenario {
    flavor: &'static str,
    messages: usize,
    quantum_count: usize,
    write_batch: usize,
    read_batch: usize,
    startup_delay_ms: u64,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        flavor: "synchronized",
        messages: 1_000_000,
        quantum_count: 1024,
        write_batch: 64,
        read_batch: 128,
        startup_delay_ms: 0,
    },
    Scenario {
        flavor: "unsynchronized",
        messages: 1_000_000,
        quantum_count: 1024,
        write_batch: 32,
        read_batch: 32,
        // lets the reader attach before the first write
        startup_delay_ms: 1_000,
    },
];

fn cargo_run(package: &str, config: &Path) -> Result<Child, Box<dyn Error>> {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
    let child = Command::new(cargo)
        .current_dir(workspace)
        .arg("run")
        .arg("--release")
        .arg("--package")
        .arg(package)
        .arg("--")
        .arg("--config")
        .arg(config)
        .spawn()?;
    Ok(child)
}

fn run(scenario: &Scenario) -> Result<(), Box<dyn Error>> {
    println!("\n--- {} ---", scenario.flavor);
    let dir = Builder::new().prefix("fmq_e2e").tempdir()?;
    let descriptor_path = dir.path().join("queue.toml");
    let descriptor = descriptor_path.to_string_lossy().replace('\\', "\\\\");

    let writer_config = dir.path().join("writer.toml");
    fs::write(
        &writer_config,
        format!(
            "flavor = \"{flavor}\"\n\
             descriptor_path = \"{descriptor}\"\n\
             messages = {messages}\n\
             batch = {batch}\n\
             timeout_ms = 1000\n\
             startup_delay_ms = {delay}\n\
             linger_ms = 5000\n\
             \n\
             [queue]\n\
             quantum_count = {count}\n\
             event_flag = true\n",
            flavor = scenario.flavor,
            descriptor = descriptor,
            messages = scenario.messages,
            batch = scenario.write_batch,
            delay = scenario.startup_delay_ms,
            count = scenario.quantum_count,
        ),
    )?;

    let reader_config = dir.path().join("reader.toml");
    fs::write(
        &reader_config,
        format!(
            "flavor = \"{flavor}\"\n\
             descriptor_path = \"{descriptor}\"\n\
             messages = {messages}\n\
             batch = {batch}\n\
             idle_timeout_ms = 3000\n\
             attach_timeout_ms = 60000\n",
            flavor = scenario.flavor,
            descriptor = descriptor,
            messages = scenario.messages,
            batch = scenario.read_batch,
        ),
    )?;

    let mut writer = cargo_run("writer_bench", &writer_config)?;
    let mut reader = cargo_run("reader_bench", &reader_config)?;
    let reader_status = reader.wait()?;
    let writer_status = writer.wait()?;
    println!("writer: {}, reader: {}", writer_status, reader_status);

    if !writer_status.success() || !reader_status.success() {
        return Err(format!("{} run failed", scenario.flavor).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    for scenario in SCENARIOS {
        run(scenario)?;
    }
    println!("\nAll end-to-end runs passed.");
    Ok(())
}
