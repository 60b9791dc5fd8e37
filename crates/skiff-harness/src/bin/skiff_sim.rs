//! Skiff transfer simulator.
//!
//! # Usage
//!
//! ```bash
//! # Scenario A: 1,000 chunks of 16 KiB over a perfect link
//! skiff-sim --scenario sequential
//!
//! # Lossy link with a session policy from a file
//! skiff-sim --scenario chaos --drop-rate 0.05 --reorder-rate 0.1 --config sim.toml
//! ```
//!
//! The TOML file may set `[session]` (any `SessionConfig` field) and `[link]`
//! (`drop_rate`, `reorder_rate`, `tamper_rate`); command-line rates win.

use std::{fs, path::PathBuf};

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use skiff_core::SessionConfig;
use skiff_harness::{InvariantRegistry, LinkConfig, Scenario};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioKind {
    /// 1,000 sequential 16 KiB chunks, no faults
    Sequential,
    /// Chunks 50 and 51 swapped in flight
    Swapped,
    /// Chunk 700 corrupted, no retransmission
    Tampered,
    /// Post-quantum step every `--pq-interval` messages
    PostQuantum,
    /// Random faults from the configured rates
    Chaos,
}

/// Skiff deterministic transfer simulator
#[derive(Parser, Debug)]
#[command(name = "skiff-sim")]
#[command(about = "Run a seeded Skiff transfer through a simulated link")]
#[command(version)]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "sequential")]
    scenario: ScenarioKind,

    /// Seed for keys, file contents and link faults
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Override the number of chunks
    #[arg(long)]
    chunks: Option<usize>,

    /// Override the chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Post-quantum interval for the post-quantum scenario
    #[arg(long, default_value = "8")]
    pq_interval: u32,

    /// TOML file with `[session]` and `[link]` tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chance a chunk frame is lost
    #[arg(long)]
    drop_rate: Option<f64>,

    /// Chance a chunk frame is delayed behind the next one
    #[arg(long)]
    reorder_rate: Option<f64>,

    /// Chance a chunk frame has a bit flipped
    #[arg(long)]
    tamper_rate: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimFile {
    session: Option<SessionConfig>,
    link: Option<LinkConfig>,
}

impl SimFile {
    fn load(path: Option<&PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn scenario(args: &Args, file: SimFile) -> Result<Scenario, Box<dyn std::error::Error>> {
    let mut link = file.link.unwrap_or_default();
    if let Some(rate) = args.drop_rate {
        link.drop_rate = rate;
    }
    if let Some(rate) = args.reorder_rate {
        link.reorder_rate = rate;
    }
    if let Some(rate) = args.tamper_rate {
        link.tamper_rate = rate;
    }
    link.validate()?;

    let mut scenario = match args.scenario {
        ScenarioKind::Sequential => Scenario::sequential(),
        ScenarioKind::Swapped => Scenario::swapped(),
        ScenarioKind::Tampered => Scenario::tampered(),
        ScenarioKind::PostQuantum => Scenario::post_quantum(args.pq_interval),
        ScenarioKind::Chaos => Scenario::chaos(link),
    };
    if !matches!(args.scenario, ScenarioKind::Chaos) && link != LinkConfig::reliable() {
        scenario.link = link;
    }
    if let Some(session) = file.session {
        scenario.session = session;
    }
    if let Some(chunks) = args.chunks {
        scenario.chunks = chunks;
    }
    if let Some(size) = args.chunk_size {
        scenario.chunk_size = size;
    }
    scenario.session.validate()?;
    Ok(scenario)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let file = SimFile::load(args.config.as_ref())?;
    let scenario = scenario(&args, file)?;
    tracing::info!(
        scenario = scenario.name,
        seed = args.seed,
        chunks = scenario.chunks,
        chunk_size = scenario.chunk_size,
        invariants = ?InvariantRegistry::standard().names(),
        "starting simulation"
    );

    let (driver, report) = scenario.run(args.seed)?;

    tracing::info!(
        sender = ?report.sender_state,
        receiver = ?report.receiver_state,
        delivered = report.delivered_chunks,
        rejected = report.rejections.len(),
        undecodable = report.undecodable,
        resend_rounds = report.resend_rounds,
        "transfer finished"
    );
    tracing::info!(status = ?report.status, "manifest status");
    tracing::info!(
        sent = report.forward.sent,
        dropped = report.forward.dropped,
        reordered = report.forward.reordered,
        tampered = report.forward.tampered,
        "forward link"
    );
    if let Some(code) = driver.sender().verification_code() {
        tracing::info!(code, "verification code");
    }

    Ok(())
}
