//! # CSP Engine
//!
//! Brings a set of CSP servo drives to OP and runs the cyclic position loop
//! until interrupted.
//!
//! Exit codes: 0 on a requested stop, 1 on configuration or start-up
//! failure, 2 when devices do not reach OP in time, 3 when the bus stops
//! answering during control.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use csp_common::config::{EngineConfig, load_config};
use csp_common::consts::DEFAULT_CONFIG_PATH;
use csp_engine::cycle::{MonotonicClock, rt_setup};
use csp_engine::engine::{Engine, RunOutcome, StopFlag};
use csp_engine::error::{EXIT_CONFIG, EngineError};
use csp_engine::sim::SimMaster;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// CSP Engine: cyclic synchronous position loop
#[derive(Parser, Debug)]
#[command(name = "csp_engine")]
#[command(version)]
#[command(about = "Deterministic cyclic synchronization engine for CSP servo drives")]
struct Args {
    /// Path to the engine configuration TOML.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// CPU core to pin the cycle thread to (overrides `engine.cpu_core`).
    #[arg(long)]
    cpu_core: Option<usize>,

    /// SCHED_FIFO priority (overrides `engine.rt_priority`; default: maximum).
    #[arg(long)]
    rt_priority: Option<i32>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            setup_tracing(&args, None);
            error!("FATAL: {e}");
            process::exit(EXIT_CONFIG);
        }
    };
    setup_tracing(&args, Some(&config));

    info!("CSP Engine v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Config OK: {} device(s), cycle {}ns, bring-up budget {} cycles",
        config.devices.len(),
        config.engine.cycle_period_ns,
        config.engine.bringup_timeout_cycles
    );

    match run(&args, &config) {
        Ok(outcome) => {
            info!("CSP Engine stopped ({outcome:?})");
        }
        Err(e) => {
            error!("FATAL: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args, config: &EngineConfig) -> Result<RunOutcome, EngineError> {
    rt_setup(
        args.rt_priority.or(config.engine.rt_priority),
        args.cpu_core.or(config.engine.cpu_core),
    )?;

    let bus = SimMaster::request(config.engine.master_index, config)?;

    let stop = StopFlag::new();
    let handler_flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.request_stop()) {
        error!("Failed to install signal handler: {e}");
    }

    let mut engine = Engine::configure(bus, config, MonotonicClock::new())?.with_stop_flag(stop);
    let outcome = engine.run();
    engine.shutdown();
    outcome
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, config: Option<&EngineConfig>) {
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        let level = config.map_or("info", |c| c.engine.log_level.as_directive());
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
