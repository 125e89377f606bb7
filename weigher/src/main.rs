//! # Weigher Calibration Supervisor
//!
//! CLI entry point: loads configuration, wires the PLC transport (real
//! Modbus/TCP, or the in-process simulation under `--simulate`), starts
//! the monitoring engine, and drives all six hoppers through the four
//! calibration stages to completion, logging every upward event as it
//! arrives.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weigher_analysis::client::AnalysisClient;
use weigher_common::config::{ConfigError, ConfigLoader, CoreConfig, LogLevel};
use weigher_common::error::{CoreError, ErrorKind};
use weigher_common::events::CoreEvent;
use weigher_common::matrix::LearningMatrix;
use weigher_plc::bucket_control::RealSleeper;
use weigher_plc::monitor::Monitor;
use weigher_plc::transport::{ModbusTransport, PlcPort, SimulatedTransport};

use weigher_control::aggregator::LearningStateAggregator;
use weigher_control::coarse_time::CoarseTimeController;
use weigher_control::context::StageContext;

/// Six-hopper weighing calibration session supervisor.
#[derive(Parser, Debug)]
#[command(name = "weigher", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "weigher.toml")]
    config: PathBuf,

    /// Drive an in-process simulated PLC instead of a real Modbus/TCP device.
    #[arg(long)]
    simulate: bool,

    /// Enable debug-level logging regardless of the configured log level.
    #[arg(long)]
    verbose: bool,

    /// Emit structured JSON logs instead of the default human-readable format.
    #[arg(long)]
    json: bool,

    /// Target weight for this session, in grams.
    #[arg(long, default_value_t = 200.0)]
    target_weight: f64,

    /// Initial coarse speed trialed by every hopper.
    #[arg(long, default_value_t = 40)]
    initial_coarse_speed: u16,
}

fn init_logging(level: LogLevel, verbose: bool, json: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { level.as_tracing_level() };
    let level_filter = tracing_subscriber::filter::LevelFilter::from_level(level);
    let filter = EnvFilter::builder().with_default_directive(level_filter.into()).from_env_lossy();
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn main() {
    let args = Args::parse();
    let config = match CoreConfig::load(&args.config) {
        Ok(c) => c,
        Err(ConfigError::FileNotFound) => {
            eprintln!("no configuration file at {:?}, using defaults", args.config);
            CoreConfig::default()
        }
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    init_logging(config.shared.log_level, args.verbose, args.json);

    if let Err(e) = run(&args, &config) {
        error!(%e, "session exited with a fatal error");
        std::process::exit(1);
    }
}

fn run(args: &Args, config: &CoreConfig) -> Result<(), CoreError> {
    info!(simulate = args.simulate, target_weight = args.target_weight, "starting weigher session");

    let plc: Arc<dyn PlcPort> = if args.simulate {
        SimulatedTransport::with_auto_fill(Duration::from_millis(800), Duration::from_millis(2000))
    } else {
        Arc::new(
            ModbusTransport::new(
                config.plc.host.clone(),
                config.plc.port,
                config.plc.unit_id,
                Duration::from_millis(config.plc.timeout_ms),
            )
            .map_err(|e| CoreError::fatal(ErrorKind::Transport, e.to_string()))?,
        )
    };
    plc.connect().map_err(|e| CoreError::fatal(ErrorKind::Transport, e.to_string()))?;

    let monitor = Arc::new(Monitor::new(Arc::clone(&plc), config.monitor.starvation_threshold_g));
    monitor.start();

    let analysis = Arc::new(
        AnalysisClient::new(config.analysis.base_url.clone(), Duration::from_millis(config.analysis.timeout_ms))
            .map_err(|e| CoreError::fatal(ErrorKind::Transport, e.to_string()))?,
    );

    // `LearningMatrix` applies one shared attempt/round budget to every
    // cell; coarse-time and fine-time share the same default, and
    // adaptive learning's round budget is the matrix's round budget.
    let matrix = Arc::new(LearningMatrix::new(
        config.budget.coarse_time_max_attempts,
        config.budget.adaptive_rounds,
        args.target_weight,
    ));
    let (events_tx, events_rx) = mpsc::channel();
    let aggregator = Arc::new(LearningStateAggregator::new(matrix, events_tx));

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            warn!("received shutdown signal, cancelling session");
            cancel.store(true, Ordering::SeqCst);
        })
        .map_err(|e| CoreError::fatal(ErrorKind::Transport, format!("failed to install signal handler: {e}")))?;
    }

    let ctx = Arc::new(StageContext {
        plc: Arc::clone(&plc),
        monitor: Arc::clone(&monitor),
        analysis,
        aggregator: Arc::clone(&aggregator),
        sleeper: Arc::new(RealSleeper),
        cancel: Arc::clone(&cancel),
        budget: config.budget.clone(),
    });

    CoarseTimeController::start_session(&ctx, args.target_weight, args.initial_coarse_speed)
        .map_err(|e| CoreError::fatal(ErrorKind::Transport, e.to_string()))?;

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("session cancelled by operator");
            break;
        }
        match events_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => log_event(&event),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if aggregator.is_all_completed() {
            info!("all hoppers reached a terminal stage outcome");
            break;
        }
    }

    let (successes, failures, total) = aggregator.counts();
    info!(successes, failures, total, "session finished");

    monitor.shutdown();
    plc.disconnect().map_err(|e| CoreError::fatal(ErrorKind::Transport, e.to_string()))?;
    Ok(())
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::BucketCompleted { hopper, stage, params } => {
            info!(%hopper, %stage, ?params, "stage completed successfully");
        }
        CoreEvent::BucketFailed { hopper, stage, message } => {
            warn!(%hopper, %stage, message, "stage failed");
        }
        CoreEvent::ProgressUpdate { hopper, stage, attempt, measurement } => {
            tracing::debug!(%hopper, %stage, attempt, ?measurement, "progress update");
        }
        CoreEvent::LogMessage { hopper, message } => {
            info!(?hopper, message, "log");
        }
        CoreEvent::StarvationDetected { hopper, stage, is_production } => {
            warn!(%hopper, %stage, is_production, "starvation detected");
        }
        CoreEvent::BucketStateChanged { hopper, active } => {
            tracing::debug!(%hopper, active, "bucket state changed");
        }
        CoreEvent::AllCompleted => {
            info!("all hoppers completed");
        }
    }
}
