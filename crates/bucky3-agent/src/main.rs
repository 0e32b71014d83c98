//! # Agent Operating Model
//!
//! - **Supervised workers**: every configured module runs on its own named
//!   thread as an isolated failure domain. The main thread only supervises:
//!   start, watch, restart with crash-loop detection, shut down.
//!
//! - **Per-pair pipes**: each source fans its sample chunks out over one
//!   dedicated channel per destination. No pipe is ever shared between
//!   sources.
//!
//! - **Uniform timing**: every worker flushes on the same tick contract,
//!   doubling its flush interval on failure up to a cap and snapping back on
//!   success.
//!
//! - **Processing pipeline**: UDP / procfs / journal -> source worker ->
//!   pipes -> destination workers -> InfluxDB / Prometheus / Carbon /
//!   Elasticsearch.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use bucky3_agent::config::{ConfigFile, load_config, load_default_config};
use bucky3_agent::supervisor::{Supervisor, SupervisorOptions};
use bucky3_agent::wiring::build_workers;
use bucky3_core::clock::ClockSource;
use bucky3_core::worker::ShutdownFlag;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

#[derive(Parser, Debug)]
#[command(version, about = "bucky3 monitoring agent")]
struct Args {
    /// Path to the TOML config file; the built-in default config is used
    /// when omitted
    #[clap(value_name = "CONFIG", env = "BUCKY3_CONFIG")]
    config_file: Option<PathBuf>,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about processing; specify multiple times for more detail"
    )]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config_file {
        Some(path) => load_config(path),
        None => load_default_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the config file; this has to go to
            // stderr directly.
            eprintln!("bucky3: {e}");
            return ExitCode::FAILURE;
        }
    };

    enable_logging(&args, &config);
    debug!("{args:?}");

    let shutdown = ShutdownFlag::new();
    set_signal_handlers(&shutdown);

    let clock = ClockSource::System;
    let specs = match build_workers(&config, &clock) {
        Ok(specs) => specs,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut supervisor = Supervisor::new(specs, SupervisorOptions::default(), shutdown);
    let code = supervisor.run();
    info!("agent finished");
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn set_signal_handlers(shutdown: &ShutdownFlag) {
    // SIGINT/SIGTERM request an orderly shutdown.
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received termination signal, exiting...");
        flag.set();
    })
    .expect("error setting termination handler");

    // Live reload is deliberately unsupported; a stray HUP from a process
    // manager must not kill the agent. Restart it instead.
    #[cfg(unix)]
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
}

fn enable_logging(args: &Args, config: &ConfigFile) {
    let configured = match config.log_level.as_deref() {
        Some("trace") => tracing::Level::TRACE,
        Some("debug") => tracing::Level::DEBUG,
        Some("warn") => tracing::Level::WARN,
        Some("error") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => configured,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    // ureq and its TLS machinery are chatty; their "normal" level is WARN.
    let dependency_verbosity = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2.. => tracing::Level::TRACE,
    };

    let filters = filter::Targets::new()
        .with_target("ureq", dependency_verbosity)
        .with_target("rustls", dependency_verbosity)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
