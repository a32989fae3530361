pub mod config;
pub mod initialization;
pub mod logging_system;
pub mod pipeline;
pub mod shutdown;

pub use config::{Config, ConfigError, LogLevel};
pub use initialization::{InitializationError, LogDirective};
pub use logging_system::{LoggingSystem, setup_logging_safe};
pub use pipeline::{InputRecord, TelemetryPipeline, parse_input_line, run_input_loop};
pub use shutdown::{ShutdownSignal, wait_for_signal};

use crate::buffer::FlushOutcome;
use anyhow::Context;
use clap::CommandFactory;
use std::process;
use tokio::io::BufReader;
use tracing::{error, info, warn};

/// How the application loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    InputClosed { tracked: usize },
    Signalled(ShutdownSignal),
}

pub struct App {
    config: Config,
    pipeline: TelemetryPipeline,
}

impl App {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args(args).context("Failed to load configuration")?;
        Self::from_config(config)
    }

    /// Must be called from within a tokio runtime.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        if let Err(e) = setup_logging_safe(config.log_level) {
            eprintln!("Warning: {e}, continuing without structured logging");
        }

        info!("Starting telemetry-channel v{}", env!("CARGO_PKG_VERSION"));
        info!(
            endpoint = %config.endpoint,
            batch_size = config.batch_size,
            batch_interval_ms = config.batch_interval_ms,
            disk_retry = config.disk_retry_enabled,
            storage_dir = %config.disk.storage_dir.display(),
            "Configuration loaded"
        );

        let pipeline = TelemetryPipeline::from_config(&config)
            .context("Failed to build telemetry pipeline")?;
        Ok(Self { config, pipeline })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &TelemetryPipeline {
        &self.pipeline
    }

    /// Read records from stdin until EOF or a termination signal.
    ///
    /// EOF flushes the buffer through the network path. A signal takes the
    /// synchronous crash path instead, since the process is about to exit.
    pub async fn run(self) -> anyhow::Result<RunOutcome> {
        let stdin = BufReader::new(tokio::io::stdin());

        let outcome = tokio::select! {
            result = run_input_loop(&self.pipeline, stdin) => {
                let tracked = result?;
                match self.pipeline.flush().await {
                    Ok(FlushOutcome::Sent(sent)) => {
                        info!(status = sent.status, "Final batch sent");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Final flush failed"),
                }
                RunOutcome::InputClosed { tracked }
            }
            signal = wait_for_signal() => {
                let signal = signal.context("Failed to listen for shutdown signals")?;
                if let FlushOutcome::PersistedOnCrash { items } = self.pipeline.flush_on_crash() {
                    info!(items, "Buffered telemetry handed to crash path");
                }
                RunOutcome::Signalled(signal)
            }
        };

        self.pipeline.shutdown();
        info!("telemetry-channel stopped.");
        Ok(outcome)
    }
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// Main entry point for the application
pub async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("telemetry-channel {}", get_version());
        return Ok(());
    }

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        Config::command().print_help()?;
        return Ok(());
    }

    let app = App::from_args(args)?;
    match app.run().await {
        // The stdin reader may still be parked on a blocking read.
        Ok(RunOutcome::Signalled(_)) => process::exit(0),
        Ok(RunOutcome::InputClosed { .. }) => Ok(()),
        Err(e) => {
            error!("Application error: {e:#}");
            process::exit(1);
        }
    }
}
