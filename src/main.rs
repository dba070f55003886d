//! hopper - an in-process asynchronous job engine.
//!
//! Usage:
//!   hopper run <config>        Run the engine with the schedules from a config file
//!   hopper validate <config>   Validate a config file without running
//!   hopper next <expr>         Print upcoming fire times of a schedule expression

use clap::{Parser, Subcommand};
use hopper::{
    Engine, EngineConfig, HandlerError, JobContext, JobType, LoggingEventHandler, Schedule,
    YamlLoader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// hopper - an in-process asynchronous job engine
#[derive(Parser)]
#[command(name = "hopper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with the schedules declared in a config file
    Run {
        /// Path to the engine YAML config
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the number of workers
        #[arg(short = 'w', long)]
        workers: Option<usize>,
    },

    /// Validate a config file without running
    Validate {
        /// Path to the engine YAML config
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Print the upcoming fire times of a schedule expression
    Next {
        /// Cron expression, shortcut (@daily) or interval (@every 10s)
        #[arg(value_name = "EXPR")]
        expression: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// IANA timezone for cron expressions
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, workers } => {
            run_engine(config, workers).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Next {
            expression,
            count,
            timezone,
        } => {
            print_next(&expression, count, &timezone)?;
        }
    }

    Ok(())
}

/// Built-in handler for the `log` job type.
async fn log_payload(ctx: JobContext) -> Result<(), HandlerError> {
    info!(
        job_id = %ctx.job_id,
        attempt = ctx.attempt,
        payload = %ctx.payload,
        "log"
    );
    Ok(())
}

/// Run the engine until Ctrl+C.
async fn run_engine(
    path: PathBuf,
    workers: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading config from: {}", path.display());

    let mut config: EngineConfig = YamlLoader::load_engine_config(&path)?;
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let engine = Engine::from_config(&config)?;
    engine.events().register(Arc::new(LoggingEventHandler)).await;
    engine.register_fn("log", log_payload)?;

    for schedule in &config.schedules {
        if !engine.registry().contains(&JobType::new(&schedule.job_type)) {
            warn!(
                job_type = %schedule.job_type,
                "No handler registered, fired jobs will fail"
            );
        }
    }

    engine.start()?;
    info!(
        workers = config.workers,
        schedules = config.schedules.len(),
        "Engine running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let report = engine.shutdown().await?;
    if !report.workers_stopped {
        warn!(
            running = report.running.len(),
            "Shutdown timeout expired with jobs still running"
        );
    }
    if !report.is_clean() {
        warn!(
            ready = report.ready.len(),
            delayed = report.delayed.len(),
            "Unfinished jobs dropped at shutdown"
        );
    }

    info!("Goodbye!");
    Ok(())
}

/// Validate a config file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating config: {}", path.display());

    match YamlLoader::load_engine_config(&path) {
        Ok(config) => {
            info!(
                "Config is valid: {} worker(s), {} schedule(s)",
                config.workers,
                config.schedules.len()
            );
            for schedule in &config.schedules {
                info!("  - {} ({}): OK", schedule.job_type, schedule.schedule);
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print upcoming fire times of a schedule expression.
fn print_next(
    expression: &str,
    count: usize,
    timezone: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let schedule = Schedule::with_timezone(expression, timezone)?;
    for at in schedule.next_n(count)? {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}
