//! Sensor telemetry pipeline CLI
//!
//! Reads raw sensor readings (one JSON document per line), runs them through
//! the stream processor, and writes window snapshots, alerts, late readings,
//! and dead letters to JSON-lines files or stdout.

mod commands;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use commands::{RunCommand, ValidateCommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "telemetry-pipeline",
    version,
    about = "Stream processor for IoT sensor telemetry",
    long_about = "Windowed aggregation and anomaly detection for sensor readings.\n\n\
                  Readings are grouped per sensor and metric into event-time windows,\n\
                  closed by watermarks, and checked against configured anomaly rules."
)]
struct Cli {
    /// Configuration file (YAML); TELEMETRY_* environment variables override it
    #[arg(
        short,
        long,
        global = true,
        env = "TELEMETRY_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    /// Log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process readings until end of input or Ctrl-C
    #[command(name = "run", about = "Process readings from a file or stdin")]
    Run(RunCommand),

    /// Load and validate the configuration, then print it
    #[command(name = "validate", about = "Validate the configuration")]
    Validate(ValidateCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_format);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Run(cmd) => cmd.execute(cli.config.as_deref()).await,
        Commands::Validate(cmd) => cmd.execute(cli.config.as_deref()),
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "telemetry_pipeline=debug,processor=debug"
    } else {
        "telemetry_pipeline=info,processor=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Logs go to stderr so stdout stays free for JSON-lines output.
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
