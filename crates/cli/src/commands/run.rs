//! Run command - drive the stream engine from a line-oriented input

use anyhow::Context;
use clap::{Args, ValueEnum};
use processor::dispatch::{FileDeadLetterQueue, FileSink, OutputFilter, Sink, SinkEncoding};
use processor::pipeline::StreamEngineBuilder;
use processor::OutputKind;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry_config::PipelineConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Input file with one JSON reading per line (stdin when omitted)
    #[arg(long, short, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Destination for window snapshots (stdout when omitted)
    #[arg(long, value_name = "FILE")]
    storage_out: Option<PathBuf>,

    /// Encoding of the snapshot output
    #[arg(long, value_enum, default_value_t = StorageFormat::Json)]
    storage_format: StorageFormat,

    /// Destination for alerts (stdout when omitted)
    #[arg(long, value_name = "FILE")]
    alerts_out: Option<PathBuf>,

    /// Destination for late readings (discarded after counting when omitted)
    #[arg(long, value_name = "FILE")]
    late_out: Option<PathBuf>,

    /// JSON-lines file receiving undeliverable outputs (kept in memory when omitted)
    #[arg(long, value_name = "FILE")]
    dead_letter: Option<PathBuf>,

    /// Print the Prometheus exposition to stderr on exit
    #[arg(long)]
    print_metrics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageFormat {
    /// One JSON snapshot per line
    Json,
    /// Time-series line protocol
    LineProtocol,
}

impl From<StorageFormat> for SinkEncoding {
    fn from(format: StorageFormat) -> Self {
        match format {
            StorageFormat::Json => SinkEncoding::JsonLines,
            StorageFormat::LineProtocol => SinkEncoding::LineProtocol,
        }
    }
}

impl RunCommand {
    pub async fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let config = PipelineConfig::load(config_path).context("failed to load configuration")?;

        let mut builder = StreamEngineBuilder::new().with_config(config);
        for sink in self.sinks().await? {
            builder = builder.with_sink(sink);
        }
        if let Some(path) = &self.dead_letter {
            builder = builder.with_dead_letter_queue(Arc::new(FileDeadLetterQueue::new(path)));
        }

        let mut engine = builder.start().context("failed to start stream engine")?;

        let input: Box<dyn AsyncRead + Unpin + Send> = match &self.input {
            Some(path) => Box::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdin()),
        };
        let mut lines = BufReader::new(input).lines();

        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        let mut line_number = 0u64;
        loop {
            tokio::select! {
                _ = &mut interrupt => {
                    info!("interrupt received, shutting down");
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read input")? else {
                        info!(lines = line_number, "end of input");
                        break;
                    };
                    line_number += 1;
                    let Some(raw) = parse_line(&line) else {
                        continue;
                    };
                    if let Err(err) = engine.submit(&raw).await {
                        warn!(line = line_number, error = %err, "engine stopped accepting input");
                        break;
                    }
                }
            }
        }

        let report = engine.shutdown().await.context("shutdown failed")?;
        eprintln!("{}", serde_json::to_string_pretty(&report)?);

        if self.print_metrics {
            eprint!("{}", engine.metrics_registry().encode()?);
        }
        Ok(())
    }

    async fn sinks(&self) -> anyhow::Result<Vec<Arc<dyn Sink>>> {
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        let storage_encoding = SinkEncoding::from(self.storage_format);

        match (&self.storage_out, &self.alerts_out) {
            (None, None) if storage_encoding == SinkEncoding::JsonLines => {
                sinks.push(Arc::new(FileSink::stdout(
                    "stdout",
                    OutputFilter::Only(vec![OutputKind::Snapshot, OutputKind::Alert]),
                    SinkEncoding::JsonLines,
                )));
            }
            (storage, alerts) => {
                sinks.push(
                    open_sink("storage", storage.as_deref(), OutputKind::Snapshot, storage_encoding)
                        .await?,
                );
                sinks.push(
                    open_sink("alerts", alerts.as_deref(), OutputKind::Alert, SinkEncoding::JsonLines)
                        .await?,
                );
            }
        }

        if let Some(path) = &self.late_out {
            sinks.push(
                open_sink("late", Some(path.as_path()), OutputKind::Late, SinkEncoding::JsonLines)
                    .await?,
            );
        }
        Ok(sinks)
    }
}

async fn open_sink(
    name: &str,
    path: Option<&Path>,
    kind: OutputKind,
    encoding: SinkEncoding,
) -> anyhow::Result<Arc<dyn Sink>> {
    let filter = OutputFilter::only(kind);
    let sink = match path {
        Some(path) => FileSink::create(name, path, filter, encoding)
            .await
            .with_context(|| format!("failed to open {name} output {}", path.display()))?,
        None => FileSink::stdout(name, filter, encoding),
    };
    Ok(Arc::new(sink))
}

/// Parse one input line; blank lines are skipped
///
/// A line that is not valid JSON is still submitted, as a JSON string, so
/// the normalizer counts it as a rejected reading.
fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}
