//! dprint-editor-client
//!
//! Formats one file through a dprint editor-service daemon and prints the
//! result to stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dprint_editor_client::config::ServiceConfig;
use dprint_editor_client::host::StaticHost;
use dprint_editor_client::lifecycle::{ServiceLifecycle, ServiceState};
use dprint_editor_client::models::CharRange;

/// Environment variable naming a client settings file.
const CONFIG_ENV: &str = "DPRINT_CLIENT_CONFIG";

#[derive(Debug, Parser)]
#[command(name = "dprint-editor-client")]
#[command(version)]
#[command(about = "Format a file through the dprint editor service", long_about = None)]
struct Args {
    /// dprint executable
    executable: PathBuf,

    /// dprint configuration file
    config: PathBuf,

    /// File to format
    file: PathBuf,

    /// Ask dprint for verbose output
    #[arg(long)]
    verbose: bool,

    /// Format only `<start>:<end>`, in UTF-16 code units. Repeatable.
    #[arg(long = "range", value_name = "START:END", value_parser = parse_range)]
    ranges: Vec<CharRange>,
}

/// `start:end` in UTF-16 code units.
fn parse_range(raw: &str) -> Result<CharRange, String> {
    let (start, end) = raw
        .split_once(':')
        .ok_or_else(|| format!("range '{}' is not <start>:<end>", raw))?;
    let start: usize = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid range start in '{}': {}", raw, e))?;
    let end: usize = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid range end in '{}': {}", raw, e))?;
    if end < start {
        return Err(format!("range '{}' ends before it starts", raw));
    }
    Ok(start..end)
}

fn load_config(verbose: bool) -> Result<ServiceConfig> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => ServiceConfig::load(Path::new(&path))?,
        None => ServiceConfig::default(),
    };
    config.verbose |= verbose;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dprint_editor_client=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.verbose)?;

    let file = std::fs::canonicalize(&args.file)
        .with_context(|| format!("Failed to resolve {}", args.file.display()))?;
    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    tracing::info!(
        "Starting dprint-editor-client v{}",
        env!("CARGO_PKG_VERSION")
    );
    let host = Arc::new(
        StaticHost::new(&args.executable, &args.config).with_open_files(vec![file.clone()]),
    );
    let lifecycle = ServiceLifecycle::with_daemon(host, config);

    let result = run(&lifecycle, &file, &content, &args.ranges).await;
    lifecycle.destroy().await;
    result
}

async fn run(
    lifecycle: &ServiceLifecycle,
    file: &Path,
    content: &str,
    ranges: &[CharRange],
) -> Result<()> {
    if !lifecycle.initialise().await {
        match lifecycle.state() {
            ServiceState::Error(reason) => bail!("dprint editor service failed to start: {}", reason),
            state => bail!("dprint editor service is {}", state.name()),
        }
    }

    match lifecycle.can_format(file).await {
        Some(true) => {}
        Some(false) => bail!("dprint cannot format {}", file.display()),
        None => bail!("dprint gave no answer for {}", file.display()),
    }

    let outcome = if ranges.is_empty() {
        lifecycle
            .format(file, content, lifecycle.next_format_id())
            .await
    } else {
        lifecycle.format_ranges(file, content, ranges).await
    };
    let result = outcome.with_context(|| format!("dprint did not format {}", file.display()))?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(result.content_or(content).as_bytes()).await?;
    stdout.flush().await?;

    if let Some(reason) = result.error {
        bail!("dprint failed to format {}: {}", file.display(), reason);
    }
    Ok(())
}
