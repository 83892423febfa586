//! Tracing setup for the node
//!
//! Human-readable output goes to stderr. A second layer appends one JSON
//! object per event to `<data>/logs/kiki.jsonl` for `jq`:
//!
//! ```bash
//! jq 'select(.level == "WARN")' ~/.kiki/logs/kiki.jsonl
//! ```

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "kiki.jsonl";

/// `RUST_LOG` wins over `debug` when set.
pub fn init(data_dir: &Path, debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = data_dir.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))
        .context("cannot open log file")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("logging already initialized")?;
    Ok(())
}
