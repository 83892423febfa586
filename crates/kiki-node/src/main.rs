//! Kiki node
//!
//! Runs one node: loads (or creates) the identity in the data directory,
//! reconciles the store, serves the HTTP surface, and pulls from known peers
//! every `sync_interval_secs`.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on the default port with data in ~/.kiki
//! kiki
//!
//! # Another node on the same machine
//! kiki --port 8004 --data /tmp/kiki-b
//!
//! # Post as the local identity
//! curl -X POST localhost:8003/letter \
//!   -d '{"content_kind":"share-text","data":"hello #kiki","to":["public"]}' \
//!   -H 'content-type: application/json'
//!
//! # Pull from a peer
//! curl -X POST localhost:8003/sync -d '{"address":"localhost:8004"}' \
//!   -H 'content-type: application/json'
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 startup or config failure, 2 port in use.

mod logging;
mod server;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use kiki_core::{setup, Feed, FeedService, HttpTransport, Synchronizer};

use server::AppState;

/// Kiki - federated sealed-envelope feed node
#[derive(Parser, Debug)]
#[command(name = "kiki")]
#[command(version)]
#[command(about = "Kiki - federated sealed-envelope feed node")]
struct Cli {
    /// Port for the HTTP surface
    #[arg(short, long, env = "KIKI_PORT", default_value_t = 8003)]
    port: u16,

    /// Data directory (default: ~/.kiki)
    #[arg(short, long, env = "KIKI_DATA")]
    data: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

/// Get the default data directory (~/.kiki)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiki")
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let port_in_use = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::AddrInUse)
    });
    if port_in_use {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("kiki: {:#}", e);
            exit_code_for(&e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data.unwrap_or_else(default_data_dir);
    logging::init(&data_dir, cli.debug)?;
    info!("Starting kiki v{}", env!("CARGO_PKG_VERSION"));

    let setup = setup(&data_dir).context("failed to load identity and settings")?;
    let settings = setup.context.settings.clone();
    let feed = Feed::open(&setup).context("failed to open store")?;
    let handle = FeedService::spawn(feed).context("failed to start feed writer")?;

    let report = handle.reconcile().await.context("startup reconcile failed")?;
    info!(
        purged = report.purged,
        opened = report.opened,
        evicted = report.evicted,
        "store reconciled"
    );
    if setup.first_start && settings.create_friends_key_on_setup {
        handle
            .add_friends_key()
            .await
            .context("failed to create friends key")?;
    }

    let transport = HttpTransport::new(Duration::from_secs(settings.request_timeout_secs))
        .context("failed to build HTTP client")?;
    let sync = Arc::new(Synchronizer::new(
        handle.clone(),
        Arc::new(transport),
        &settings,
    )?);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        identity = %setup.context.identity.public(),
        data = %data_dir.display(),
        "listening"
    );

    let periodic = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.run_periodic().await })
    };

    let app = server::router(AppState {
        feed: handle,
        sync,
    });
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    periodic.abort();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
