//! `crucible` — script service CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crucible_host::config::HostConfig;
use crucible_host::http::{serve, AppState};
use crucible_host::manager::ScriptManager;
use crucible_host::metrics::Metrics;
use crucible_lang::{codec, PoolConfig, TypeRegistry, VmPool};
use crucible_store::KvStore;

#[derive(Parser, Debug)]
#[command(name = "crucible", version, about = "Script compile-store-execute service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service.
    Serve(ServeArgs),

    /// Compile a script file and report the blob size.
    Check { file: PathBuf },

    /// Print a fresh script id.
    Id,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Directory for the storage engine's files.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8040")]
    listen: SocketAddr,

    /// Maximum number of concurrently live VMs.
    #[arg(long, default_value_t = crucible_lang::DEFAULT_LIMIT)]
    pool_limit: usize,

    /// Per-request deadline in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Check { file } => run_check(&file),
        Command::Id => {
            println!("{}", uuid::Uuid::now_v7().simple());
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = HostConfig {
        data_dir: args.data_dir,
        listen: args.listen,
        pool_limit: args.pool_limit,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..HostConfig::default()
    };
    let store = KvStore::open(&config.data_dir)
        .with_context(|| format!("opening store in {:?}", config.data_dir))?;
    let registry = TypeRegistry::with_defaults();
    let pool = VmPool::new(
        PoolConfig {
            limit: config.pool_limit,
        },
        registry,
    );
    let manager = Arc::new(ScriptManager::new(
        store,
        pool.clone(),
        Arc::new(Metrics::default()),
    ));
    let state = AppState::new(manager, &config);

    serve(config.listen, state, shutdown_signal()).await?;
    pool.shutdown();
    tracing::info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutting down");
}

fn run_check(file: &PathBuf) -> Result<()> {
    let source =
        std::fs::read_to_string(file).with_context(|| format!("reading {file:?}"))?;
    match codec::compile(&source) {
        Ok(blob) => {
            println!("{} compiled to {} bytes of bytecode", file.display(), blob.len());
            Ok(())
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
