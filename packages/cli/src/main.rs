use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use lightvm_host::{BridgeError, ClientConfig, Result, VmBytecode};
use lightvm_relay::{RelayClient, RelayConfig};
use tracing_subscriber::EnvFilter;

mod database;

use database::FileDatabase;

/// lightvm - run a light-client VM module
#[derive(Parser, Debug)]
#[command(name = "lightvm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// VM module: raw WebAssembly or a base64 text file
    #[arg(long)]
    vm: PathBuf,

    /// Chain specification file
    #[arg(long)]
    chain_spec: PathBuf,

    /// Database file; saves are written here and loaded on the next start
    #[arg(long)]
    database: Option<PathBuf>,

    /// Relay chain specification file
    #[arg(long)]
    relay_chain_spec: Option<PathBuf>,

    /// Maximum VM log level (0 disables VM logging)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=5))]
    max_log_level: Option<u32>,

    /// Run the VM on a worker thread behind the message relay
    #[arg(long)]
    relay: bool,

    /// Disable raw TCP connections
    #[arg(long)]
    no_tcp: bool,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read {} {}: {}", what, path.display(), e))
    })
}

fn client_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(read_text(&args.chain_spec, "chain spec")?)
        .with_tcp(!args.no_tcp)
        .with_best_block_callback(|number| tracing::info!(number, "best block"))
        .with_json_rpc_callback(|response| tracing::debug!(%response, "json-rpc response"));

    if let Some(path) = &args.relay_chain_spec {
        config = config.with_relay_chain_spec(read_text(path, "relay chain spec")?);
    }
    if let Some(level) = args.max_log_level {
        config = config.with_max_log_level(level);
    }
    if let Some(path) = &args.database {
        let database = FileDatabase::new(path);
        if let Some(content) = database.load()? {
            tracing::info!(path = %database.path().display(), "loaded database");
            config = config.with_database_content(content);
        }
        config = config.with_database_sink(Arc::new(database));
    }
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let bytecode = VmBytecode::from_file(&args.vm)?;
    let config = client_config(&args)?;

    if args.relay {
        run_relayed(bytecode, config).await
    } else {
        run_direct(bytecode, config).await
    }
}

async fn run_direct(bytecode: VmBytecode, config: ClientConfig) -> Result<()> {
    let controller = lightvm_host::start(&bytecode, config).await?;
    tracing::info!(session = %controller.session_id(), "VM started");

    let termination = controller.termination();
    tokio::pin!(termination);

    let reason = tokio::select! {
        reason = &mut termination => reason,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
            controller.shutdown();
            termination.await
        }
    };

    match reason {
        BridgeError::Terminated => Ok(()),
        reason => Err(reason),
    }
}

async fn run_relayed(bytecode: VmBytecode, config: ClientConfig) -> Result<()> {
    let mut client = RelayClient::start(bytecode, config, RelayConfig::default())?;
    tracing::info!("VM started on relay worker");

    tokio::select! {
        result = client.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
            client.shutdown();
            client.wait().await
        }
    }
}
