use clap::Parser;
use rpc_keeper_server::{RpcServer, ServiceRegistry};
use rpc_keeper_shared::defaults;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rpc-keeper-server")]
#[command(about = "Reference RPC server for rpc-keeper", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = defaults::ADDRESS)]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let server = RpcServer::bind(&cli.listen, ServiceRegistry::with_defaults()).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        signal.cancel();
    });

    server.serve(shutdown).await
}
