use clap::Parser;
use rpc_keeper::{ConnectionConfig, ConnectionManager, Dialer, TcpDialer};
use rpc_keeper_shared::{defaults, methods, EchoReply, EchoRequest};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rpc-keeper")]
#[command(about = "Keep one RPC connection alive and call through it", long_about = None)]
struct Cli {
    /// Server address to dial
    #[arg(short, long, default_value = defaults::ADDRESS)]
    target: String,

    /// Remote method used as the health check
    #[arg(long, default_value = methods::HEALTH_PING)]
    healthcheck: String,

    #[arg(long, default_value_t = defaults::PROBE_INTERVAL_SECS)]
    probe_interval_secs: u64,

    #[arg(long, default_value_t = defaults::RECONNECT_DELAY_SECS)]
    reconnect_delay_secs: u64,

    /// Issue an Echo call this often
    #[arg(long, default_value_t = 10)]
    echo_every_secs: u64,

    #[arg(short, long, default_value = "hello")]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig {
        probe_interval: Duration::from_secs(cli.probe_interval_secs),
        reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
        ..ConnectionConfig::new(cli.target, cli.healthcheck)
    };

    // Without a first connection there is nothing to keep alive
    let manager = ConnectionManager::connect(TcpDialer::new(), config).await?;

    let config = manager.config();
    info!("rpc-keeper started");
    info!("  target: {} via {}", config.target, manager.transport());
    info!("  healthcheck: {} every {:?}", config.healthcheck_method, config.probe_interval);
    info!("  reconnect delay: {:?}", config.reconnect_delay);

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Can't listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };
    let every = Duration::from_secs(cli.echo_every_secs.max(1));
    let replies = echo_until(&manager, &cli.message, every, ctrl_c).await;

    manager.shutdown().await;
    info!("Stopped after {} echo repl(ies)", replies);
    Ok(())
}

/// Call `Echo.Echo` every `every` until `shutdown` resolves
///
/// A call blocked behind a reconnection is abandoned as soon as `shutdown`
/// resolves. Returns the number of successful replies.
async fn echo_until<D: Dialer>(
    manager: &ConnectionManager<D>,
    message: &str,
    every: Duration,
    shutdown: impl Future<Output = ()>,
) -> u64 {
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(every);
    let mut replies = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let request = EchoRequest::new(message);
        let call = manager.call::<EchoRequest, EchoReply>(methods::ECHO, &request);
        tokio::select! {
            _ = &mut shutdown => break,
            result = call => match result {
                Ok(reply) => {
                    replies += 1;
                    info!("Echo reply: {} ({})", reply.text, manager.state());
                }
                Err(e) => error!("Echo call failed: {}", e),
            },
        }
    }

    replies
}
