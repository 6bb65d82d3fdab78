use clap::Parser;

use clawdis_gateway::{server::start_gateway, services::GatewayServices};

/// Local WebSocket gateway for Clawdis clients.
///
/// Binds loopback only; configuration beyond the listen address comes
/// from the environment (`CLAWDIS_GATEWAY_TOKEN`, `CLAWDIS_VERSION`,
/// `GIT_COMMIT`).
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Address to bind the WebSocket server to.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = clawdis_protocol::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    start_gateway(&args.bind, args.port, GatewayServices::noop()).await
}
