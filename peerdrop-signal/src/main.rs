use clap::Parser;
use peerdrop_signal::{AppState, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerdrop-signal", version, about = "PeerDrop rendezvous server")]
struct SignalArgs {
    #[arg(long, env = "PEERDROP_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = SignalArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!("signal server starting on {}", args.bind_address);
    if let Err(err) = serve(listener, AppState::new()).await {
        warn!("signal server exited: {}", err);
    }
}
