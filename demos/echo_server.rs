use clap::Parser;
use clap_derive::Parser;
use rudp_stream::{listen_with_config, Connection, RudpConfig};
use tokio::select;
use tracing::{info, warn, Level};

/// Accepts connections and echoes every payload back to its sender
#[derive(Parser)]
struct Args {
    listen_address: String,

    /// give up on initiators that do not complete the handshake within this many seconds
    #[clap(long)]
    handshake_timeout_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = RudpConfig {
        responder_handshake_timeout: args.handshake_timeout_secs.map(std::time::Duration::from_secs),
        ..RudpConfig::default()
    };

    let mut server = listen_with_config(args.listen_address.as_str(), config).await?;
    info!("echo server listening on {:?}", server.local_addr());

    loop {
        select! {
            connection = server.accept() => {
                match connection {
                    Some(connection) => { tokio::spawn(echo(connection)); }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                server.close();
            }
        }
    }
    Ok(())
}

async fn echo(mut connection: Connection) {
    info!("new connection from {:?}", connection.peer_addr());
    while let Some(payload) = connection.recv().await {
        if let Err(e) = connection.send(&payload).await {
            warn!("error echoing to {:?}: {}", connection.peer_addr(), e);
        }
    }
    info!("connection from {:?} closed", connection.peer_addr());
}
