use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use rudp_stream::{connect_with_config, RudpConfig};
use tracing::{info, Level};

/// Sends numbered messages to an echo server and checks that they come back in order
#[derive(Parser)]
struct Args {
    server_address: String,

    #[clap(short, long, default_value_t = 100)]
    num_messages: u32,

    #[clap(long, default_value_t = 4)]
    handshake_timeout_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = RudpConfig {
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
        ..RudpConfig::default()
    };

    let mut connection = connect_with_config(args.server_address.as_str(), config).await?;
    info!("connected to {:?}", connection.peer_addr());

    for i in 0..args.num_messages {
        connection.send(format!("message #{}", i).as_bytes()).await?;
    }

    for i in 0..args.num_messages {
        let Some(echoed) = connection.recv().await else {
            anyhow::bail!("connection closed after {} echoes", i);
        };
        let expected = format!("message #{}", i);
        if echoed.as_ref() != expected.as_bytes() {
            anyhow::bail!("expected {:?}, received {:?}", expected, String::from_utf8_lossy(&echoed));
        }
    }

    info!("received {} echoes in order, {} resends", args.num_messages, connection.resend_count());
    connection.close();
    Ok(())
}
