use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, Instrument};

use crate::config::RudpConfig;
use crate::connection::Connection;
use crate::error::is_transient_recv_error;
use crate::events::{ConnectionEvent, EventNotifier};
use crate::send_socket::ConnectedUdpSocket;
use crate::serial::Serial;

/// Connects to a server with default configuration, see [connect_with_config]
pub async fn connect(addr: impl ToSocketAddrs) -> anyhow::Result<Connection> {
    connect_with_config(addr, RudpConfig::default()).await
}

/// Opens a connection to a server, returning after the handshake completed.
///
/// The connection gets a UDP socket of its own on an ephemeral port. A failed handshake is
///  returned as a [crate::HandshakeError] wrapped in `anyhow::Error`.
pub async fn connect_with_config(addr: impl ToSocketAddrs, config: RudpConfig) -> anyhow::Result<Connection> {
    config.validate()?;

    let peer_addr = lookup_host(addr).await?
        .next()
        .ok_or_else(|| anyhow!("address does not resolve to a socket address"))?;

    let bind_addr = if peer_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = Arc::new(UdpSocket::bind(SocketAddr::from_str(bind_addr)?).await?);
    socket.connect(peer_addr).await?;
    debug!("connecting to {:?} from {:?}", peer_addr, socket.local_addr()?);

    let config = Arc::new(config);
    let (connection, mut driver, inbound) = Connection::new(
        config.clone(),
        peer_addr,
        Arc::new(ConnectedUdpSocket(socket.clone())),
        Serial::random(),
        None,
    );

    let span = driver.span();
    tokio::spawn(recv_loop(socket, inbound, connection.subscribe_shutdown(), connection.event_notifier(), config.max_datagram_size)
        .instrument(span.clone()));

    driver.initiate_handshake()
        .instrument(span.clone())
        .await?;

    tokio::spawn(driver.run().instrument(span));
    Ok(connection)
}

/// Receives datagrams from the connection's socket until the connection is closed. A socket error
///  terminates the loop, which in turn closes the connection.
async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    events: EventNotifier<ConnectionEvent>,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];

    trace!("starting UDP receive loop");

    loop {
        if *shutdown.borrow() {
            break;
        }

        select! {
            r = shutdown.changed() => {
                if r.is_err() {
                    break;
                }
            }
            r = socket.recv(&mut buf) => {
                match r {
                    Ok(len) => {
                        if inbound.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                            break;
                        }
                    }
                    Err(e) if is_transient_recv_error(&e) => {
                        debug!(error = ?e, "transient error receiving from datagram socket");
                    }
                    Err(e) => {
                        error!(error = ?e, "error receiving from datagram socket");
                        events.send_event(ConnectionEvent::SocketError { error: e.to_string() });
                        break;
                    }
                }
            }
        }
    }

    trace!("UDP receive loop terminated");
}
