use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::RudpConfig;
use crate::connection::Connection;
use crate::error::is_transient_recv_error;
use crate::events::{EventNotifier, ServerEvent};
use crate::packet::{Packet, PacketFlags};
use crate::serial::Serial;

/// Binds a UDP socket and starts accepting connections on it, with default configuration.
pub async fn listen(addr: impl ToSocketAddrs) -> anyhow::Result<Server> {
    listen_with_config(addr, RudpConfig::default()).await
}

pub async fn listen_with_config(addr: impl ToSocketAddrs, config: RudpConfig) -> anyhow::Result<Server> {
    config.validate()?;

    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    info!("listening on {:?}", local_addr);

    let events = EventNotifier::new(config.event_channel_capacity);
    let (cancel_sender, cancel_receiver) = broadcast::channel(1);
    let (new_connections_sender, new_connections) = mpsc::unbounded_channel();
    let (unregister_sender, unregister_receiver) = mpsc::unbounded_channel();

    let dispatcher = Dispatcher {
        config: Arc::new(config),
        socket,
        connections: FxHashMap::default(),
        new_connections: new_connections_sender,
        unregister_sender,
        events: events.clone(),
    };
    tokio::spawn(dispatcher.run(cancel_receiver, unregister_receiver)
        .instrument(tracing::info_span!("server", addr = %local_addr)));

    Ok(Server {
        local_addr,
        new_connections,
        events,
        cancel_sender,
    })
}

/// A listening endpoint. It accepts connections from any number of peers, and dispatches their
///  datagrams to the matching connection.
///
/// Closing the server (explicitly or by dropping it) stops the receive loop and closes all
///  connections that were accepted through it.
pub struct Server {
    local_addr: SocketAddr,
    new_connections: mpsc::UnboundedReceiver<Connection>,
    events: EventNotifier<ServerEvent>,
    cancel_sender: broadcast::Sender<()>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next connection a peer initiated. The returned connection may still be in
    ///  its handshake, see [Connection::wait_established].
    ///
    /// Returns `None` after the server was closed.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.new_connections.recv().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// idempotent
    pub fn close(&self) {
        // an error means that the receive loop terminated already
        let _ = self.cancel_sender.send(());
    }
}

struct ConnectionEntry {
    id: Uuid,
    inbound: mpsc::UnboundedSender<Bytes>,
}

/// Owns the socket's receiving side and the map of connections. It runs in a task of its own,
///  and it is the only place where the map is modified.
struct Dispatcher {
    config: Arc<RudpConfig>,
    socket: Arc<UdpSocket>,
    connections: FxHashMap<SocketAddr, ConnectionEntry>,
    new_connections: mpsc::UnboundedSender<Connection>,
    unregister_sender: mpsc::UnboundedSender<(SocketAddr, Uuid)>,
    events: EventNotifier<ServerEvent>,
}

impl Dispatcher {
    async fn run(mut self, mut cancel_receiver: broadcast::Receiver<()>, mut unregister_receiver: mpsc::UnboundedReceiver<(SocketAddr, Uuid)>) {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        trace!("starting UDP receive loop");

        loop {
            select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            self.on_datagram(Bytes::copy_from_slice(&buf[..len]), from);
                        }
                        Err(e) if is_transient_recv_error(&e) => {
                            debug!(error = ?e, "transient error receiving from datagram socket");
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket - shutting down");
                            self.events.send_event(ServerEvent::Fatal { error: e.to_string() });
                            break;
                        }
                    }
                }
                Some((peer_addr, id)) = unregister_receiver.recv() => {
                    self.unregister(peer_addr, id);
                }
                _ = cancel_receiver.recv() => {
                    debug!("server closed");
                    break;
                }
            }
        }

        info!("closing {} connections", self.connections.len());
        // dropping the inbound senders makes the connections close
        self.connections.clear();
        self.events.send_event(ServerEvent::Closed);
    }

    fn on_datagram(&mut self, datagram: Bytes, from: SocketAddr) {
        trace!("received {} bytes from {:?}", datagram.len(), from);
        self.events.send_event(ServerEvent::DatagramReceived { from, len: datagram.len() });

        if let Some(entry) = self.connections.get(&from) {
            if entry.inbound.send(datagram).is_err() {
                debug!("connection to {:?} is closing - dropping datagram", from);
            }
            return;
        }

        let len = datagram.len();
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("malformed datagram from {:?} - dropping: {}", from, e);
                self.events.send_event(ServerEvent::MalformedDatagram { from, len });
                return;
            }
        };

        if !packet.header.flags.contains(PacketFlags::SYNC) {
            debug!("datagram from {:?} without a connection and without SYNC - dropping", from);
            self.events.send_event(ServerEvent::UnsolicitedDatagram { from });
            return;
        }

        self.accept_connection(from, packet.header.serial);
    }

    fn accept_connection(&mut self, peer_addr: SocketAddr, remote_serial: Serial) {
        let (connection, mut driver, inbound) = Connection::new(
            self.config.clone(),
            peer_addr,
            Arc::new(self.socket.clone()),
            Serial::random(),
            Some(remote_serial),
        );

        let id = connection.id();
        let unregister_sender = self.unregister_sender.clone();
        driver.on_close(move || {
            let _ = unregister_sender.send((peer_addr, id));
        });

        info!("new connection from {:?} (remote serial #{})", peer_addr, remote_serial);
        self.connections.insert(peer_addr, ConnectionEntry { id, inbound });
        self.events.send_event(ServerEvent::NewConnection { peer_addr, remote_serial });

        let span = driver.span();
        tokio::spawn(driver.run_responder().instrument(span));

        if self.new_connections.send(connection).is_err() {
            warn!("no one is accepting connections - closing connection from {:?}", peer_addr);
        }
    }

    fn unregister(&mut self, peer_addr: SocketAddr, id: Uuid) {
        match self.connections.get(&peer_addr) {
            Some(entry) if entry.id == id => {
                debug!("removing connection to {:?}", peer_addr);
                self.connections.remove(&peer_addr);
                self.events.send_event(ServerEvent::ConnectionRemoved { peer_addr });
            }
            _ => {
                trace!("connection {} to {:?} was removed before", id, peer_addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::packet::PacketHeader;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(events: &mut broadcast::Receiver<ServerEvent>, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        }).await.unwrap()
    }

    fn datagram(serial: u32, ack_serial: u32, flags: PacketFlags, payload: &[u8]) -> Vec<u8> {
        Packet {
            header: PacketHeader {
                serial: Serial::from_raw(serial),
                ack_serial: Serial::from_raw(ack_serial),
                flags,
                window_size: 0,
            },
            payload: Bytes::copy_from_slice(payload),
        }.encode().to_vec()
    }

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 1500];
        let len = timeout(Duration::from_secs(5), socket.recv(&mut buf)).await.unwrap().unwrap();
        Packet::decode(Bytes::copy_from_slice(&buf[..len])).unwrap()
    }

    #[tokio::test]
    async fn test_close() {
        let mut server = listen("127.0.0.1:0").await.unwrap();
        let mut events = server.subscribe_events();

        server.close();
        server.close();

        assert_eq!(next_event(&mut events, |_| true).await, ServerEvent::Closed);
        assert!(server.accept().await.is_none());
        server.close();
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = RudpConfig {
            max_datagram_size: 5,
            ..RudpConfig::default()
        };
        assert!(listen_with_config("127.0.0.1:0", config).await.is_err());
    }

    #[tokio::test]
    async fn test_drops_datagrams_without_connection() {
        let server = listen("127.0.0.1:0").await.unwrap();
        let mut events = server.subscribe_events();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        peer.send_to(&[1, 2, 3], server.local_addr()).await.unwrap();
        assert_eq!(
            next_event(&mut events, |e| !matches!(e, ServerEvent::DatagramReceived { .. })).await,
            ServerEvent::MalformedDatagram { from: peer_addr, len: 3 });

        peer.send_to(&datagram(5, 0, PacketFlags::ACK, b"data"), server.local_addr()).await.unwrap();
        assert_eq!(
            next_event(&mut events, |e| !matches!(e, ServerEvent::DatagramReceived { .. })).await,
            ServerEvent::UnsolicitedDatagram { from: peer_addr });
    }

    #[tokio::test]
    async fn test_handshake_with_raw_peer() {
        let mut server = listen("127.0.0.1:0").await.unwrap();
        let mut events = server.subscribe_events();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(server.local_addr()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        peer.send(&datagram(77, 0, PacketFlags::SYNC | PacketFlags::ACK, b"")).await.unwrap();

        let mut connection = server.accept().await.unwrap();
        assert_eq!(connection.peer_addr(), peer_addr);
        assert_eq!(
            next_event(&mut events, |e| matches!(e, ServerEvent::NewConnection { .. })).await,
            ServerEvent::NewConnection { peer_addr, remote_serial: Serial::from_raw(77) });

        let sync = recv_packet(&peer).await;
        assert_eq!(sync.header.flags, PacketFlags::SYNC | PacketFlags::ACK);
        assert_eq!(sync.header.ack_serial, Serial::from_raw(78));
        assert!(sync.payload.is_empty());
        let server_serial = sync.header.serial;

        // a duplicate SYNC does not create another connection
        peer.send(&datagram(77, 0, PacketFlags::SYNC | PacketFlags::ACK, b"")).await.unwrap();
        peer.send(&datagram(78, server_serial.next().to_raw(), PacketFlags::ACK, b"")).await.unwrap();
        timeout(Duration::from_secs(5), connection.wait_established()).await.unwrap().unwrap();

        peer.send(&datagram(78, server_serial.next().to_raw(), PacketFlags::ACK, b"hi")).await.unwrap();
        assert_eq!(connection.recv().await.unwrap(), Bytes::from_static(b"hi"));

        connection.send(b"ho").await.unwrap();
        let data = loop {
            let packet = recv_packet(&peer).await;
            if !packet.payload.is_empty() {
                break packet;
            }
        };
        assert_eq!(data.header.serial, server_serial.next());
        assert_eq!(data.header.ack_serial, Serial::from_raw(79));
        assert_eq!(data.payload, Bytes::from_static(b"ho"));
    }

    #[tokio::test]
    async fn test_connection_close_unregisters() {
        let mut server = listen("127.0.0.1:0").await.unwrap();
        let mut events = server.subscribe_events();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        peer.send_to(&datagram(1, 0, PacketFlags::SYNC | PacketFlags::ACK, b""), server.local_addr()).await.unwrap();

        let connection = server.accept().await.unwrap();
        connection.close();

        assert_eq!(
            next_event(&mut events, |e| matches!(e, ServerEvent::ConnectionRemoved { .. })).await,
            ServerEvent::ConnectionRemoved { peer_addr });

        // the peer's old connection is gone, so a new SYNC starts a new one
        peer.send_to(&datagram(1000, 0, PacketFlags::SYNC | PacketFlags::ACK, b""), server.local_addr()).await.unwrap();
        let second = server.accept().await.unwrap();
        assert_ne!(second.id(), connection.id());
    }

    #[tokio::test]
    async fn test_close_closes_connections() {
        let mut server = listen("127.0.0.1:0").await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&datagram(1, 0, PacketFlags::SYNC | PacketFlags::ACK, b""), server.local_addr()).await.unwrap();
        let connection = server.accept().await.unwrap();

        server.close();
        timeout(Duration::from_secs(5), connection.wait_closed()).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
