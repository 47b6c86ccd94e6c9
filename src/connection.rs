use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, info_span, trace, warn, Span};
use uuid::Uuid;

use crate::clock::LogicalClock;
use crate::config::{HandshakeCompletion, RudpConfig};
use crate::error::{ConnectionError, HandshakeError};
use crate::events::{ConnectionEvent, EventNotifier};
use crate::packet::{Packet, PacketFlags, PacketHeader};
use crate::reassembly_buffer::{Arrival, ReassemblyBuffer};
use crate::retransmit_queue::RetransmitQueue;
use crate::send_socket::SendSocket;
use crate::serial::Serial;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    Closed,
}

#[derive(Default, Debug)]
pub struct ConnectionStats {
    resend_count: AtomicU64,
    delivered_count: AtomicU64,
    duplicate_count: AtomicU64,
}

pub(crate) enum Command {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// An application's handle to a connection.
///
/// All protocol state is owned by a task that runs in the background, and the handle talks to it
///  through channels. Dropping the handle closes the connection.
pub struct Connection {
    id: Uuid,
    peer_addr: SocketAddr,
    max_payload_len: usize,
    commands: mpsc::UnboundedSender<Command>,
    received: mpsc::UnboundedReceiver<Bytes>,
    events: EventNotifier<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{id:{},peer:{:?},state:{:?}}}", self.id, self.peer_addr, self.state())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connection {
    /// Creates a connection's handle together with the driver that owns its state, and the
    ///  sender through which raw inbound datagrams are passed to the driver.
    ///
    /// `remote_sync_serial` is the serial of a SYNC that was already received from the peer, i.e.
    ///  it is present for the responding side of a handshake.
    pub(crate) fn new(
        config: Arc<RudpConfig>,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        local_serial: Serial,
        remote_sync_serial: Option<Serial>,
    ) -> (Connection, ConnectionDriver, mpsc::UnboundedSender<Bytes>) {
        let id = Uuid::new_v4();
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        let (command_sender, commands) = mpsc::unbounded_channel();
        let (delivered, received) = mpsc::unbounded_channel();
        let (state_sender, state) = watch::channel(ConnectionState::Handshaking);
        let (shutdown_sender, shutdown) = watch::channel(false);
        let shutdown_sender = Arc::new(shutdown_sender);

        let events = EventNotifier::new(config.event_channel_capacity);
        let stats = Arc::new(ConnectionStats::default());

        let next_expected = remote_sync_serial
            .map(|s| s.next())
            .unwrap_or(Serial::ZERO);

        let inner = ConnectionInner {
            peer_addr,
            send_socket,
            local_serial,
            reassembly_buffer: ReassemblyBuffer::new(next_expected),
            retransmit_queue: RetransmitQueue::new(config.initial_resend_timeout, config.max_resend_timeout),
            window_size: config.window_size,
            now: 0,
            last_sent_at: Instant::now(),
            delivered,
            events: events.clone(),
            stats: stats.clone(),
            state: state_sender,
            config: config.clone(),
        };

        let connection = Connection {
            id,
            peer_addr,
            max_payload_len: config.max_payload_len(),
            commands: command_sender,
            received,
            events,
            stats,
            state,
            shutdown: shutdown_sender.clone(),
        };

        let driver = ConnectionDriver {
            id,
            inner,
            inbound,
            commands,
            shutdown,
            shutdown_sender,
            on_close: None,
        };

        (connection, driver, inbound_sender)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Sends a payload to the peer, returning after it was handed to the socket.
    ///
    /// An empty payload is accepted and ignored. If the socket reports an error, the packet is
    ///  still registered for resending, and the error is returned.
    ///
    /// Payloads passed before the handshake completes are held back and sent afterwards.
    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.max_payload_len {
            bail!("payload of {} bytes exceeds the maximum of {} bytes", payload.len(), self.max_payload_len);
        }

        let (reply, reply_receiver) = oneshot::channel();
        self.commands.send(Command::Send {
            payload: Bytes::copy_from_slice(payload),
            reply,
        }).map_err(|_| ConnectionError::Closed)?;

        reply_receiver.await
            .map_err(|_| ConnectionError::Closed)?
    }

    /// Waits for the next payload from the peer, in the order they were sent. Returns `None`
    ///  after the connection is closed and all payloads received before that were consumed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.received.recv().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn wait_established(&self) -> anyhow::Result<()> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Established => return Ok(()),
                ConnectionState::Closed => return Err(ConnectionError::Closed.into()),
                ConnectionState::Handshaking => {}
            }
            state.changed().await
                .map_err(|_| ConnectionError::Closed)?;
        }
    }

    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        // an error means that the driver is gone, which implies 'closed'
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Closes the connection. This is idempotent, and it is done implicitly when the handle is
    ///  dropped. Unacknowledged packets are discarded, they are not flushed.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("closing connection {} to {:?}", self.id, self.peer_addr);
        }
    }

    /// number of packet retransmissions (not distinct packets)
    pub fn resend_count(&self) -> u64 {
        self.stats.resend_count.load(Ordering::Acquire)
    }

    pub fn delivered_count(&self) -> u64 {
        self.stats.delivered_count.load(Ordering::Acquire)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.stats.duplicate_count.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn event_notifier(&self) -> EventNotifier<ConnectionEvent> {
        self.events.clone()
    }
}

/// A connection's protocol state. It is owned by a single task, so none of it is synchronized.
struct ConnectionInner {
    config: Arc<RudpConfig>,
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,

    /// serial for the next packet that occupies a place in the sequence space
    local_serial: Serial,
    /// holds the frontier, i.e. the next serial expected from the peer
    reassembly_buffer: ReassemblyBuffer,
    retransmit_queue: RetransmitQueue,
    window_size: u16,

    /// logical time, advanced by the resend clock
    now: u64,
    last_sent_at: Instant,

    delivered: mpsc::UnboundedSender<Bytes>,
    events: EventNotifier<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionInner {
    fn remote_ack_serial(&self) -> Serial {
        self.reassembly_buffer.next_expected()
    }

    async fn transmit(&mut self, serial: Serial, flags: PacketFlags, payload: Bytes) -> std::io::Result<()> {
        let packet = Packet {
            header: PacketHeader {
                serial,
                ack_serial: self.remote_ack_serial(),
                flags,
                window_size: self.window_size,
            },
            payload,
        };
        trace!("sending packet #{} (ack #{}, {:?}) with {} bytes payload", serial, packet.header.ack_serial, flags, packet.payload.len());

        let result = self.send_socket.do_send_packet(self.peer_addr, &packet.encode()).await;
        self.last_sent_at = Instant::now();
        result
    }

    async fn send_sync(&mut self) {
        let serial = self.local_serial.post_increment();
        self.events.send_event(ConnectionEvent::HandshakeStarted { local_serial: serial });

        // a SYNC is not resent: if it is lost, the handshake times out
        if let Err(e) = self.transmit(serial, PacketFlags::SYNC | PacketFlags::ACK, Bytes::new()).await {
            warn!("error sending SYNC to {:?}: {}", self.peer_addr, e);
        }
    }

    /// A bare ACK carries the current local serial without consuming it, and it is never
    ///  registered for resending
    async fn send_bare_ack(&mut self) {
        match self.transmit(self.local_serial, PacketFlags::ACK, Bytes::new()).await {
            Ok(()) => self.events.send_event(ConnectionEvent::BareAckSent { ack_serial: self.remote_ack_serial() }),
            Err(e) => debug!("error sending ACK to {:?}: {}", self.peer_addr, e),
        }
    }

    async fn send_data(&mut self, payload: Bytes) -> anyhow::Result<()> {
        if payload.is_empty() {
            trace!("empty payload - nothing to send");
            return Ok(());
        }

        let serial = self.local_serial.post_increment();
        let result = self.transmit(serial, PacketFlags::ACK, payload.clone()).await;
        // registered regardless of the outcome, so a failed send is made up for by a resend
        self.retransmit_queue.push(serial, PacketFlags::ACK, payload.clone(), self.now);

        match result {
            Ok(()) => {
                self.events.send_event(ConnectionEvent::PacketSent { serial, payload_len: payload.len() });
                Ok(())
            }
            Err(e) => {
                warn!("error sending packet #{} to {:?}: {}", serial, self.peer_addr, e);
                self.events.send_event(ConnectionEvent::SendFailed { serial, error: e.to_string() });
                Err(e.into())
            }
        }
    }

    fn decode(&self, datagram: Bytes) -> Option<Packet> {
        let len = datagram.len();
        match Packet::decode(datagram) {
            Ok(packet) => {
                trace!("received packet #{} (ack #{}, {:?}) with {} bytes payload", packet.header.serial, packet.header.ack_serial, packet.header.flags, packet.payload.len());
                self.events.send_event(ConnectionEvent::PacketReceived {
                    serial: packet.header.serial,
                    ack_serial: packet.header.ack_serial,
                    payload_len: packet.payload.len(),
                });
                Some(packet)
            }
            Err(e) => {
                debug!("dropping malformed datagram from {:?}: {}", self.peer_addr, e);
                self.events.send_event(ConnectionEvent::MalformedPacket { len });
                None
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        let is_bare_ack = packet.is_bare_ack();
        let Packet { header, payload } = packet;

        if !is_bare_ack {
            match self.reassembly_buffer.on_packet(header.serial, payload) {
                Arrival::InOrder { deliverable } => {
                    for payload in deliverable {
                        self.stats.delivered_count.fetch_add(1, Ordering::AcqRel);
                        self.events.send_event(ConnectionEvent::Delivered { payload_len: payload.len() });
                        if self.delivered.send(payload).is_err() {
                            trace!("application dropped its receiver - discarding payload");
                        }
                    }
                }
                Arrival::OutOfOrder => {
                    self.events.send_event(ConnectionEvent::OutOfOrder {
                        serial: header.serial,
                        num_buffered: self.reassembly_buffer.len(),
                    });
                }
                Arrival::Duplicate => {
                    self.stats.duplicate_count.fetch_add(1, Ordering::AcqRel);
                    self.events.send_event(ConnectionEvent::Duplicate { serial: header.serial });
                }
            }
        }

        // FINISH and the window size are transmitted but not interpreted
        let num_acked = self.retransmit_queue.on_ack(header.ack_serial);
        if num_acked > 0 {
            self.events.send_event(ConnectionEvent::Acked { up_to: header.ack_serial, num_acked });
        }
    }

    async fn on_tick(&mut self, now: u64) {
        self.now = now;
        for packet in self.retransmit_queue.collect_due(now) {
            debug!("resending packet #{}, next resend after {} ticks", packet.serial, packet.resend_timeout);
            self.stats.resend_count.fetch_add(1, Ordering::AcqRel);
            self.events.send_event(ConnectionEvent::Resent { serial: packet.serial, resend_timeout: packet.resend_timeout });

            if let Err(e) = self.transmit(packet.serial, packet.flags, packet.payload).await {
                warn!("error resending packet #{} to {:?}: {}", packet.serial, self.peer_addr, e);
            }
        }
    }
}

/// Drives a connection: it performs the handshake and then runs the connection's event loop. It is
///  moved into the connection's task.
pub(crate) struct ConnectionDriver {
    id: Uuid,
    inner: ConnectionInner,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    shutdown_sender: Arc<watch::Sender<bool>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionDriver {
    pub(crate) fn span(&self) -> Span {
        info_span!("connection", peer = %self.inner.peer_addr, id = %self.id)
    }

    /// registers a callback that is invoked once when the connection closes
    pub(crate) fn on_close(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_close = Some(Box::new(f));
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// waits for the next well-formed inbound packet, or `None` if the connection is closed
    async fn next_packet(&mut self) -> Option<Packet> {
        loop {
            if self.is_shut_down() {
                return None;
            }

            select! {
                _ = self.shutdown.changed() => return None,
                datagram = self.inbound.recv() => {
                    let datagram = datagram?;
                    if let Some(packet) = self.inner.decode(datagram) {
                        return Some(packet);
                    }
                }
            }
        }
    }

    fn is_acceptable_completion(&self, packet: &Packet) -> bool {
        match self.inner.config.handshake_completion {
            HandshakeCompletion::AnyPacket => true,
            HandshakeCompletion::RequireAck => packet.header.flags.contains(PacketFlags::ACK),
        }
    }

    fn fail_handshake(&mut self, error: HandshakeError) -> Result<(), HandshakeError> {
        warn!("handshake failed: {}", error);
        self.inner.events.send_event(ConnectionEvent::HandshakeFailed { reason: error.to_string() });
        self.close();
        Err(error)
    }

    fn establish(&mut self) {
        info!("connection established");
        self.inner.state.send_replace(ConnectionState::Established);
        self.inner.events.send_event(ConnectionEvent::HandshakeDone { remote_ack_serial: self.inner.remote_ack_serial() });
    }

    /// The initiating side's handshake: send a SYNC, and wait for the peer's first packet.
    pub(crate) async fn initiate_handshake(&mut self) -> Result<(), HandshakeError> {
        debug!("initiating handshake");
        self.inner.send_sync().await;

        let packet = match timeout(self.inner.config.handshake_timeout, self.next_packet()).await {
            Err(_) => return self.fail_handshake(HandshakeError::Timeout),
            Ok(None) => return self.fail_handshake(HandshakeError::Closed),
            Ok(Some(packet)) => packet,
        };

        if !self.is_acceptable_completion(&packet) {
            return self.fail_handshake(HandshakeError::MissingAck);
        }

        self.inner.reassembly_buffer.reset(packet.header.serial.next());
        self.inner.retransmit_queue.on_ack(packet.header.ack_serial);
        self.establish();
        self.inner.send_bare_ack().await;
        Ok(())
    }

    /// The responding side's handshake. The peer's SYNC was received already, so this sends a
    ///  SYNC and waits for the first packet that is not a duplicate of the peer's SYNC. That packet
    ///  completes the handshake and is then processed like any other packet, so a data packet
    ///  that overtook (or replaced) a lost ACK is not lost.
    pub(crate) async fn respond_handshake(&mut self) -> Result<(), HandshakeError> {
        debug!("responding to handshake");
        self.inner.send_sync().await;

        let deadline = self.inner.config.responder_handshake_timeout
            .map(|t| Instant::now() + t);

        let packet = loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, self.next_packet()).await {
                    Ok(next) => next,
                    Err(_) => return self.fail_handshake(HandshakeError::Timeout),
                },
                None => self.next_packet().await,
            };

            let Some(packet) = next else {
                return self.fail_handshake(HandshakeError::Closed);
            };

            if packet.header.flags.contains(PacketFlags::SYNC) && packet.header.serial.is_before(&self.inner.remote_ack_serial()) {
                debug!("duplicate SYNC #{} during handshake - ignoring", packet.header.serial);
                continue;
            }
            break packet;
        };

        if !self.is_acceptable_completion(&packet) {
            return self.fail_handshake(HandshakeError::MissingAck);
        }

        self.establish();
        self.inner.on_packet(packet);
        Ok(())
    }

    pub(crate) async fn run_responder(mut self) {
        if self.respond_handshake().await.is_ok() {
            self.run().await;
        }
    }

    /// The event loop of an established connection. It returns when the connection is closed,
    ///  either through its handle or because the inbound side went away.
    pub(crate) async fn run(mut self) {
        let idle_ack_interval = self.inner.config.idle_ack_interval;
        let mut clock = LogicalClock::new(self.inner.config.resend_tick_interval);

        let idle_ack = sleep_until(self.inner.last_sent_at + idle_ack_interval);
        tokio::pin!(idle_ack);

        loop {
            if self.is_shut_down() {
                break;
            }

            select! {
                _ = self.shutdown.changed() => {
                    debug!("shutdown requested");
                    break;
                }
                datagram = self.inbound.recv() => {
                    match datagram {
                        Some(datagram) => {
                            if let Some(packet) = self.inner.decode(datagram) {
                                self.inner.on_packet(packet);
                            }
                        }
                        None => {
                            debug!("inbound channel closed");
                            break;
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Send { payload, reply }) => {
                            let result = self.inner.send_data(payload).await;
                            let _ = reply.send(result);
                        }
                        None => {
                            debug!("all handles are gone");
                            break;
                        }
                    }
                }
                now = clock.tick() => {
                    self.inner.on_tick(now).await;
                }
                _ = &mut idle_ack => {
                    trace!("idle - sending ACK");
                    self.inner.send_bare_ack().await;
                }
            }

            idle_ack.as_mut().reset(self.inner.last_sent_at + idle_ack_interval);
        }

        self.close();
    }

    /// Idempotent. Unacknowledged and buffered packets are dropped along with the driver.
    fn close(&mut self) {
        if *self.inner.state.borrow() == ConnectionState::Closed {
            return;
        }

        info!("connection closed");
        self.inner.state.send_replace(ConnectionState::Closed);
        self.shutdown_sender.send_replace(true);
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.inner.events.send_event(ConnectionEvent::Closed);
    }
}
