use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::trace;
use crate::serial::Serial;

/// Diagnostic events of a single connection. They mirror what is logged through `tracing`, but
///  as a typed stream that observers can subscribe to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    HandshakeStarted { local_serial: Serial },
    HandshakeDone { remote_ack_serial: Serial },
    HandshakeFailed { reason: String },
    PacketSent { serial: Serial, payload_len: usize },
    BareAckSent { ack_serial: Serial },
    PacketReceived { serial: Serial, ack_serial: Serial, payload_len: usize },
    MalformedPacket { len: usize },
    Delivered { payload_len: usize },
    OutOfOrder { serial: Serial, num_buffered: usize },
    Duplicate { serial: Serial },
    Acked { up_to: Serial, num_acked: usize },
    Resent { serial: Serial, resend_timeout: u64 },
    SendFailed { serial: Serial, error: String },
    SocketError { error: String },
    Closed,
}

/// Diagnostic events of a listening endpoint
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    DatagramReceived { from: SocketAddr, len: usize },
    MalformedDatagram { from: SocketAddr, len: usize },
    UnsolicitedDatagram { from: SocketAddr },
    NewConnection { peer_addr: SocketAddr, remote_serial: Serial },
    ConnectionRemoved { peer_addr: SocketAddr },
    Fatal { error: String },
    Closed,
}

/// Publishing never blocks and never fails: events without a subscriber are dropped, and a
///  subscriber that lags behind loses the oldest events.
pub struct EventNotifier<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + std::fmt::Debug> EventNotifier<E> {
    pub fn new(capacity: usize) -> EventNotifier<E> {
        let (sender, _) = broadcast::channel(capacity);
        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl<E: Clone> Clone for EventNotifier<E> {
    fn clone(&self) -> Self {
        EventNotifier {
            sender: self.sender.clone(),
        }
    }
}
