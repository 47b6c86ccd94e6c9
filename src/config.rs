use std::time::Duration;
use anyhow::bail;
use crate::packet::PacketHeader;

/// Determines which inbound packet completes a handshake. This is part of the wire
///  compatibility contract: both peers should be configured identically.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeCompletion {
    /// The first packet received from the peer completes the handshake, regardless of its flags
    AnyPacket,
    /// The first packet received from the peer must carry the ACK flag, otherwise the handshake
    ///  fails and the connection is closed
    RequireAck,
}

#[derive(Clone, Debug)]
pub struct RudpConfig {
    /// The initiator gives up if the peer does not respond within this time
    pub handshake_timeout: Duration,

    /// The responder side of a handshake waits for the initiator's follow-up packet. `None` means
    ///  it waits indefinitely, i.e. a silent initiator leaves a half-open connection on the
    ///  server until it is closed explicitly.
    pub responder_handshake_timeout: Option<Duration>,

    pub handshake_completion: HandshakeCompletion,

    /// Interval between two logical clock ticks. Every tick, all unacknowledged packets are
    ///  checked for being due for a resend.
    pub resend_tick_interval: Duration,

    /// A bare ACK is sent if nothing else was sent for this long
    pub idle_ack_interval: Duration,

    /// Number of logical ticks a packet waits for its acknowledgement before it is sent again.
    ///  This doubles with every resend of the same packet.
    pub initial_resend_timeout: u64,
    /// Upper bound for the doubling resend timeout (in logical ticks), or `None` for unbounded
    ///  doubling
    pub max_resend_timeout: Option<u64>,

    /// This value is sent in every packet header. It is not interpreted by the receiver, there
    ///  is no flow control.
    pub window_size: u16,

    /// Size of the receive buffer for a single datagram. Datagrams are expected to fit into a
    ///  single network-layer packet, so payloads should stay well below this.
    pub max_datagram_size: usize,

    /// Capacity of the diagnostic event channels. Subscribers that fall behind by more than this
    ///  number of events lose the oldest ones.
    pub event_channel_capacity: usize,
}

impl Default for RudpConfig {
    fn default() -> Self {
        RudpConfig {
            handshake_timeout: Duration::from_secs(4),
            responder_handshake_timeout: None,
            handshake_completion: HandshakeCompletion::RequireAck,
            resend_tick_interval: Duration::from_millis(100),
            idle_ack_interval: Duration::from_millis(100),
            initial_resend_timeout: 3,
            max_resend_timeout: None,
            window_size: 0,
            max_datagram_size: 1500,
            event_channel_capacity: 1024,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must not be zero");
        }
        if self.responder_handshake_timeout == Some(Duration::ZERO) {
            bail!("responder handshake timeout must not be zero");
        }
        if self.resend_tick_interval.is_zero() {
            bail!("resend tick interval must not be zero");
        }
        if self.idle_ack_interval.is_zero() {
            bail!("idle ack interval must not be zero");
        }
        if self.initial_resend_timeout == 0 {
            bail!("initial resend timeout must be at least one tick");
        }
        if let Some(max) = self.max_resend_timeout {
            if max < self.initial_resend_timeout {
                bail!("maximum resend timeout {} is below the initial resend timeout {}", max, self.initial_resend_timeout);
            }
        }
        if self.max_datagram_size <= PacketHeader::SERIALIZED_LEN {
            bail!("datagram size {} leaves no room for payload", self.max_datagram_size);
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must not be zero");
        }
        Ok(())
    }

    /// The largest payload that fits into a single datagram
    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN
    }
}
