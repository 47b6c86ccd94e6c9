//! A reliable, ordered, connection-oriented byte-message transport on top of UDP.
//!
//! A server binds a UDP socket and accepts connections from any number of peers. A client opens a
//!  connection with a two-way handshake. Once established, both sides send payloads that the
//!  other side receives exactly once and in send order, regardless of loss, duplication or
//!  reordering of the underlying datagrams.
//!
//! Every datagram carries an 11 byte header (see [packet::PacketHeader]) followed by the payload.
//!  Each SYNC and each packet with a payload occupies a serial number, and every packet carries
//!  the sender's cumulative acknowledgement. Unacknowledged packets are resent with exponential
//!  backoff, based on a logical clock. Idle connections periodically send bare ACKs.
//!
//! NB: A bare ACK (no payload, no SYNC) carries the sender's next serial without occupying it,
//!      and receivers do not advance their frontier for it. Peers that assign a serial to their
//!      bare ACKs (including a handshake-completing ACK) are not wire compatible: the receiver
//!      waits for the data packet at that serial, which never comes.
//!
//! There is no congestion control and no flow control, and payloads must fit into a single
//!  datagram.

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod packet;
pub mod reassembly_buffer;
pub mod retransmit_queue;
pub mod send_socket;
pub mod serial;
pub mod server;

pub use client::{connect, connect_with_config};
pub use config::{HandshakeCompletion, RudpConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{ConnectionError, HandshakeError};
pub use events::{ConnectionEvent, ServerEvent};
pub use server::{listen, listen_with_config, Server};
