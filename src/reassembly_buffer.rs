use std::cmp::Ordering;
use std::collections::BTreeMap;
use bytes::Bytes;
use tracing::trace;
use crate::serial::Serial;

#[derive(Debug, Eq, PartialEq)]
pub enum Arrival {
    /// The packet was the next expected one. It and all buffered packets that directly follow it
    ///  are consumed, and their non-empty payloads are returned in serial order.
    InOrder { deliverable: Vec<Bytes> },
    /// The packet is ahead of the frontier and was buffered until the gap before it is closed
    OutOfOrder,
    /// The packet was delivered or buffered before - it is discarded
    Duplicate,
}

/// Inbound reassembly: keeps track of the 'frontier', i.e. the next serial expected from the peer,
///  and buffers packets that arrive ahead of it.
///
/// All packets before the frontier were delivered (or were empty), so there are no gaps below
///  it. This makes the frontier the cumulative ack serial advertised to the peer.
///
/// NB: The buffer is keyed by raw serial, and draining looks up the frontier's exact key. That
///      keeps draining correct when serials wrap around, where ordering by raw value would not.
pub struct ReassemblyBuffer {
    next_expected: Serial,
    buffered: BTreeMap<u32, Bytes>,
}

impl ReassemblyBuffer {
    pub fn new(next_expected: Serial) -> ReassemblyBuffer {
        ReassemblyBuffer {
            next_expected,
            buffered: BTreeMap::default(),
        }
    }

    pub fn next_expected(&self) -> Serial {
        self.next_expected
    }

    /// re-positions the frontier, discarding everything that was buffered
    pub fn reset(&mut self, next_expected: Serial) {
        self.next_expected = next_expected;
        self.buffered.clear();
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn on_packet(&mut self, serial: Serial, payload: Bytes) -> Arrival {
        match serial.serial_cmp(&self.next_expected) {
            Ordering::Less => {
                trace!("packet #{} is below the frontier #{} - discarding duplicate", serial, self.next_expected);
                Arrival::Duplicate
            }
            Ordering::Greater => {
                if self.buffered.contains_key(&serial.to_raw()) {
                    trace!("packet #{} is buffered already - discarding duplicate", serial);
                    return Arrival::Duplicate;
                }
                self.buffered.insert(serial.to_raw(), payload);
                trace!("out of order packet #{}, {} packets buffered", serial, self.buffered.len());
                Arrival::OutOfOrder
            }
            Ordering::Equal => {
                let mut deliverable = Vec::new();
                if !payload.is_empty() {
                    deliverable.push(payload);
                }
                self.next_expected = self.next_expected.next();

                while let Some(buffered) = self.buffered.remove(&self.next_expected.to_raw()) {
                    trace!("draining buffered packet #{}", self.next_expected);
                    if !buffered.is_empty() {
                        deliverable.push(buffered);
                    }
                    self.next_expected = self.next_expected.next();
                }

                Arrival::InOrder { deliverable }
            }
        }
    }
}
