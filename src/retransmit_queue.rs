use std::collections::VecDeque;
use bytes::Bytes;
use tracing::trace;
use crate::packet::PacketFlags;
use crate::serial::Serial;

/// An outbound packet that was sent but not acknowledged by the peer yet
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnackedPacket {
    pub serial: Serial,
    pub flags: PacketFlags,
    pub payload: Bytes,
    /// logical tick of the most recent (re)transmission
    pub sent_tick: u64,
    /// number of logical ticks after `sent_tick` at which the packet is due for a resend
    pub resend_timeout: u64,
}

/// The packets a connection sent and is still waiting for the peer to acknowledge.
///
/// Serials are assigned in ascending order and packets are registered in that order, so the
///  queue is always sorted by serial. Acknowledgement is cumulative, which means that an ACK
///  removes a prefix of the queue.
pub struct RetransmitQueue {
    packets: VecDeque<UnackedPacket>,
    initial_resend_timeout: u64,
    max_resend_timeout: Option<u64>,
}

impl RetransmitQueue {
    pub fn new(initial_resend_timeout: u64, max_resend_timeout: Option<u64>) -> RetransmitQueue {
        RetransmitQueue {
            packets: VecDeque::new(),
            initial_resend_timeout,
            max_resend_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnackedPacket> {
        self.packets.iter()
    }

    pub fn push(&mut self, serial: Serial, flags: PacketFlags, payload: Bytes, now: u64) {
        if let Some(last) = self.packets.back() {
            debug_assert!(last.serial.is_before(&serial), "packets must be registered in serial order");
        }

        self.packets.push_back(UnackedPacket {
            serial,
            flags,
            payload,
            sent_tick: now,
            resend_timeout: self.initial_resend_timeout,
        });
    }

    /// Removes all packets with a serial before the peer's ack serial, returning the number of
    ///  removed packets
    pub fn on_ack(&mut self, peer_ack_serial: Serial) -> usize {
        let mut num_acked = 0;
        while let Some(front) = self.packets.front() {
            if !front.serial.is_before(&peer_ack_serial) {
                break;
            }
            trace!("acked #{}", front.serial);
            self.packets.pop_front();
            num_acked += 1;
        }
        num_acked
    }

    /// Checks *all* unacknowledged packets, returning those that are overdue. They are treated
    ///  as resent at `now`, and their resend timeout is doubled.
    pub fn collect_due(&mut self, now: u64) -> Vec<UnackedPacket> {
        let mut result = Vec::new();

        for packet in self.packets.iter_mut() {
            if now.saturating_sub(packet.sent_tick) <= packet.resend_timeout {
                continue;
            }

            packet.sent_tick = now;
            packet.resend_timeout = packet.resend_timeout.saturating_mul(2);
            if let Some(max) = self.max_resend_timeout {
                packet.resend_timeout = packet.resend_timeout.min(max);
            }

            result.push(packet.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn queue_with(serials: &[u32], now: u64) -> RetransmitQueue {
        let mut queue = RetransmitQueue::new(3, None);
        for &serial in serials {
            queue.push(Serial::from_raw(serial), PacketFlags::ACK, Bytes::from(vec![serial as u8]), now);
        }
        queue
    }

    fn serials(queue: &RetransmitQueue) -> Vec<u32> {
        queue.iter()
            .map(|p| p.serial.to_raw())
            .collect()
    }

    #[rstest]
    #[case::empty(vec![], 5, 0, vec![])]
    #[case::below_all(vec![4,5,6], 3, 0, vec![4,5,6])]
    #[case::at_first(vec![4,5,6], 4, 0, vec![4,5,6])]
    #[case::one(vec![4,5,6], 5, 1, vec![5,6])]
    #[case::two(vec![4,5,6], 6, 2, vec![6])]
    #[case::all(vec![4,5,6], 7, 3, vec![])]
    #[case::beyond_all(vec![4,5,6], 888, 3, vec![])]
    #[case::wrap_around(vec![u32::MAX-1, u32::MAX, 0, 1], 1, 3, vec![1])]
    fn test_on_ack(#[case] initial: Vec<u32>, #[case] peer_ack: u32, #[case] expected_num_acked: usize, #[case] expected: Vec<u32>) {
        let mut queue = queue_with(&initial, 0);
        assert_eq!(queue.on_ack(Serial::from_raw(peer_ack)), expected_num_acked);
        assert_eq!(serials(&queue), expected);
    }

    #[test]
    fn test_collect_due_not_before_timeout() {
        let mut queue = queue_with(&[1, 2], 10);
        assert!(queue.collect_due(10).is_empty());
        assert!(queue.collect_due(13).is_empty());

        let due = queue.collect_due(14);
        assert_eq!(due.iter().map(|p| p.serial.to_raw()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(due[0].payload.as_ref(), &[1u8]);
    }

    #[test]
    fn test_collect_due_doubles_timeout() {
        let mut queue = queue_with(&[1], 0);

        let mut resend_ticks = Vec::new();
        let mut timeouts = vec![queue.iter().next().unwrap().resend_timeout];
        for now in 0..=60 {
            if !queue.collect_due(now).is_empty() {
                resend_ticks.push(now);
                timeouts.push(queue.iter().next().unwrap().resend_timeout);
            }
        }

        assert_eq!(resend_ticks, vec![4, 11, 24, 49]);
        assert_eq!(timeouts, vec![3, 6, 12, 24, 48]);
        assert!(timeouts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_first_resend_before_twice_initial_timeout() {
        for initial_resend_timeout in 1..10 {
            let mut queue = RetransmitQueue::new(initial_resend_timeout, None);
            queue.push(Serial::from_raw(1), PacketFlags::ACK, Bytes::new(), 0);

            let first_resend = (0..=2*initial_resend_timeout)
                .find(|&now| !queue.collect_due(now).is_empty());
            assert!(first_resend.is_some());
        }
    }

    #[test]
    fn test_collect_due_respects_cap() {
        let mut queue = RetransmitQueue::new(3, Some(5));
        queue.push(Serial::from_raw(1), PacketFlags::ACK, Bytes::new(), 0);

        assert_eq!(queue.collect_due(4).len(), 1);
        assert_eq!(queue.iter().next().unwrap().resend_timeout, 5);
        assert_eq!(queue.collect_due(10).len(), 1);
        assert_eq!(queue.iter().next().unwrap().resend_timeout, 5);
    }

    #[test]
    fn test_collect_due_scans_every_packet() {
        let mut queue = queue_with(&[1], 0);
        queue.push(Serial::from_raw(2), PacketFlags::ACK, Bytes::new(), 2);
        queue.push(Serial::from_raw(3), PacketFlags::ACK, Bytes::new(), 0);

        let due = queue.collect_due(4);
        assert_eq!(due.iter().map(|p| p.serial.to_raw()).collect::<Vec<_>>(), vec![1, 3]);
    }
}
