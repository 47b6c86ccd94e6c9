use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::serial::Serial;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u8 {
        const SYNC = 0b001;
        const FINISH = 0b010;
        const ACK = 0b100;
    }
}

/// The fixed-size header at the start of every datagram, all numbers little endian:
///
/// ```ascii
///  0: serial (u32)
///  4: ack serial (u32) - the next serial the sender expects from the receiver
///  8: flags (u8)
///  9: window size (u16) - reserved, not interpreted by the receiver
/// 11: payload
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub serial: Serial,
    pub ack_serial: Serial,
    pub flags: PacketFlags,
    pub window_size: u16,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 2*size_of::<u32>() + size_of::<u8>() + size_of::<u16>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.serial.to_raw());
        buf.put_u32_le(self.ack_serial.to_raw());
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.window_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet header requires {} bytes, datagram has {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        Ok(PacketHeader {
            serial: Serial::from_raw(buf.get_u32_le()),
            ack_serial: Serial::from_raw(buf.get_u32_le()),
            // unknown flag bits are preserved but not interpreted
            flags: PacketFlags::from_bits_retain(buf.get_u8()),
            window_size: buf.get_u16_le(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.payload.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// NB: The payload shares memory with the datagram rather than copying it
    pub fn decode(mut datagram: Bytes) -> anyhow::Result<Packet> {
        let header = PacketHeader::deser(&mut datagram)?;
        Ok(Packet {
            header,
            payload: datagram,
        })
    }

    /// A bare ACK carries no payload and no SYNC flag. It does not occupy a serial, its only
    ///  purpose is to advertise the sender's current ack serial.
    pub fn is_bare_ack(&self) -> bool {
        self.payload.is_empty() && !self.header.flags.contains(PacketFlags::SYNC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn packet(serial: u32, ack_serial: u32, flags: PacketFlags, window_size: u16, payload: &[u8]) -> Packet {
        Packet {
            header: PacketHeader {
                serial: Serial::from_raw(serial),
                ack_serial: Serial::from_raw(ack_serial),
                flags,
                window_size,
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[rstest]
    #[case::bare_ack(packet(1, 2, PacketFlags::ACK, 0, b""), vec![1,0,0,0, 2,0,0,0, 4, 0,0])]
    #[case::sync_ack(packet(0x01020304, 0, PacketFlags::SYNC | PacketFlags::ACK, 0, b""), vec![4,3,2,1, 0,0,0,0, 5, 0,0])]
    #[case::data(packet(7, 0xffff_ffff, PacketFlags::ACK, 0x1234, b"abc"), vec![7,0,0,0, 255,255,255,255, 4, 0x34,0x12, b'a',b'b',b'c'])]
    #[case::finish(packet(0, 0, PacketFlags::FINISH, 0, b"x"), vec![0,0,0,0, 0,0,0,0, 2, 0,0, b'x'])]
    fn test_encode(#[case] packet: Packet, #[case] expected: Vec<u8>) {
        assert_eq!(packet.encode().as_ref(), expected.as_slice());
        assert_eq!(Packet::decode(Bytes::from(expected)).unwrap(), packet);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![1])]
    #[case::ten_bytes(vec![0; 10])]
    fn test_decode_too_short(#[case] datagram: Vec<u8>) {
        assert!(Packet::decode(Bytes::from(datagram)).is_err());
    }

    #[test]
    fn test_decode_unknown_flags() {
        let decoded = Packet::decode(Bytes::from(vec![0,0,0,0, 0,0,0,0, 0b1000_0100, 0,0])).unwrap();
        assert!(decoded.header.flags.contains(PacketFlags::ACK));
        assert!(!decoded.header.flags.contains(PacketFlags::SYNC));
        assert!(decoded.payload.is_empty());
    }

    #[rstest]
    #[case::bare(packet(1, 1, PacketFlags::ACK, 0, b""), true)]
    #[case::no_flags(packet(1, 1, PacketFlags::empty(), 0, b""), true)]
    #[case::sync(packet(1, 1, PacketFlags::SYNC | PacketFlags::ACK, 0, b""), false)]
    #[case::data(packet(1, 1, PacketFlags::ACK, 0, b"a"), false)]
    fn test_is_bare_ack(#[case] packet: Packet, #[case] expected: bool) {
        assert_eq!(packet.is_bare_ack(), expected);
    }
}
