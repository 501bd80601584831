use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_ARC};
use crate::error::{S3tpError, S3tpResult};
use crate::safe_converter::PrecheckedCast;
use crate::wire::packet_header::{PacketFlags, PacketHeader};

/// CRC-16 with generator polynomial 0x8005
const CRC_16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// A packet is a header and its PDU.
///
/// Packets are moved between queues and have exactly one owner at a time. The PDU is immutable
///  and reference counted, so keeping a copy for retransmission does not copy payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
    /// the virtual channel this packet travels on - link metadata, not part of the wire format
    pub channel: u8,
}

impl Packet {
    pub fn new(mut header: PacketHeader, payload: Bytes, channel: u8) -> Packet {
        debug_assert!(payload.len() <= PacketHeader::MAX_PDU_LEN);
        header.pdu_len = payload.len().prechecked_cast();
        Packet {
            header,
            payload,
            channel,
        }
    }

    pub fn wire_len(&self) -> usize {
        PacketHeader::SERIALIZED_LEN + self.payload.len()
    }

    pub fn port(&self) -> u8 {
        self.header.dst_port
    }

    pub fn has_flags(&self, flags: PacketFlags) -> bool {
        self.header.flags.contains(flags)
    }

    pub fn is_final_fragment(&self) -> bool {
        !self.header.more_fragments
    }

    pub fn checksum(data: &[u8]) -> u16 {
        CRC_16.checksum(data)
    }

    /// serializes header and PDU, calculating the CRC over everything after the CRC field
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());

        let mut header = self.header.clone();
        header.crc = 0;
        header.pdu_len = self.payload.len().prechecked_cast();
        header.ser(&mut buf);
        buf.put_slice(&self.payload);

        let crc = Self::checksum(&buf[2..]);
        buf[..2].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Parses a frame received from the link. Structural problems are reported as
    ///  `MalformedPacket`, a CRC mismatch as `IntegrityError`.
    ///
    /// NB: The CRC is verified before header fields are interpreted, so a bit flip in the message
    ///      type or flags shows up as an integrity error rather than as a malformed packet
    pub fn decode(channel: u8, buf: &[u8]) -> S3tpResult<Packet> {
        if buf.len() < PacketHeader::SERIALIZED_LEN {
            return Err(S3tpError::malformed(format!("frame of {} bytes is shorter than a packet header", buf.len())));
        }

        let declared_len = PacketHeader::pdu_len_of(u16::from_be_bytes([buf[4], buf[5]])) as usize;
        let actual_len = buf.len() - PacketHeader::SERIALIZED_LEN;
        if declared_len != actual_len {
            return Err(S3tpError::malformed(format!("declared PDU length {} does not match the {} bytes received", declared_len, actual_len)));
        }

        let received = u16::from_be_bytes([buf[0], buf[1]]);
        let calculated = Self::checksum(&buf[2..]);
        if received != calculated {
            return Err(S3tpError::IntegrityError { received, calculated });
        }

        let mut parse_buf = &buf[..PacketHeader::SERIALIZED_LEN];
        let header = PacketHeader::deser(&mut parse_buf)?;

        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(&buf[PacketHeader::SERIALIZED_LEN..]),
            channel,
        })
    }
}
