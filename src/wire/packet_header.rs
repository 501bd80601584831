use std::fmt::{Debug, Formatter};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::{S3tpError, S3tpResult};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Default, Debug)]
    pub struct PacketFlags: u8 {
        const SYN  = 0b0000_0001;
        const ACK  = 0b0000_0010;
        const FIN  = 0b0000_0100;
        const RST  = 0b0000_1000;
        /// the PDU is a selective acknowledgement rather than application data
        const CTRL = 0b0001_0000;
        /// the packet carries sequenced application data and consumes a reliability sequence number
        const DATA = 0b0010_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// unreliable, goes straight to reassembly
    Datagram = 0,
    /// belongs to a reliable connection and passes through the connection manager
    Connection = 1,
}

/// The packet header - all numbers in network byte order (BE):
///
/// ```ascii
///  0: crc (u16) - CRC-16/ARC over all bytes *after* this field, i.e. rest of header and PDU
///  2: seq (u16) - per-port transmit sequence, determines send order
///  4: length and type (u16):
///     * bit 0-13: PDU length
///     * bit 14-15: message type
///  6: port seq (u8) - per-port fragment sequence for reassembly
///  7: port and fragment flag (u8):
///     * bit 0-6: destination port
///     * bit 7: 'more fragments' flag
///  8: source port (u8) - bit 7 is reserved and must be 0
///  9: flags (u8) - SYN, ACK, FIN, RST, CTRL, DATA
/// 10: reliability sequence (u8)
/// 11: cumulative ack (u8) - the next reliability sequence number the sender expects
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub crc: u16,
    pub seq: u16,
    pub pdu_len: u16,
    pub message_type: MessageType,
    pub port_seq: u8,
    pub dst_port: u8,
    pub more_fragments: bool,
    pub src_port: u8,
    pub flags: PacketFlags,
    pub rel_seq: u8,
    pub ack: u8,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}->{} {:?} seq:{} frag:{}{} len:{} {:?} rel:{} ack:{}}}",
               self.src_port,
               self.dst_port,
               self.message_type,
               self.seq,
               self.port_seq,
               if self.more_fragments { "+" } else { "" },
               self.pdu_len,
               self.flags,
               self.rel_seq,
               self.ack,
        )
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 12;

    pub const MAX_PDU_LEN: usize = 0x3fff;
    pub const MAX_PORT: u8 = 0x7f;

    const MASK_LEN: u16 = 0x3fff;
    const SHIFT_TYPE: u16 = 14;
    const MASK_PORT: u8 = 0x7f;
    const FLAG_MORE_FRAGMENTS: u8 = 0x80;

    pub fn new(src_port: u8, dst_port: u8, message_type: MessageType) -> PacketHeader {
        PacketHeader {
            crc: 0,
            seq: 0,
            pdu_len: 0,
            message_type,
            port_seq: 0,
            dst_port,
            more_fragments: false,
            src_port,
            flags: PacketFlags::empty(),
            rel_seq: 0,
            ack: 0,
        }
    }

    pub fn length_and_type(&self) -> u16 {
        debug_assert!(self.pdu_len as usize <= Self::MAX_PDU_LEN);
        (u16::from(u8::from(self.message_type)) << Self::SHIFT_TYPE) | (self.pdu_len & Self::MASK_LEN)
    }

    pub fn port_and_frag(&self) -> u8 {
        debug_assert!(self.dst_port <= Self::MAX_PORT);
        let flag = if self.more_fragments { Self::FLAG_MORE_FRAGMENTS } else { 0 };
        (self.dst_port & Self::MASK_PORT) | flag
    }

    /// extracts the PDU length from a raw `length and type` field
    pub fn pdu_len_of(length_and_type: u16) -> u16 {
        length_and_type & Self::MASK_LEN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.src_port <= Self::MAX_PORT);

        buf.put_u16(self.crc);
        buf.put_u16(self.seq);
        buf.put_u16(self.length_and_type());
        buf.put_u8(self.port_seq);
        buf.put_u8(self.port_and_frag());
        buf.put_u8(self.src_port & Self::MASK_PORT);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.rel_seq);
        buf.put_u8(self.ack);
    }

    pub fn deser(buf: &mut impl Buf) -> S3tpResult<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(S3tpError::malformed(format!("header needs {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining())));
        }

        let crc = buf.get_u16();
        let seq = buf.get_u16();

        let length_and_type = buf.get_u16();
        let message_type = MessageType::try_from((length_and_type >> Self::SHIFT_TYPE) as u8)
            .map_err(|e| S3tpError::malformed(format!("unsupported message type {}", e.number)))?;

        let port_seq = buf.get_u8();
        let port_and_frag = buf.get_u8();

        let src_port = buf.get_u8();
        if src_port > Self::MAX_PORT {
            return Err(S3tpError::malformed(format!("reserved bit set in source port {:x}", src_port)));
        }

        let raw_flags = buf.get_u8();
        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or_else(|| S3tpError::malformed(format!("unsupported flags {:x}", raw_flags)))?;

        let rel_seq = buf.get_u8();
        let ack = buf.get_u8();

        Ok(PacketHeader {
            crc,
            seq,
            pdu_len: Self::pdu_len_of(length_and_type),
            message_type,
            port_seq,
            dst_port: port_and_frag & Self::MASK_PORT,
            more_fragments: port_and_frag & Self::FLAG_MORE_FRAGMENTS != 0,
            src_port,
            flags,
            rel_seq,
            ack,
        })
    }
}
