//! Everything that goes over the link byte for byte: the packet header and its bit fields, the
//!  packet with its CRC, the payload of selective acknowledgements, and the redundant length
//!  record that frames packets on byte streams.

pub mod packet_header;
pub mod packet;
pub mod sack;
pub mod safe_length;
