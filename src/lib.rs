//! S3TP is a transport protocol for a single narrow-bandwidth, lossy link, e.g. a satellite
//!  modem. It multiplexes up to 128 application ports over the link, and provides per-port
//!  ordering, fragmentation and reassembly of large messages, integrity checking, and optionally
//!  reliable delivery through connections with a handshake, acknowledgements and retransmission.
//!
//! ## Design goals
//!
//! * Messages, not streams: the application hands over and receives defined-length chunks of
//!    data. Messages larger than a packet are split into fragments and reassembled by the receiver.
//! * Ports are independent: a large message on one port must not delay traffic on other ports
//!    longer than necessary, so the transmitter serves ports round-robin
//! * Datagrams are the default. A port with an open connection gets reliable, in-sequence delivery
//!    instead, with per-connection options for retransmission and selective acknowledgement
//! * The link's bandwidth is precious: the header is small and has a fixed size, and there is no
//!    traffic apart from what the application sends plus acknowledgements and retransmissions
//! * The link corrupts bits: every packet carries a CRC, and length prefixes on byte streams are
//!    written redundantly so that a single corrupted copy does not lose frame boundaries
//! * Link outages are expected and temporary: while the link is down, packets stay queued and
//!    connections are not timed out
//!
//! Explicitly *not* goals: congestion control, encryption, addressing beyond the 7 bit port space,
//!  routing over several hops.
//!
//! ## Header
//!
//! All packets share a 12 byte header - all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: CRC-16 (u16) over all bytes after this field
//!  2: transmit sequence (u16), per destination port
//!  4: PDU length (14 bits) and message type (2 bits): 0 datagram, 1 connection
//!  6: fragment sequence (u8), per destination port and message type
//!  7: destination port (7 bits) and 'more fragments' flag (high bit)
//!  8: source port (7 bits)
//!  9: flags: SYN, ACK, FIN, RST, CTRL, DATA
//! 10: reliability sequence (u8), per connection
//! 11: cumulative ack (u8), per connection
//! ```
//!
//! See [wire::packet_header::PacketHeader] for details.
//!
//! ## Connections
//!
//! A connection is opened with a three-way handshake (SYN, SYN+ACK, ACK) and closed with FIN and
//!  FIN+ACK. RST aborts a connection immediately. Every packet of a connection carries the
//!  cumulative ack of its sender, and SYN, DATA and FIN packets consume a reliability sequence
//!  number. A receiver that got packets beyond a gap reports them in a CTRL packet whose PDU is a
//!  list of received sequence number ranges (SACK), see [wire::sack::SackRanges].
//!
//! ## Threads
//!
//! The protocol engine ([protocol::S3tp]) runs three worker threads: the Tx worker that drains
//!  the shared send queue into the link, the Rx consumer that delivers reassembled messages to the
//!  application, and a timer that drives retransmission. The link driver and the application
//!  call into the engine from their own threads.

pub mod application;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod priority_queue;
pub mod protocol;
pub mod rx;
pub mod safe_converter;
pub mod sequence;
pub mod test_util;
pub mod tx;
pub mod wire;
