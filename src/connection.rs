//! Reliable sessions on top of the packet layer.
//!
//! A [connection::Connection] is the state machine for one local port talking to one remote port:
//!  three-way handshake, cumulative and selective acknowledgements, retransmission with
//!  exponential back-off, FIN / RST teardown. It is purely reactive and never touches a thread
//!  or the link; everything it wants to have sent goes into its outbound queue, everything it
//!  received in order goes into its inbound queue, and it raises [connection_events::ConnectionEvent]s
//!  so that its owner can move packets along.
//!
//! The [connection_manager::ConnectionManager] owns all connections, demultiplexes inbound
//!  connection packets by destination port and fans events out to a single listener.

pub mod connection;
pub mod connection_events;
pub mod connection_manager;
pub mod connection_state;
pub mod retransmission;
