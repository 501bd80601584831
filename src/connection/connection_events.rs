#[cfg(test)] use mockall::automock;
use crate::connection::connection_state::{ConnectionOptions, ConnectionState};
use crate::wire::packet::Packet;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(StateChangedData),
    /// the connection's outbound queue has packets for the transmitter
    OutboundAvailable { local_port: u8 },
    /// the connection's inbound queue has in-sequence packets for reassembly
    InboundAvailable { local_port: u8 },
    /// A connection packet arrived for a port without a connection, and the manager answers it
    ///  with a reset. The reply is fully addressed, it only needs a transmit sequence.
    Rejected { local_port: u8, reply: Packet },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateChangedData {
    pub local_port: u8,
    pub remote_port: u8,
    pub old_state: ConnectionState,
    pub new_state: ConnectionState,
}

impl ConnectionEvent {
    pub fn local_port(&self) -> u8 {
        match self {
            ConnectionEvent::StateChanged(data) => data.local_port,
            ConnectionEvent::OutboundAvailable { local_port } => *local_port,
            ConnectionEvent::InboundAvailable { local_port } => *local_port,
            ConnectionEvent::Rejected { local_port, .. } => *local_port,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectionEvent::StateChanged(StateChangedData { new_state: ConnectionState::Disconnected, .. }))
    }
}

/// The single consumer of a [crate::connection::connection_manager::ConnectionManager]'s events.
///
/// NB: The manager calls its listener without holding any of its locks, so implementations may
///      call back into the manager
#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync {
    fn on_connection_event(&self, event: ConnectionEvent);

    /// Called for a SYN on a port without a connection. `Some` accepts the connection with the
    ///  returned options, `None` refuses it.
    fn accept_connection(&self, local_port: u8, remote_port: u8) -> Option<ConnectionOptions>;
}
