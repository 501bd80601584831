use std::fmt::{Display, Formatter};
use bitflags::bitflags;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// initial and terminal state - a connection in this state is removed from its manager
    Disconnected,
    /// handshake in progress
    Connecting,
    Connected,
    /// RST is queued, waiting to be handed to the transmitter
    Resetting,
    /// FIN was sent, waiting for the peer's FIN+ACK
    Disconnecting,
}
impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Resetting => "RESETTING",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        write!(f, "{}", s)
    }
}

impl ConnectionState {
    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Resetting | ConnectionState::Disconnecting)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    /// sent the SYN
    Initiator,
    /// answered a SYN
    Responder,
}

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Default, Debug)]
    pub struct ConnectionOptions: u8 {
        /// resend unacknowledged packets after a timeout, resetting the connection after the
        ///  configured number of attempts
        const RETRANSMIT    = 0b0000_0001;
        /// report received packets beyond a gap to the peer so it resends only what is missing
        const SELECTIVE_ACK = 0b0000_0010;
    }
}
