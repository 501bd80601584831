#[cfg(test)] use mockall::automock;
use crate::connection::connection_state::{ConnectionOptions, ConnectionState};

/// The upper layer that S3TP delivers reassembled messages and notifications to.
///
/// NB: Callbacks are made from S3TP's worker threads, and an implementation must not block in
///      them for long. Calling back into S3TP from inside a callback is allowed.
#[cfg_attr(test, automock)]
pub trait ApplicationLayer: Send + Sync {
    /// An error is logged and the message is dropped - it is not redelivered.
    fn deliver_to_application(&self, port: u8, message: Vec<u8>) -> anyhow::Result<()>;

    fn on_connection_state_changed(&self, port: u8, state: ConnectionState);

    fn on_link_status_changed(&self, is_available: bool);
}

/// The parameters an application binds a local port with: messages are sent to `remote_port` on
///  virtual channel `channel`. Connections opened on the port use `options`, and so do connections
///  accepted on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortBinding {
    pub channel: u8,
    pub remote_port: u8,
    pub options: ConnectionOptions,
}

impl PortBinding {
    pub fn new(channel: u8, remote_port: u8) -> PortBinding {
        PortBinding {
            channel,
            remote_port,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(self, options: ConnectionOptions) -> PortBinding {
        PortBinding { options, ..self }
    }
}
