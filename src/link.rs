//! The boundary between the protocol engine and the physical link.
//!
//! The link is a lower layer: S3TP hands it complete encoded packets ('frames') tagged with a
//!  virtual channel number, and the link calls back into a [FrameHandler] for every received
//!  frame. The link signals loss of connectivity by rejecting frames with
//!  [LinkError::Unavailable], and by calling [FrameHandler::on_link_status_changed].
//!
//! [StreamLink] and [run_stream_receiver] implement a link on top of a byte stream (e.g. a serial
//!  line or a TCP socket to a ground station modem), delimiting frames by a redundant length prefix.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use crate::error::{LinkError, S3tpError};
use crate::wire::safe_length::{read_framed, write_framed};

#[cfg_attr(test, automock)]
pub trait LinkInterface: Send + Sync {
    /// Transmits a single frame on a virtual channel.
    ///
    /// NB: Implementations must not call back into the protocol engine from inside this call
    fn send_frame(&self, channel: u8, frame: &[u8]) -> Result<(), LinkError>;
}

#[cfg_attr(test, automock)]
pub trait FrameHandler: Send + Sync {
    fn on_frame_received(&self, channel: u8, frame: &[u8]);

    fn on_link_status_changed(&self, is_available: bool);
}

/// Sends frames over a byte stream. Each frame is written as a redundant length prefix, followed
///  by the channel number and the frame's bytes.
pub struct StreamLink<W: Write + Send> {
    writer: Mutex<W>,
    max_frame_len: usize,
}

impl<W: Write + Send> StreamLink<W> {
    pub fn new(writer: W, max_frame_len: usize) -> StreamLink<W> {
        StreamLink {
            writer: Mutex::new(writer),
            max_frame_len,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> LinkInterface for StreamLink<W> {
    fn send_frame(&self, channel: u8, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() > self.max_frame_len {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }

        let mut record = BytesMut::with_capacity(frame.len() + 1);
        record.put_u8(channel);
        record.put_slice(frame);

        let mut writer = self.writer.lock();
        write_framed(&mut *writer, &record)
            .map_err(|e| match e.kind() {
                ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected => LinkError::Unavailable,
                _ => LinkError::Io(e),
            })
    }
}

/// Reads frames written by a [StreamLink] and passes them to `handler`, until the stream ends,
///  `cancelled` is set, or frame boundaries are lost.
///
/// The handler is notified that the link is available when the loop starts, and that it is
///  unavailable when it ends.
pub fn run_stream_receiver(mut reader: impl Read, handler: &dyn FrameHandler, max_frame_len: usize, cancelled: &AtomicBool) -> anyhow::Result<()> {
    handler.on_link_status_changed(true);
    let result = receive_loop(&mut reader, handler, max_frame_len, cancelled);
    handler.on_link_status_changed(false);
    result
}

fn receive_loop(reader: &mut impl Read, handler: &dyn FrameHandler, max_frame_len: usize, cancelled: &AtomicBool) -> anyhow::Result<()> {
    while !cancelled.load(Ordering::Acquire) {
        let record = match read_framed(reader, max_frame_len + 1) {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("link stream closed by peer");
                return Ok(());
            }
            Err(e @ (S3tpError::CorruptLength | S3tpError::MessageTooLarge { .. })) => {
                return Err(anyhow::Error::new(e).context("lost frame boundaries on link stream"));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context("error reading from link stream"));
            }
        };

        let Some((&channel, frame)) = record.split_first() else {
            warn!("empty record on link stream - dropping");
            continue;
        };
        trace!("received frame of {} bytes on channel {}", frame.len(), channel);
        handler.on_frame_received(channel, frame);
    }
    debug!("link stream receiver cancelled");
    Ok(())
}
