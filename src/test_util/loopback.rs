use std::sync::Weak;
use parking_lot::Mutex;
use tracing::trace;
use crate::error::LinkError;
use crate::link::{FrameHandler, LinkInterface};
use crate::wire::packet::Packet;

type DropPredicate = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// An in-memory link that hands every frame synchronously to the peer's [FrameHandler], with
///  hooks for simulating loss and outages. All frames handed to the link are recorded, including
///  those that are 'lost'.
pub struct LoopbackLink {
    peer: Mutex<Option<Weak<dyn FrameHandler>>>,
    sent: Mutex<Vec<Packet>>,
    num_to_drop: Mutex<usize>,
    drop_predicate: Mutex<Option<DropPredicate>>,
    unavailable: Mutex<bool>,
    num_delivered: Mutex<usize>,
}

impl Default for LoopbackLink {
    fn default() -> Self {
        LoopbackLink {
            peer: Mutex::new(None),
            sent: Default::default(),
            num_to_drop: Mutex::new(0),
            drop_predicate: Mutex::new(None),
            unavailable: Mutex::new(false),
            num_delivered: Mutex::new(0),
        }
    }
}

impl LoopbackLink {
    pub fn connect(&self, peer: Weak<dyn FrameHandler>) {
        *self.peer.lock() = Some(peer);
    }

    /// copies of all packets that were handed to the link, in the order they were sent
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    pub fn num_delivered(&self) -> usize {
        *self.num_delivered.lock()
    }

    /// loses the next `n` frames
    pub fn drop_next_frames(&self, n: usize) {
        *self.num_to_drop.lock() = n;
    }

    /// loses every frame whose packet matches the predicate
    pub fn drop_frames_where(&self, predicate: impl Fn(&Packet) -> bool + Send + Sync + 'static) {
        *self.drop_predicate.lock() = Some(Box::new(predicate));
    }

    /// While unavailable, the link refuses frames with [LinkError::Unavailable]. This does not
    ///  notify anybody: the tests drive the [FrameHandler] callbacks explicitly.
    pub fn set_available(&self, is_available: bool) {
        *self.unavailable.lock() = !is_available;
    }

    fn should_drop(&self, packet: &Packet) -> bool {
        {
            let mut num_to_drop = self.num_to_drop.lock();
            if *num_to_drop > 0 {
                *num_to_drop -= 1;
                return true;
            }
        }
        self.drop_predicate.lock().as_ref()
            .is_some_and(|p| p(packet))
    }
}

impl LinkInterface for LoopbackLink {
    fn send_frame(&self, channel: u8, frame: &[u8]) -> Result<(), LinkError> {
        if *self.unavailable.lock() {
            return Err(LinkError::Unavailable);
        }
        let peer = self.peer.lock().as_ref().and_then(|p| p.upgrade())
            .ok_or(LinkError::Unavailable)?;

        // frames come from the local encoder, so they always decode
        if let Ok(packet) = Packet::decode(channel, frame) {
            let is_dropped = self.should_drop(&packet);
            self.sent.lock().push(packet);
            if is_dropped {
                trace!("loopback: losing frame");
                return Ok(());
            }
        }

        *self.num_delivered.lock() += 1;
        peer.on_frame_received(channel, frame);
        Ok(())
    }
}
