use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::config::S3tpConfig;
use crate::error::{S3tpError, S3tpResult};
use crate::priority_queue::{PacketQueue, SequenceOrdering};
use crate::sequence::SerialNumber;
use crate::wire::packet::Packet;

struct RxState {
    queue: PacketQueue,
    /// per port: the fragment sequence number of the next message's first fragment
    cursors: FxHashMap<u8, u8>,
    /// ports with at least one complete message, in the order they completed
    available: VecDeque<u8>,

    /// per port: the message being assembled from a connection's packets
    assemblies: FxHashMap<u8, Assembly>,
    /// messages from connections that are complete, in the order they completed
    completed: VecDeque<(u8, Vec<u8>)>,
}

/// A connection delivers its packets in order and without duplicates, so its messages are
///  assembled by appending. The fragment sequence only detects a message that was abandoned when
///  its connection went away.
struct Assembly {
    next_frag: u8,
    num_fragments: usize,
    message: Vec<u8>,
}

impl RxState {
    fn cursor(&self, port: u8) -> u8 {
        self.cursors.get(&port).copied().unwrap_or(0)
    }

    /// `true` if the port's queue starts with an unbroken run of fragments from the cursor up to
    ///  and including a final fragment
    fn is_complete(&self, port: u8) -> bool {
        let mut expected = self.cursor(port);
        for packet in self.queue.iter_port(port) {
            if packet.header.port_seq != expected {
                return false;
            }
            if packet.is_final_fragment() {
                return true;
            }
            expected = expected.next();
        }
        false
    }

    fn mark_if_complete(&mut self, port: u8) -> bool {
        if !self.available.contains(&port) && self.is_complete(port) {
            self.available.push_back(port);
            return true;
        }
        false
    }

    fn has_messages(&self) -> bool {
        !self.completed.is_empty() || !self.available.is_empty()
    }

    fn take_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if let Some(message) = self.completed.pop_front() {
            return Some(message);
        }
        let port = self.available.pop_front()?;

        let mut message = Vec::new();
        while let Some(packet) = self.queue.pop(port) {
            message.extend_from_slice(&packet.payload);
            self.cursors.insert(port, packet.header.port_seq.next());
            if packet.is_final_fragment() {
                break;
            }
        }

        self.mark_if_complete(port);
        Some((port, message))
    }

    /// Discards fragments up to and including the first final fragment in the port's queue, so
    ///  that reassembly resumes with the message after it
    fn skip_lost_fragments(&mut self, port: u8) {
        let cursor_before = self.cursor(port);
        let mut num_discarded = 0;
        while let Some(packet) = self.queue.pop(port) {
            num_discarded += 1;
            self.cursors.insert(port, packet.header.port_seq.next());
            if packet.is_final_fragment() {
                break;
            }
        }
        warn!("port {}: fragment {} did not arrive - discarded {} fragments, resuming at {}", port, cursor_before, num_discarded, self.cursor(port));
    }
}

/// The receiving half of the protocol engine: validates frames from the link, queues packets per
///  port in fragment sequence order, and reassembles complete messages for a consumer thread.
///
/// A message is complete when its port's queue starts with the fragment at the port's cursor,
///  continues without gaps and contains a final fragment. Messages on the same port are delivered
///  in order; messages on different ports are delivered in the order they completed.
pub struct RxEngine {
    config: Arc<S3tpConfig>,
    state: Mutex<RxState>,
    message_available: Condvar,
    active: AtomicBool,
    num_integrity_errors: AtomicU64,
}

impl RxEngine {
    pub fn new(config: Arc<S3tpConfig>) -> RxEngine {
        let capacity = config.queue_capacity_bytes;
        RxEngine {
            config,
            state: Mutex::new(RxState {
                queue: PacketQueue::new(SequenceOrdering::Fragment, capacity),
                cursors: Default::default(),
                available: Default::default(),
                assemblies: Default::default(),
                completed: Default::default(),
            }),
            message_available: Condvar::new(),
            active: AtomicBool::new(false),
            num_integrity_errors: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// wakes up all blocked consumers, which then return `None`
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        let _state = self.state.lock();
        self.message_available.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn num_integrity_errors(&self) -> u64 {
        self.num_integrity_errors.load(Ordering::Relaxed)
    }

    pub fn num_queued_packets(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Decodes a frame received from the link. Frames with a CRC mismatch are counted.
    pub fn verify_frame(&self, channel: u8, frame: &[u8]) -> S3tpResult<Packet> {
        Packet::decode(channel, frame)
            .inspect_err(|e| {
                if let S3tpError::IntegrityError { .. } = e {
                    self.num_integrity_errors.fetch_add(1, Ordering::Relaxed);
                }
            })
    }

    /// Queues a packet for reassembly. Stale fragments (before the port's cursor) and duplicates
    ///  are dropped silently.
    pub fn push_packet(&self, packet: Packet) -> S3tpResult<()> {
        let port = packet.port();
        let port_seq = packet.header.port_seq;

        let mut state = self.state.lock();
        if port_seq.precedes(state.cursor(port)) {
            debug!("port {}: fragment {} is stale (expecting {}) - dropping", port, port_seq, state.cursor(port));
            return Ok(());
        }
        if state.queue.iter_port(port).any(|p| p.header.port_seq == port_seq) {
            debug!("port {}: duplicate fragment {} - dropping", port, port_seq);
            return Ok(());
        }

        trace!("port {}: queueing fragment {}", port, port_seq);
        state.queue.push(packet)?;

        if state.mark_if_complete(port) {
            self.message_available.notify_one();
        }
        else if state.queue.len_port(port) >= self.config.max_fragments_per_message {
            state.skip_lost_fragments(port);
            if state.mark_if_complete(port) {
                self.message_available.notify_one();
            }
        }
        Ok(())
    }

    /// Appends a packet that a connection delivered in sequence to the port's current message.
    ///
    /// NB: Connection traffic has a fragment sequence of its own and does not touch the port's
    ///  datagram cursor. A fragment that does not continue the current message starts a new one,
    ///  discarding the fragments of a message whose connection was reset before it was complete.
    pub fn push_connection_packet(&self, packet: Packet) {
        let port = packet.port();
        let port_seq = packet.header.port_seq;

        let mut state = self.state.lock();
        if let Some(assembly) = state.assemblies.get(&port) {
            if assembly.next_frag != port_seq {
                warn!("port {}: connection fragment {} does not continue the message at {} - discarding {} fragments", port, port_seq, assembly.next_frag, assembly.num_fragments);
                state.assemblies.remove(&port);
            }
        }

        if packet.is_final_fragment() {
            let mut message = state.assemblies.remove(&port)
                .map(|a| a.message)
                .unwrap_or_default();
            message.extend_from_slice(&packet.payload);
            trace!("port {}: connection message of {} bytes is complete", port, message.len());
            state.completed.push_back((port, message));
            self.message_available.notify_one();
            return;
        }

        let max_fragments = self.config.max_fragments_per_message;
        let assembly = state.assemblies.entry(port)
            .or_insert_with(|| Assembly { next_frag: port_seq, num_fragments: 0, message: Vec::new() });
        if assembly.num_fragments + 1 >= max_fragments {
            warn!("port {}: connection message exceeds {} fragments - dropping", port, max_fragments);
            state.assemblies.remove(&port);
            return;
        }
        assembly.num_fragments += 1;
        assembly.next_frag = port_seq.next();
        assembly.message.extend_from_slice(&packet.payload);
    }

    pub fn is_complete(&self, port: u8) -> bool {
        self.state.lock().is_complete(port)
    }

    /// Blocks until a message is complete, returning its port and bytes, or until the engine is
    ///  stopped, returning `None`
    pub fn get_next_complete_message(&self) -> Option<(u8, Vec<u8>)> {
        let mut state = self.state.lock();
        loop {
            if !self.is_active() {
                return None;
            }
            if let Some(message) = state.take_message() {
                if state.has_messages() {
                    self.message_available.notify_one();
                }
                return Some(message);
            }
            self.message_available.wait(&mut state);
        }
    }

    pub fn try_get_next_complete_message(&self) -> Option<(u8, Vec<u8>)> {
        self.state.lock().take_message()
    }
}
