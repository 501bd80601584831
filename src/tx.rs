use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use crate::config::S3tpConfig;
use crate::error::{LinkError, S3tpResult};
use crate::link::LinkInterface;
use crate::priority_queue::{PriorityQueue, SequenceOrdering};
use crate::wire::packet::Packet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// draining the queue into the link
    Running,
    /// the queue is empty
    Waiting,
    /// the link is unavailable; queued packets stay queued
    Blocked,
    Stopped,
}

/// Owns the shared send queue and a single worker thread that drains it into the link.
///
/// Packets are ordered per destination port by their transmit sequence number, and the worker
///  serves ports that have packets round-robin, so a port with a large message in flight does not
///  starve the others.
pub struct TxScheduler {
    queue: PriorityQueue,
    link: Arc<dyn LinkInterface>,
    active: AtomicBool,
    link_available: AtomicBool,
    state: Mutex<TxState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TxScheduler {
    pub fn new(config: &S3tpConfig, link: Arc<dyn LinkInterface>) -> TxScheduler {
        TxScheduler {
            queue: PriorityQueue::new(SequenceOrdering::Transmit, config.queue_capacity_bytes),
            link,
            active: AtomicBool::new(false),
            link_available: AtomicBool::new(true),
            state: Mutex::new(TxState::Stopped),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub fn num_queued_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn is_link_available(&self) -> bool {
        self.link_available.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, packet: Packet) -> S3tpResult<()> {
        trace!("enqueueing {:?}", packet.header);
        self.queue.push(packet)
    }

    /// Enqueues all packets or none of them. On failure, the packets are left in `packets`.
    pub fn enqueue_all(&self, packets: &mut Vec<Packet>) -> S3tpResult<()> {
        self.queue.push_all(packets)
    }

    pub fn set_link_available(&self, is_available: bool) {
        if self.link_available.swap(is_available, Ordering::AcqRel) != is_available {
            info!("link is {}", if is_available { "available" } else { "unavailable" });
        }
        self.queue.wake_all();
    }

    pub fn start(self: &Arc<Self>) -> S3tpResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.active.store(true, Ordering::Release);
        let scheduler = self.clone();
        let handle = thread::Builder::new()
            .name("s3tp-tx".to_string())
            .spawn(move || scheduler.run())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops and joins the worker thread. Queued packets are kept.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.queue.wake_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle.filter(|h| h.thread().id() != thread::current().id()) {
            if handle.join().is_err() {
                error!("tx worker thread panicked");
            }
        }
        *self.state.lock() = TxState::Stopped;
        debug!("tx scheduler stopped with {} packets queued", self.queue.len());
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_state(&self, new_state: TxState) {
        let mut state = self.state.lock();
        if *state != new_state {
            trace!("tx: {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    fn run(&self) {
        info!("tx worker started");

        while self.is_active() {
            if !self.is_link_available() {
                self.set_state(TxState::Blocked);
            }
            else if self.queue.is_empty() {
                self.set_state(TxState::Waiting);
            }

            self.queue.wait_for_packets(|| !self.is_active(), || !self.is_link_available());
            if !self.is_active() {
                break;
            }
            self.set_state(TxState::Running);

            while self.is_active() && self.is_link_available() {
                let Some(packet) = self.queue.pop_any() else {
                    break;
                };
                self.transmit(packet);
            }
        }

        self.set_state(TxState::Stopped);
        info!("tx worker stopped");
    }

    fn transmit(&self, packet: Packet) {
        let frame = packet.encode();
        match self.link.send_frame(packet.channel, &frame) {
            Ok(()) => trace!("sent {:?}", packet.header),
            Err(LinkError::Unavailable) => {
                debug!("link refused {:?} - blocking until it is available", packet.header);
                self.link_available.store(false, Ordering::Release);
                if let Err(e) = self.queue.push(packet) {
                    warn!("can not requeue packet refused by the link - dropping: {}", e);
                }
            }
            Err(e) => error!("link failed to send {:?} - dropping: {}", packet.header, e),
        }
    }
}
