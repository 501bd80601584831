use std::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;
use anyhow::Context;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, trace_span, warn};
use uuid::Uuid;
use crate::application::{ApplicationLayer, PortBinding};
use crate::config::S3tpConfig;
use crate::connection::connection_events::{ConnectionEvent, ConnectionListener};
use crate::connection::connection_manager::ConnectionManager;
use crate::connection::connection_state::{ConnectionOptions, ConnectionState};
use crate::error::{S3tpError, S3tpResult};
use crate::link::{FrameHandler, LinkInterface};
use crate::rx::RxEngine;
use crate::sequence::SerialNumber;
use crate::tx::{TxScheduler, TxState};
use crate::wire::packet::Packet;
use crate::wire::packet_header::{MessageType, PacketFlags, PacketHeader};

/// Sequence counters per destination port. The transmit sequence is shared by all traffic to the
///  port, while datagrams and connection traffic have fragment sequences of their own: packets of
///  a connection that is reset are discarded, and their fragment numbers must not leave a gap in
///  the datagram sequence.
#[derive(Clone, Copy, Default, Debug)]
struct PortCounters {
    next_seq: u16,
    next_frag: u8,
    next_connection_frag: u8,
}

struct S3tpInner {
    config: Arc<S3tpConfig>,
    tx: Arc<TxScheduler>,
    rx: Arc<RxEngine>,
    manager: ConnectionManager,
    application: Arc<dyn ApplicationLayer>,

    bindings: Mutex<FxHashMap<u8, PortBinding>>,
    /// NB: acquired after a connection's lock and before the Tx queue's lock
    counters: Mutex<FxHashMap<u8, PortCounters>>,
    /// RSTs of connections that are gone, waiting for room in the Tx queue
    pending_resets: Mutex<Vec<Packet>>,

    active: AtomicBool,
    timer_stopped: Mutex<bool>,
    timer_signal: Condvar,
}

/// The protocol engine: fragments application messages and routes them through a port's
///  connection or straight to the Tx scheduler as datagrams, and routes frames from the link to
///  the connection manager or the reassembly engine.
///
/// Between [S3tp::start] and [S3tp::stop], three worker threads run: the Tx worker, a consumer
///  that delivers reassembled messages to the [ApplicationLayer], and a timer that drives
///  retransmission.
pub struct S3tp {
    inner: Arc<S3tpInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Forwards connection events to the engine. It holds a weak reference because the engine owns
///  the connection manager, which owns the listener.
struct FacadeListener {
    inner: Weak<S3tpInner>,
}

impl ConnectionListener for FacadeListener {
    fn on_connection_event(&self, event: ConnectionEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connection_event(event);
        }
    }

    fn accept_connection(&self, local_port: u8, remote_port: u8) -> Option<ConnectionOptions> {
        let inner = self.inner.upgrade()?;
        let binding = inner.bindings.lock().get(&local_port).copied();
        match binding {
            Some(binding) => {
                debug!("accepting connection from {} on port {} with {:?}", remote_port, local_port, binding.options);
                Some(binding.options)
            }
            None => {
                debug!("no application is bound to port {} - refusing connection from {}", local_port, remote_port);
                None
            }
        }
    }
}

impl S3tp {
    pub fn new(config: S3tpConfig, link: Arc<dyn LinkInterface>, application: Arc<dyn ApplicationLayer>) -> anyhow::Result<S3tp> {
        config.validate()
            .context("invalid S3TP configuration")?;
        let config = Arc::new(config);

        let inner = Arc::new_cyclic(|inner: &Weak<S3tpInner>| S3tpInner {
            tx: Arc::new(TxScheduler::new(&config, link)),
            rx: Arc::new(RxEngine::new(config.clone())),
            manager: ConnectionManager::new(config.clone(), Arc::new(FacadeListener { inner: inner.clone() })),
            application,
            bindings: Default::default(),
            counters: Default::default(),
            pending_resets: Default::default(),
            active: AtomicBool::new(false),
            timer_stopped: Mutex::new(false),
            timer_signal: Condvar::new(),
            config,
        });

        Ok(S3tp {
            inner,
            workers: Default::default(),
        })
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut workers = self.workers.lock();
        if self.inner.active.swap(true, Ordering::AcqRel) {
            debug!("S3TP is already running");
            return Ok(());
        }
        info!("starting S3TP");

        *self.inner.timer_stopped.lock() = false;
        self.inner.rx.start();
        self.inner.tx.start()
            .context("failed to start the tx worker")?;

        let inner = self.inner.clone();
        workers.push(thread::Builder::new()
            .name("s3tp-rx".to_string())
            .spawn(move || inner.run_rx_consumer())?);

        let inner = self.inner.clone();
        workers.push(thread::Builder::new()
            .name("s3tp-timer".to_string())
            .spawn(move || inner.run_retransmission_timer())?);

        Ok(())
    }

    /// Resets all connections and stops the worker threads. Packets that are still queued for
    ///  transmission stay queued.
    pub fn stop(&self) {
        let mut workers = self.workers.lock();
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping S3TP");

        self.inner.manager.reset_all();
        self.inner.rx.stop();
        self.inner.tx.stop();
        {
            *self.inner.timer_stopped.lock() = true;
            self.inner.timer_signal.notify_all();
        }

        for worker in workers.drain(..) {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!("S3TP worker thread panicked");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Binds a local port for an application
    pub fn on_application_connected(&self, port: u8, binding: PortBinding) -> S3tpResult<()> {
        for p in [port, binding.remote_port] {
            if p > PacketHeader::MAX_PORT {
                return Err(S3tpError::InvalidPort(p));
            }
        }

        let mut bindings = self.inner.bindings.lock();
        if bindings.contains_key(&port) {
            return Err(S3tpError::PortBusy(port));
        }
        debug!("binding port {} to {:?}", port, binding);
        bindings.insert(port, binding);
        Ok(())
    }

    /// Unbinds a port, closing its connection if there is one
    pub fn on_application_disconnected(&self, port: u8) -> S3tpResult<()> {
        self.inner.bindings.lock().remove(&port)
            .ok_or(S3tpError::PortNotBound(port))?;
        debug!("unbinding port {}", port);

        match self.inner.manager.close(port) {
            Ok(()) | Err(S3tpError::PortNotOpen(_)) => {}
            Err(e) => debug!("closing connection on unbound port {}: {}", port, e),
        }
        Ok(())
    }

    /// Sends a message from a bound port. If the port has a connection, the message goes through
    ///  it, waiting up to `send_timeout` for room in the connection's queue and window. Otherwise
    ///  it is sent as datagrams to the binding's remote port.
    ///
    /// The message is either accepted as a whole or not at all.
    pub fn on_application_message(&self, port: u8, message: &[u8]) -> S3tpResult<()> {
        let inner = &self.inner;
        if !inner.is_active() {
            return Err(S3tpError::Stopped);
        }
        let binding = inner.binding(port)?;
        if !inner.tx.is_link_available() {
            return Err(S3tpError::LinkUnavailable);
        }

        let has_connection = inner.manager.state(port).is_some();
        let max_fragments = if has_connection {
            min(inner.config.max_fragments_per_message, inner.config.transmission_window as usize)
        }
        else {
            inner.config.max_fragments_per_message
        };
        let max_len = max_fragments * inner.config.max_pdu_len();
        if message.len() > max_len {
            return Err(S3tpError::MessageTooLarge { len: message.len(), max: max_len });
        }

        trace!("sending {} bytes from port {} to {}", message.len(), port, binding.remote_port);
        if has_connection {
            let packets = inner.fragment(port, binding.remote_port, MessageType::Connection, binding.channel, message);
            inner.send_through_connection(port, packets)
        }
        else {
            let packets = inner.fragment(port, binding.remote_port, MessageType::Datagram, binding.channel, message);
            inner.send_datagram(packets)
        }
    }

    /// Opens a connection from a bound port, using the binding's channel
    pub fn open_connection(&self, local_port: u8, remote_port: u8, options: ConnectionOptions) -> S3tpResult<()> {
        if !self.inner.is_active() {
            return Err(S3tpError::Stopped);
        }
        let binding = self.inner.binding(local_port)?;
        if !self.inner.tx.is_link_available() {
            return Err(S3tpError::LinkUnavailable);
        }
        self.inner.manager.open(local_port, remote_port, binding.channel, options)?;
        // an RST of the port's previous connection would reset the new one
        self.inner.pending_resets.lock().retain(|p| p.header.src_port != local_port);
        Ok(())
    }

    pub fn close_connection(&self, local_port: u8) -> S3tpResult<()> {
        self.inner.manager.close(local_port)
    }

    pub fn connection_state(&self, local_port: u8) -> Option<ConnectionState> {
        self.inner.manager.state(local_port)
    }

    pub fn tx_state(&self) -> TxState {
        self.inner.tx.state()
    }

    pub fn is_link_available(&self) -> bool {
        self.inner.tx.is_link_available()
    }

    pub fn num_integrity_errors(&self) -> u64 {
        self.inner.rx.num_integrity_errors()
    }
}

impl Drop for S3tp {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FrameHandler for S3tp {
    fn on_frame_received(&self, channel: u8, frame: &[u8]) {
        self.inner.on_frame_received(channel, frame);
    }

    fn on_link_status_changed(&self, is_available: bool) {
        self.inner.on_link_status_changed(is_available);
    }
}

impl S3tpInner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn binding(&self, port: u8) -> S3tpResult<PortBinding> {
        self.bindings.lock().get(&port).copied()
            .ok_or(S3tpError::PortNotBound(port))
    }

    /// Splits a message into packets of at most `max_pdu_len` bytes each, marking all but the
    ///  last with 'more fragments'. An empty message is a single empty packet.
    fn fragment(&self, src_port: u8, dst_port: u8, message_type: MessageType, channel: u8, message: &[u8]) -> Vec<Packet> {
        let max_pdu_len = self.config.max_pdu_len();
        let payload = Bytes::copy_from_slice(message);
        let num_fragments = payload.len().div_ceil(max_pdu_len).max(1);

        (0..num_fragments)
            .map(|i| {
                let start = i * max_pdu_len;
                let end = min(start + max_pdu_len, payload.len());

                let mut header = PacketHeader::new(src_port, dst_port, message_type);
                header.more_fragments = i + 1 < num_fragments;
                Packet::new(header, payload.slice(start..end), channel)
            })
            .collect()
    }

    fn send_through_connection(&self, port: u8, packets: Vec<Packet>) -> S3tpResult<()> {
        let assign_fragment_seqs = |packets: &mut [Packet]| {
            let mut counters = self.counters.lock();
            for packet in packets {
                let port_counters = counters.entry(packet.port()).or_default();
                packet.header.port_seq = port_counters.next_connection_frag;
                port_counters.next_connection_frag = port_counters.next_connection_frag.next();
            }
        };

        match self.config.send_timeout {
            Some(timeout) => self.manager.send_blocking(port, packets, timeout, assign_fragment_seqs),
            None => self.manager.send(port, packets, assign_fragment_seqs),
        }
    }

    fn send_datagram(&self, mut packets: Vec<Packet>) -> S3tpResult<()> {
        let Some(dst_port) = packets.first().map(|p| p.port()) else {
            return Ok(());
        };

        let mut counters = self.counters.lock();
        let mut next_frag = counters.get(&dst_port).map(|c| c.next_frag).unwrap_or_default();
        for packet in packets.iter_mut() {
            packet.header.port_seq = next_frag;
            next_frag = next_frag.next();
        }

        self.enqueue_for_transmission(&mut counters, &mut packets)?;
        counters.entry(dst_port).or_default().next_frag = next_frag;
        Ok(())
    }

    /// Stamps packets with their transmit sequence numbers and hands them to the Tx scheduler,
    ///  all or nothing. Counters are advanced only if the scheduler accepts the packets.
    fn enqueue_for_transmission(&self, counters: &mut FxHashMap<u8, PortCounters>, packets: &mut Vec<Packet>) -> S3tpResult<()> {
        let mut next_seqs = FxHashMap::<u8, u16>::default();
        for packet in packets.iter_mut() {
            let port = packet.port();
            let next_seq = next_seqs.entry(port)
                .or_insert_with(|| counters.get(&port).map(|c| c.next_seq).unwrap_or_default());
            packet.header.seq = *next_seq;
            *next_seq = (*next_seq).next();
        }

        self.tx.enqueue_all(packets)?;

        for (port, next_seq) in next_seqs {
            counters.entry(port).or_default().next_seq = next_seq;
        }
        Ok(())
    }

    fn enqueue(&self, packets: &mut Vec<Packet>) -> S3tpResult<()> {
        let mut counters = self.counters.lock();
        self.enqueue_for_transmission(&mut counters, packets)
    }

    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(data) => {
                self.application.on_connection_state_changed(data.local_port, data.new_state);
            }
            ConnectionEvent::OutboundAvailable { local_port } => {
                let mut packets = self.manager.take_outbound(local_port);
                if packets.is_empty() {
                    return;
                }
                if let Err(e) = self.enqueue(&mut packets) {
                    debug!("no room for outbound packets of connection {} - retrying later: {}", local_port, e);
                    // an RST is the connection's last packet, the connection is gone once it was taken
                    let (resets, packets): (Vec<Packet>, Vec<Packet>) = packets.into_iter()
                        .partition(|p| p.has_flags(PacketFlags::RST));
                    self.pending_resets.lock().extend(resets);
                    if !packets.is_empty() {
                        self.manager.requeue_outbound(local_port, packets);
                    }
                }
            }
            ConnectionEvent::InboundAvailable { local_port } => {
                for packet in self.manager.take_inbound(local_port) {
                    self.rx.push_connection_packet(packet);
                }
            }
            ConnectionEvent::Rejected { local_port, reply } => {
                if let Err(e) = self.enqueue(&mut vec![reply]) {
                    debug!("no room for rejecting a packet for port {} - dropping the reply: {}", local_port, e);
                }
            }
        }
    }

    /// Retries RSTs that did not fit into the Tx queue when their connection was reset
    fn enqueue_pending_resets(&self) {
        let mut resets = std::mem::take(&mut *self.pending_resets.lock());
        if resets.is_empty() {
            return;
        }
        match self.enqueue(&mut resets) {
            Ok(()) => debug!("queued {} pending RST packets", resets.len()),
            Err(e) => {
                trace!("still no room for {} pending RST packets: {}", resets.len(), e);
                let mut pending = self.pending_resets.lock();
                resets.append(&mut pending);
                *pending = resets;
            }
        }
    }

    fn on_frame_received(&self, channel: u8, frame: &[u8]) {
        let span = trace_span!("frame", correlation_id = %Uuid::new_v4(), channel);
        let _entered = span.enter();

        if !self.is_active() {
            debug!("S3TP is stopped - dropping frame");
            return;
        }

        let packet = match self.rx.verify_frame(channel, frame) {
            Ok(packet) => packet,
            Err(e @ S3tpError::IntegrityError { .. }) => {
                warn!("{} - dropping", e);
                return;
            }
            Err(e) => {
                debug!("{} - dropping", e);
                return;
            }
        };
        trace!("received {:?}", packet.header);

        match packet.header.message_type {
            MessageType::Datagram => {
                if let Err(e) = self.rx.push_packet(packet) {
                    debug!("can not queue datagram for reassembly - dropping: {}", e);
                }
            }
            MessageType::Connection => {
                if let Err(e) = self.manager.handle_inbound(packet) {
                    debug!("connection packet was not accepted - dropping: {}", e);
                }
            }
        }
    }

    fn on_link_status_changed(&self, is_available: bool) {
        self.tx.set_link_available(is_available);
        self.application.on_link_status_changed(is_available);
    }

    fn run_rx_consumer(&self) {
        info!("rx consumer started");
        while let Some((port, message)) = self.rx.get_next_complete_message() {
            trace!("delivering {} bytes on port {}", message.len(), port);
            if let Err(e) = self.application.deliver_to_application(port, message) {
                warn!("application did not accept message on port {} - dropping: {:#}", port, e);
            }
        }
        info!("rx consumer stopped");
    }

    /// Ticks the connections periodically while the link is available, so that an outage does
    ///  not exhaust their retransmissions
    fn run_retransmission_timer(&self) {
        let interval = self.config.retransmission_check_interval;
        let mut stopped = self.timer_stopped.lock();
        while !*stopped {
            self.timer_signal.wait_for(&mut stopped, interval);
            if *stopped {
                break;
            }
            MutexGuard::unlocked(&mut stopped, || self.enqueue_pending_resets());
            if self.tx.is_link_available() {
                MutexGuard::unlocked(&mut stopped, || self.manager.tick(Instant::now()));
            }
        }
        debug!("retransmission timer stopped");
    }
}
