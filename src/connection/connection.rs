use std::sync::Arc;
use std::time::Instant;
use bit_set::BitSet;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::config::S3tpConfig;
use crate::connection::connection_events::{ConnectionEvent, StateChangedData};
use crate::connection::connection_state::{ConnectionOptions, ConnectionRole, ConnectionState};
use crate::connection::retransmission::{RetransmissionOutcome, RetransmissionQueue};
use crate::error::{S3tpError, S3tpResult};
use crate::priority_queue::{PacketQueue, SequenceOrdering};
use crate::sequence::{is_in_range, SerialNumber};
use crate::wire::packet::Packet;
use crate::wire::packet_header::{MessageType, PacketFlags, PacketHeader};
use crate::wire::sack::SackRanges;

/// The state machine of a reliable session between a local and a remote port.
///
/// Every packet that consumes a reliability sequence number (SYN, SYN+ACK, DATA, FIN) is kept
///  for retransmission until the peer acknowledges it, either cumulatively through the `ack`
///  field of any packet with the ACK flag, or selectively through a SACK control packet. Pure
///  acknowledgements, SACKs and RSTs carry the next unused sequence number without consuming it.
///
/// Inbound packets are accepted only inside the receive window, i.e. less than
///  `transmission_window` sequence numbers ahead of the next expected one. Everything the
///  connection wants to send ends up in its outbound queue, and in-sequence inbound packets in its
///  inbound queue; the owner is told about both through [ConnectionEvent]s that it collects with
///  [Connection::drain_events].
pub struct Connection {
    config: Arc<S3tpConfig>,

    local_port: u8,
    remote_port: u8,
    channel: u8,
    role: ConnectionRole,
    options: ConnectionOptions,
    state: ConnectionState,

    /// the sequence number for the next packet that consumes one
    next_out_seq: u8,
    /// the oldest sequence number that was sent and is not cumulatively acknowledged
    send_una: u8,
    /// the next inbound sequence number needed for in-sequence delivery; this is what the
    ///  connection acknowledges
    expected_in: u8,

    outbound: PacketQueue,
    inbound: PacketQueue,

    /// inbound sequence numbers that were received but are not covered by `expected_in` yet
    scheduled: BitSet,
    /// there are received packets beyond a gap, i.e. the peer should get a SACK
    sack_pending: bool,

    retransmission: RetransmissionQueue,

    pending_events: Vec<ConnectionEvent>,
}

impl Connection {
    pub fn new(config: Arc<S3tpConfig>, role: ConnectionRole, local_port: u8, remote_port: u8, channel: u8, options: ConnectionOptions) -> Connection {
        let queue_capacity = config.connection_queue_capacity_bytes;
        Connection {
            config,
            local_port,
            remote_port,
            channel,
            role,
            options,
            state: ConnectionState::Disconnected,
            next_out_seq: 0,
            send_una: 0,
            expected_in: 0,
            outbound: PacketQueue::new(SequenceOrdering::Reliability, queue_capacity),
            inbound: PacketQueue::new(SequenceOrdering::Reliability, queue_capacity),
            scheduled: BitSet::with_capacity(256),
            sack_pending: false,
            retransmission: RetransmissionQueue::default(),
            pending_events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn local_port(&self) -> u8 {
        self.local_port
    }

    pub fn remote_port(&self) -> u8 {
        self.remote_port
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    pub fn unacknowledged(&self) -> usize {
        self.retransmission.len()
    }

    /// Hands out the events raised since the last call, state changes first: a listener that
    ///  reacts to `OutboundAvailable` by taking a final RST must not see the resulting
    ///  `Disconnected` before the `Resetting` that preceded it.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = std::mem::take(&mut self.pending_events);
        events.sort_by_key(|e| !matches!(e, ConnectionEvent::StateChanged(_)));
        events
    }

    fn emit(&mut self, event: ConnectionEvent) {
        if !self.pending_events.contains(&event) {
            self.pending_events.push(event);
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.state == new_state {
            return;
        }
        debug!("connection {} -> {}: {} -> {}", self.local_port, self.remote_port, self.state, new_state);
        let old_state = self.state;
        self.state = new_state;
        self.emit(ConnectionEvent::StateChanged(StateChangedData {
            local_port: self.local_port,
            remote_port: self.remote_port,
            old_state,
            new_state,
        }));
    }

    fn new_packet(&self, flags: PacketFlags, rel_seq: u8, payload: Bytes) -> Packet {
        let mut header = PacketHeader::new(self.local_port, self.remote_port, MessageType::Connection);
        header.flags = flags;
        header.rel_seq = rel_seq;
        header.ack = self.expected_in;
        Packet::new(header, payload, self.channel)
    }

    /// queues a packet that does not carry application data; a full outbound queue drops it
    fn queue_control(&mut self, packet: Packet) {
        trace!("queueing control packet {:?}", packet.header);
        match self.outbound.push(packet) {
            Ok(()) => self.emit(ConnectionEvent::OutboundAvailable { local_port: self.local_port }),
            Err(e) => debug!("connection {}: outbound queue is full, dropping control packet: {}", self.local_port, e),
        }
    }

    /// queues a packet that consumes a sequence number, keeping a copy for retransmission
    fn queue_sequenced(&mut self, flags: PacketFlags, payload: Bytes, now: Instant) -> S3tpResult<()> {
        let packet = self.new_packet(flags, self.next_out_seq, payload);
        if !self.outbound.has_room_for(packet.wire_len()) {
            return Err(S3tpError::QueueFull);
        }
        self.next_out_seq = self.next_out_seq.next();
        self.retransmission.push(packet.clone(), now);
        self.outbound.push(packet)?;
        self.emit(ConnectionEvent::OutboundAvailable { local_port: self.local_port });
        Ok(())
    }

    /// Starts the handshake as the initiator
    pub fn open(&mut self, now: Instant) -> S3tpResult<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(S3tpError::PortBusy(self.local_port));
        }
        self.queue_sequenced(PacketFlags::SYN, Bytes::new(), now)?;
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Answers a SYN that created this connection as a responder
    pub fn on_syn(&mut self, syn: &Packet, now: Instant) -> S3tpResult<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(S3tpError::invalid_packet("SYN for a connection that is already open"));
        }
        self.expected_in = syn.header.rel_seq.next();
        self.queue_sequenced(PacketFlags::SYN | PacketFlags::ACK, Bytes::new(), now)?;
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Processes a packet the peer sent to this connection. An `Err` means the packet was
    ///  dropped, leaving the connection's state untouched.
    pub fn handle_packet(&mut self, packet: Packet) -> S3tpResult<()> {
        trace!("connection {}: received {:?}", self.local_port, packet.header);

        if packet.has_flags(PacketFlags::RST) {
            debug!("connection {} was reset by the peer", self.local_port);
            self.discard_buffers();
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        match self.state {
            ConnectionState::Connecting => self.on_packet_while_connecting(packet),
            ConnectionState::Connected | ConnectionState::Disconnecting => self.on_packet_while_open(packet),
            ConnectionState::Resetting => {
                trace!("connection {} is resetting - dropping packet", self.local_port);
                Ok(())
            }
            ConnectionState::Disconnected => Err(S3tpError::NotConnected(self.local_port)),
        }
    }

    fn on_packet_while_connecting(&mut self, packet: Packet) -> S3tpResult<()> {
        let flags = packet.header.flags;

        match self.role {
            ConnectionRole::Initiator => {
                if flags != PacketFlags::SYN | PacketFlags::ACK {
                    return Err(S3tpError::invalid_packet(format!("expected SYN+ACK, got {:?}", flags)));
                }
                if !self.covers_unacknowledged(packet.header.ack) {
                    return Err(S3tpError::invalid_packet(format!("SYN+ACK acknowledges {}, but next sequence number is {}", packet.header.ack, self.next_out_seq)));
                }
                self.process_ack(packet.header.ack);

                self.expected_in = packet.header.rel_seq;
                self.schedule(packet.header.rel_seq);
                self.sweep();

                self.set_state(ConnectionState::Connected);
                self.queue_ack();
                Ok(())
            }
            ConnectionRole::Responder => {
                if flags == PacketFlags::SYN {
                    if packet.header.rel_seq.next() != self.expected_in {
                        return Err(S3tpError::invalid_packet("SYN with a different initial sequence number"));
                    }
                    debug!("connection {}: duplicate SYN - resending SYN+ACK", self.local_port);
                    let syn_ack = self.new_packet(PacketFlags::SYN | PacketFlags::ACK, self.send_una, Bytes::new());
                    self.queue_control(syn_ack);
                    return Ok(());
                }

                if !flags.contains(PacketFlags::ACK) || !self.covers_unacknowledged(packet.header.ack) {
                    return Err(S3tpError::invalid_packet(format!("expected an ACK for SYN+ACK, got {:?}", packet.header)));
                }
                self.set_state(ConnectionState::Connected);

                if flags.intersects(PacketFlags::DATA | PacketFlags::FIN | PacketFlags::CTRL) {
                    self.on_packet_while_open(packet)
                }
                else {
                    self.process_ack(packet.header.ack);
                    Ok(())
                }
            }
        }
    }

    fn on_packet_while_open(&mut self, packet: Packet) -> S3tpResult<()> {
        let flags = packet.header.flags;

        if flags.contains(PacketFlags::SYN) {
            if self.role == ConnectionRole::Initiator && flags.contains(PacketFlags::ACK) && packet.header.rel_seq.next() == self.expected_in {
                debug!("connection {}: duplicate SYN+ACK - acknowledging again", self.local_port);
                self.queue_ack();
                return Ok(());
            }
            return Err(S3tpError::invalid_packet(format!("unexpected SYN on open connection: {:?}", packet.header)));
        }

        if flags.contains(PacketFlags::ACK) {
            self.process_ack(packet.header.ack);
        }

        if flags.contains(PacketFlags::CTRL) {
            let mut buf: &[u8] = &packet.payload;
            let sack = SackRanges::deser(&mut buf)?;
            for (first, last) in sack.ranges {
                let removed = self.retransmission.acknowledge_range(first, last);
                trace!("connection {}: SACK [{}, {}] acknowledged {} packets", self.local_port, first, last, removed);
            }
            return Ok(());
        }

        if flags.contains(PacketFlags::FIN) {
            return self.on_fin(&packet);
        }

        if flags.contains(PacketFlags::DATA) {
            return self.on_data(packet);
        }

        Ok(())
    }

    fn on_fin(&mut self, packet: &Packet) -> S3tpResult<()> {
        if packet.has_flags(PacketFlags::ACK) {
            // FIN+ACK is the peer's answer to our FIN
            if self.state != ConnectionState::Disconnecting {
                return Err(S3tpError::invalid_packet("FIN+ACK without a preceding FIN"));
            }
            self.discard_buffers();
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        if packet.header.rel_seq != self.expected_in {
            return Err(S3tpError::invalid_packet(format!("FIN with sequence number {} while expecting {}", packet.header.rel_seq, self.expected_in)));
        }

        self.expected_in = self.expected_in.next();
        let fin_ack = self.new_packet(PacketFlags::FIN | PacketFlags::ACK, self.next_out_seq, Bytes::new());
        self.queue_control(fin_ack);

        self.retransmission.clear();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn on_data(&mut self, packet: Packet) -> S3tpResult<()> {
        let rel_seq = packet.header.rel_seq;

        if self.expected_in.distance_to(rel_seq) >= self.config.transmission_window as usize {
            if rel_seq.precedes(self.expected_in) {
                trace!("connection {}: old duplicate {} - acknowledging again", self.local_port, rel_seq);
                self.queue_ack();
                return Ok(());
            }
            return Err(S3tpError::invalid_packet(format!("sequence number {} is outside the receive window starting at {}", rel_seq, self.expected_in)));
        }

        if self.scheduled.contains(rel_seq as usize) {
            trace!("connection {}: duplicate {} - acknowledging again", self.local_port, rel_seq);
            self.queue_ack();
            return Ok(());
        }

        self.inbound.push(packet)?;
        self.schedule(rel_seq);

        let expected_before = self.expected_in;
        self.sweep();
        if self.expected_in != expected_before {
            self.emit(ConnectionEvent::InboundAvailable { local_port: self.local_port });
        }

        self.queue_ack();
        Ok(())
    }

    /// `true` if `ack` acknowledges at least one packet that is not acknowledged yet
    fn covers_unacknowledged(&self, ack: u8) -> bool {
        ack != self.send_una && is_in_range(ack, self.send_una, self.next_out_seq)
    }

    fn process_ack(&mut self, ack: u8) {
        if !is_in_range(ack, self.send_una, self.next_out_seq) {
            trace!("connection {}: ignoring ack {} outside of [{}, {}]", self.local_port, ack, self.send_una, self.next_out_seq);
            return;
        }
        let removed = self.retransmission.acknowledge_up_to(ack);
        if removed > 0 {
            trace!("connection {}: ack {} removed {} packets from the retransmission queue", self.local_port, ack, removed);
        }
        self.send_una = ack;
    }

    fn schedule(&mut self, rel_seq: u8) {
        self.scheduled.insert(rel_seq as usize);
    }

    /// advances `expected_in` over all contiguously received sequence numbers
    fn sweep(&mut self) {
        while self.scheduled.remove(self.expected_in as usize) {
            self.expected_in = self.expected_in.next();
        }
        self.sack_pending = !self.scheduled.is_empty();
    }

    fn sack_ranges(&self) -> SackRanges {
        let mut ranges = Vec::new();
        let mut range_start = None;
        let mut rel_seq = self.expected_in;
        for _ in 0..self.config.transmission_window {
            if self.scheduled.contains(rel_seq as usize) {
                range_start.get_or_insert(rel_seq);
            }
            else if let Some(first) = range_start.take() {
                ranges.push((first, rel_seq.wrapping_sub(1)));
            }
            rel_seq = rel_seq.next();
        }
        if let Some(first) = range_start {
            ranges.push((first, rel_seq.wrapping_sub(1)));
        }
        SackRanges { ranges }
    }

    fn sack_packet(&self) -> Option<Packet> {
        if !self.sack_pending || !self.options.contains(ConnectionOptions::SELECTIVE_ACK) {
            return None;
        }
        Some(self.new_packet(PacketFlags::CTRL | PacketFlags::ACK, self.next_out_seq, self.sack_ranges().to_bytes()))
    }

    /// queues a pure acknowledgement, plus a SACK while there is a gap
    fn queue_ack(&mut self) {
        let ack = self.new_packet(PacketFlags::ACK, self.next_out_seq, Bytes::new());
        self.queue_control(ack);
        if let Some(sack) = self.sack_packet() {
            self.queue_control(sack);
        }
    }

    /// Checks if a message of the given packets could be sent right now: `NotConnected` unless the
    ///  connection is established, `QueueFull` if the outbound queue or the transmission window
    ///  has no room for them.
    pub fn check_send(&self, packets: &[Packet]) -> S3tpResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(S3tpError::NotConnected(self.local_port));
        }

        if self.retransmission.len() + packets.len() > self.config.transmission_window as usize {
            trace!("connection {}: transmission window is full", self.local_port);
            return Err(S3tpError::QueueFull);
        }

        let sack_len = self.sack_packet().map(|p| p.wire_len()).unwrap_or(0);
        let total: usize = packets.iter().map(|p| p.wire_len()).sum();
        if !self.outbound.has_room_for(total + sack_len) {
            trace!("connection {}: outbound queue is full", self.local_port);
            return Err(S3tpError::QueueFull);
        }
        Ok(())
    }

    /// Sends the fragments of a message, stamping each with ports, channel, DATA+ACK flags, a
    ///  sequence number and the current cumulative ack. `assign_fragment_seqs` is called with
    ///  the stamped packets once they are certain to be accepted, so fragment sequence numbers
    ///  are not wasted on refused messages.
    pub fn send_out_packets(&mut self, mut packets: Vec<Packet>, now: Instant, assign_fragment_seqs: impl FnOnce(&mut [Packet])) -> S3tpResult<()> {
        self.check_send(&packets)?;

        if let Some(sack) = self.sack_packet() {
            self.queue_control(sack);
        }

        for packet in packets.iter_mut() {
            let header = &mut packet.header;
            header.message_type = MessageType::Connection;
            header.src_port = self.local_port;
            header.dst_port = self.remote_port;
            header.flags = PacketFlags::DATA | PacketFlags::ACK;
            header.rel_seq = self.next_out_seq;
            header.ack = self.expected_in;
            packet.channel = self.channel;
            self.next_out_seq = self.next_out_seq.next();
        }
        assign_fragment_seqs(packets.as_mut_slice());

        for packet in packets {
            self.retransmission.push(packet.clone(), now);
            self.outbound.push(packet)?;
        }
        self.emit(ConnectionEvent::OutboundAvailable { local_port: self.local_port });
        Ok(())
    }

    /// Starts an orderly shutdown. A connection that is not established yet is reset instead.
    pub fn close(&mut self, now: Instant) -> S3tpResult<()> {
        match self.state {
            ConnectionState::Connected => {
                self.queue_sequenced(PacketFlags::FIN, Bytes::new(), now)?;
                self.set_state(ConnectionState::Disconnecting);
                Ok(())
            }
            ConnectionState::Connecting => {
                self.reset();
                Ok(())
            }
            ConnectionState::Disconnecting | ConnectionState::Resetting => Err(S3tpError::AlreadyClosing(self.local_port)),
            ConnectionState::Disconnected => Err(S3tpError::NotConnected(self.local_port)),
        }
    }

    /// Discards both buffers and queues an RST. The connection is `Disconnected` once the RST is
    ///  taken from its outbound queue.
    pub fn reset(&mut self) {
        if matches!(self.state, ConnectionState::Resetting | ConnectionState::Disconnected) {
            return;
        }
        self.discard_buffers();
        let rst = self.new_packet(PacketFlags::RST, self.next_out_seq, Bytes::new());
        self.queue_control(rst);
        self.set_state(ConnectionState::Resetting);
    }

    fn discard_buffers(&mut self) {
        let num_out = self.outbound.clear();
        let num_in = self.inbound.clear();
        if num_out + num_in > 0 {
            debug!("connection {}: discarding {} outbound and {} inbound packets", self.local_port, num_out, num_in);
        }
        self.scheduled.make_empty();
        self.sack_pending = false;
        self.retransmission.clear();
    }

    /// Hands all queued outbound packets to the caller
    pub fn take_outbound(&mut self) -> Vec<Packet> {
        let mut result = Vec::new();
        while let Some(packet) = self.outbound.pop_any() {
            let is_rst = packet.has_flags(PacketFlags::RST);
            result.push(packet);
            if is_rst && self.state == ConnectionState::Resetting {
                self.set_state(ConnectionState::Disconnected);
                break;
            }
        }
        result
    }

    /// Puts back packets from [Connection::take_outbound] that could not be handed on
    pub fn requeue_outbound(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.outbound.push(packet) {
                debug!("connection {}: can not requeue outbound packet - dropping: {}", self.local_port, e);
            }
        }
    }

    /// Hands the inbound packets that are in sequence to the caller
    pub fn take_inbound(&mut self) -> Vec<Packet> {
        let mut result = Vec::new();
        while let Some(packet) = self.inbound.peek(self.local_port) {
            if !packet.header.rel_seq.precedes(self.expected_in) {
                break;
            }
            if let Some(packet) = self.inbound.pop(self.local_port) {
                result.push(packet);
            }
        }
        result
    }

    /// Retransmits packets whose back-off expired, and resets the connection when a packet
    ///  reached the maximum number of retransmissions
    pub fn on_tick(&mut self, now: Instant) {
        if !self.outbound.is_empty() {
            self.emit(ConnectionEvent::OutboundAvailable { local_port: self.local_port });
        }

        if !self.options.contains(ConnectionOptions::RETRANSMIT) {
            return;
        }
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting) {
            return;
        }

        match self.retransmission.due_packets(now, &self.config) {
            RetransmissionOutcome::Due(packets) => {
                for mut packet in packets {
                    packet.header.ack = self.expected_in;
                    self.queue_control(packet);
                }
            }
            RetransmissionOutcome::Exhausted { rel_seq } => {
                warn!("connection {} -> {}: packet {} was not acknowledged after {} retransmissions - resetting", self.local_port, self.remote_port, rel_seq, self.config.max_retransmissions);
                self.reset();
            }
        }
    }
}
