use std::collections::VecDeque;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::error::{S3tpError, S3tpResult};
use crate::sequence::SerialNumber;
use crate::wire::packet::Packet;
use crate::wire::packet_header::PacketHeader;

/// The sequence number a queue orders its packets by. Lower sequence numbers (in serial number
///  arithmetic) are closer to the head of a port's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOrdering {
    /// per-port transmit sequence - send order
    Transmit,
    /// per-port fragment sequence - reassembly order
    Fragment,
    /// a connection's reliability sequence
    Reliability,
}
impl SequenceOrdering {
    fn precedes(&self, a: &PacketHeader, b: &PacketHeader) -> bool {
        match self {
            SequenceOrdering::Transmit => a.seq.precedes(b.seq),
            SequenceOrdering::Fragment => a.port_seq.precedes(b.port_seq),
            SequenceOrdering::Reliability => a.rel_seq.precedes(b.rel_seq),
        }
    }
}

/// A mapping from port to the packets queued for that port, each port's packets ordered by
///  ascending sequence number. The queue is bounded by the aggregate size of its packets on the
///  wire; pushing into a full queue fails without blocking.
///
/// Ports that have at least one packet are tracked in the order they became ready, so that
///  [PacketQueue::pop_any] picks a ready port in O(1) and serves ports round-robin.
///
/// This is the unsynchronized core, used by owners that have their own lock (connections, the
///  reassembly engine). [PriorityQueue] wraps it for sharing between threads.
pub struct PacketQueue {
    ordering: SequenceOrdering,
    capacity_bytes: usize,
    used_bytes: usize,
    ports: FxHashMap<u8, VecDeque<Packet>>,
    ready_ports: VecDeque<u8>,
}

impl PacketQueue {
    pub fn new(ordering: SequenceOrdering, capacity_bytes: usize) -> PacketQueue {
        PacketQueue {
            ordering,
            capacity_bytes,
            used_bytes: 0,
            ports: FxHashMap::default(),
            ready_ports: VecDeque::default(),
        }
    }

    pub fn ordering(&self) -> SequenceOrdering {
        self.ordering
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn has_room_for(&self, num_bytes: usize) -> bool {
        self.used_bytes + num_bytes <= self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.ports.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ready_ports.is_empty()
    }

    pub fn len_port(&self, port: u8) -> usize {
        self.ports.get(&port).map(|q| q.len()).unwrap_or(0)
    }

    pub fn ready_ports(&self) -> impl Iterator<Item = u8> + '_ {
        self.ready_ports.iter().copied()
    }

    pub fn push(&mut self, packet: Packet) -> S3tpResult<()> {
        if !self.has_room_for(packet.wire_len()) {
            trace!("queue is full: {} of {} bytes used, {} more requested", self.used_bytes, self.capacity_bytes, packet.wire_len());
            return Err(S3tpError::QueueFull);
        }
        self.do_push(packet);
        Ok(())
    }

    /// Pushes either all packets, leaving `packets` empty, or - if they do not fit - none of
    ///  them, leaving `packets` untouched so the caller can retry or put them back
    pub fn push_all(&mut self, packets: &mut Vec<Packet>) -> S3tpResult<()> {
        let total: usize = packets.iter().map(|p| p.wire_len()).sum();
        if !self.has_room_for(total) {
            trace!("queue is full: {} of {} bytes used, {} more requested", self.used_bytes, self.capacity_bytes, total);
            return Err(S3tpError::QueueFull);
        }
        for packet in packets.drain(..) {
            self.do_push(packet);
        }
        Ok(())
    }

    fn do_push(&mut self, packet: Packet) {
        let port = packet.port();
        self.used_bytes += packet.wire_len();

        let queue = self.ports.entry(port).or_default();
        if queue.is_empty() {
            self.ready_ports.push_back(port);
        }

        // insert behind all packets that do not come after the new one; this keeps packets with
        //  identical sequence numbers in push order. Iterating from the back because packets
        //  usually arrive in order.
        let ordering = self.ordering;
        let pos = queue.iter()
            .rposition(|existing| !ordering.precedes(&packet.header, &existing.header))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        queue.insert(pos, packet);
    }

    pub fn peek(&self, port: u8) -> Option<&Packet> {
        self.ports.get(&port)
            .and_then(|q| q.front())
    }

    pub fn iter_port(&self, port: u8) -> impl Iterator<Item = &Packet> {
        self.ports.get(&port)
            .into_iter()
            .flat_map(|q| q.iter())
    }

    pub fn pop(&mut self, port: u8) -> Option<Packet> {
        let queue = self.ports.get_mut(&port)?;
        let packet = queue.pop_front()?;
        if queue.is_empty() {
            self.ready_ports.retain(|&p| p != port);
        }
        self.used_bytes -= packet.wire_len();
        Some(packet)
    }

    /// Pops the head packet of the port that has been waiting longest. If that port has more
    ///  packets, it goes to the back of the ready ports.
    pub fn pop_any(&mut self) -> Option<Packet> {
        let port = self.ready_ports.pop_front()?;
        let queue = self.ports.get_mut(&port)?;
        let packet = queue.pop_front()?;
        if !queue.is_empty() {
            self.ready_ports.push_back(port);
        }
        self.used_bytes -= packet.wire_len();
        Some(packet)
    }

    /// discards all packets for a port, returning the number of discarded packets
    pub fn clear_port(&mut self, port: u8) -> usize {
        let Some(queue) = self.ports.remove(&port) else {
            return 0;
        };
        self.ready_ports.retain(|&p| p != port);
        self.used_bytes -= queue.iter().map(|p| p.wire_len()).sum::<usize>();
        queue.len()
    }

    pub fn clear(&mut self) -> usize {
        let num_packets = self.len();
        self.ports.clear();
        self.ready_ports.clear();
        self.used_bytes = 0;
        num_packets
    }
}


/// A [PacketQueue] shared between producer and consumer threads, with a condition variable that
///  is signalled whenever a packet is pushed.
pub struct PriorityQueue {
    queue: Mutex<PacketQueue>,
    packets_available: Condvar,
}

impl PriorityQueue {
    pub fn new(ordering: SequenceOrdering, capacity_bytes: usize) -> PriorityQueue {
        PriorityQueue {
            queue: Mutex::new(PacketQueue::new(ordering, capacity_bytes)),
            packets_available: Condvar::new(),
        }
    }

    pub fn push(&self, packet: Packet) -> S3tpResult<()> {
        self.queue.lock().push(packet)?;
        self.packets_available.notify_all();
        Ok(())
    }

    pub fn push_all(&self, packets: &mut Vec<Packet>) -> S3tpResult<()> {
        self.queue.lock().push_all(packets)?;
        self.packets_available.notify_all();
        Ok(())
    }

    pub fn pop(&self, port: u8) -> Option<Packet> {
        self.queue.lock().pop(port)
    }

    pub fn pop_any(&self) -> Option<Packet> {
        self.queue.lock().pop_any()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.queue.lock().used_bytes()
    }

    pub fn has_room_for(&self, num_bytes: usize) -> bool {
        self.queue.lock().has_room_for(num_bytes)
    }

    pub fn clear(&self) -> usize {
        self.queue.lock().clear()
    }

    /// Blocks until there is a packet in the queue and the consumer is not paused, or until the
    ///  consumer is cancelled.
    ///
    /// NB: Both closures are evaluated while holding the queue's lock, and the flags they check
    ///      must be followed by a call to [PriorityQueue::wake_all] when they change
    pub fn wait_for_packets(&self, is_cancelled: impl Fn() -> bool, is_paused: impl Fn() -> bool) {
        let mut queue = self.queue.lock();
        while !is_cancelled() && (queue.is_empty() || is_paused()) {
            self.packets_available.wait(&mut queue);
        }
    }

    pub fn wake_all(&self) {
        let _queue = self.queue.lock();
        self.packets_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::wire::packet_header::MessageType;

    fn packet(port: u8, seq: u16, port_seq: u8, payload_len: usize) -> Packet {
        let mut header = PacketHeader::new(1, port, MessageType::Datagram);
        header.seq = seq;
        header.port_seq = port_seq;
        Packet::new(header, Bytes::from(vec![0u8; payload_len]), 0)
    }

    fn pop_all_seqs(queue: &mut PacketQueue, port: u8) -> Vec<u16> {
        let mut result = Vec::new();
        while let Some(p) = queue.pop(port) {
            result.push(p.header.seq);
        }
        result
    }

    #[rstest]
    #[case::in_order(vec![1,2,3], vec![1,2,3])]
    #[case::reverse(vec![3,2,1], vec![1,2,3])]
    #[case::shuffled(vec![5,1,4,2,3], vec![1,2,3,4,5])]
    #[case::wrap_around(vec![1, 65534, 0, 65535], vec![65534, 65535, 0, 1])]
    #[case::duplicates(vec![2,1,2], vec![1,2,2])]
    fn test_pop_in_sequence_order(#[case] pushed: Vec<u16>, #[case] expected: Vec<u16>) {
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 1024*1024);
        for seq in pushed {
            queue.push(packet(3, seq, 0, 1)).unwrap();
        }
        assert_eq!(pop_all_seqs(&mut queue, 3), expected);
        assert!(queue.is_empty());
        assert_eq!(queue.used_bytes(), 0);
    }

    #[test]
    fn test_fragment_ordering() {
        let mut queue = PacketQueue::new(SequenceOrdering::Fragment, 1024*1024);
        queue.push(packet(3, 1, 254, 0)).unwrap();
        queue.push(packet(3, 2, 0, 0)).unwrap();
        queue.push(packet(3, 3, 255, 0)).unwrap();

        let order: Vec<u8> = queue.iter_port(3).map(|p| p.header.port_seq).collect();
        assert_eq!(order, vec![254, 255, 0]);
    }

    #[test]
    fn test_same_sequence_keeps_push_order() {
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 1024*1024);
        queue.push(packet(3, 7, 1, 1)).unwrap();
        queue.push(packet(3, 7, 2, 1)).unwrap();
        queue.push(packet(3, 6, 3, 1)).unwrap();

        let order: Vec<u8> = queue.iter_port(3).map(|p| p.header.port_seq).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_ports_are_independent() {
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 1024*1024);
        queue.push(packet(3, 2, 0, 1)).unwrap();
        queue.push(packet(4, 1, 0, 1)).unwrap();
        queue.push(packet(3, 1, 0, 1)).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.len_port(3), 2);
        assert_eq!(queue.peek(4).map(|p| p.header.seq), Some(1));
        assert_eq!(pop_all_seqs(&mut queue, 3), vec![1, 2]);
        assert_eq!(queue.ready_ports().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_capacity() {
        let packet_len = PacketHeader::SERIALIZED_LEN + 10;
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 2*packet_len);

        queue.push(packet(3, 1, 0, 10)).unwrap();
        queue.push(packet(3, 2, 0, 10)).unwrap();
        assert!(matches!(queue.push(packet(3, 3, 0, 10)), Err(S3tpError::QueueFull)));
        assert_eq!(queue.len(), 2);

        queue.pop(3).unwrap();
        queue.push(packet(3, 3, 0, 10)).unwrap();
        assert_eq!(queue.used_bytes(), 2*packet_len);
    }

    #[test]
    fn test_push_all_is_atomic() {
        let packet_len = PacketHeader::SERIALIZED_LEN + 10;
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 3*packet_len);
        queue.push(packet(3, 1, 0, 10)).unwrap();

        let mut batch = vec![packet(3, 2, 0, 10), packet(3, 3, 0, 10), packet(3, 4, 0, 10)];
        assert!(matches!(queue.push_all(&mut batch), Err(S3tpError::QueueFull)));
        assert_eq!(queue.len(), 1);
        assert_eq!(batch.len(), 3);

        batch.pop();
        queue.push_all(&mut batch).unwrap();
        assert_eq!(queue.len(), 3);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_pop_any_round_robin() {
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 1024*1024);
        queue.push(packet(3, 1, 0, 1)).unwrap();
        queue.push(packet(3, 2, 0, 1)).unwrap();
        queue.push(packet(4, 9, 0, 1)).unwrap();
        queue.push(packet(5, 4, 0, 1)).unwrap();

        let mut order = Vec::new();
        while let Some(p) = queue.pop_any() {
            order.push((p.port(), p.header.seq));
        }
        assert_eq!(order, vec![(3, 1), (4, 9), (5, 4), (3, 2)]);
        assert_eq!(queue.used_bytes(), 0);
    }

    #[test]
    fn test_clear_port() {
        let mut queue = PacketQueue::new(SequenceOrdering::Transmit, 1024*1024);
        queue.push(packet(3, 1, 0, 5)).unwrap();
        queue.push(packet(3, 2, 0, 5)).unwrap();
        queue.push(packet(4, 1, 0, 5)).unwrap();

        assert_eq!(queue.clear_port(3), 2);
        assert_eq!(queue.clear_port(3), 0);
        assert_eq!(queue.used_bytes(), PacketHeader::SERIALIZED_LEN + 5);
        assert_eq!(queue.pop_any().map(|p| p.port()), Some(4));
        assert!(queue.pop_any().is_none());
    }

    #[test]
    fn test_wait_for_packets_wakes_on_push() {
        let queue = Arc::new(PriorityQueue::new(SequenceOrdering::Transmit, 1024*1024));

        let consumer_queue = queue.clone();
        let consumer = thread::spawn(move || {
            consumer_queue.wait_for_packets(|| false, || false);
            consumer_queue.pop_any()
        });

        thread::sleep(Duration::from_millis(20));
        queue.push(packet(3, 1, 0, 1)).unwrap();

        let popped = consumer.join().unwrap();
        assert_eq!(popped.map(|p| p.header.seq), Some(1));
    }

    #[test]
    fn test_wait_for_packets_wakes_on_cancel() {
        let queue = Arc::new(PriorityQueue::new(SequenceOrdering::Transmit, 1024*1024));
        let cancelled = Arc::new(AtomicBool::new(false));

        let consumer_queue = queue.clone();
        let consumer_cancelled = cancelled.clone();
        let consumer = thread::spawn(move || {
            consumer_queue.wait_for_packets(|| consumer_cancelled.load(Ordering::Acquire), || false);
        });

        thread::sleep(Duration::from_millis(20));
        cancelled.store(true, Ordering::Release);
        queue.wake_all();

        consumer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_for_packets_while_paused() {
        let queue = Arc::new(PriorityQueue::new(SequenceOrdering::Transmit, 1024*1024));
        let paused = Arc::new(AtomicBool::new(true));
        queue.push(packet(3, 1, 0, 1)).unwrap();

        let consumer_queue = queue.clone();
        let consumer_paused = paused.clone();
        let consumer = thread::spawn(move || {
            consumer_queue.wait_for_packets(|| false, || consumer_paused.load(Ordering::Acquire));
            consumer_queue.pop_any()
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        paused.store(false, Ordering::Release);
        queue.wake_all();
        assert!(consumer.join().unwrap().is_some());
    }
}
