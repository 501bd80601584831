use std::cmp::min;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;
use crate::config::S3tpConfig;
use crate::sequence::{is_in_range, SerialNumber};
use crate::wire::packet::Packet;

pub struct RetransmissionEntry {
    pub packet: Packet,
    /// time of the most recent (re)transmission
    pub sent_at: Instant,
    pub retries: u32,
}

/// Copies of sent packets that consume a reliability sequence number (SYN, DATA, FIN) and are not
///  acknowledged yet, in the order they were sent.
#[derive(Default)]
pub struct RetransmissionQueue {
    entries: VecDeque<RetransmissionEntry>,
}

#[derive(Debug)]
pub enum RetransmissionOutcome {
    /// packets that are due for retransmission, possibly none
    Due(Vec<Packet>),
    /// a packet reached the maximum number of retransmissions
    Exhausted { rel_seq: u8 },
}

impl RetransmissionQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, packet: Packet, now: Instant) {
        self.entries.push_back(RetransmissionEntry {
            packet,
            sent_at: now,
            retries: 0,
        });
    }

    pub fn contains(&self, rel_seq: u8) -> bool {
        self.entries.iter().any(|e| e.packet.header.rel_seq == rel_seq)
    }

    /// removes all packets with a sequence number before `ack`, returning the number of removed packets
    pub fn acknowledge_up_to(&mut self, ack: u8) -> usize {
        let len_before = self.entries.len();
        self.entries.retain(|e| !e.packet.header.rel_seq.precedes(ack));
        len_before - self.entries.len()
    }

    /// removes the packets in the inclusive range `[first, last]`
    pub fn acknowledge_range(&mut self, first: u8, last: u8) -> usize {
        let len_before = self.entries.len();
        self.entries.retain(|e| !is_in_range(e.packet.header.rel_seq, first, last));
        len_before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// the time a packet waits for its acknowledgement after its `retries`th retransmission
    pub fn backoff(config: &S3tpConfig, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        min(config.retransmission_timeout.saturating_mul(factor), config.max_retransmission_timeout)
    }

    /// Collects copies of all packets whose back-off expired, counting the retransmission.
    pub fn due_packets(&mut self, now: Instant, config: &S3tpConfig) -> RetransmissionOutcome {
        let mut due = Vec::new();
        for entry in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) < Self::backoff(config, entry.retries) {
                continue;
            }
            if entry.retries >= config.max_retransmissions {
                return RetransmissionOutcome::Exhausted { rel_seq: entry.packet.header.rel_seq };
            }

            entry.retries += 1;
            entry.sent_at = now;
            trace!("retransmitting {:?} (retry #{})", entry.packet.header, entry.retries);
            due.push(entry.packet.clone());
        }
        RetransmissionOutcome::Due(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::wire::packet_header::{MessageType, PacketHeader};

    fn packet(rel_seq: u8) -> Packet {
        let mut header = PacketHeader::new(1, 2, MessageType::Connection);
        header.rel_seq = rel_seq;
        Packet::new(header, Bytes::from_static(b"x"), 0)
    }

    fn queue_with(rel_seqs: &[u8], now: Instant) -> RetransmissionQueue {
        let mut queue = RetransmissionQueue::default();
        for &rel_seq in rel_seqs {
            queue.push(packet(rel_seq), now);
        }
        queue
    }

    fn remaining(queue: &RetransmissionQueue) -> Vec<u8> {
        queue.entries.iter().map(|e| e.packet.header.rel_seq).collect()
    }

    #[rstest]
    #[case::nothing(vec![3,4,5], 3, 0, vec![3,4,5])]
    #[case::first(vec![3,4,5], 4, 1, vec![4,5])]
    #[case::all(vec![3,4,5], 6, 3, vec![])]
    #[case::wrapping(vec![254,255,0,1], 1, 3, vec![1])]
    fn test_acknowledge_up_to(#[case] rel_seqs: Vec<u8>, #[case] ack: u8, #[case] expected_removed: usize, #[case] expected_remaining: Vec<u8>) {
        let mut queue = queue_with(&rel_seqs, Instant::now());
        assert_eq!(queue.acknowledge_up_to(ack), expected_removed);
        assert_eq!(remaining(&queue), expected_remaining);
    }

    #[test]
    fn test_contains_until_acknowledged() {
        let mut queue = RetransmissionQueue::default();
        assert!(!queue.contains(7));

        queue.push(packet(7), Instant::now());
        assert!(queue.contains(7));
        assert!(!queue.contains(8));

        queue.acknowledge_up_to(8);
        assert!(!queue.contains(7));
        assert!(queue.is_empty());
    }

    #[rstest]
    #[case::single(vec![3,4,5,6], 4, 4, vec![3,5,6])]
    #[case::several(vec![3,4,5,6], 5, 6, vec![3,4])]
    #[case::wrapping(vec![254,255,0,1], 255, 0, vec![254,1])]
    #[case::not_present(vec![3,4], 9, 10, vec![3,4])]
    fn test_acknowledge_range(#[case] rel_seqs: Vec<u8>, #[case] first: u8, #[case] last: u8, #[case] expected_remaining: Vec<u8>) {
        let mut queue = queue_with(&rel_seqs, Instant::now());
        queue.acknowledge_range(first, last);
        assert_eq!(remaining(&queue), expected_remaining);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 4)]
    #[case(2, 8)]
    #[case(3, 16)]
    #[case(4, 30)]
    #[case(40, 30)]
    fn test_backoff(#[case] retries: u32, #[case] expected_secs: u64) {
        let config = S3tpConfig::default();
        assert_eq!(RetransmissionQueue::backoff(&config, retries), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_due_packets() {
        let config = S3tpConfig {
            retransmission_timeout: Duration::from_millis(100),
            max_retransmission_timeout: Duration::from_secs(1),
            max_retransmissions: 2,
            ..Default::default()
        };
        let start = Instant::now();
        let mut queue = queue_with(&[1], start);
        queue.push(packet(2), start + Duration::from_millis(50));

        match queue.due_packets(start + Duration::from_millis(99), &config) {
            RetransmissionOutcome::Due(packets) => assert!(packets.is_empty()),
            other => panic!("{:?}", other),
        }
        match queue.due_packets(start + Duration::from_millis(100), &config) {
            RetransmissionOutcome::Due(packets) => assert_eq!(packets.iter().map(|p| p.header.rel_seq).collect::<Vec<_>>(), vec![1]),
            other => panic!("{:?}", other),
        }

        // second retry of #1 after 200ms, first retry of #2 after 100ms
        match queue.due_packets(start + Duration::from_millis(300), &config) {
            RetransmissionOutcome::Due(packets) => assert_eq!(packets.iter().map(|p| p.header.rel_seq).collect::<Vec<_>>(), vec![1, 2]),
            other => panic!("{:?}", other),
        }

        match queue.due_packets(start + Duration::from_millis(700), &config) {
            RetransmissionOutcome::Exhausted { rel_seq } => assert_eq!(rel_seq, 1),
            other => panic!("{:?}", other),
        }
    }
}
