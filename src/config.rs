use std::time::Duration;
use anyhow::bail;
use crate::wire::packet_header::PacketHeader;

#[derive(Clone, Debug)]
pub struct S3tpConfig {
    /// This is the size of a complete packet (header plus PDU) as it is handed to the link
    ///  driver. Packets are never split by the link, so this must fit the link's frame size.
    ///
    /// Satellite modems typically have small frames and low throughput; the PDU length field
    ///  has 14 bits, which puts an upper bound of `PacketHeader::SERIALIZED_LEN + 16383` on this
    ///  value.
    pub mtu: usize,

    /// Upper bound for the aggregate packet bytes in the shared send queue and in the reassembly
    ///  queue
    pub queue_capacity_bytes: usize,
    /// Upper bound for the aggregate packet bytes in each connection's outbound and inbound queues
    pub connection_queue_capacity_bytes: usize,

    /// Fragment sequence numbers are 8 bits wide and compared with wrap-around semantics, so a
    ///  message can never span more than 128 fragments
    pub max_fragments_per_message: usize,

    /// This is the maximum number of *packets* (not bytes) that a connection keeps in flight
    ///  pending acknowledgement. Sequence numbers are 8 bits wide, so this must be <= 128.
    pub transmission_window: u8,

    pub retransmission_timeout: Duration,
    /// upper bound for the exponential back-off of retransmissions
    pub max_retransmission_timeout: Duration,
    /// a connection is reset after a packet was retransmitted this many times without being
    ///  acknowledged
    pub max_retransmissions: u32,
    pub retransmission_check_interval: Duration,

    /// How long a reliable send waits for room in a full connection queue. `None` fails
    ///  immediately with `QueueFull`.
    pub send_timeout: Option<Duration>,
}

impl Default for S3tpConfig {
    fn default() -> Self {
        S3tpConfig {
            mtu: 1024,
            queue_capacity_bytes: 1024*1024,
            connection_queue_capacity_bytes: 64*1024,
            max_fragments_per_message: 128,
            transmission_window: 64,
            retransmission_timeout: Duration::from_secs(2),
            max_retransmission_timeout: Duration::from_secs(30),
            max_retransmissions: 5,
            retransmission_check_interval: Duration::from_millis(100),
            send_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl S3tpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= PacketHeader::SERIALIZED_LEN {
            bail!("MTU of {} does not leave room for a PDU after the {} byte header", self.mtu, PacketHeader::SERIALIZED_LEN);
        }
        if self.max_pdu_len() > PacketHeader::MAX_PDU_LEN {
            bail!("MTU of {} exceeds the maximum PDU length of {} bytes", self.mtu, PacketHeader::MAX_PDU_LEN);
        }
        if self.transmission_window == 0 || self.transmission_window > 128 {
            bail!("transmission window must be between 1 and 128, was {}", self.transmission_window);
        }
        if self.max_fragments_per_message == 0 || self.max_fragments_per_message > 128 {
            bail!("max fragments per message must be between 1 and 128, was {}", self.max_fragments_per_message);
        }
        if self.queue_capacity_bytes < self.mtu || self.connection_queue_capacity_bytes < self.mtu {
            bail!("queue capacities must hold at least one packet of {} bytes", self.mtu);
        }
        if self.retransmission_timeout > self.max_retransmission_timeout {
            bail!("retransmission timeout exceeds its own upper bound");
        }
        Ok(())
    }

    pub fn max_pdu_len(&self) -> usize {
        self.mtu.saturating_sub(PacketHeader::SERIALIZED_LEN)
    }

    pub fn max_message_len(&self) -> usize {
        self.max_pdu_len() * self.max_fragments_per_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(S3tpConfig::default(), true)]
    #[case::mtu_header_only(S3tpConfig { mtu: PacketHeader::SERIALIZED_LEN, ..Default::default() }, false)]
    #[case::mtu_max(S3tpConfig { mtu: PacketHeader::SERIALIZED_LEN + PacketHeader::MAX_PDU_LEN, queue_capacity_bytes: 1024*1024, connection_queue_capacity_bytes: 1024*1024, ..Default::default() }, true)]
    #[case::mtu_too_big(S3tpConfig { mtu: PacketHeader::SERIALIZED_LEN + PacketHeader::MAX_PDU_LEN + 1, queue_capacity_bytes: 1024*1024, connection_queue_capacity_bytes: 1024*1024, ..Default::default() }, false)]
    #[case::window_zero(S3tpConfig { transmission_window: 0, ..Default::default() }, false)]
    #[case::window_max(S3tpConfig { transmission_window: 128, ..Default::default() }, true)]
    #[case::window_too_big(S3tpConfig { transmission_window: 129, ..Default::default() }, false)]
    #[case::no_fragments(S3tpConfig { max_fragments_per_message: 0, ..Default::default() }, false)]
    #[case::small_queue(S3tpConfig { connection_queue_capacity_bytes: 100, ..Default::default() }, false)]
    #[case::rto_above_max(S3tpConfig { retransmission_timeout: Duration::from_secs(60), ..Default::default() }, false)]
    fn test_validate(#[case] config: S3tpConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_derived_lengths() {
        let config = S3tpConfig { mtu: 1000 + PacketHeader::SERIALIZED_LEN, max_fragments_per_message: 10, ..Default::default() };
        assert_eq!(config.max_pdu_len(), 1000);
        assert_eq!(config.max_message_len(), 10_000);
    }
}
