use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::{S3tpError, S3tpResult};

/// Payload of a selective acknowledgement (a packet with the CTRL flag): the ranges of reliability
///  sequence numbers that were received *beyond* the cumulative ack point.
///
/// ```ascii
/// 0: number of ranges (u8)
/// *: (repeated) first sequence number of the range (u8), last sequence number of the range (u8)
/// ```
///
/// NB: Ranges are inclusive on both ends and may wrap around
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SackRanges {
    pub ranges: Vec<(u8, u8)>,
}

impl SackRanges {
    pub fn serialized_len(num_ranges: usize) -> usize {
        1 + 2*num_ranges
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.ranges.len() <= u8::MAX as usize);

        buf.put_u8(self.ranges.len() as u8);
        for &(start, end) in &self.ranges {
            buf.put_u8(start);
            buf.put_u8(end);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::serialized_len(self.ranges.len()));
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> S3tpResult<SackRanges> {
        if !buf.has_remaining() {
            return Err(S3tpError::invalid_packet("empty SACK payload"));
        }
        let num_ranges = buf.get_u8() as usize;
        if buf.remaining() != 2*num_ranges {
            return Err(S3tpError::invalid_packet(format!("SACK announces {} ranges, but has {} bytes of range data", num_ranges, buf.remaining())));
        }

        let mut ranges = Vec::with_capacity(num_ranges);
        for _ in 0..num_ranges {
            let start = buf.get_u8();
            let end = buf.get_u8();
            ranges.push((start, end));
        }
        Ok(SackRanges { ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(vec![], vec![0])]
    #[case::single(vec![(2,2)], vec![1, 2,2])]
    #[case::several(vec![(5,7), (9,12)], vec![2, 5,7, 9,12])]
    #[case::wrapping(vec![(254,1)], vec![1, 254,1])]
    fn test_ser_deser(#[case] ranges: Vec<(u8, u8)>, #[case] expected: Vec<u8>) {
        let sack = SackRanges { ranges };
        let bytes = sack.to_bytes();
        assert_eq!(bytes.as_ref(), expected.as_slice());

        let mut b: &[u8] = &bytes;
        assert_eq!(SackRanges::deser(&mut b).unwrap(), sack);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![2, 1,2, 3])]
    #[case::trailing(vec![1, 1,2, 3])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(matches!(SackRanges::deser(&mut b), Err(S3tpError::InvalidPacket(_))));
    }
}
