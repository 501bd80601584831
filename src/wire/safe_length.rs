use std::io;
use std::io::{ErrorKind, Read, Write};
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::error::{S3tpError, S3tpResult};
use crate::safe_converter::PrecheckedCast;

/// A length prefix that survives bit flips on the wire.
///
/// The length is replicated [SafeLength::REDUNDANCY] times into a fixed-size record, and decoded
///  by majority vote. This trades bandwidth for robustness on metadata that can not be validated
///  in any other way: if a length prefix on a byte stream is corrupted, every subsequent frame
///  boundary is lost.
///
/// ```ascii
/// 0: length (u32 BE)
/// 4: length (u32 BE)
/// ... REDUNDANCY times
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafeLength {
    pub len: u32,
}

impl SafeLength {
    pub const REDUNDANCY: usize = 5;
    pub const SERIALIZED_LEN: usize = Self::REDUNDANCY * size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        for _ in 0..Self::REDUNDANCY {
            buf.put_u32(self.len);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> S3tpResult<SafeLength> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(S3tpError::malformed(format!("length record needs {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining())));
        }

        let mut copies = [0u32; Self::REDUNDANCY];
        for copy in copies.iter_mut() {
            *copy = buf.get_u32();
        }

        let len = Self::majority(&copies).ok_or(S3tpError::CorruptLength)?;
        Ok(SafeLength { len })
    }

    /// the value that occurs in more than half of the copies, if any
    fn majority(copies: &[u32]) -> Option<u32> {
        let mut counts = FxHashMap::<u32, usize>::default();
        for &copy in copies {
            *counts.entry(copy).or_default() += 1;
        }

        let (value, count) = counts.into_iter()
            .max_by_key(|&(_, count)| count)?;

        if count <= copies.len() / 2 {
            debug!("no majority in redundant length record {:?}", copies);
            return None;
        }
        Some(value)
    }
}

/// Writes a frame as a redundant length record followed by the frame's bytes
pub fn write_framed(w: &mut impl Write, frame: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(SafeLength::SERIALIZED_LEN + frame.len());
    SafeLength { len: frame.len().prechecked_cast() }.ser(&mut buf);
    buf.put_slice(frame);

    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Reads a frame written by [write_framed]. Returns `None` if the stream ends cleanly before the
///  start of a frame.
///
/// NB: A `CorruptLength` or `MessageTooLarge` error means that frame boundaries are lost, and the
///      stream can not be resynchronized - the caller should close it
pub fn read_framed(r: &mut impl Read, max_len: usize) -> S3tpResult<Option<Vec<u8>>> {
    let mut record = [0u8; SafeLength::SERIALIZED_LEN];

    // a clean end of stream is only acceptable before the first byte of a record
    loop {
        match r.read(&mut record[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    r.read_exact(&mut record[1..])?;

    let len = SafeLength::deser(&mut &record[..])?.len as usize;
    if len > max_len {
        return Err(S3tpError::MessageTooLarge { len, max: max_len });
    }

    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame)?;
    trace!("read frame of {} bytes", len);
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use rstest::rstest;

    fn record(copies: [u32; SafeLength::REDUNDANCY]) -> Vec<u8> {
        let mut buf = Vec::new();
        for copy in copies {
            buf.put_u32(copy);
        }
        buf
    }

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        SafeLength { len: 0x01020304 }.ser(&mut buf);
        assert_eq!(buf.as_ref(), record([0x01020304; 5]).as_slice());
    }

    #[rstest]
    #[case::intact([7, 7, 7, 7, 7], Some(7))]
    #[case::one_corrupted([7, 7, 99, 7, 7], Some(7))]
    #[case::two_corrupted_differently([7, 1, 7, 2, 7], Some(7))]
    #[case::two_corrupted_identically([7, 3, 7, 3, 7], Some(7))]
    #[case::three_corrupted([7, 3, 4, 7, 5], None)]
    #[case::no_majority_two_two_one([7, 7, 3, 3, 5], None)]
    #[case::all_different([1, 2, 3, 4, 5], None)]
    #[case::majority_of_corrupted_value([3, 3, 3, 7, 7], Some(3))]
    fn test_deser(#[case] copies: [u32; SafeLength::REDUNDANCY], #[case] expected: Option<u32>) {
        let raw = record(copies);
        let mut b: &[u8] = &raw;
        match (SafeLength::deser(&mut b), expected) {
            (Ok(actual), Some(expected)) => assert_eq!(actual.len, expected),
            (Err(S3tpError::CorruptLength), None) => {}
            (actual, expected) => panic!("expected {:?}, was {:?}", expected, actual),
        }
    }

    #[test]
    fn test_deser_incomplete_record() {
        let raw = vec![0u8; SafeLength::SERIALIZED_LEN - 1];
        let mut b: &[u8] = &raw;
        assert!(matches!(SafeLength::deser(&mut b), Err(S3tpError::MalformedPacket(_))));
    }

    #[test]
    fn test_framed_stream() {
        let mut stream = Vec::new();
        write_framed(&mut stream, b"first").unwrap();
        write_framed(&mut stream, b"").unwrap();
        write_framed(&mut stream, b"third frame").unwrap();

        let mut r = Cursor::new(stream);
        assert_eq!(read_framed(&mut r, 100).unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_framed(&mut r, 100).unwrap(), Some(vec![]));
        assert_eq!(read_framed(&mut r, 100).unwrap(), Some(b"third frame".to_vec()));
        assert_eq!(read_framed(&mut r, 100).unwrap(), None);
    }

    #[test]
    fn test_framed_stream_survives_single_copy_corruption() {
        let mut stream = Vec::new();
        write_framed(&mut stream, b"abc").unwrap();
        stream[2] ^= 0x40;

        let mut r = Cursor::new(stream);
        assert_eq!(read_framed(&mut r, 100).unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_framed_stream_corrupt_length() {
        let mut stream = record([1, 2, 3, 4, 5]);
        stream.extend_from_slice(b"abc");

        let mut r = Cursor::new(stream);
        assert!(matches!(read_framed(&mut r, 100), Err(S3tpError::CorruptLength)));
    }

    #[test]
    fn test_framed_stream_too_large() {
        let mut stream = Vec::new();
        write_framed(&mut stream, b"abcdef").unwrap();

        let mut r = Cursor::new(stream);
        assert!(matches!(read_framed(&mut r, 5), Err(S3tpError::MessageTooLarge { len: 6, max: 5 })));
    }

    #[test]
    fn test_framed_stream_truncated() {
        let mut stream = Vec::new();
        write_framed(&mut stream, b"abcdef").unwrap();
        stream.truncate(stream.len() - 2);

        let mut r = Cursor::new(stream);
        assert!(matches!(read_framed(&mut r, 100), Err(S3tpError::Io(_))));
    }
}
