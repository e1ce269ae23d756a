//! Checksummed record framing shared by ledger logs, snapshots and swap files.
//!
//! Frame layout (little endian):
//!
//! ```text
//! +-------------+-------------+----------------------+
//! | len: u32    | crc32: u32  | payload: len bytes   |
//! +-------------+-------------+----------------------+
//! ```
//!
//! The payload is a bincode encoding of the framed value and the CRC covers
//! the payload only. A reader distinguishes a clean end of input from a torn
//! frame (short header, short payload, oversized length or CRC mismatch).

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::CodecError;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: u64 = 8;

/// Largest payload a frame may declare. Anything above is treated as torn.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Outcome of reading one raw frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RawFrame {
    /// A complete frame whose checksum matched.
    Payload(Vec<u8>),
    /// The input ended exactly on a frame boundary.
    End,
    /// The frame is incomplete or failed its checksum.
    Torn {
        /// Payload length from the header, when the header was complete and plausible.
        declared_len: Option<u32>,
        /// Short description of what was wrong.
        reason: &'static str,
    },
}

/// Encodes `value` as a complete frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(CodecError::Encode(format!(
            "payload of {} bytes exceeds frame limit {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encodes `value` and writes the frame to `writer`, returning the bytes written.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<u64, CodecError> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame)?;
    Ok(frame.len() as u64)
}

/// Decodes a payload previously produced by [`encode_frame`].
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(payload).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Reads one raw frame from `reader`.
///
/// I/O errors other than a short read are returned as errors; short reads are
/// reported as [`RawFrame::Torn`] (or [`RawFrame::End`] when no byte was read).
pub fn read_raw_frame<R: Read>(reader: &mut R) -> io::Result<RawFrame> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    let got = read_fully(reader, &mut header)?;
    if got == 0 {
        return Ok(RawFrame::End);
    }
    if got < header.len() {
        return Ok(RawFrame::Torn {
            declared_len: None,
            reason: "short frame header",
        });
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Ok(RawFrame::Torn {
            declared_len: None,
            reason: "frame length out of range",
        });
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_fully(reader, &mut payload)?;
    if got < payload.len() {
        return Ok(RawFrame::Torn {
            declared_len: Some(len),
            reason: "short frame payload",
        });
    }

    let actual = crc32fast::hash(&payload);
    if actual != crc {
        debug!(expected = crc, actual = actual, len = len, "frame checksum mismatch");
        return Ok(RawFrame::Torn {
            declared_len: Some(len),
            reason: "frame checksum mismatch",
        });
    }

    Ok(RawFrame::Payload(payload))
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decoded frame produced by [`FrameReader::next_frame`].
#[derive(Debug)]
pub enum Frame<T> {
    /// A decoded value and the offset its frame started at.
    Value {
        /// The decoded value.
        value: T,
        /// Byte offset of the frame header.
        offset: u64,
    },
    /// Clean end of input.
    End,
    /// Torn frame starting at `offset`.
    Torn {
        /// Byte offset of the torn frame header.
        offset: u64,
        /// Payload length declared by the header, if readable.
        declared_len: Option<u32>,
        /// What was wrong with the frame.
        reason: &'static str,
    },
}

/// Sequential frame reader that tracks the byte offset of each frame.
pub struct FrameReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    /// Wraps `inner`, which must be positioned at a frame boundary.
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Offset of the next unread frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads and decodes the next frame.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Frame<T>, CodecError> {
        let start = self.offset;
        match read_raw_frame(&mut self.inner)? {
            RawFrame::Payload(payload) => {
                self.offset += FRAME_HEADER_LEN + payload.len() as u64;
                let value = decode(&payload)?;
                Ok(Frame::Value {
                    value,
                    offset: start,
                })
            }
            RawFrame::End => Ok(Frame::End),
            RawFrame::Torn {
                declared_len,
                reason,
            } => Ok(Frame::Torn {
                offset: start,
                declared_len,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    fn sample(id: u64) -> Sample {
        Sample {
            id,
            name: format!("sample-{}", id),
        }
    }

    #[test]
    fn test_frames_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample(1)).unwrap();
        write_frame(&mut buf, &sample(2)).unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        match reader.next_frame::<Sample>().unwrap() {
            Frame::Value { value, offset } => {
                assert_eq!(value, sample(1));
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match reader.next_frame::<Sample>().unwrap() {
            Frame::Value { value, .. } => assert_eq!(value, sample(2)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(reader.next_frame::<Sample>().unwrap(), Frame::End));
    }

    #[test]
    fn test_truncated_payload_is_torn() {
        let mut buf = encode_frame(&sample(9)).unwrap();
        buf.truncate(buf.len() - 3);
        let mut reader = FrameReader::new(Cursor::new(buf));
        match reader.next_frame::<Sample>().unwrap() {
            Frame::Torn {
                offset,
                declared_len,
                reason,
            } => {
                assert_eq!(offset, 0);
                assert!(declared_len.is_some());
                assert_eq!(reason, "short frame payload");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_header_is_torn() {
        let mut reader = FrameReader::new(Cursor::new(vec![1u8, 2, 3]));
        assert!(matches!(
            reader.next_frame::<Sample>().unwrap(),
            Frame::Torn {
                declared_len: None,
                ..
            }
        ));
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let mut buf = encode_frame(&sample(4)).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(
            read_raw_frame(&mut Cursor::new(buf)).unwrap(),
            RawFrame::Torn {
                reason: "frame checksum mismatch",
                ..
            }
        ));
    }

    #[test]
    fn test_oversized_length_is_torn() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            read_raw_frame(&mut Cursor::new(buf)).unwrap(),
            RawFrame::Torn {
                declared_len: None,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_wrong_type_is_error() {
        let frame = encode_frame(&7u8).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert!(reader.next_frame::<Sample>().is_err());
    }
}
