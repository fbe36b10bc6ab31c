//! Length-prefixed record framing shared by the log files and the wire.
//!
//! A frame is a protobuf-style varint holding the body length, the
//! bincode-encoded body, then a little-endian CRC32 of the body. A clean end of
//! input between frames reads as `None`; input that ends inside a frame is an
//! error, and so is a body whose checksum does not match.

use std::io::{self, Read};

use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;
use crate::error::{ReplicatorError, Result};

/// Upper bound on a frame body; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Bytes of checksum trailing every body.
pub const CHECKSUM_LEN: u64 = 4;

const MAX_VARINT_LEN: usize = 10;

pub fn encode_frame<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<()> {
    let body = bincode::serialize(value)?;
    out.reserve(encoded_len_varint(body.len() as u64) + body.len() + CHECKSUM_LEN as usize);
    encode_varint(body.len() as u64, out);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(())
}

pub fn frame_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_frame(value, &mut out)?;
    Ok(out)
}

/// Accumulates the varint length prefix of a frame one byte at a time, so
/// blocking and async readers decode it the same way.
#[derive(Debug, Default)]
pub struct FrameLen {
    buf: [u8; MAX_VARINT_LEN],
    len: usize,
}

impl FrameLen {
    /// Whether no byte of the prefix has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds the next prefix byte. Returns the body length once the varint is
    /// complete.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        self.buf[self.len] = byte;
        self.len += 1;
        if byte & 0x80 != 0 {
            if self.len == MAX_VARINT_LEN {
                return Err(ReplicatorError::Codec("frame length varint too long".into()));
            }
            return Ok(None);
        }
        let frame_len = decode_varint(&mut &self.buf[..self.len])
            .map_err(|err| ReplicatorError::Codec(err.to_string()))?;
        if frame_len > MAX_FRAME_LEN {
            return Err(ReplicatorError::Codec(format!("frame length {frame_len} exceeds maximum")));
        }
        Ok(Some(frame_len))
    }
}

/// Bytes that follow the prefix of a frame whose body is `len` long.
pub fn trailer_len(len: u64) -> usize {
    (len + CHECKSUM_LEN) as usize
}

/// Splits the checksum off a frame's body and trailer and verifies it.
pub fn verify_checksum(mut frame: Vec<u8>) -> Result<Vec<u8>> {
    let Some(split) = frame.len().checked_sub(CHECKSUM_LEN as usize) else {
        return Err(ReplicatorError::Codec("frame shorter than its checksum".into()));
    };
    let mut stored = [0u8; CHECKSUM_LEN as usize];
    stored.copy_from_slice(&frame[split..]);
    frame.truncate(split);
    if crc32fast::hash(&frame) != u32::from_le_bytes(stored) {
        return Err(ReplicatorError::Codec("frame checksum mismatch".into()));
    }
    Ok(frame)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Reads the varint length prefix. `Ok(None)` means the input ended cleanly.
pub fn read_frame_len<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u64>> {
    let mut prefix = FrameLen::default();
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) if prefix.is_empty() => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof inside frame length").into())
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        if let Some(len) = prefix.push(byte[0])? {
            return Ok(Some(len));
        }
    }
}

/// Reads a body of `len` bytes and its checksum, returning the verified body.
pub fn read_frame_body<R: Read + ?Sized>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; trailer_len(len)];
    reader.read_exact(&mut frame)?;
    verify_checksum(frame)
}

pub fn read_frame<R: Read + ?Sized, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let Some(len) = read_frame_len(reader)? else {
        return Ok(None);
    };
    let body = read_frame_body(reader, len)?;
    Ok(Some(decode_body(&body)?))
}

pub fn decode_entry<R: Read + ?Sized>(reader: &mut R) -> Result<Option<LogEntry>> {
    read_frame(reader)
}

/// What a recovery scan found at one position of a log file.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameScan {
    /// Clean end of input.
    End,
    /// A verified body.
    Frame(Vec<u8>),
    /// The input ends inside the frame.
    Torn,
    /// The whole frame is present but its checksum does not match.
    Corrupt,
}

/// Reads the next frame for recovery, telling a torn write apart from a
/// damaged one. The reader is left after the frame, or at the end of input.
pub fn scan_frame<R: Read + ?Sized>(reader: &mut R) -> Result<FrameScan> {
    let len = match read_frame_len(reader) {
        Ok(Some(len)) => len,
        Ok(None) => return Ok(FrameScan::End),
        Err(ReplicatorError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameScan::Torn),
        Err(err) => return Err(err),
    };
    let mut frame = vec![0u8; trailer_len(len)];
    match reader.read_exact(&mut frame) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameScan::Torn),
        Err(err) => return Err(err.into()),
    }
    Ok(match verify_checksum(frame) {
        Ok(body) => FrameScan::Frame(body),
        Err(_) => FrameScan::Corrupt,
    })
}

#[derive(Deserialize)]
struct EntryPrefix {
    #[allow(dead_code)]
    term: u64,
    index: u64,
}

/// Consumes one entry frame and returns its sequence number, without
/// decoding the payload.
pub fn skip_entry_and_return_seq_num<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u64>> {
    let Some(len) = read_frame_len(reader)? else {
        return Ok(None);
    };
    let body = read_frame_body(reader, len)?;
    let prefix: EntryPrefix = decode_body(&body)?;
    Ok(Some(prefix.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;
    use crate::quorum::QuorumConfiguration;

    #[test]
    fn reads_entries_back_in_order() {
        let logged = entries()
            .term(3)
            .indexes(&[1, 2])
            .configuration_and_index(QuorumConfiguration::of([1, 2, 3]), 3)
            .build();
        let mut bytes = Vec::new();
        for entry in &logged {
            encode_frame(entry, &mut bytes).unwrap();
        }

        let mut reader = &bytes[..];
        let mut decoded = Vec::new();
        while let Some(entry) = decode_entry(&mut reader).unwrap() {
            decoded.push(entry);
        }
        assert_eq!(decoded, logged);
    }

    #[test]
    fn skipping_reports_sequence_numbers() {
        let mut bytes = Vec::new();
        for entry in entries().term(9).indexes(&[41, 42]).build() {
            encode_frame(&entry, &mut bytes).unwrap();
        }
        let mut reader = &bytes[..];
        assert_eq!(skip_entry_and_return_seq_num(&mut reader).unwrap(), Some(41));
        assert_eq!(skip_entry_and_return_seq_num(&mut reader).unwrap(), Some(42));
        assert_eq!(skip_entry_and_return_seq_num(&mut reader).unwrap(), None);
    }

    #[test]
    fn torn_frame_is_an_error() {
        let bytes = frame_bytes(&entries().term(1).indexes(&[1]).build()[0]).unwrap();
        let mut reader = &bytes[..bytes.len() - 2];
        assert!(decode_entry(&mut reader).is_err());
    }

    #[test]
    fn flipped_body_byte_fails_the_checksum() {
        let mut bytes = frame_bytes(&entries().term(1).indexes(&[1]).build()[0]).unwrap();
        bytes[3] ^= 0xff;
        assert!(matches!(decode_entry(&mut &bytes[..]), Err(ReplicatorError::Codec(_))));
        assert_eq!(scan_frame(&mut &bytes[..]).unwrap(), FrameScan::Corrupt);
    }

    #[test]
    fn scan_tells_torn_frames_from_clean_ends() {
        let bytes = frame_bytes(&entries().term(1).indexes(&[1]).build()[0]).unwrap();
        assert_eq!(scan_frame(&mut &bytes[..0]).unwrap(), FrameScan::End);
        assert_eq!(scan_frame(&mut &bytes[..bytes.len() - 1]).unwrap(), FrameScan::Torn);
        assert!(matches!(scan_frame(&mut &bytes[..]).unwrap(), FrameScan::Frame(_)));
    }
}
