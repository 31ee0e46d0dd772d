//! Binary framing for file chunks.
//!
//! # Frame Format
//!
//! Each binary data-channel message carries one chunk:
//! - N bytes: UTF-8 transfer id
//! - 1 byte: separator `|` (0x7C)
//! - M bytes: raw file bytes
//!
//! The receiver only looks for the separator in the first
//! [`TRANSFER_ID_SEARCH_WINDOW`] bytes, so transfer ids must stay short.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Default payload size of one chunk (16 KiB).
pub const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Separator between transfer id and chunk payload.
pub const CHUNK_SEPARATOR: u8 = b'|';

/// How far into a frame the separator may appear.
pub const TRANSFER_ID_SEARCH_WINDOW: usize = 60;

/// A decoded chunk borrowing from the received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk<'a> {
    /// Transfer this chunk belongs to.
    pub transfer_id: &'a str,
    /// Raw file bytes.
    pub data: &'a [u8],
}

/// Encode one chunk frame.
pub fn encode_chunk(transfer_id: &str, data: &[u8]) -> Result<Bytes> {
    if transfer_id.is_empty() {
        return Err(ProtocolError::InvalidChunk("empty transfer id".to_string()));
    }
    if transfer_id.len() >= TRANSFER_ID_SEARCH_WINDOW {
        return Err(ProtocolError::InvalidChunk(format!(
            "transfer id of {} bytes exceeds search window of {}",
            transfer_id.len(),
            TRANSFER_ID_SEARCH_WINDOW
        )));
    }
    if transfer_id.as_bytes().contains(&CHUNK_SEPARATOR) {
        return Err(ProtocolError::InvalidChunk(
            "transfer id contains separator".to_string(),
        ));
    }

    let mut buf = BytesMut::with_capacity(transfer_id.len() + 1 + data.len());
    buf.put_slice(transfer_id.as_bytes());
    buf.put_u8(CHUNK_SEPARATOR);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Split a received frame into transfer id and payload.
pub fn decode_chunk(frame: &[u8]) -> Result<FileChunk<'_>> {
    let window = &frame[..frame.len().min(TRANSFER_ID_SEARCH_WINDOW)];
    let separator = window
        .iter()
        .position(|b| *b == CHUNK_SEPARATOR)
        .ok_or_else(|| ProtocolError::InvalidChunk("separator not found".to_string()))?;
    if separator == 0 {
        return Err(ProtocolError::InvalidChunk("empty transfer id".to_string()));
    }

    let transfer_id = std::str::from_utf8(&frame[..separator])
        .map_err(|e| ProtocolError::InvalidChunk(format!("transfer id is not UTF-8: {e}")))?;
    Ok(FileChunk {
        transfer_id,
        data: &frame[separator + 1..],
    })
}

/// Iterate over the chunk frames for a whole file.
///
/// An empty file yields no frames.
pub fn chunk_frames<'a>(
    transfer_id: &'a str,
    data: &'a [u8],
    chunk_size: usize,
) -> impl Iterator<Item = Result<Bytes>> + 'a {
    data.chunks(chunk_size.max(1))
        .map(move |piece| encode_chunk(transfer_id, piece))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode_chunk("abc", &[1, 2, 3]).unwrap();
        assert_eq!(&frame[..], b"abc|\x01\x02\x03");
    }

    #[test]
    fn test_decode_splits_on_first_separator() {
        let frame = b"t1|a|b";
        let chunk = decode_chunk(frame).unwrap();
        assert_eq!(chunk.transfer_id, "t1");
        assert_eq!(chunk.data, b"a|b");
    }

    #[test]
    fn test_decode_empty_payload() {
        let chunk = decode_chunk(b"t1|").unwrap();
        assert_eq!(chunk.transfer_id, "t1");
        assert!(chunk.data.is_empty());
    }

    #[test]
    fn test_decode_rejects_leading_separator() {
        assert!(matches!(
            decode_chunk(b"|data"),
            Err(ProtocolError::InvalidChunk(_))
        ));
    }

    #[test]
    fn test_decode_rejects_separator_outside_window() {
        let mut frame = vec![b'x'; TRANSFER_ID_SEARCH_WINDOW];
        frame.push(CHUNK_SEPARATOR);
        frame.extend_from_slice(b"payload");
        assert!(decode_chunk(&frame).is_err());
    }

    #[test]
    fn test_encode_rejects_bad_ids() {
        assert!(encode_chunk("", b"x").is_err());
        assert!(encode_chunk("a|b", b"x").is_err());
        assert!(encode_chunk(&"x".repeat(TRANSFER_ID_SEARCH_WINDOW), b"x").is_err());
    }

    #[test]
    fn test_chunk_frames_37_bytes_in_16_byte_chunks() {
        let data: Vec<u8> = (0..37u8).collect();
        let frames: Vec<Bytes> = chunk_frames("file-1", &data, 16)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);

        let payload_sizes: Vec<usize> = frames
            .iter()
            .map(|f| decode_chunk(f).unwrap().data.len())
            .collect();
        assert_eq!(payload_sizes, vec![16, 16, 5]);

        let mut reassembled = Vec::new();
        for frame in &frames {
            assert!(frame.starts_with(b"file-1|"));
            reassembled.extend_from_slice(decode_chunk(frame).unwrap().data);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_chunk_frames_empty_file() {
        assert_eq!(chunk_frames("t", &[], FILE_CHUNK_SIZE).count(), 0);
    }
}
