//! Reading and writing media segment records in a shared-memory partition.
//!
//! The client's frame writer lays records out back to back from the start
//! of the `(offset, max_len)` window it was told about:
//!
//! ```text
//! u32 header_len | header (bincode MediaSegmentHeader) | payload bytes
//! ```
//!
//! The server reads the same layout back when the client answers a
//! NeedMediaData cycle with HaveData. Both sides operate on plain byte
//! slices; mapping the shared region is the caller's concern.

use thiserror::Error;

use crate::types::{MediaSegment, MediaSegmentHeader};

const LEN_PREFIX: usize = 4;

/// Errors raised while writing or reading segment records.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The partition window cannot hold the next record.
    #[error("segment of {needed} bytes does not fit in the {available} bytes remaining")]
    NoSpace { needed: usize, available: usize },

    /// A record in the partition is malformed.
    #[error("malformed segment record: {0}")]
    Malformed(String),

    /// A segment header failed to encode or decode.
    #[error("segment header codec failure: {0}")]
    HeaderCodec(#[from] bincode::Error),
}

/// Sequentially writes segment records into a partition window.
#[derive(Debug)]
pub struct SegmentWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
    frames: u32,
}

impl<'a> SegmentWriter<'a> {
    /// Starts writing at the beginning of the window.
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            frames: 0,
        }
    }

    /// Appends one record. The header's `payload_len` is overwritten with
    /// the actual payload size before encoding.
    pub fn write(
        &mut self,
        header: &MediaSegmentHeader,
        payload: &[u8],
    ) -> Result<(), SegmentError> {
        let mut header = header.clone();
        header.payload_len = payload.len() as u32;
        let header_bytes = bincode::serialize(&header)?;

        let needed = LEN_PREFIX + header_bytes.len() + payload.len();
        let available = self.buf.len() - self.offset;
        if needed > available {
            return Err(SegmentError::NoSpace { needed, available });
        }

        let at = self.offset;
        self.buf[at..at + LEN_PREFIX]
            .copy_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        let at = at + LEN_PREFIX;
        self.buf[at..at + header_bytes.len()].copy_from_slice(&header_bytes);
        let at = at + header_bytes.len();
        self.buf[at..at + payload.len()].copy_from_slice(payload);

        self.offset = at + payload.len();
        self.frames += 1;
        Ok(())
    }

    /// Number of records written so far.
    #[must_use]
    pub fn frames_written(&self) -> u32 {
        self.frames
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.offset
    }
}

/// Reads `count` records from the start of a partition window.
pub fn read_segments(buf: &[u8], count: u32) -> Result<Vec<MediaSegment>, SegmentError> {
    let mut segments = Vec::with_capacity(count as usize);
    let mut offset = 0usize;

    for index in 0..count {
        if buf.len() - offset < LEN_PREFIX {
            return Err(SegmentError::Malformed(format!(
                "record {index} length prefix out of bounds"
            )));
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&buf[offset..offset + LEN_PREFIX]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        offset += LEN_PREFIX;

        if buf.len() - offset < header_len {
            return Err(SegmentError::Malformed(format!(
                "record {index} header out of bounds"
            )));
        }
        let header: MediaSegmentHeader = bincode::deserialize(&buf[offset..offset + header_len])?;
        offset += header_len;

        let payload_len = header.payload_len as usize;
        if buf.len() - offset < payload_len {
            return Err(SegmentError::Malformed(format!(
                "record {index} payload of {payload_len} bytes out of bounds"
            )));
        }
        let payload = buf[offset..offset + payload_len].to_vec();
        offset += payload_len;

        segments.push(MediaSegment { header, payload });
    }

    Ok(segments)
}
