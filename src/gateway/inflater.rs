//! zlib-stream transport decompression
//!
//! The compression context spans the whole connection, so one `Inflater`
//! lives as long as its websocket and is reset on every reconnect. A
//! message may arrive split over several frames; it is complete once a
//! frame ends with the zlib sync-flush marker.

use flate2::{Decompress, DecompressError, FlushDecompress, Status};

/// Suffix of a complete zlib-stream message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const CHUNK: usize = 32 * 1024;

#[derive(Debug)]
pub struct Inflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Drop the dictionary and any partial message (new connection)
    pub fn reset(&mut self) {
        self.decompress.reset(true);
        self.pending.clear();
    }

    /// Bytes buffered toward an incomplete message
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one frame; returns the inflated message once it is complete
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, DecompressError> {
        self.pending.extend_from_slice(frame);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let input = std::mem::take(&mut self.pending);
        let mut output = Vec::with_capacity(input.len() * 4);
        let mut offset = 0usize;

        loop {
            if output.capacity() - output.len() < CHUNK {
                output.reserve(CHUNK);
            }

            let in_before = self.decompress.total_in();
            let out_before = output.len();
            let status = self
                .decompress
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            offset += consumed;

            if status == Status::StreamEnd {
                break;
            }
            let output_full = output.len() == output.capacity();
            if offset >= input.len() && !output_full {
                break;
            }
            if consumed == 0 && output.len() == out_before {
                break;
            }
        }

        Ok(Some(output))
    }
}
