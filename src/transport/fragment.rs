//! Fragment engine: splitting payloads into frame runs and reassembling them.

use crate::core::constants::HEADER_SIZE;
use crate::core::{ProtocolError, Result};

use super::frame::{Frame, FrameFlags};
use super::sequence::next_sequence;

/// Payload bytes a frame of `max_frame_size` can carry.
fn chunk_size(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(HEADER_SIZE).max(1)
}

/// Number of frames `split` produces for a payload of `len` bytes.
pub fn fragment_count(len: usize, max_frame_size: usize) -> usize {
    len.div_ceil(chunk_size(max_frame_size)).max(1)
}

/// Split `payload` into a run of DEFAULT frames no larger than `max_frame_size`.
///
/// Every frame but the last has HAS_MORE_FRAGMENTS set. Sequence numbers are
/// left at 0; the sender assigns them when each frame goes out. An empty
/// payload yields one empty frame.
pub fn split(payload: &[u8], max_frame_size: usize) -> Vec<Frame> {
    if payload.is_empty() {
        return vec![Frame::data(Vec::new())];
    }

    let chunks: Vec<&[u8]> = payload.chunks(chunk_size(max_frame_size)).collect();
    let last = chunks.len() - 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            Frame::data(chunk.to_vec())
                .with_flags(FrameFlags::NONE.with_more_fragments(i < last))
        })
        .collect()
}

/// Accumulates an incoming fragment run.
///
/// Enforces sequence continuity: every frame after the first must carry the
/// successor of the previous one. Only DEFAULT and ERROR frames carry run
/// payload; the run closes on the first one without HAS_MORE_FRAGMENTS.
#[derive(Debug, Clone, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    last_sequence: Option<u8>,
    closed: bool,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame to the run.
    ///
    /// On a sequence gap the buffer is left untouched and
    /// [`ProtocolError::SequenceMismatch`] is returned. A frame of a type that
    /// carries no run payload, or one arriving after the run closed, is
    /// rejected with [`ProtocolError::UnexpectedFrame`].
    pub fn reassemble(&mut self, frame: &Frame) -> Result<()> {
        if !frame.frame_type.carries_data() {
            return Err(ProtocolError::UnexpectedFrame {
                frame_type: frame.frame_type,
                state: "reassembling a fragment run",
            });
        }
        if self.closed {
            return Err(ProtocolError::UnexpectedFrame {
                frame_type: frame.frame_type,
                state: "fragment run already closed",
            });
        }

        if let Some(last) = self.last_sequence {
            let expected = next_sequence(last);
            if frame.sequence != expected {
                return Err(ProtocolError::SequenceMismatch {
                    expected,
                    actual: frame.sequence,
                });
            }
            self.buffer.extend_from_slice(&frame.payload);
        } else {
            self.buffer = frame.payload.clone();
        }

        self.last_sequence = Some(frame.sequence);
        self.closed = !frame.has_more_fragments();
        Ok(())
    }

    /// Check if the last frame accepted closed the run.
    pub fn is_complete(&self) -> bool {
        self.closed
    }

    /// Sequence number of the last accepted frame.
    pub fn last_sequence(&self) -> Option<u8> {
        self.last_sequence
    }

    /// Bytes accumulated so far.
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    /// Check if no run is in progress.
    pub fn is_empty(&self) -> bool {
        self.last_sequence.is_none()
    }

    /// Move the payload out and start a new run.
    pub fn take(&mut self) -> Vec<u8> {
        self.last_sequence = None;
        self.closed = false;
        std::mem::take(&mut self.buffer)
    }

    /// Discard the run in progress.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_sequence = None;
        self.closed = false;
    }
}
