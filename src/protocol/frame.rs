//! Sentinel-delimited text frames.
//!
//! A frame is `0x00 <payload> 0xFF`. There is no length prefix, no masking
//! and no continuation, so the payload must not contain either marker byte.
//! The pair `0xFF 0x00` at a frame boundary means the peer is closing.

use tracing::trace;

pub const FRAME_START: u8 = 0x00;
pub const FRAME_END: u8 = 0xFF;

/// Marker pair sent by either side before closing.
pub const CLOSE_MARKER: [u8; 2] = [FRAME_END, FRAME_START];

/// Wraps `payload` in frame markers.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(FRAME_START);
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    frame
}

/// Output of [`FrameDecoder::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete payload with the markers stripped.
    Message(Vec<u8>),
    /// The peer sent the close marker pair.
    Close,
}

/// Incremental decoder holding the unterminated tail between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    closed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every frame it completes.
    ///
    /// Segments that do not begin with [`FRAME_START`] are dropped. Once the
    /// close marker is seen, [`Frame::Close`] is the last item returned and
    /// all later input is ignored.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.closed {
            return frames;
        }
        self.buf.extend_from_slice(data);

        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == FRAME_END) {
            let end = start + offset;
            let segment = &self.buf[start..end];

            if segment.is_empty() {
                match self.buf.get(end + 1).copied() {
                    Some(FRAME_START) => {
                        self.closed = true;
                        self.buf.clear();
                        frames.push(Frame::Close);
                        return frames;
                    }
                    // A lone end marker may be the first half of a close
                    None => break,
                    Some(_) => {}
                }
            } else if segment[0] == FRAME_START {
                frames.push(Frame::Message(segment[1..].to_vec()));
            } else {
                trace!(len = segment.len(), "Dropping segment without start marker");
            }
            start = end + 1;
        }

        self.buf.drain(..start);
        frames
    }

    /// Bytes held back waiting for a frame end.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
