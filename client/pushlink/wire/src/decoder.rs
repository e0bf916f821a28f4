//! Incremental frame decoding over a byte stream.
//!
//! The decoder consumes CRLF-terminated lines from a caller-owned read
//! buffer, buffering partial lines until the terminator arrives. A fresh
//! decoder can be seeded with the last acknowledged progress marker so that
//! data frames replayed by the server after a recovery bind are dropped
//! before they reach the session layer.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Maximum accepted line length, matching the server's request limit.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Streaming frame decoder with rebind-aware replay suppression.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Local progress count at the time this decode context was created.
    resume_from: u64,
    /// Replayed data frames still to drop; set once the server's progress
    /// marker arrives on the recovered connection.
    skip_remaining: Option<u64>,
}

impl FrameDecoder {
    /// Decoder for a brand-new session.
    pub fn new() -> Self {
        Self {
            resume_from: 0,
            skip_remaining: None,
        }
    }

    /// Decoder for a recovered connection, seeded with the count of data
    /// frames already delivered on previous bindings.
    pub fn with_resume(progress: u64) -> Self {
        Self {
            resume_from: progress,
            skip_remaining: None,
        }
    }

    /// Decode the next frame out of `buf`, consuming the bytes it covers.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete line yet; the
    /// caller keeps appending reads to the same buffer and retries.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(line_end) = find_crlf(buf) else {
                if buf.len() > MAX_LINE_SIZE {
                    return Err(ProtocolError::Oversized(MAX_LINE_SIZE));
                }
                return Ok(None);
            };

            let line = buf.split_to(line_end);
            buf.advance(2); // CRLF

            if line.is_empty() {
                continue;
            }

            let text = std::str::from_utf8(&line).map_err(|_| ProtocolError::Encoding)?;
            trace!("decoded line: {}", text);
            let frame = Frame::parse(text)?;

            if let Frame::Progress(server_count) = frame {
                if self.resume_from > 0 && self.skip_remaining.is_none() {
                    let replayed = self.resume_from.saturating_sub(server_count);
                    debug!(
                        "recovery resumes at {} (local {}), dropping {} replayed frames",
                        server_count, self.resume_from, replayed
                    );
                    self.skip_remaining = Some(replayed);
                }
                return Ok(Some(frame));
            }

            if frame.carries_data() {
                if let Some(remaining) = self.skip_remaining {
                    if remaining > 0 {
                        self.skip_remaining = Some(remaining - 1);
                        trace!("dropping replayed frame, {} left", remaining - 1);
                        continue;
                    }
                }
            }

            if matches!(frame, Frame::Noop) {
                continue;
            }

            return Ok(Some(frame));
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
