//! End-of-message framing: every message is followed by `]]>]]>`.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::NetconfError;

/// message terminator
pub const TERMINATOR: &[u8] = b"]]>]]>";
/// default upper bound on a single frame
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Splits a byte stream on [`TERMINATOR`], keeping any trailing partial
/// frame buffered until more bytes arrive.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
    // where the next terminator search starts
    scanned: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            scanned: 0,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = NetconfError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // a terminator may straddle the previous read boundary
            let start = self.scanned.saturating_sub(TERMINATOR.len() - 1);
            let Some(pos) = find(&buf[start..], TERMINATOR).map(|p| p + start) else {
                if buf.len() > self.max_frame {
                    return Err(NetconfError::FrameTooLarge {
                        max: self.max_frame,
                    });
                }
                self.scanned = buf.len();
                return Ok(None);
            };
            self.scanned = 0;
            let frame = buf.split_to(pos);
            buf.advance(TERMINATOR.len());
            let frame = String::from_utf8(frame.to_vec())
                .map_err(|err| NetconfError::Xml(format!("frame is not utf-8: {err}")))?;
            let frame = frame.trim();
            // whitespace between messages
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame.to_owned()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.iter().all(u8::is_ascii_whitespace) {
                    debug!(len = buf.len(), "dropping partial frame at end of stream");
                }
                buf.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = NetconfError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + TERMINATOR.len());
        dst.put_slice(item.as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
