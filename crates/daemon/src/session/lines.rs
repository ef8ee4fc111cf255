//! Line framing for engine output.
//!
//! Engines speak a newline-delimited text protocol with no other framing.
//! [`EngineLineCodec`] turns the raw stdout byte stream into discrete lines,
//! reassembling lines that arrive split across reads.

use std::cmp;
use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Default cap on a single line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Decoder splitting engine output on `\n`.
///
/// - The delimiter and a trailing `\r` are removed.
/// - Invalid UTF-8 is replaced rather than ending the stream.
/// - A line longer than `max_length` is emitted in chunks of at most
///   `max_length` bytes, cut between characters.
/// - An unterminated final line is emitted at end of stream.
/// - Empty lines are yielded as empty strings, never merged with neighbours.
#[derive(Debug, Clone)]
pub struct EngineLineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline, so repeated calls don't rescan.
    next_index: usize,
}

impl EngineLineCodec {
    /// Creates a codec with the default maximum line length.
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Creates a codec that splits lines longer than `max_length` bytes.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }

    /// Returns the maximum line length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for EngineLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Where to cut an overlong line: at most `max` bytes, backed off so a
/// multi-byte character is not split. `bytes` must be longer than `max`.
fn chunk_end(bytes: &[u8], max: usize) -> usize {
    let is_continuation = |b: u8| b & 0xC0 == 0x80;

    let mut end = max;
    while end > 0 && max - end < 3 && is_continuation(bytes[end]) {
        end -= 1;
    }
    if end == 0 || is_continuation(bytes[end]) {
        // Not valid UTF-8 here, or one character wider than the limit.
        max
    } else {
        end
    }
}

impl Decoder for EngineLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        // One byte past the limit so a newline right at the limit still counts.
        let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
        let newline = buf[self.next_index.min(read_to)..read_to]
            .iter()
            .position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let newline_index = offset + self.next_index;
                self.next_index = 0;
                let line = buf.split_to(newline_index + 1);
                Ok(Some(to_line(&line[..line.len() - 1])))
            }
            // A `\r` right at the limit may be the start of `\r\n`.
            None if buf.len() == self.max_length.saturating_add(1) && buf[self.max_length] == b'\r' => {
                self.next_index = buf.len();
                Ok(None)
            }
            None if buf.len() > self.max_length => {
                self.next_index = 0;
                if buf[self.max_length..].starts_with(b"\r\n") {
                    let line = buf.split_to(self.max_length + 2);
                    return Ok(Some(to_line(&line[..self.max_length])));
                }

                let end = chunk_end(buf, self.max_length);
                let chunk = buf.split_to(end);
                tracing::debug!(
                    max_length = self.max_length,
                    "Engine output line exceeds limit, splitting"
                );
                Ok(Some(to_line(&chunk)))
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let rest = buf.split_to(buf.len());
        Ok(Some(to_line(&rest)))
    }
}
