//! Byte-level line splitting.

use bytes::{Buf, BytesMut};
use memchr::{memchr2, memchr3};

use super::constants::{COLON, CR, LF};

/// Splits a chunked byte stream into lines.
///
/// Lines end at `\n`, `\r` or `\r\n`, and a `\r\n` pair may straddle two
/// chunks. For each line the parser reports the offset of the first `:`
/// (`None` when the line has no separator). Bytes after the last terminator
/// are kept until more input arrives; once every buffered byte has been
/// consumed the buffer is emptied, so memory stays bounded by the longest
/// line.
///
/// A parser belongs to one physical connection. Create a new one when the
/// connection is replaced.
#[derive(Debug, Default)]
pub struct LineParser {
    buffer: BytesMut,
    /// Scan position, relative to the start of `buffer`.
    position: usize,
    /// Separator offset for the line currently being scanned.
    field_length: Option<usize>,
    /// The previous chunk ended in `\r`; swallow a leading `\n`.
    discard_lf: bool,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for a line terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk, calling `on_line` once per completed line.
    ///
    /// The line passed to `on_line` excludes its terminator.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_line: F)
    where
        F: FnMut(&[u8], Option<usize>),
    {
        if chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        let len = self.buffer.len();
        let mut line_start = 0;

        while self.position < len {
            if self.discard_lf {
                if self.buffer[self.position] == LF {
                    self.position += 1;
                    line_start = self.position;
                }
                self.discard_lf = false;
                continue;
            }

            let rest = &self.buffer[self.position..];
            let found = if self.field_length.is_none() {
                memchr3(COLON, CR, LF, rest)
            } else {
                memchr2(CR, LF, rest)
            };

            let Some(offset) = found else {
                self.position = len;
                break;
            };

            let at = self.position + offset;
            match self.buffer[at] {
                COLON => {
                    self.field_length = Some(at - line_start);
                }
                terminator => {
                    self.discard_lf = terminator == CR;
                    on_line(&self.buffer[line_start..at], self.field_length);
                    line_start = at + 1;
                    self.field_length = None;
                }
            }
            self.position = at + 1;
        }

        if line_start == len {
            self.buffer.clear();
            self.position = 0;
        } else if line_start > 0 {
            self.buffer.advance(line_start);
            self.position -= line_start;
        }
    }
}
