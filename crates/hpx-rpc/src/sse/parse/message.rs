//! Folding field lines into messages.

use std::borrow::Cow;

use super::constants::SPACE;

/// A dispatched SSE message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub event: String,
    /// `data` lines joined with `\n`.
    pub data: String,
    pub retry: Option<u64>,
}

/// Receives assembler output.
///
/// `on_id` and `on_retry` fire as soon as the field is read, before the
/// message that carries it is dispatched.
pub trait MessageSink {
    fn on_message(&mut self, message: Message);

    fn on_id(&mut self, _id: &str) {}

    fn on_retry(&mut self, _retry: u64) {}
}

impl MessageSink for Vec<Message> {
    fn on_message(&mut self, message: Message) {
        self.push(message);
    }
}

/// How field bytes become text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextDecoding {
    /// UTF-8, replacing invalid sequences with U+FFFD.
    #[default]
    Utf8Lossy,
    /// Each byte maps to the code point of the same value.
    Latin1,
}

impl TextDecoding {
    fn decode<'a>(self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            Self::Utf8Lossy => String::from_utf8_lossy(bytes),
            Self::Latin1 => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Builds [`Message`]s from the lines produced by
/// [`LineParser`](super::LineParser).
#[derive(Debug, Default)]
pub struct MessageAssembler {
    message: Message,
    has_data: bool,
    decoding: TextDecoding,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoding(decoding: TextDecoding) -> Self {
        Self {
            decoding,
            ..Self::default()
        }
    }

    /// Drop any partially assembled message.
    pub fn reset(&mut self) {
        self.message = Message::default();
        self.has_data = false;
    }

    /// Process one line.
    ///
    /// An empty line dispatches the pending message, even when nothing was
    /// set on it. Lines starting with `:` are comments. Unknown fields are
    /// ignored.
    pub fn on_line<S: MessageSink + ?Sized>(
        &mut self,
        line: &[u8],
        field_length: Option<usize>,
        sink: &mut S,
    ) {
        if line.is_empty() {
            self.has_data = false;
            sink.on_message(std::mem::take(&mut self.message));
            return;
        }

        let (name, value) = match field_length {
            Some(0) => return,
            Some(length) => {
                let mut start = length + 1;
                if line.get(start) == Some(&SPACE) {
                    start += 1;
                }
                (&line[..length], line.get(start..).unwrap_or_default())
            }
            None => (line, &[][..]),
        };

        match name {
            b"data" => {
                if self.has_data {
                    self.message.data.push('\n');
                }
                self.message.data.push_str(&self.decoding.decode(value));
                self.has_data = true;
            }
            b"event" => {
                self.message.event = self.decoding.decode(value).into_owned();
            }
            b"id" => {
                let id = self.decoding.decode(value).into_owned();
                sink.on_id(&id);
                self.message.id = id;
            }
            b"retry" => {
                if let Some(retry) = parse_retry(value) {
                    self.message.retry = Some(retry);
                    sink.on_retry(retry);
                }
            }
            _ => {}
        }
    }
}

/// `retry` must be made of ASCII digits only.
fn parse_retry(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}
