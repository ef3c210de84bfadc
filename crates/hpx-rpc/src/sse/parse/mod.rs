//! Incremental Server-Sent Events parsing.
//!
//! Parsing happens in two layers: [`LineParser`] splits arbitrary byte chunks
//! into lines and locates the field separator, and [`MessageAssembler`] folds
//! those lines into [`Message`]s following the
//! [HTML Living Standard](https://html.spec.whatwg.org/multipage/server-sent-events.html)
//! field rules. [`EventParser`] glues the two together.

pub(crate) mod constants;
pub mod line;
pub mod message;

pub use line::LineParser;
pub use message::{Message, MessageAssembler, MessageSink, TextDecoding};

/// Line splitting plus message assembly in one value.
#[derive(Debug, Default)]
pub struct EventParser {
    lines: LineParser,
    assembler: MessageAssembler,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoding(decoding: TextDecoding) -> Self {
        Self {
            lines: LineParser::new(),
            assembler: MessageAssembler::with_decoding(decoding),
        }
    }

    /// Feed one chunk, reporting completed messages to `sink`.
    pub fn feed<S: MessageSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) {
        let assembler = &mut self.assembler;
        self.lines
            .feed(chunk, |line, field_length| assembler.on_line(line, field_length, sink));
    }

    /// Start over on a fresh connection.
    ///
    /// Partial lines are always discarded; the pending message only when
    /// `keep_pending` is `false`.
    pub fn reset(&mut self, keep_pending: bool) {
        self.lines = LineParser::new();
        if !keep_pending {
            self.assembler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [&[u8]; 4] = [
        b"id: 1\nevent: tick\ndata: hello\n\n",
        b"data: a\r\ndata: b\r\n\r\n: comment\r\nretry: 500\r\ndata\r\n\r\n",
        b"data:one\rdata:two\r\rid\ndata: {\"json\":1}\n\n",
        b"event: x\ndata: caf\xc3\xa9\n\ndata: trailing",
    ];

    fn parse_in_chunks(input: &[u8], sizes: impl Iterator<Item = usize>) -> Vec<Message> {
        let mut parser = EventParser::new();
        let mut messages = Vec::new();
        let mut rest = input;
        for size in sizes {
            if rest.is_empty() {
                break;
            }
            let (chunk, tail) = rest.split_at(size.clamp(1, rest.len()));
            parser.feed(chunk, &mut messages);
            rest = tail;
        }
        parser.feed(rest, &mut messages);
        messages
    }

    #[test]
    fn test_round_trip_single_message() {
        let messages = parse_in_chunks(SAMPLES[0], std::iter::once(SAMPLES[0].len()));
        assert_eq!(
            messages,
            vec![Message {
                id: "1".into(),
                event: "tick".into(),
                data: "hello".into(),
                retry: None,
            }]
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_output() {
        // Small linear congruential sequence for reproducible chunk sizes.
        let mut seed: u32 = 0x2545_f491;
        for input in SAMPLES {
            let whole = parse_in_chunks(input, std::iter::once(input.len()));
            let bytewise = parse_in_chunks(input, std::iter::repeat(1));
            assert_eq!(whole, bytewise);

            for _ in 0..32 {
                let sizes: Vec<usize> = (0..input.len())
                    .map(|_| {
                        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        (seed >> 24) as usize % 7 + 1
                    })
                    .collect();
                assert_eq!(whole, parse_in_chunks(input, sizes.into_iter()));
            }
        }
    }

    #[test]
    fn test_mixed_terminators() {
        let messages = parse_in_chunks(SAMPLES[2], std::iter::once(SAMPLES[2].len()));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, "one\ntwo");
        assert_eq!(messages[1].data, "{\"json\":1}");
        assert_eq!(messages[1].id, "");
    }

    #[test]
    fn test_reset_keeps_pending_message() {
        let mut parser = EventParser::new();
        let mut messages = Vec::new();
        parser.feed(b"data: first\ndata: par", &mut messages);
        parser.reset(true);
        parser.feed(b"data: second\n\n", &mut messages);
        assert_eq!(messages[0].data, "first\nsecond");

        parser.feed(b"data: dropped\n", &mut messages);
        parser.reset(false);
        parser.feed(b"data: fresh\n\n", &mut messages);
        assert_eq!(messages[1].data, "fresh");
    }
}
