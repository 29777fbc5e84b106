//! Byte stream to line-record framing.
//!
//! Recognizes `\n`, `\r\n`, and bare `\r` terminators. A `\r` flushes the
//! pending line immediately; a directly following `\n` is swallowed so CRLF
//! never produces an empty record. Invalid UTF-8 is replaced with U+FFFD and
//! framing continues. The emitted line sequence is independent of how the
//! byte stream is chunked.

use std::time::Instant;
use tracelink_types::TraceSource;

/// A framed line before the bus assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    pub text: String,
    pub timestamp_ns: u64,
    pub source: TraceSource,
}

/// Stateful line framer for one transport stream.
pub struct LineFramer {
    source: TraceSource,
    epoch: Instant,
    buf: Vec<u8>,
    pending_cr: bool,
}

impl LineFramer {
    /// `epoch` is the session epoch; timestamps are nanoseconds since it.
    /// Sharing one epoch across framers keeps timestamps comparable between
    /// streams of the same session.
    pub fn new(source: TraceSource, epoch: Instant) -> Self {
        Self {
            source,
            epoch,
            buf: Vec::new(),
            pending_cr: false,
        }
    }

    pub fn source(&self) -> TraceSource {
        self.source
    }

    /// Consume a chunk of bytes, returning every line completed by it.
    ///
    /// Timestamps are taken when the terminator is observed, not when the
    /// first byte of the line arrived.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FramedLine> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.pending_cr = true;
                }
                _ => self.buf.push(byte),
            }
        }
        lines
    }

    /// Flush any residual bytes as a final record. Called on transport close.
    pub fn finish(&mut self) -> Option<FramedLine> {
        self.pending_cr = false;
        if self.buf.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> FramedLine {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        FramedLine {
            text,
            timestamp_ns: self.epoch.elapsed().as_nanos() as u64,
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new(TraceSource::Stdout, Instant::now());
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(framer.push(chunk).into_iter().map(|l| l.text));
        }
        if let Some(last) = framer.finish() {
            lines.push(last.text);
        }
        lines
    }

    #[test]
    fn splits_on_lf() {
        assert_eq!(frame_all(&[b"one\ntwo\n"]), vec!["one", "two"]);
    }

    #[test]
    fn crlf_does_not_produce_empty_record() {
        assert_eq!(frame_all(&[b"one\r\ntwo\r\n"]), vec!["one", "two"]);
    }

    #[test]
    fn bare_cr_flushes() {
        assert_eq!(frame_all(&[b"one\rtwo\r"]), vec!["one", "two"]);
    }

    #[test]
    fn crlf_split_across_chunks() {
        assert_eq!(frame_all(&[b"one\r", b"\ntwo\n"]), vec!["one", "two"]);
    }

    #[test]
    fn lone_blank_lines_are_records() {
        assert_eq!(frame_all(&[b"a\n\nb\n"]), vec!["a", "", "b"]);
    }

    #[test]
    fn residue_flushes_on_finish() {
        assert_eq!(frame_all(&[b"partial"]), vec!["partial"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let lines = frame_all(&[b"ok\n\xff\xfe bad\n"]);
        assert_eq!(lines[0], "ok");
        assert!(lines[1].contains('\u{FFFD}'));
    }

    #[test]
    fn framing_is_chunking_independent() {
        let input = b"alpha\r\nbeta\rgamma\n\ndelta";
        let whole = frame_all(&[input]);
        for split in 1..input.len() {
            let (a, b) = input.split_at(split);
            assert_eq!(frame_all(&[a, b]), whole, "split at {}", split);
        }
    }
}
