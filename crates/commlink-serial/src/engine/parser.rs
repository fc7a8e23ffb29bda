//! Packet framing.
//!
//! Parsers turn the raw byte stream into [`Packet`]s. Each parser is
//! stateful: frames split across reads are reassembled, and emitted
//! bytes are never re-read.

use bytes::Bytes;
use commlink_core::types::{FramingKind, Packet};
use log::debug;

/// Cap on a parser's reassembly buffer. On overflow the oldest bytes
/// are discarded so a terminator-less stream cannot grow unbounded.
const MAX_PARSE_BUFFER: usize = 8192;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parser trait & factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming packet parser.
pub trait PacketParser: Send {
    /// Feed bytes in; get zero or more completed packets out.
    fn parse(&mut self, data: &[u8]) -> Vec<Packet>;

    /// Discard any partially accumulated frame.
    fn reset(&mut self);

    /// Framing strategy this parser implements.
    fn framing(&self) -> FramingKind;
}

/// Build a parser for the given framing kind.
///
/// `Delimiter` gets the default ETX delimiter and `FixedLength` a
/// 16-byte frame; use the concrete constructors for other values.
pub fn make_parser(kind: &FramingKind) -> Box<dyn PacketParser> {
    match kind {
        FramingKind::Raw => Box::new(RawParser),
        FramingKind::AtLine => Box::new(AtLineParser::new()),
        FramingKind::Delimiter => Box::new(DelimiterParser::new(vec![0x03])),
        FramingKind::FixedLength => Box::new(FixedLengthParser::new(16)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Raw
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every non-empty read batch is one packet. Stateless.
pub struct RawParser;

impl PacketParser for RawParser {
    fn parse(&mut self, data: &[u8]) -> Vec<Packet> {
        if data.is_empty() {
            return Vec::new();
        }
        vec![Packet::new(data.to_vec(), FramingKind::Raw)]
    }

    fn reset(&mut self) {}

    fn framing(&self) -> FramingKind {
        FramingKind::Raw
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Delimiter-terminated frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames terminated by an arbitrary byte sequence. The delimiter is
/// included at the end of each emitted packet.
pub struct DelimiterParser {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    framing: FramingKind,
}

impl DelimiterParser {
    pub fn new(delimiter: Vec<u8>) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            delimiter,
            framing: FramingKind::Delimiter,
        }
    }

    fn with_framing(delimiter: Vec<u8>, framing: FramingKind) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            delimiter,
            framing,
        }
    }

    fn truncate_overflow(&mut self) {
        if self.buffer.len() > MAX_PARSE_BUFFER {
            let excess = self.buffer.len() - MAX_PARSE_BUFFER;
            debug!("parse buffer overflow, discarding {} oldest bytes", excess);
            self.buffer.drain(..excess);
        }
    }
}

impl PacketParser for DelimiterParser {
    fn parse(&mut self, data: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(data);
        self.truncate_overflow();

        let mut packets = Vec::new();
        if self.delimiter.is_empty() {
            return packets;
        }
        // Scan for complete frames; the search restarts past each one.
        let mut start = 0;
        while let Some(pos) = find_subsequence(&self.buffer[start..], &self.delimiter) {
            let end = start + pos + self.delimiter.len();
            packets.push(Packet::new(
                Bytes::copy_from_slice(&self.buffer[start..end]),
                self.framing.clone(),
            ));
            start = end;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        packets
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn framing(&self) -> FramingKind {
        self.framing.clone()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  AT lines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `\r\n`-terminated response lines (Hayes AT style). A thin wrapper
/// over the delimiter parser with a fixed CRLF terminator.
pub struct AtLineParser {
    inner: DelimiterParser,
}

impl AtLineParser {
    pub fn new() -> Self {
        Self {
            inner: DelimiterParser::with_framing(b"\r\n".to_vec(), FramingKind::AtLine),
        }
    }
}

impl Default for AtLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser for AtLineParser {
    fn parse(&mut self, data: &[u8]) -> Vec<Packet> {
        self.inner.parse(data)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn framing(&self) -> FramingKind {
        FramingKind::AtLine
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Fixed-length frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits one packet per complete `frame_len`-byte run; the remainder
/// stays buffered for the next read.
pub struct FixedLengthParser {
    buffer: Vec<u8>,
    frame_len: usize,
}

impl FixedLengthParser {
    pub fn new(frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_len.max(1)),
            frame_len: frame_len.max(1),
        }
    }
}

impl PacketParser for FixedLengthParser {
    fn parse(&mut self, data: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        let complete = self.buffer.len() / self.frame_len;
        for i in 0..complete {
            let start = i * self.frame_len;
            packets.push(Packet::new(
                Bytes::copy_from_slice(&self.buffer[start..start + self.frame_len]),
                FramingKind::FixedLength,
            ));
        }
        if complete > 0 {
            self.buffer.drain(..complete * self.frame_len);
        }
        packets
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn framing(&self) -> FramingKind {
        FramingKind::FixedLength
    }
}
