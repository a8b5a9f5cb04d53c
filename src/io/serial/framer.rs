// src/io/serial/framer.rs
//
// Frame reassembly for the sensors' text protocol.
// Turns arbitrarily split serial reads into schema-sized field lists.
//
// Two policies:
// - Delimited: `;`-separated fields, a line break closes the frame once it
//   holds at least as many fields as the schema has columns.
// - Sentinel: each frame is wrapped in a start/end marker pair
//   (e.g. `BOX...X`); whitespace and line breaks are ignored.
//
// Bytes are evaluated one at a time, so the frames produced never depend on
// where the stream was split into reads.

use crate::schema::Schema;

// =============================================================================
// Types
// =============================================================================

/// Framing policy. Chosen per process, shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingPolicy {
    /// Field-count framing closed by a line break
    Delimited,
    /// Marker-wrapped framing
    Sentinel {
        start_marker: Vec<u8>,
        end_marker: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    pub policy: FramingPolicy,
    /// Field separator (ASCII)
    pub delimiter: u8,
    /// Carry buffer limit; an unfinished frame beyond this is discarded
    pub max_frame_bytes: usize,
    /// Delimited only: emit a partial frame padded with nulls when the stream ends
    pub pad_on_close: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig {
            policy: FramingPolicy::Delimited,
            delimiter: b';',
            max_frame_bytes: 8192,
            pad_on_close: true,
        }
    }
}

/// A complete frame, aligned 1:1 with the schema columns.
/// `None` is the null marker used for padded trailing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fields: Vec<Option<String>>,
    /// True when trailing fields were filled with nulls
    pub padded: bool,
}

/// Why bytes were thrown away instead of becoming a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Delimited frame closed with more fields than columns
    TooManyFields { expected: usize, found: usize },
    /// Sentinel frame whose field count differs from the schema
    FieldCountMismatch { expected: usize, found: usize },
    /// Carry buffer outgrew `max_frame_bytes`
    Overflow { limit: usize },
    /// Bytes ahead of the start marker
    Resync { skipped: usize },
    /// Stream ended mid-frame
    Truncated,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooManyFields { expected, found } => {
                write!(f, "{} fields for {} columns", found, expected)
            }
            RejectReason::FieldCountMismatch { expected, found } => {
                write!(f, "malformed frame: {} fields, expected {}", found, expected)
            }
            RejectReason::Overflow { limit } => {
                write!(f, "no complete frame within {} bytes", limit)
            }
            RejectReason::Resync { skipped } => {
                write!(f, "skipped {} bytes before start marker", skipped)
            }
            RejectReason::Truncated => write!(f, "stream ended mid-frame"),
        }
    }
}

/// One outcome of feeding bytes to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Complete(Frame),
    Rejected {
        reason: RejectReason,
        /// Lossy text of the discarded bytes, for diagnostics
        raw: String,
    },
}

impl FrameEvent {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            FrameEvent::Complete(frame) => Some(frame),
            FrameEvent::Rejected { .. } => None,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Split on the delimiter the way a line reader does: interior empty fields
/// are kept, a trailing delimiter does not start another field.
pub fn split_fields(text: &[u8], delimiter: u8) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut fields: Vec<String> = text
        .split(|&b| b == delimiter)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    if text.last() == Some(&delimiter) {
        fields.pop();
    }
    fields
}

fn rejected(reason: RejectReason, raw: &[u8]) -> FrameEvent {
    FrameEvent::Rejected {
        reason,
        raw: String::from_utf8_lossy(raw).into_owned(),
    }
}

// =============================================================================
// Internal Framer Trait
// =============================================================================

trait FramerImpl {
    fn feed(&mut self, data: &[u8], out: &mut Vec<FrameEvent>);
    fn flush(&mut self) -> Option<FrameEvent>;
    fn carry(&self) -> &[u8];
}

// =============================================================================
// Delimited Framer
// =============================================================================

struct DelimitedFramer {
    carry: Vec<u8>,
    columns: usize,
    delimiter: u8,
    max_frame_bytes: usize,
    pad_on_close: bool,
}

impl DelimitedFramer {
    fn end_of_line(&mut self, out: &mut Vec<FrameEvent>) {
        if self.carry.is_empty() {
            return;
        }

        let fields = split_fields(&self.carry, self.delimiter);

        // Short: the break is dropped and the frame keeps growing
        if fields.len() < self.columns {
            return;
        }

        if fields.len() == self.columns {
            out.push(FrameEvent::Complete(Frame {
                fields: fields.into_iter().map(Some).collect(),
                padded: false,
            }));
        } else {
            out.push(rejected(
                RejectReason::TooManyFields {
                    expected: self.columns,
                    found: fields.len(),
                },
                &self.carry,
            ));
        }
        self.carry.clear();
    }
}

impl FramerImpl for DelimitedFramer {
    fn feed(&mut self, data: &[u8], out: &mut Vec<FrameEvent>) {
        for &byte in data {
            match byte {
                b'\r' | b'\n' => self.end_of_line(out),
                _ => {
                    self.carry.push(byte);
                    if self.carry.len() > self.max_frame_bytes {
                        out.push(rejected(
                            RejectReason::Overflow {
                                limit: self.max_frame_bytes,
                            },
                            &self.carry,
                        ));
                        self.carry.clear();
                    }
                }
            }
        }
    }

    fn flush(&mut self) -> Option<FrameEvent> {
        if self.carry.is_empty() {
            return None;
        }
        let carry = std::mem::take(&mut self.carry);
        let fields = split_fields(&carry, self.delimiter);

        if fields.len() > self.columns {
            return Some(rejected(
                RejectReason::TooManyFields {
                    expected: self.columns,
                    found: fields.len(),
                },
                &carry,
            ));
        }
        if !self.pad_on_close || fields.is_empty() {
            return Some(rejected(RejectReason::Truncated, &carry));
        }

        let padded = fields.len() < self.columns;
        let mut values: Vec<Option<String>> = fields.into_iter().map(Some).collect();
        values.resize(self.columns, None);
        Some(FrameEvent::Complete(Frame {
            fields: values,
            padded,
        }))
    }

    fn carry(&self) -> &[u8] {
        &self.carry
    }
}

// =============================================================================
// Sentinel Framer
// =============================================================================

struct SentinelFramer {
    carry: Vec<u8>,
    columns: usize,
    delimiter: u8,
    max_frame_bytes: usize,
    start: Vec<u8>,
    end: Vec<u8>,
    /// Bytes dropped while hunting for a start marker, not yet reported
    skipped: Vec<u8>,
}

impl SentinelFramer {
    /// Keep the carry buffer a prefix of the start marker while it is shorter
    /// than the marker. Anything that cannot begin a frame is dropped.
    fn resync(&mut self) {
        if self.carry.len() > self.start.len() {
            return;
        }
        let keep_from = (0..=self.carry.len())
            .find(|&i| self.start.starts_with(&self.carry[i..]))
            .unwrap_or(self.carry.len());
        if keep_from > 0 {
            self.skipped.extend(self.carry.drain(..keep_from));
        }
    }

    fn report_skipped(&mut self, out: &mut Vec<FrameEvent>) {
        if !self.skipped.is_empty() {
            let skipped = std::mem::take(&mut self.skipped);
            out.push(rejected(
                RejectReason::Resync {
                    skipped: skipped.len(),
                },
                &skipped,
            ));
        }
    }

    fn is_complete(&self) -> bool {
        self.carry.len() >= self.start.len() + self.end.len()
            && self.carry.starts_with(&self.start)
            && self.carry.ends_with(&self.end)
    }

    fn parse(&mut self, out: &mut Vec<FrameEvent>) {
        let carry = std::mem::take(&mut self.carry);
        let mut inner = &carry[self.start.len()..carry.len() - self.end.len()];
        if inner.last() == Some(&self.delimiter) {
            inner = &inner[..inner.len() - 1];
        }

        let fields = split_fields(inner, self.delimiter);
        if fields.len() == self.columns {
            out.push(FrameEvent::Complete(Frame {
                fields: fields.into_iter().map(Some).collect(),
                padded: false,
            }));
        } else {
            out.push(rejected(
                RejectReason::FieldCountMismatch {
                    expected: self.columns,
                    found: fields.len(),
                },
                &carry,
            ));
        }
    }
}

impl FramerImpl for SentinelFramer {
    fn feed(&mut self, data: &[u8], out: &mut Vec<FrameEvent>) {
        for &byte in data {
            if byte.is_ascii_whitespace() {
                continue;
            }
            self.carry.push(byte);
            self.resync();

            if self.is_complete() {
                self.report_skipped(out);
                self.parse(out);
            } else if self.carry.len() > self.max_frame_bytes {
                self.report_skipped(out);
                out.push(rejected(
                    RejectReason::Overflow {
                        limit: self.max_frame_bytes,
                    },
                    &self.carry,
                ));
                self.carry.clear();
            }
        }
        self.report_skipped(out);
    }

    fn flush(&mut self) -> Option<FrameEvent> {
        self.skipped.clear();
        if self.carry.is_empty() {
            return None;
        }
        let carry = std::mem::take(&mut self.carry);
        Some(rejected(RejectReason::Truncated, &carry))
    }

    fn carry(&self) -> &[u8] {
        &self.carry
    }
}

// =============================================================================
// Public FrameReassembler
// =============================================================================

/// Stateful reassembler for one device's byte stream.
/// Owns that session's carry buffer; never blocks.
pub struct FrameReassembler {
    framer: Box<dyn FramerImpl + Send>,
}

impl FrameReassembler {
    pub fn new(config: &FramingConfig, schema: &Schema) -> Self {
        let columns = schema.len();
        let framer: Box<dyn FramerImpl + Send> = match &config.policy {
            FramingPolicy::Delimited => Box::new(DelimitedFramer {
                carry: Vec::new(),
                columns,
                delimiter: config.delimiter,
                max_frame_bytes: config.max_frame_bytes,
                pad_on_close: config.pad_on_close,
            }),
            FramingPolicy::Sentinel {
                start_marker,
                end_marker,
            } => Box::new(SentinelFramer {
                carry: Vec::new(),
                columns,
                delimiter: config.delimiter,
                max_frame_bytes: config.max_frame_bytes,
                start: start_marker.clone(),
                end: end_marker.clone(),
                skipped: Vec::new(),
            }),
        };
        FrameReassembler { framer }
    }

    /// Feed one read's worth of bytes.
    /// Returns frames completed and bytes rejected, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        self.framer.feed(data, &mut events);
        events
    }

    /// Resolve whatever is left in the carry buffer. Call when the stream ends.
    pub fn flush(&mut self) -> Option<FrameEvent> {
        self.framer.flush()
    }

    /// Bytes read but not yet resolved into a frame
    pub fn carry(&self) -> &[u8] {
        self.framer.carry()
    }
}

/// Lazily reassemble a sequence of reads. The carry buffer is flushed once
/// the chunks run out.
pub fn reassemble<I>(chunks: I, config: &FramingConfig, schema: &Schema) -> Reassembled<I::IntoIter>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    Reassembled {
        chunks: chunks.into_iter(),
        reassembler: FrameReassembler::new(config, schema),
        pending: std::collections::VecDeque::new(),
        flushed: false,
    }
}

pub struct Reassembled<I> {
    chunks: I,
    reassembler: FrameReassembler,
    pending: std::collections::VecDeque<FrameEvent>,
    flushed: bool,
}

impl<I> Iterator for Reassembled<I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    type Item = FrameEvent;

    fn next(&mut self) -> Option<FrameEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.flushed {
                return None;
            }
            match self.chunks.next() {
                Some(chunk) => self.pending.extend(self.reassembler.feed(chunk.as_ref())),
                None => {
                    self.flushed = true;
                    self.pending.extend(self.reassembler.flush());
                }
            }
        }
    }
}
