//! Row framing: splitting transport fragments into `(id, tag, payload)` rows
//!
//! A 4-state scanner: hex row id up to `:`, a single tag byte, an optional
//! hex length up to `,` (length-prefixed tags only), then the payload either
//! by exact byte count or up to the next newline. Fragment boundaries are
//! arbitrary for the binary framer; partial rows are buffered and the
//! remaining length carried across calls.
//!
//! The text framer is a deliberate fork with the same logical behavior but
//! stricter preconditions: row content must arrive within a single fragment
//! (headers may still split), and binary-framed tags other than `T` are a
//! protocol violation when delivered as text.

use crate::error::ProtocolError;

/// One framed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row id (hex on the wire)
    pub id: u64,
    /// Raw tag byte; `0` for untagged JSON model rows
    pub tag: u8,
    /// Payload, complete (partial fragments already merged)
    pub payload: RowPayload,
}

/// Payload of a framed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPayload {
    /// Raw bytes (binary feed; may still hold UTF-8 text for text tags)
    Bytes(Vec<u8>),
    /// Decoded text (text feed)
    Text(String),
}

impl RowPayload {
    /// View the payload as text, decoding when it arrived as bytes.
    pub fn as_text(&self) -> Result<std::borrow::Cow<'_, str>, ProtocolError> {
        match self {
            RowPayload::Bytes(bytes) => Ok(std::borrow::Cow::Borrowed(std::str::from_utf8(
                bytes,
            )?)),
            RowPayload::Text(text) => Ok(std::borrow::Cow::Borrowed(text)),
        }
    }

    /// Take the payload as owned bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RowPayload::Bytes(bytes) => bytes,
            RowPayload::Text(text) => text.into_bytes(),
        }
    }

    /// Whether the payload is empty (the halt signal for untagged rows).
    pub fn is_empty(&self) -> bool {
        match self {
            RowPayload::Bytes(bytes) => bytes.is_empty(),
            RowPayload::Text(text) => text.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    RowId,
    RowTag,
    RowLength,
    ChunkByNewline,
    ChunkByLength,
}

/// Tags that switch the scanner to length-prefixed framing.
fn is_length_framed_tag(byte: u8) -> bool {
    matches!(
        byte,
        b'T' | b'A' | b'O' | b'o' | b'U' | b'S' | b's' | b'L' | b'l' | b'G' | b'g' | b'M'
            | b'm' | b'V'
    )
}

/// Tags that are consumed as a tag byte and framed by newline. Anything else
/// is treated as the start of untagged JSON (also newline framed).
fn is_newline_framed_tag(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte == b'#' || byte == b'r' || byte == b'x'
}

/// Fold one hex digit into an accumulator the way the wire expects. Malformed
/// digits fold through the same arithmetic rather than failing; garbage in,
/// garbage id, but never a crash.
fn fold_hex(acc: u64, byte: u8) -> u64 {
    let digit = if byte > 96 {
        (byte as u64).wrapping_sub(87)
    } else {
        (byte as u64).wrapping_sub(48)
    };
    acc.wrapping_shl(4) | (digit & 0xf)
}

/// Incremental framer over a raw byte transport. Fragment boundaries are
/// arbitrary; partial rows are buffered across calls.
#[derive(Debug, Default)]
pub struct BinaryRowFramer {
    state: ScanStateMachine,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct ScanStateMachine {
    state: ScanState,
    row_id: u64,
    row_tag: u8,
    row_length: usize,
}

impl Default for ScanStateMachine {
    fn default() -> Self {
        ScanStateMachine {
            state: ScanState::RowId,
            row_id: 0,
            row_tag: 0,
            row_length: 0,
        }
    }
}

impl ScanStateMachine {
    fn reset(&mut self) {
        *self = ScanStateMachine::default();
    }
}

impl BinaryRowFramer {
    /// Create a fresh framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport fragment, emitting every complete row it finishes.
    pub fn feed(&mut self, fragment: &[u8]) -> Result<Vec<Row>, ProtocolError> {
        let mut rows = Vec::new();
        let mut i = 0usize;
        let len = fragment.len();
        while i < len {
            match self.state.state {
                ScanState::RowId => {
                    let byte = fragment[i];
                    i += 1;
                    if byte == b':' {
                        self.state.state = ScanState::RowTag;
                    } else {
                        self.state.row_id = fold_hex(self.state.row_id, byte);
                    }
                }
                ScanState::RowTag => {
                    let byte = fragment[i];
                    if is_length_framed_tag(byte) {
                        self.state.row_tag = byte;
                        self.state.state = ScanState::RowLength;
                        i += 1;
                    } else if is_newline_framed_tag(byte) {
                        self.state.row_tag = byte;
                        self.state.state = ScanState::ChunkByNewline;
                        i += 1;
                    } else {
                        // Unknown tag; part of the payload, untagged JSON.
                        self.state.row_tag = 0;
                        self.state.state = ScanState::ChunkByNewline;
                    }
                }
                ScanState::RowLength => {
                    let byte = fragment[i];
                    i += 1;
                    if byte == b',' {
                        self.state.state = ScanState::ChunkByLength;
                    } else {
                        self.state.row_length =
                            fold_hex(self.state.row_length as u64, byte) as usize;
                    }
                }
                ScanState::ChunkByNewline => {
                    match fragment[i..].iter().position(|&b| b == b'\n') {
                        Some(offset) => {
                            let end = i + offset;
                            self.buffer.extend_from_slice(&fragment[i..end]);
                            rows.push(self.complete_row());
                            i = end + 1;
                        }
                        None => {
                            self.buffer.extend_from_slice(&fragment[i..]);
                            i = len;
                        }
                    }
                }
                ScanState::ChunkByLength => {
                    let remaining = self.state.row_length;
                    let available = len - i;
                    if available >= remaining {
                        let end = i + remaining;
                        self.buffer.extend_from_slice(&fragment[i..end]);
                        rows.push(self.complete_row());
                        i = end;
                    } else {
                        self.buffer.extend_from_slice(&fragment[i..]);
                        // Track how many bytes the row is still owed.
                        self.state.row_length = remaining - available;
                        i = len;
                    }
                }
            }
        }
        Ok(rows)
    }

    fn complete_row(&mut self) -> Row {
        let row = Row {
            id: self.state.row_id,
            tag: self.state.row_tag,
            payload: RowPayload::Bytes(std::mem::take(&mut self.buffer)),
        };
        tracing::trace!(id = row.id, tag = row.tag, "framed binary row");
        self.state.reset();
        row
    }
}

/// Incremental framer over pre-decoded text. Row headers may split across
/// fragments, but row content must arrive whole: the transport is expected
/// to hand over rows in the shape it received them, and repairing a split is
/// out of contract.
#[derive(Debug, Default)]
pub struct TextRowFramer {
    state: ScanStateMachine,
}

impl TextRowFramer {
    /// Create a fresh framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one text fragment, emitting every complete row it finishes.
    pub fn feed(&mut self, fragment: &str) -> Result<Vec<Row>, ProtocolError> {
        let mut rows = Vec::new();
        let bytes = fragment.as_bytes();
        let mut i = 0usize;
        let len = bytes.len();
        while i < len {
            match self.state.state {
                ScanState::RowId => {
                    let byte = bytes[i];
                    i += 1;
                    if byte == b':' {
                        self.state.state = ScanState::RowTag;
                    } else {
                        self.state.row_id = fold_hex(self.state.row_id, byte);
                    }
                }
                ScanState::RowTag => {
                    let byte = bytes[i];
                    if is_length_framed_tag(byte) {
                        if byte != b'T' {
                            return Err(ProtocolError::BinaryRowAsText { tag: byte as char });
                        }
                        self.state.row_tag = byte;
                        self.state.state = ScanState::RowLength;
                        i += 1;
                    } else if is_newline_framed_tag(byte) {
                        self.state.row_tag = byte;
                        self.state.state = ScanState::ChunkByNewline;
                        i += 1;
                    } else {
                        self.state.row_tag = 0;
                        self.state.state = ScanState::ChunkByNewline;
                    }
                }
                ScanState::RowLength => {
                    let byte = bytes[i];
                    i += 1;
                    if byte == b',' {
                        self.state.state = ScanState::ChunkByLength;
                    } else {
                        self.state.row_length =
                            fold_hex(self.state.row_length as u64, byte) as usize;
                    }
                }
                ScanState::ChunkByNewline => {
                    match bytes[i..].iter().position(|&b| b == b'\n') {
                        Some(offset) => {
                            let end = i + offset;
                            rows.push(self.complete_row(&fragment[i..end]));
                            i = end + 1;
                        }
                        None => {
                            // Row content must not split across text fragments.
                            return Err(ProtocolError::SplitTextRow {
                                id: self.state.row_id,
                            });
                        }
                    }
                }
                ScanState::ChunkByLength => {
                    // Only `T` reaches here. The declared length is the UTF-8
                    // byte count and the content must be entirely present.
                    let declared = self.state.row_length;
                    let available = len - i;
                    if available < declared {
                        return Err(ProtocolError::TextLengthMismatch {
                            declared,
                            actual: available,
                        });
                    }
                    let end = i + declared;
                    if !fragment.is_char_boundary(end) {
                        return Err(ProtocolError::CharBoundary);
                    }
                    rows.push(self.complete_row(&fragment[i..end]));
                    i = end;
                }
            }
        }
        Ok(rows)
    }

    fn complete_row(&mut self, content: &str) -> Row {
        let row = Row {
            id: self.state.row_id,
            tag: self.state.row_tag,
            payload: RowPayload::Text(content.to_owned()),
        };
        tracing::trace!(id = row.id, tag = row.tag, "framed text row");
        self.state.reset();
        row
    }
}
