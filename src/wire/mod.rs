//! Wire vocabulary: row tags, binary element kinds, and sentinel prefixes
//!
//! One row is `(id, tag, payload)`. The tag byte selects both the framing
//! mode (length-prefixed for text and typed-array rows, newline-delimited for
//! everything else) and the payload interpretation. Dispatch is over the
//! [`RowTag`] enum rather than raw bytes so every arm is typed.

pub mod framer;

pub use framer::{BinaryRowFramer, Row, RowPayload, TextRowFramer};

/// Element kind of a binary row. Determines the tag byte on the wire and the
/// element width used for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Opaque buffer (`A`)
    Buffer,
    /// Signed 8-bit (`O`)
    I8,
    /// Unsigned 8-bit (`o`)
    U8,
    /// Clamped unsigned 8-bit (`U`)
    U8Clamped,
    /// Signed 16-bit (`S`)
    I16,
    /// Unsigned 16-bit (`s`)
    U16,
    /// Signed 32-bit (`L`)
    I32,
    /// Unsigned 32-bit (`l`)
    U32,
    /// 32-bit float (`G`)
    F32,
    /// 64-bit float (`g`)
    F64,
    /// Signed 64-bit (`M`)
    I64,
    /// Unsigned 64-bit (`m`)
    U64,
    /// Raw byte view (`V`)
    View,
}

impl ElementKind {
    /// The wire tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            ElementKind::Buffer => b'A',
            ElementKind::I8 => b'O',
            ElementKind::U8 => b'o',
            ElementKind::U8Clamped => b'U',
            ElementKind::I16 => b'S',
            ElementKind::U16 => b's',
            ElementKind::I32 => b'L',
            ElementKind::U32 => b'l',
            ElementKind::F32 => b'G',
            ElementKind::F64 => b'g',
            ElementKind::I64 => b'M',
            ElementKind::U64 => b'm',
            ElementKind::View => b'V',
        }
    }

    /// Element width in bytes. Buffers and views are byte-granular.
    pub fn width(self) -> usize {
        match self {
            ElementKind::Buffer | ElementKind::U8 | ElementKind::I8 | ElementKind::U8Clamped
            | ElementKind::View => 1,
            ElementKind::I16 | ElementKind::U16 => 2,
            ElementKind::I32 | ElementKind::U32 | ElementKind::F32 => 4,
            ElementKind::F64 | ElementKind::I64 | ElementKind::U64 => 8,
        }
    }

    /// Reverse lookup from a tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            b'A' => ElementKind::Buffer,
            b'O' => ElementKind::I8,
            b'o' => ElementKind::U8,
            b'U' => ElementKind::U8Clamped,
            b'S' => ElementKind::I16,
            b's' => ElementKind::U16,
            b'L' => ElementKind::I32,
            b'l' => ElementKind::U32,
            b'G' => ElementKind::F32,
            b'g' => ElementKind::F64,
            b'M' => ElementKind::I64,
            b'm' => ElementKind::U64,
            b'V' => ElementKind::View,
            _ => return None,
        })
    }
}

/// Flavor of a streamed aggregate started by an `R`/`r`/`X`/`x` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `R`: readable stream of decoded values
    Values,
    /// `r`: readable stream of raw byte buffers
    Bytes,
    /// `X`: async iterable, re-iterable from the start
    MultiShot,
    /// `x`: async iterator, single pass
    SingleShot,
}

impl StreamKind {
    /// The wire tag byte that starts a stream of this kind.
    pub fn tag(self) -> u8 {
        match self {
            StreamKind::Values => b'R',
            StreamKind::Bytes => b'r',
            StreamKind::MultiShot => b'X',
            StreamKind::SingleShot => b'x',
        }
    }
}

/// Decoded row tag. `Model` covers untagged rows whose payload is JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTag {
    /// Untagged JSON model row. Empty payload is the halt signal.
    Model,
    /// `I`: module reference descriptor
    Module,
    /// `H`: hint; first payload char is the hint code
    Hint,
    /// `E`: error model for one chunk
    ErrorModel,
    /// `T`: length-framed text chunk
    Text,
    /// `D`: debug model
    Debug,
    /// `J`: io-info model
    IoInfo,
    /// `W`: console replay entry
    Console,
    /// `N`: time origin marker
    TimeOrigin,
    /// `P`: postpone
    Postpone,
    /// `C`: stream close, optionally carrying a final value
    StreamClose,
    /// `R`/`r`/`X`/`x`: start a streamed aggregate
    StreamStart(StreamKind),
    /// Typed binary row
    Binary(ElementKind),
}

impl RowTag {
    /// Classify a raw tag byte the way the framer does: typed-array tags and
    /// `T` switch to length-prefixed mode, other uppercase tags (plus `r` and
    /// `x`) use newline framing, and anything else is untagged JSON.
    pub fn classify(byte: u8) -> RowTag {
        if byte == b'T' {
            return RowTag::Text;
        }
        if let Some(kind) = ElementKind::from_tag(byte) {
            return RowTag::Binary(kind);
        }
        match byte {
            b'I' => RowTag::Module,
            b'H' => RowTag::Hint,
            b'E' => RowTag::ErrorModel,
            b'D' => RowTag::Debug,
            b'J' => RowTag::IoInfo,
            b'W' => RowTag::Console,
            b'N' => RowTag::TimeOrigin,
            b'P' => RowTag::Postpone,
            b'C' => RowTag::StreamClose,
            b'R' => RowTag::StreamStart(StreamKind::Values),
            b'r' => RowTag::StreamStart(StreamKind::Bytes),
            b'X' => RowTag::StreamStart(StreamKind::MultiShot),
            b'x' => RowTag::StreamStart(StreamKind::SingleShot),
            _ => RowTag::Model,
        }
    }

    /// Whether rows with this tag are length-prefixed on the wire.
    pub fn length_framed(self) -> bool {
        matches!(self, RowTag::Text | RowTag::Binary(_))
    }
}

/// Sentinel prefix: strings in a model payload beginning with `$` encode
/// references and out-of-band scalars. A leading `$$` escapes a literal `$`.
pub const SENTINEL: char = '$';
