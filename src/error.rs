//! Error types for the protocol engine
//!
//! Three families, matching the failure taxonomy: fatal framing violations
//! (`ProtocolError`), errors that attach to chunks and flow to listeners
//! (`WireError`, shared as `Arc`), and reply-side failures (`EncodeError`).

use std::sync::Arc;
use thiserror::Error;

/// A chunk-level error, shared between every listener that depended on it.
///
/// One transport failure rejects all pending chunks with a single clone of
/// the same `Arc`, which is how tests can assert the "same error instance"
/// guarantee.
pub type SharedWireError = Arc<WireError>;

/// Fatal framing violation. Never recovered; the feed call that detected it
/// returns the error and the decoder must be discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A newline- or length-framed text row was split across fragments.
    /// Text framing requires each row's content to arrive as a single unit.
    #[error("text row split across fragments (id {id:#x})")]
    SplitTextRow {
        /// Row id being scanned when the split was detected
        id: u64,
    },

    /// A binary-framed row (typed array) was delivered through the text feed.
    #[error("binary row {tag:?} cannot be delivered as pre-decoded text")]
    BinaryRowAsText {
        /// The offending tag byte
        tag: char,
    },

    /// A length-framed text row whose declared byte length cannot match the
    /// fragment it arrived in.
    #[error("text row length mismatch: declared {declared} bytes, fragment holds {actual}")]
    TextLengthMismatch {
        /// Declared payload length in bytes
        declared: usize,
        /// Bytes actually available in the fragment
        actual: usize,
    },

    /// Length framing cut a multi-byte character in half.
    #[error("length-framed row does not end on a character boundary")]
    CharBoundary,

    /// A text-tagged row carried bytes that are not valid UTF-8.
    #[error("invalid utf-8 in row payload: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A typed-array payload whose byte length is not a multiple of the
    /// element width it declared.
    #[error("typed array of {len} bytes is not a multiple of element width {width}")]
    ElementWidth {
        /// Payload length in bytes
        len: usize,
        /// Declared element width
        width: usize,
    },
}

/// An error carried by the wire or raised while resolving a model payload.
///
/// These attach to individual chunks and propagate to the handlers that
/// depended on them; they never abort the whole stream.
#[derive(Debug, Error)]
pub enum WireError {
    /// The inbound transport ended while chunks were still pending.
    #[error("connection closed before the value resolved")]
    ConnectionClosed,

    /// An explicit error row (`E`) attached to one chunk.
    #[error("{name}: {message}")]
    Remote {
        /// Error class name reported by the peer
        name: String,
        /// Human-readable message
        message: String,
        /// Opaque digest for correlating with peer-side logs
        digest: Option<String>,
        /// Environment name the error originated in
        env: Option<String>,
    },

    /// A postpone row (`P`): the peer gave up on this subtree on purpose.
    #[error("postponed: {0}")]
    Postponed(String),

    /// The model payload could not be parsed into a value.
    #[error("invalid model payload: {0}")]
    Model(String),

    /// A `$T` reference arrived but no temporary reference set was supplied.
    #[error("missing temporary reference set for a `$T` reference")]
    MissingTemporaryRefs,

    /// A `$T` reference names a slot the temporary reference set never saw.
    #[error("unknown temporary reference {0:?}")]
    UnknownTemporaryRef(String),

    /// A remote callable was invoked but the decoder was built without a
    /// call function.
    #[error("remote callable {0:?} invoked without a call function configured")]
    NoRemoteCall(String),

    /// A `$E` function stub was invoked. Stubs only describe a function,
    /// they cannot run it.
    #[error("function stubs cannot be invoked")]
    StubCall,

    /// A deferred reply part failed on the peer and the hole was read.
    #[error("deferred part never arrived")]
    MissingPart,
}

impl WireError {
    /// Wrap into the shared form used on listener lists.
    pub fn shared(self) -> SharedWireError {
        Arc::new(self)
    }
}

/// Reply-encoder failures.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Local functions cannot cross the boundary; only callables the peer
    /// gave us (or values covered by a temporary reference set) can.
    #[error("local callables cannot be encoded; pass a temporary reference set")]
    LocalCallable,

    /// Tree nodes require a temporary reference set on the reply side.
    #[error("tree nodes cannot be encoded; pass a temporary reference set")]
    NodeWithoutTemporaryRefs,

    /// Symbols require a temporary reference set on the reply side.
    #[error("symbols cannot be encoded; pass a temporary reference set")]
    SymbolWithoutTemporaryRefs,

    /// An unresolved placeholder (a reference that never arrived) was found
    /// in the value graph.
    #[error("cannot encode an unresolved placeholder")]
    PendingPlaceholder,

    /// A deferred part's source (promise, stream, iterable) failed.
    #[error("deferred part failed: {0}")]
    Deferred(SharedWireError),

    /// JSON assembly failed.
    #[error("model serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
