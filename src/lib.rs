//! Filament – a streaming structured-value wire protocol engine
//!
//! This crate implements both halves of a row-oriented wire protocol for
//! structured value graphs:
//! - Incremental decoding of newline- and length-framed rows into a graph of
//!   identified chunks, with out-of-order delivery and forward references
//! - Cyclic and self-referential models, resolved without blocking
//! - Asynchronous values as first-class citizens: promises, lazy chunks,
//!   readable streams, and async iterables that fill in as rows arrive
//! - Reply encoding back onto the wire, including deferred parts that flush
//!   as their sources settle

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Decode side: sessions, chunks, and sentinel resolution
pub mod decode;
/// Reply encoding
pub mod encode;
/// Failure families for framing, decoding, and encoding
pub mod error;
/// The value model shared by both directions
pub mod value;
/// Row framing and tag grammar
pub mod wire;

// Re-export key types for convenience
pub use decode::{
    ChunkHandle, DecodeOptions, Decoder, IterHandle, IterReader, PromiseResolver, StreamHandle,
    TemporaryReferenceSet,
};
pub use encode::{encode, EncodeOptions, PendingReply, Reply, ReplyAborter};
pub use error::{EncodeError, ProtocolError, SharedWireError, WireError};
pub use value::{Callable, Value};
pub use wire::{ElementKind, StreamKind};

/// Current version of the Filament engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
