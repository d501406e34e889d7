//! Tagged value model: the closed set of value kinds the protocol can carry
//!
//! Aggregates are shared cells (`Arc` + mutex) rather than owned trees, for
//! two reasons: late-arriving references are written into their containers in
//! place after the container has already been handed out, and cyclic graphs
//! must be representable at all. Identity (pointer) comparison backs both
//! encode-side deduplication and cycle-safe structural equality.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::decode::chunk::ChunkHandle;
use crate::decode::stream::{IterHandle, StreamHandle};
use crate::error::{SharedWireError, WireError};
use crate::wire::ElementKind;

/// A shared, in-place-mutable list cell.
pub type SharedList = Arc<ListCell>;

/// Backing storage for [`Value::List`], [`Value::Set`] and node tuples.
#[derive(Debug, Default)]
pub struct ListCell {
    items: Mutex<Vec<Value>>,
}

impl ListCell {
    /// Wrap a vector into a shared cell.
    pub fn new(items: Vec<Value>) -> SharedList {
        Arc::new(ListCell {
            items: Mutex::new(items),
        })
    }

    /// Snapshot the current items.
    pub fn snapshot(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Read one slot.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.lock().get(index).cloned()
    }

    /// Overwrite one slot. Out-of-range writes extend with `Undefined`, which
    /// only happens when a reference fulfills into a sparse tuple.
    pub fn set(&self, index: usize, value: Value) {
        let mut items = self.items.lock();
        if index >= items.len() {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value;
    }

    /// Append one item.
    pub fn push(&self, value: Value) {
        self.items.lock().push(value);
    }
}

/// A shared, ordered string-keyed object cell.
pub type SharedObject = Arc<ObjectCell>;

/// Backing storage for [`Value::Object`]. Entries keep insertion order; the
/// wire never carries enough keys for lookup cost to matter.
#[derive(Debug, Default)]
pub struct ObjectCell {
    entries: Mutex<Vec<(String, Value)>>,
}

impl ObjectCell {
    /// Wrap entries into a shared cell.
    pub fn new(entries: Vec<(String, Value)>) -> SharedObject {
        Arc::new(ObjectCell {
            entries: Mutex::new(entries),
        })
    }

    /// Snapshot the current entries.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or overwrite a key.
    pub fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            entries.push((key.to_owned(), value));
        }
    }
}

/// A shared list of key/value pairs, backing [`Value::Map`] and
/// [`Value::Form`].
pub type SharedPairs = Arc<PairsCell>;

/// Ordered pair storage. Keys are full values (maps admit non-string keys).
#[derive(Debug, Default)]
pub struct PairsCell {
    entries: Mutex<Vec<(Value, Value)>>,
}

impl PairsCell {
    /// Wrap pairs into a shared cell.
    pub fn new(entries: Vec<(Value, Value)>) -> SharedPairs {
        Arc::new(PairsCell {
            entries: Mutex::new(entries),
        })
    }

    /// Snapshot the current pairs.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.entries.lock().clone()
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A typed binary buffer.
#[derive(Debug, Clone)]
pub struct BytesValue {
    /// Element kind (width and signedness on the wire)
    pub kind: ElementKind,
    /// Raw little-endian bytes
    pub data: Arc<[u8]>,
}

/// An opaque binary blob with an optional media type.
#[derive(Debug, Clone)]
pub struct BlobValue {
    /// Media type, when the peer declared one
    pub media_type: Option<String>,
    /// Blob contents
    pub data: Arc<[u8]>,
}

/// Function the decoder uses to invoke a remote callable across the boundary.
pub type RemoteCallFn = Arc<
    dyn Fn(
            String,
            Vec<Value>,
        ) -> futures::future::BoxFuture<'static, Result<Value, SharedWireError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
enum CallableKind {
    /// A reference the peer handed us; calling routes back over the boundary.
    Remote {
        id: String,
        bound: Option<Value>,
        call: Option<RemoteCallFn>,
    },
    /// A `$E` function literal: source text only, never invokable.
    Stub { source: String },
}

/// A callable value. Either a remote reference that can be invoked across
/// the protocol boundary, or an uncallable source-text stub.
#[derive(Clone)]
pub struct Callable {
    inner: Arc<CallableKind>,
}

impl Callable {
    /// Build a remote callable.
    pub fn remote(id: impl Into<String>, bound: Option<Value>, call: Option<RemoteCallFn>) -> Self {
        Callable {
            inner: Arc::new(CallableKind::Remote {
                id: id.into(),
                bound,
                call,
            }),
        }
    }

    /// Build an uncallable stub from source text.
    pub fn stub(source: impl Into<String>) -> Self {
        Callable {
            inner: Arc::new(CallableKind::Stub {
                source: source.into(),
            }),
        }
    }

    /// The remote reference id, when this is a remote callable.
    pub fn remote_id(&self) -> Option<&str> {
        match &*self.inner {
            CallableKind::Remote { id, .. } => Some(id),
            CallableKind::Stub { .. } => None,
        }
    }

    /// Bound arguments captured by the peer, if any. May itself be a promise
    /// that has not resolved yet.
    pub fn bound(&self) -> Option<Value> {
        match &*self.inner {
            CallableKind::Remote { bound, .. } => bound.clone(),
            CallableKind::Stub { .. } => None,
        }
    }

    /// Invoke across the boundary. Bound arguments are awaited first when the
    /// peer sent them as a promise.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, SharedWireError> {
        match &*self.inner {
            CallableKind::Stub { .. } => Err(WireError::StubCall.shared()),
            CallableKind::Remote { id, bound, call } => {
                let call = call
                    .clone()
                    .ok_or_else(|| WireError::NoRemoteCall(id.clone()).shared())?;
                let mut full_args = Vec::new();
                if let Some(bound) = bound {
                    let bound = match bound {
                        Value::Promise(handle) => handle.value().await?,
                        other => other.clone(),
                    };
                    if let Value::List(list) = bound {
                        full_args.extend(list.snapshot());
                    }
                }
                full_args.extend(args);
                call(id.clone(), full_args).await
            }
        }
    }

    fn ptr_token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner {
            CallableKind::Remote { id, .. } => write!(f, "Callable::Remote({id:?})"),
            CallableKind::Stub { .. } => write!(f, "Callable::Stub"),
        }
    }
}

/// One value in the wire model.
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON null
    Null,
    /// `$undefined`
    Undefined,
    /// Placeholder for a reference that has not resolved yet. Overwritten in
    /// place once the referenced chunk initializes.
    Pending,
    /// `$Y`: a value the peer deliberately omitted.
    Omitted,
    /// Boolean
    Bool(bool),
    /// Finite or special (`NaN`, `±Infinity`, `-0`) number
    Number(f64),
    /// `$n`: arbitrary-precision integer, kept as its decimal digits
    BigInt(String),
    /// UTF-8 string
    String(String),
    /// `$S`: interned symbol name
    Symbol(String),
    /// `$D`: instant in time
    Date(DateTime<Utc>),
    /// Typed binary buffer
    Bytes(BytesValue),
    /// `$B`: opaque blob
    Blob(BlobValue),
    /// Ordered list
    List(SharedList),
    /// String-keyed object
    Object(SharedObject),
    /// `$Q`: map with arbitrary keys
    Map(SharedPairs),
    /// `$W`: set
    Set(SharedList),
    /// `$K`: form data (ordered key/value entries)
    Form(SharedPairs),
    /// Tree node: tuple storage `[marker, tag, key, props]` shared with any
    /// references that are still filling it in
    Node(SharedList),
    /// `$L`: lazily-initialized reference to a chunk
    Lazy(ChunkHandle),
    /// `$@`: a promise backed by a chunk
    Promise(ChunkHandle),
    /// `R`/`r`: readable stream
    Stream(StreamHandle),
    /// `X`/`x`: async iterable
    AsyncIter(IterHandle),
    /// `$F`/`$E`: callable reference or stub
    Callable(Callable),
    /// `$Z`: an error value carried as data
    Error(SharedWireError),
}

impl Value {
    /// Build a list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(ListCell::new(items))
    }

    /// Build an object from ordered entries.
    pub fn object(entries: Vec<(impl Into<String>, Value)>) -> Value {
        Value::Object(ObjectCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Build a map.
    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value::Map(PairsCell::new(pairs))
    }

    /// Build a set.
    pub fn set(items: Vec<Value>) -> Value {
        Value::Set(ListCell::new(items))
    }

    /// Build form data.
    pub fn form(pairs: Vec<(Value, Value)>) -> Value {
        Value::Form(PairsCell::new(pairs))
    }

    /// Build a typed binary buffer.
    pub fn bytes(kind: ElementKind, data: Vec<u8>) -> Value {
        Value::Bytes(BytesValue {
            kind,
            data: data.into(),
        })
    }

    /// Build a tree node. Slot 0 is the marker position and stays unused.
    pub fn node(tag: Value, key: Option<&str>, props: Value) -> Value {
        Value::Node(ListCell::new(vec![
            Value::Undefined,
            tag,
            key.map(|k| Value::String(k.to_owned())).unwrap_or(Value::Null),
            props,
        ]))
    }

    /// Build an already-resolved promise.
    pub fn promise_ready(value: Value) -> Value {
        Value::Promise(ChunkHandle::ready(value))
    }

    /// Build an already-rejected promise.
    pub fn promise_err(error: SharedWireError) -> Value {
        Value::Promise(ChunkHandle::failed(error))
    }

    /// Node tag (slot 1).
    pub fn node_tag(&self) -> Option<Value> {
        match self {
            Value::Node(tuple) => tuple.get(1),
            _ => None,
        }
    }

    /// Node key (slot 2).
    pub fn node_key(&self) -> Option<String> {
        match self {
            Value::Node(tuple) => match tuple.get(2) {
                Some(Value::String(key)) => Some(key),
                _ => None,
            },
            _ => None,
        }
    }

    /// Node props (slot 3).
    pub fn node_props(&self) -> Option<Value> {
        match self {
            Value::Node(tuple) => tuple.get(3),
            _ => None,
        }
    }

    /// Drill one path segment into an aggregate, the way outlined reference
    /// paths do. Missing members resolve to `Undefined`.
    pub fn member(&self, segment: &str) -> Value {
        match self {
            Value::List(list) | Value::Set(list) | Value::Node(list) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| list.get(idx))
                .unwrap_or(Value::Undefined),
            Value::Object(object) => object.get(segment).unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Pointer identity token for aggregates and handles; `None` for plain
    /// scalars. Two values with the same token are the same cell.
    pub fn ptr_token(&self) -> Option<usize> {
        match self {
            Value::List(cell) | Value::Set(cell) | Value::Node(cell) => {
                Some(Arc::as_ptr(cell) as usize)
            }
            Value::Object(cell) => Some(Arc::as_ptr(cell) as usize),
            Value::Map(cell) | Value::Form(cell) => Some(Arc::as_ptr(cell) as usize),
            Value::Bytes(bytes) => Some(bytes.data.as_ptr() as usize),
            Value::Blob(blob) => Some(blob.data.as_ptr() as usize),
            Value::Lazy(handle) | Value::Promise(handle) => Some(handle.ptr_token()),
            Value::Stream(handle) => Some(handle.ptr_token()),
            Value::AsyncIter(handle) => Some(handle.ptr_token()),
            Value::Callable(callable) => Some(callable.ptr_token()),
            _ => None,
        }
    }

    /// Cycle-safe deep structural equality. Numbers compare by bit pattern,
    /// so `NaN == NaN` and `0.0 != -0.0`, which is what round-trip assertions
    /// want. Streams and unresolved handles compare by identity.
    pub fn deep_eq(&self, other: &Value) -> bool {
        fn go(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
            if let (Some(pa), Some(pb)) = (a.ptr_token(), b.ptr_token()) {
                if pa == pb {
                    return true;
                }
                // A revisited pair means we're inside a cycle both sides
                // entered the same way; treat it as equal at this level.
                if !seen.insert((pa, pb)) {
                    return true;
                }
            }
            match (a, b) {
                (Value::Null, Value::Null)
                | (Value::Undefined, Value::Undefined)
                | (Value::Pending, Value::Pending)
                | (Value::Omitted, Value::Omitted) => true,
                (Value::Bool(x), Value::Bool(y)) => x == y,
                (Value::Number(x), Value::Number(y)) => x.to_bits() == y.to_bits(),
                (Value::BigInt(x), Value::BigInt(y)) => x == y,
                (Value::String(x), Value::String(y)) => x == y,
                (Value::Symbol(x), Value::Symbol(y)) => x == y,
                (Value::Date(x), Value::Date(y)) => {
                    x.timestamp_millis() == y.timestamp_millis()
                }
                (Value::Bytes(x), Value::Bytes(y)) => x.kind == y.kind && x.data == y.data,
                (Value::Blob(x), Value::Blob(y)) => {
                    x.media_type == y.media_type && x.data == y.data
                }
                (Value::List(x), Value::List(y))
                | (Value::Set(x), Value::Set(y))
                | (Value::Node(x), Value::Node(y)) => {
                    let xs = x.snapshot();
                    let ys = y.snapshot();
                    xs.len() == ys.len()
                        && xs.iter().zip(ys.iter()).all(|(a, b)| go(a, b, seen))
                }
                (Value::Object(x), Value::Object(y)) => {
                    let xs = x.snapshot();
                    let ys = y.snapshot();
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .zip(ys.iter())
                            .all(|((ka, va), (kb, vb))| ka == kb && go(va, vb, seen))
                }
                (Value::Map(x), Value::Map(y)) | (Value::Form(x), Value::Form(y)) => {
                    let xs = x.snapshot();
                    let ys = y.snapshot();
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .zip(ys.iter())
                            .all(|((ka, va), (kb, vb))| go(ka, kb, seen) && go(va, vb, seen))
                }
                (Value::Lazy(x), Value::Lazy(y)) | (Value::Promise(x), Value::Promise(y)) => {
                    match (x.try_value(), y.try_value()) {
                        (Some(Ok(va)), Some(Ok(vb))) => go(&va, &vb, seen),
                        _ => x.ptr_token() == y.ptr_token(),
                    }
                }
                (Value::Callable(x), Value::Callable(y)) => {
                    x.ptr_token() == y.ptr_token() || x.remote_id() == y.remote_id()
                }
                (Value::Error(x), Value::Error(y)) => x.to_string() == y.to_string(),
                _ => false,
            }
        }
        go(self, other, &mut HashSet::new())
    }

    /// Whether this value is the pending placeholder.
    pub fn is_pending(&self) -> bool {
        matches!(self, Value::Pending)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_eq_handles_cycles() {
        let a = ObjectCell::new(vec![]);
        a.set("self", Value::Object(a.clone()));
        let b = ObjectCell::new(vec![]);
        b.set("self", Value::Object(b.clone()));
        assert!(Value::Object(a).deep_eq(&Value::Object(b)));
    }

    #[test]
    fn nan_is_equal_to_itself() {
        assert!(Value::Number(f64::NAN).deep_eq(&Value::Number(f64::NAN)));
        assert!(!Value::Number(0.0).deep_eq(&Value::Number(-0.0)));
    }

    #[test]
    fn member_walks_lists_and_objects() {
        let v = Value::object(vec![("items", Value::list(vec![Value::from(1i64)]))]);
        assert_eq!(v.member("items").member("0"), Value::Number(1.0));
        assert_eq!(v.member("missing"), Value::Undefined);
    }
}
