//! Model resolution: JSON payloads plus the `$` sentinel grammar
//!
//! A model row's payload is JSON whose strings may be sentinels: escapes,
//! out-of-band scalars, or references to other chunks (`$<hexid>[:path...]`).
//! Resolution is re-entrant and non-blocking. A reference to a chunk that has
//! not arrived yet leaves a placeholder in its container slot and registers a
//! [`Reference`] on that chunk; when the chunk settles, the reference writes
//! the real value into the slot in place.
//!
//! Each parse threads an explicit [`ParseCx`] instead of ambient state, so
//! concurrent parses on different sessions cannot observe each other's
//! in-flight handlers.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::decode::chunk::{self, ChunkCell, ChunkHandle, ChunkState, Listener, DETACHED_ID};
use crate::decode::SessionInner;
use crate::error::{SharedWireError, WireError};
use crate::value::{Callable, ListCell, ObjectCell, PairsCell, Value};
use crate::wire::SENTINEL;

/// Dependency bookkeeping for one value that is still being filled in.
///
/// Every deferred reference created under the same parse scope shares one
/// handler. `deps` counts references that have not written back yet; when it
/// reaches zero the handler's chunk (if any) initializes with the completed
/// value.
pub(crate) struct Handler {
    inner: Mutex<HandlerInner>,
}

pub(crate) struct HandlerInner {
    /// Chunk to initialize once `deps` drains, when the owner stayed blocked
    pub(crate) chunk: Option<Arc<ChunkCell>>,
    /// The value under construction (partial until `deps` drains)
    pub(crate) value: Option<Value>,
    /// First failure, if any reference rejected
    pub(crate) reason: Option<SharedWireError>,
    /// Outstanding reference count
    pub(crate) deps: usize,
    /// Whether any reference rejected
    pub(crate) errored: bool,
}

impl Handler {
    fn new(deps: usize) -> Arc<Handler> {
        Arc::new(Handler {
            inner: Mutex::new(HandlerInner {
                chunk: None,
                value: None,
                reason: None,
                deps,
                errored: false,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandlerInner> {
        self.inner.lock()
    }
}

/// Where a deferred reference writes once it resolves.
#[derive(Clone)]
pub(crate) enum Slot {
    /// The root of the model payload itself was a reference.
    Root,
    /// Index into a shared list (or node tuple).
    ListIndex(Arc<ListCell>, usize),
    /// Key in a shared object.
    Entry(Arc<ObjectCell>, String),
}

/// Post-resolution mapping applied to an outlined value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Mapper {
    /// Identity.
    Model,
    /// Entry-pair list to a map.
    Map,
    /// List to a set.
    Set,
    /// `[media_type, ...buffers]` to a blob.
    Blob,
    /// Entry-pair list to form data.
    FormData,
    /// Outlined iterator payload; iterates as the list it arrived as.
    Iterator,
    /// `{id, bound}` metadata to a remote callable.
    Callable,
    /// Error model to an error value.
    ErrorValue,
}

/// A deferred slot write: waits on a chunk, then walks `path` into its value,
/// applies `mapper`, and stores the result at `slot`.
pub(crate) struct Reference {
    session: Weak<SessionInner>,
    pub(crate) handler: Arc<Handler>,
    slot: Slot,
    mapper: Mapper,
    /// Remaining path; truncated when the walk re-parks on an inner chunk
    path: Mutex<Vec<String>>,
}

/// Per-parse state. One lives for the duration of each model parse.
pub(crate) struct ParseCx {
    handler: Option<Arc<Handler>>,
}

impl ParseCx {
    pub(crate) fn new() -> ParseCx {
        ParseCx { handler: None }
    }

    /// Detach the scope's handler, if any reference was created under it.
    pub(crate) fn take_handler(&mut self) -> Option<Arc<Handler>> {
        self.handler.take()
    }
}

/// Parse one model payload into a value. References to unarrived chunks
/// leave placeholders and register themselves through `cx`.
pub(crate) fn parse_model(
    session: &Arc<SessionInner>,
    raw: &str,
    cx: &mut ParseCx,
) -> Result<Value, SharedWireError> {
    let json: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| WireError::Model(e.to_string()).shared())?;
    convert(session, cx, json, Slot::Root)
}

fn convert(
    session: &Arc<SessionInner>,
    cx: &mut ParseCx,
    json: serde_json::Value,
    slot: Slot,
) -> Result<Value, SharedWireError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
        serde_json::Value::String(s) => parse_model_string(session, cx, &s, slot),
        serde_json::Value::Array(items) => {
            if matches!(items.first(), Some(serde_json::Value::String(s)) if s == "$") {
                return convert_node(session, cx, items);
            }
            let cell = ListCell::new(Vec::new());
            for (index, item) in items.into_iter().enumerate() {
                let slot = Slot::ListIndex(cell.clone(), index);
                let value = convert(session, cx, item, slot)?;
                cell.push(value);
            }
            Ok(Value::List(cell))
        }
        serde_json::Value::Object(entries) => {
            let cell = ObjectCell::new(Vec::new());
            for (key, item) in entries {
                let slot = Slot::Entry(cell.clone(), key.clone());
                let value = convert(session, cx, item, slot)?;
                cell.set(&key, value);
            }
            Ok(Value::Object(cell))
        }
    }
}

/// Convert a `["$", tag, key, props, ...]` tuple into a node. References
/// created while converting the tuple's own slots are scoped to the node:
/// if any remain unresolved the node is returned as a lazy wrapper around a
/// blocked chunk that initializes when the last one writes back.
fn convert_node(
    session: &Arc<SessionInner>,
    cx: &mut ParseCx,
    items: Vec<serde_json::Value>,
) -> Result<Value, SharedWireError> {
    let outer = cx.handler.take();

    let tuple = ListCell::new(vec![Value::Undefined]);
    let result: Result<(), SharedWireError> = (|| {
        for (index, item) in items.into_iter().enumerate().skip(1) {
            let slot = Slot::ListIndex(tuple.clone(), index);
            let value = convert(session, cx, item, slot)?;
            tuple.set(index, value);
        }
        while tuple.len() < 4 {
            tuple.push(Value::Null);
        }
        Ok(())
    })();
    let scoped = cx.handler.take();
    cx.handler = outer;
    result?;

    let node = Value::Node(tuple);
    if let Some(handler) = scoped {
        let mut inner = handler.lock();
        if inner.errored {
            let error = inner
                .reason
                .clone()
                .unwrap_or_else(|| WireError::ConnectionClosed.shared());
            return Ok(Value::Lazy(ChunkHandle {
                cell: ChunkCell::errored(Arc::downgrade(session), DETACHED_ID, error),
            }));
        }
        if inner.deps > 0 {
            let cell = ChunkCell::blocked(Arc::downgrade(session), DETACHED_ID);
            inner.value = Some(node.clone());
            inner.chunk = Some(cell.clone());
            return Ok(Value::Lazy(ChunkHandle { cell }));
        }
    }
    Ok(node)
}

/// Decode one sentinel string.
fn parse_model_string(
    session: &Arc<SessionInner>,
    cx: &mut ParseCx,
    s: &str,
    slot: Slot,
) -> Result<Value, SharedWireError> {
    if !s.starts_with(SENTINEL) {
        return Ok(Value::String(s.to_owned()));
    }
    let rest = &s[1..];
    match rest.as_bytes().first() {
        // A bare "$" outside tuple position carries no meaning of its own.
        None => Ok(Value::String(s.to_owned())),
        // "$$..." escapes a literal leading dollar.
        Some(b'$') => Ok(Value::String(rest.to_owned())),
        Some(b'L') => {
            let id = parse_hex_id(&rest[1..])?;
            Ok(Value::Lazy(ChunkHandle {
                cell: SessionInner::chunk(session, id),
            }))
        }
        Some(b'@') => {
            let id = parse_hex_id(&rest[1..])?;
            Ok(Value::Promise(ChunkHandle {
                cell: SessionInner::chunk(session, id),
            }))
        }
        Some(b'S') => Ok(Value::Symbol(rest[1..].to_owned())),
        Some(b'F') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Callable),
        Some(b'T') => {
            let key = &rest[1..];
            let refs = session
                .options
                .temporary_refs
                .as_ref()
                .ok_or_else(|| WireError::MissingTemporaryRefs.shared())?;
            refs.get(key)
                .ok_or_else(|| WireError::UnknownTemporaryRef(key.to_owned()).shared())
        }
        Some(b'Q') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Map),
        Some(b'W') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Set),
        Some(b'B') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Blob),
        Some(b'K') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::FormData),
        Some(b'Z') => {
            if rest.len() == 1 {
                Ok(Value::Error(
                    WireError::Remote {
                        name: "Error".to_owned(),
                        message: "an error occurred on the remote side".to_owned(),
                        digest: None,
                        env: None,
                    }
                    .shared(),
                ))
            } else {
                get_outlined_model(session, cx, &rest[1..], slot, Mapper::ErrorValue)
            }
        }
        Some(b'i') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Iterator),
        Some(b'I') if rest == "Infinity" => Ok(Value::Number(f64::INFINITY)),
        Some(b'-') if rest == "-Infinity" => Ok(Value::Number(f64::NEG_INFINITY)),
        Some(b'-') if rest == "-0" => Ok(Value::Number(-0.0)),
        Some(b'N') if rest == "NaN" => Ok(Value::Number(f64::NAN)),
        Some(b'u') if rest == "undefined" => Ok(Value::Undefined),
        Some(b'D') => {
            let stamp = &rest[1..];
            let date = DateTime::parse_from_rfc3339(stamp)
                .map_err(|e| WireError::Model(format!("invalid date {stamp:?}: {e}")).shared())?;
            Ok(Value::Date(date.with_timezone(&Utc)))
        }
        Some(b'n') => Ok(Value::BigInt(rest[1..].to_owned())),
        Some(b'E') => Ok(Value::Callable(Callable::stub(&rest[1..]))),
        Some(b'Y') => Ok(Value::Omitted),
        Some(b'P') => get_outlined_model(session, cx, &rest[1..], slot, Mapper::Model),
        _ => get_outlined_model(session, cx, rest, slot, Mapper::Model),
    }
}

fn parse_hex_id(s: &str) -> Result<u64, SharedWireError> {
    u64::from_str_radix(s, 16)
        .map_err(|_| WireError::Model(format!("malformed chunk id {s:?}")).shared())
}

/// Outcome of walking a member path through a value, dereferencing lazy
/// wrappers along the way.
enum Walk {
    Done(Value),
    Wait {
        cell: Arc<ChunkCell>,
        remaining: Vec<String>,
    },
    Failed(SharedWireError),
    Halted,
}

fn walk_path(mut value: Value, path: &[String], handler: Option<&Arc<Handler>>) -> Walk {
    let mut index = 0;
    loop {
        loop {
            let handle = match &value {
                Value::Lazy(handle) => handle.clone(),
                _ => break,
            };
            if let Some(handler) = handler {
                // A hop back onto the chunk this handler is itself building:
                // read the in-flight partial instead of waiting on ourselves.
                let partial = {
                    let inner = handler.lock();
                    match &inner.chunk {
                        Some(cell) if Arc::ptr_eq(cell, &handle.cell) => inner.value.clone(),
                        _ => None,
                    }
                };
                if let Some(partial) = partial {
                    value = partial;
                    continue;
                }
            }
            chunk::ensure_initialized(&handle.cell);
            let next = {
                let state = handle.cell.state.lock();
                match &*state {
                    ChunkState::Initialized { value, .. } => Some(value.clone()),
                    ChunkState::Errored { error } => return Walk::Failed(error.clone()),
                    ChunkState::Halted => return Walk::Halted,
                    _ => None,
                }
            };
            match next {
                Some(inner) => value = inner,
                None => {
                    return Walk::Wait {
                        cell: handle.cell.clone(),
                        remaining: path[index..].to_vec(),
                    }
                }
            }
        }
        if index == path.len() {
            return Walk::Done(value);
        }
        value = value.member(&path[index]);
        index += 1;
    }
}

/// Resolve a `<hexid>[:segment...]` reference string against the registry.
/// Returns the mapped value when everything along the way is initialized, or
/// a placeholder after registering a deferred reference.
fn get_outlined_model(
    session: &Arc<SessionInner>,
    cx: &mut ParseCx,
    reference: &str,
    slot: Slot,
    mapper: Mapper,
) -> Result<Value, SharedWireError> {
    let mut parts = reference.split(':');
    let id = parse_hex_id(parts.next().unwrap_or(""))?;
    let path: Vec<String> = parts.map(str::to_owned).collect();

    let cell = SessionInner::chunk(session, id);
    chunk::ensure_initialized(&cell);

    enum Outcome {
        Ready(Value),
        Wait,
        Errored(SharedWireError),
        Halted,
    }
    let outcome = {
        let state = cell.state.lock();
        match &*state {
            ChunkState::Initialized { value, .. } => Outcome::Ready(value.clone()),
            ChunkState::Errored { error } => Outcome::Errored(error.clone()),
            ChunkState::Halted => Outcome::Halted,
            _ => Outcome::Wait,
        }
    };
    match outcome {
        Outcome::Ready(value) => match walk_path(value, &path, None) {
            Walk::Done(value) => Ok(apply_mapper(Some(session), mapper, value)),
            Walk::Wait { cell, remaining } => Ok(wait_for_reference(
                session, cx, &cell, slot, mapper, remaining,
            )),
            Walk::Failed(error) => {
                mark_errored(cx, error);
                Ok(Value::Pending)
            }
            Walk::Halted => Ok(never_resolves(cx)),
        },
        Outcome::Wait => Ok(wait_for_reference(session, cx, &cell, slot, mapper, path)),
        Outcome::Errored(error) => {
            mark_errored(cx, error);
            Ok(Value::Pending)
        }
        Outcome::Halted => Ok(never_resolves(cx)),
    }
}

/// Record a dependency failure on the parse scope. The enclosing chunk (or
/// node) will surface it once the parse completes.
fn mark_errored(cx: &mut ParseCx, error: SharedWireError) {
    let handler = match &cx.handler {
        Some(handler) => handler.clone(),
        None => {
            let handler = Handler::new(0);
            cx.handler = Some(handler.clone());
            handler
        }
    };
    let mut inner = handler.lock();
    if !inner.errored {
        inner.errored = true;
        inner.reason = Some(error);
    }
}

/// A dependency that will never arrive: count it so the owner stays blocked.
fn never_resolves(cx: &mut ParseCx) -> Value {
    match &cx.handler {
        Some(handler) => handler.lock().deps += 1,
        None => cx.handler = Some(Handler::new(1)),
    }
    Value::Pending
}

/// Park a deferred reference on `cell` and return the placeholder that holds
/// its slot until the write-back happens.
fn wait_for_reference(
    session: &Arc<SessionInner>,
    cx: &mut ParseCx,
    cell: &Arc<ChunkCell>,
    slot: Slot,
    mapper: Mapper,
    path: Vec<String>,
) -> Value {
    let handler = match &cx.handler {
        Some(handler) => {
            handler.lock().deps += 1;
            handler.clone()
        }
        None => {
            let handler = Handler::new(1);
            cx.handler = Some(handler.clone());
            handler
        }
    };
    let reference = Arc::new(Reference {
        session: Arc::downgrade(session),
        handler,
        slot,
        mapper,
        path: Mutex::new(path),
    });
    chunk::push_listener(cell, Listener::Reference(reference));
    Value::Pending
}

/// Complete a deferred reference with the value its chunk settled to.
pub(crate) fn fulfill_reference(reference: &Arc<Reference>, value: Value) {
    let mut path = reference.path.lock().clone();
    let mut current = value;
    let value = loop {
        match walk_path(current, &path, Some(&reference.handler)) {
            Walk::Done(value) => break value,
            Walk::Wait { cell, remaining } => {
                // A blocked inner hop may be waiting, through a chain of
                // handlers, on this very reference; resolve against the
                // partial on that cycle rather than parking on it.
                let blocked = matches!(&*cell.state.lock(), ChunkState::Blocked { .. });
                if blocked {
                    if let Some(partial) = resolve_blocked_cycle(&cell, reference) {
                        current = partial;
                        path = remaining;
                        continue;
                    }
                }
                // Still pending for real; move the reference there.
                *reference.path.lock() = remaining;
                chunk::push_listener(&cell, Listener::Reference(reference.clone()));
                return;
            }
            Walk::Failed(error) => return reject_reference(reference, error),
            Walk::Halted => return,
        }
    };

    let session = reference.session.upgrade();
    let mapped = apply_mapper(session.as_ref(), reference.mapper, value);

    match &reference.slot {
        Slot::Root => {
            let mut inner = reference.handler.lock();
            if matches!(inner.value, None | Some(Value::Pending)) {
                inner.value = Some(mapped);
            }
        }
        Slot::ListIndex(list, index) => list.set(*index, mapped),
        Slot::Entry(object, key) => object.set(key, mapped),
    }

    let completion = {
        let mut inner = reference.handler.lock();
        inner.deps = inner.deps.saturating_sub(1);
        if inner.deps == 0 && !inner.errored {
            inner
                .chunk
                .take()
                .map(|cell| (cell, inner.value.clone().unwrap_or(Value::Null)))
        } else {
            None
        }
    };
    if let Some((cell, value)) = completion {
        let listeners = {
            let mut state = cell.state.lock();
            match &mut *state {
                ChunkState::Blocked { listeners } => {
                    let listeners = std::mem::take(listeners);
                    *state = ChunkState::Initialized {
                        value: value.clone(),
                        controller: None,
                    };
                    listeners
                }
                _ => return,
            }
        };
        chunk::wake_listeners(listeners, &value);
    }
}

/// Fail a deferred reference: the whole handler scope becomes errored, and
/// its chunk (if it stayed blocked) errors with the same shared instance.
pub(crate) fn reject_reference(reference: &Arc<Reference>, error: SharedWireError) {
    let cell = {
        let mut inner = reference.handler.lock();
        if inner.errored {
            return;
        }
        inner.errored = true;
        inner.reason = Some(error.clone());
        inner.chunk.take()
    };
    if let Some(cell) = cell {
        chunk::settle_error(&cell, error);
    }
}

/// Search for a dependency cycle: starting from the chunk this reference's
/// own handler is building, follow the chain of parked references until one
/// belongs to a handler building `resolved` itself. That handler's partial
/// value is what `resolved` will initialize to, so the reference resolves
/// against it instead of deadlocking.
pub(crate) fn resolve_blocked_cycle(
    resolved: &Arc<ChunkCell>,
    reference: &Arc<Reference>,
) -> Option<Value> {
    let start = reference.handler.lock().chunk.clone()?;
    let mut visited: Vec<usize> = Vec::new();
    search_cycle(&start, resolved, &mut visited)
        .map(|handler| handler.lock().value.clone().unwrap_or(Value::Null))
}

fn search_cycle(
    from: &Arc<ChunkCell>,
    target: &Arc<ChunkCell>,
    visited: &mut Vec<usize>,
) -> Option<Arc<Handler>> {
    let token = Arc::as_ptr(from) as usize;
    if visited.contains(&token) {
        return None;
    }
    visited.push(token);

    let candidates: Vec<(Arc<Handler>, Option<Arc<ChunkCell>>)> = {
        let state = from.state.lock();
        match &*state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => listeners
                .iter()
                .filter_map(|listener| match listener {
                    Listener::Reference(r) => {
                        let cell = r.handler.lock().chunk.clone();
                        Some((r.handler.clone(), cell))
                    }
                    Listener::Notify(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    };
    for (handler, cell) in candidates {
        let Some(cell) = cell else { continue };
        if Arc::ptr_eq(&cell, target) {
            return Some(handler);
        }
        if let Some(found) = search_cycle(&cell, target, visited) {
            return Some(found);
        }
    }
    None
}

fn apply_mapper(session: Option<&Arc<SessionInner>>, mapper: Mapper, value: Value) -> Value {
    match mapper {
        Mapper::Model | Mapper::Iterator => value,
        Mapper::Map => Value::Map(PairsCell::new(entry_pairs(&value))),
        Mapper::FormData => Value::Form(PairsCell::new(entry_pairs(&value))),
        Mapper::Set => match value {
            Value::List(list) => Value::Set(list),
            other => Value::Set(ListCell::new(vec![other])),
        },
        Mapper::Blob => {
            let items = match &value {
                Value::List(list) => list.snapshot(),
                _ => Vec::new(),
            };
            let media_type = match items.first() {
                Some(Value::String(t)) if !t.is_empty() => Some(t.clone()),
                _ => None,
            };
            let mut data = Vec::new();
            for item in items.iter().skip(1) {
                if let Value::Bytes(bytes) = item {
                    data.extend_from_slice(&bytes.data);
                }
            }
            Value::Blob(crate::value::BlobValue {
                media_type,
                data: data.into(),
            })
        }
        Mapper::Callable => {
            let (id, bound) = match &value {
                Value::Object(obj) => (obj.get("id"), obj.get("bound")),
                _ => (None, None),
            };
            let id = match id {
                Some(Value::String(s)) => s,
                Some(Value::Number(n)) => format!("{n}"),
                _ => String::new(),
            };
            let bound = bound.filter(|b| !matches!(b, Value::Null | Value::Undefined));
            let call = session.and_then(|s| s.options.call_remote.clone());
            Value::Callable(Callable::remote(id, bound, call))
        }
        Mapper::ErrorValue => Value::Error(error_from_model(&value)),
    }
}

fn entry_pairs(value: &Value) -> Vec<(Value, Value)> {
    match value {
        Value::List(list) => list
            .snapshot()
            .into_iter()
            .filter_map(|entry| match entry {
                Value::List(pair) => Some((
                    pair.get(0).unwrap_or(Value::Undefined),
                    pair.get(1).unwrap_or(Value::Undefined),
                )),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Rehydrate an error model (`{message, name?, digest?, env?}`) into the
/// shared error form.
pub(crate) fn error_from_model(value: &Value) -> SharedWireError {
    let field = |key: &str| match value {
        Value::Object(obj) => match obj.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    };
    let message = match value {
        Value::String(s) => s.clone(),
        _ => field("message").unwrap_or_else(|| "an error occurred on the remote side".to_owned()),
    };
    WireError::Remote {
        name: field("name").unwrap_or_else(|| "Error".to_owned()),
        message,
        digest: field("digest"),
        env: field("env"),
    }
    .shared()
}
