//! Reply encoding: turning a value graph back into wire parts
//!
//! The encoder walks a [`Value`] graph and produces a [`Reply`]: a list of
//! parts, each one row on the wire. Aggregates serialize inline with
//! identity-based deduplication (a revisited cell becomes a `$`-reference
//! back to where it first appeared, which is also how cycles terminate).
//! Asynchronous values (promises, lazy chunks, streams, iterables) reserve a
//! part id synchronously and flush their content as deferred parts when the
//! underlying source settles.
//!
//! `Reply::into_wire` renders the parts as rows this crate's own decoder
//! accepts, so a full round trip never leaves the library.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::decode::{ChunkHandle, TemporaryReferenceSet};
use crate::error::{EncodeError, SharedWireError, WireError};
use crate::value::{Callable, Value};
use crate::wire::{ElementKind, StreamKind};

/// Reply-side configuration.
#[derive(Default)]
pub struct EncodeOptions {
    /// Parks values that cannot cross the boundary (nodes, symbols, local
    /// callables) so the peer can reference them back.
    pub temporary_refs: Option<Arc<TemporaryReferenceSet>>,
}

/// One encoded part: a single row on the wire.
#[derive(Debug, Clone)]
pub struct Part {
    /// Row id
    pub id: u64,
    /// Row content
    pub body: PartBody,
}

/// The row a part renders to.
#[derive(Debug, Clone)]
pub enum PartBody {
    /// Untagged JSON model row.
    Model(String),
    /// Typed binary row.
    Binary {
        /// Element kind tag
        kind: ElementKind,
        /// Raw bytes
        bytes: Arc<[u8]>,
    },
    /// Stream start row (`R`/`r`/`X`/`x`).
    StreamStart {
        /// Stream flavor
        kind: StreamKind,
    },
    /// Stream close row (`C`), optionally with a final model.
    StreamClose(Option<String>),
    /// Error row (`E`) carrying an error model.
    Error(String),
}

/// A fully flushed reply.
#[derive(Debug)]
pub struct Reply {
    parts: Vec<Part>,
}

impl Reply {
    /// The parts, in flush order. Part 0 is the root model.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Render as wire rows.
    pub fn into_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            match &part.body {
                PartBody::Model(model) => {
                    out.extend_from_slice(format!("{:x}:{}\n", part.id, model).as_bytes());
                }
                PartBody::Binary { kind, bytes } => {
                    out.extend_from_slice(
                        format!("{:x}:{}{:x},", part.id, kind.tag() as char, bytes.len())
                            .as_bytes(),
                    );
                    out.extend_from_slice(bytes);
                }
                PartBody::StreamStart { kind } => {
                    out.extend_from_slice(
                        format!("{:x}:{}\n", part.id, kind.tag() as char).as_bytes(),
                    );
                }
                PartBody::StreamClose(final_model) => {
                    out.extend_from_slice(
                        format!("{:x}:C{}\n", part.id, final_model.as_deref().unwrap_or(""))
                            .as_bytes(),
                    );
                }
                PartBody::Error(model) => {
                    out.extend_from_slice(format!("{:x}:E{}\n", part.id, model).as_bytes());
                }
            }
        }
        out
    }
}

type Job = BoxFuture<'static, Result<(), EncodeError>>;

struct State {
    options: EncodeOptions,
    next_id: u64,
    parts: Vec<Part>,
    /// Identity token of every aggregate already serialized, mapped to the
    /// reference string a second occurrence should emit.
    written: HashMap<usize, String>,
    jobs: Vec<Job>,
    aborted: Option<SharedWireError>,
}

/// An encode in flight: the root model is already serialized, deferred parts
/// are still flushing.
pub struct PendingReply {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

/// Cancels the deferred parts of a [`PendingReply`].
#[derive(Clone)]
pub struct ReplyAborter {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl ReplyAborter {
    /// Abort: every part still in flight flushes as an error row carrying
    /// this reason, and [`PendingReply::finish`] returns promptly.
    pub fn abort(&self, reason: WireError) {
        {
            let mut state = self.state.lock();
            if state.aborted.is_some() {
                return;
            }
            state.aborted = Some(reason.shared());
        }
        self.notify.notify_waiters();
    }
}

/// Encode a value graph and wait for every deferred part to flush.
pub async fn encode(value: &Value, options: EncodeOptions) -> Result<Reply, EncodeError> {
    PendingReply::new(value, options)?.finish().await
}

impl PendingReply {
    /// Serialize the root model. Deferred sources reserve their part ids
    /// here; their content flushes during [`PendingReply::finish`].
    pub fn new(value: &Value, options: EncodeOptions) -> Result<PendingReply, EncodeError> {
        let state = Arc::new(Mutex::new(State {
            options,
            next_id: 1,
            parts: vec![Part {
                id: 0,
                body: PartBody::Model(String::new()),
            }],
            written: HashMap::new(),
            jobs: Vec::new(),
            aborted: None,
        }));
        let notify = Arc::new(Notify::new());
        let root = serialize(&state, &notify, value, "$0")?;
        state.lock().parts[0].body = PartBody::Model(root.to_string());
        Ok(PendingReply { state, notify })
    }

    /// Handle for aborting the deferred parts.
    pub fn aborter(&self) -> ReplyAborter {
        ReplyAborter {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Drive every deferred part to completion.
    pub async fn finish(self) -> Result<Reply, EncodeError> {
        let mut active: FuturesUnordered<Job> = FuturesUnordered::new();
        loop {
            {
                let mut state = self.state.lock();
                for job in state.jobs.drain(..) {
                    active.push(job);
                }
            }
            if active.is_empty() {
                break;
            }
            if let Some(result) = active.next().await {
                result?;
            }
        }
        let parts = std::mem::take(&mut self.state.lock().parts);
        Ok(Reply { parts })
    }
}

fn alloc(state: &Arc<Mutex<State>>) -> u64 {
    let mut st = state.lock();
    let id = st.next_id;
    st.next_id += 1;
    id
}

fn push_part(state: &Arc<Mutex<State>>, id: u64, body: PartBody) {
    state.lock().parts.push(Part { id, body });
}

fn spawn_job(state: &Arc<Mutex<State>>, job: Job) {
    state.lock().jobs.push(job);
}

/// Render an error into the model the `E` row carries.
fn error_model(error: &WireError) -> String {
    let json = match error {
        WireError::Remote {
            name,
            message,
            digest,
            env,
        } => serde_json::json!({
            "name": name,
            "message": message,
            "digest": digest,
            "env": env,
        }),
        other => serde_json::json!({
            "name": "Error",
            "message": other.to_string(),
        }),
    };
    json.to_string()
}

/// Race a future against the reply being aborted.
async fn abortable<T>(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, SharedWireError> {
    let notified = notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if let Some(reason) = state.lock().aborted.clone() {
        return Err(reason);
    }
    tokio::pin!(fut);
    tokio::select! {
        _ = &mut notified => {
            let reason = state.lock().aborted.clone();
            Err(reason.unwrap_or_else(|| WireError::ConnectionClosed.shared()))
        }
        out = &mut fut => Ok(out),
    }
}

/// Serialize one value. `my_ref` is the reference string another occurrence
/// of this exact cell would emit; an empty string marks a position that is
/// not addressable (aggregates there get outlined instead).
fn serialize(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    value: &Value,
    my_ref: &str,
) -> Result<serde_json::Value, EncodeError> {
    if let Some(ptr) = value.ptr_token() {
        if let Some(existing) = state.lock().written.get(&ptr) {
            return Ok(serde_json::Value::String(existing.clone()));
        }
    }
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Undefined => Ok(sentinel("$undefined")),
        Value::Omitted => Ok(sentinel("$Y")),
        Value::Pending => Err(EncodeError::PendingPlaceholder),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => Ok(serialize_number(*n)),
        Value::BigInt(digits) => Ok(sentinel(&format!("$n{digits}"))),
        Value::String(s) => {
            if s.starts_with('$') {
                // Escape: a literal leading dollar doubles.
                Ok(serde_json::Value::String(format!("${s}")))
            } else {
                Ok(serde_json::Value::String(s.clone()))
            }
        }
        Value::Symbol(_) => park_or(state, value, EncodeError::SymbolWithoutTemporaryRefs),
        Value::Date(date) => Ok(sentinel(&format!(
            "$D{}",
            date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        ))),
        Value::Bytes(bytes) => {
            let id = alloc(state);
            let reference = format!("${id:x}");
            state
                .lock()
                .written
                .insert(value.ptr_token().unwrap_or_default(), reference.clone());
            push_part(
                state,
                id,
                PartBody::Binary {
                    kind: bytes.kind,
                    bytes: bytes.data.clone(),
                },
            );
            Ok(serde_json::Value::String(reference))
        }
        Value::Blob(blob) => {
            let data_id = alloc(state);
            push_part(
                state,
                data_id,
                PartBody::Binary {
                    kind: ElementKind::U8,
                    bytes: blob.data.clone(),
                },
            );
            let model = serde_json::json!([
                blob.media_type.clone().unwrap_or_default(),
                format!("${data_id:x}"),
            ]);
            let id = alloc(state);
            let reference = format!("$B{id:x}");
            state
                .lock()
                .written
                .insert(value.ptr_token().unwrap_or_default(), reference.clone());
            push_part(state, id, PartBody::Model(model.to_string()));
            Ok(serde_json::Value::String(reference))
        }
        Value::List(list) => {
            remember(state, value, my_ref);
            let items = list.snapshot();
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let child_ref = child_reference(my_ref, &index.to_string());
                out.push(serialize(state, notify, item, &child_ref)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Object(object) => {
            remember(state, value, my_ref);
            let mut out = serde_json::Map::new();
            for (key, item) in object.snapshot() {
                let child_ref = child_reference(my_ref, &key);
                out.insert(key, serialize(state, notify, &item, &child_ref)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Map(pairs) => outline_pairs(state, notify, value, pairs.snapshot(), 'Q'),
        Value::Form(pairs) => outline_pairs(state, notify, value, pairs.snapshot(), 'K'),
        Value::Set(items) => {
            let id = alloc(state);
            let reference = format!("$W{id:x}");
            remember_as(state, value, &reference);
            let base = format!("${id:x}");
            let mut out = Vec::new();
            for (index, item) in items.snapshot().iter().enumerate() {
                let child_ref = child_reference(&base, &index.to_string());
                out.push(serialize(state, notify, item, &child_ref)?);
            }
            push_part(state, id, PartBody::Model(serde_json::Value::Array(out).to_string()));
            Ok(serde_json::Value::String(reference))
        }
        Value::Node(_) => park_or(state, value, EncodeError::NodeWithoutTemporaryRefs),
        Value::Error(error) => {
            let id = alloc(state);
            let reference = format!("$Z{id:x}");
            remember_as(state, value, &reference);
            push_part(state, id, PartBody::Model(error_model(error)));
            Ok(serde_json::Value::String(reference))
        }
        Value::Callable(callable) => serialize_callable(state, notify, value, callable),
        Value::Lazy(handle) => match handle.try_value() {
            Some(Ok(inner)) => serialize(state, notify, &inner, my_ref),
            Some(Err(error)) => Err(EncodeError::Deferred(error)),
            None => {
                let id = alloc(state);
                let reference = format!("$L{id:x}");
                remember_as(state, value, &reference);
                spawn_settle_job(state, notify, handle.clone(), id);
                Ok(serde_json::Value::String(reference))
            }
        },
        Value::Promise(handle) => {
            let id = alloc(state);
            let reference = format!("$@{id:x}");
            remember_as(state, value, &reference);
            spawn_settle_job(state, notify, handle.clone(), id);
            Ok(serde_json::Value::String(reference))
        }
        Value::Stream(stream) => {
            let id = alloc(state);
            let reference = format!("${id:x}");
            remember_as(state, value, &reference);
            let kind = stream.kind();
            push_part(state, id, PartBody::StreamStart { kind });
            let state2 = state.clone();
            let notify2 = notify.clone();
            let stream = stream.clone();
            spawn_job(
                state,
                Box::pin(async move {
                    loop {
                        let item = match abortable(&state2, &notify2, stream.next()).await {
                            Ok(item) => item,
                            Err(reason) => {
                                push_part(&state2, id, PartBody::Error(error_model(&reason)));
                                return Ok(());
                            }
                        };
                        match item {
                            None => {
                                push_part(&state2, id, PartBody::StreamClose(None));
                                return Ok(());
                            }
                            Some(Err(error)) => {
                                push_part(&state2, id, PartBody::Error(error_model(&error)));
                                return Ok(());
                            }
                            Some(Ok(Value::Bytes(bytes))) if kind == StreamKind::Bytes => {
                                push_part(
                                    &state2,
                                    id,
                                    PartBody::Binary {
                                        kind: bytes.kind,
                                        bytes: bytes.data,
                                    },
                                );
                            }
                            Some(Ok(item)) => {
                                let model = entry_model(&state2, &notify2, &item)?;
                                push_part(&state2, id, PartBody::Model(model));
                            }
                        }
                    }
                }),
            );
            Ok(serde_json::Value::String(reference))
        }
        Value::AsyncIter(iter) => {
            let id = alloc(state);
            let reference = format!("${id:x}");
            remember_as(state, value, &reference);
            let kind = if iter.is_single_shot() {
                StreamKind::SingleShot
            } else {
                StreamKind::MultiShot
            };
            push_part(state, id, PartBody::StreamStart { kind });
            let state2 = state.clone();
            let notify2 = notify.clone();
            let mut reader = iter.iterate();
            spawn_job(
                state,
                Box::pin(async move {
                    loop {
                        let item = match abortable(&state2, &notify2, reader.next()).await {
                            Ok(item) => item,
                            Err(reason) => {
                                push_part(&state2, id, PartBody::Error(error_model(&reason)));
                                return Ok(());
                            }
                        };
                        match item {
                            None => {
                                push_part(&state2, id, PartBody::StreamClose(None));
                                return Ok(());
                            }
                            Some(Err(error)) => {
                                push_part(&state2, id, PartBody::Error(error_model(&error)));
                                return Ok(());
                            }
                            Some(Ok(item)) => {
                                let model = entry_model(&state2, &notify2, &item)?;
                                push_part(&state2, id, PartBody::Model(model));
                            }
                        }
                    }
                }),
            );
            Ok(serde_json::Value::String(reference))
        }
    }
}

fn sentinel(s: &str) -> serde_json::Value {
    serde_json::Value::String(s.to_owned())
}

fn serialize_number(n: f64) -> serde_json::Value {
    if n.is_nan() {
        return sentinel("$NaN");
    }
    if n == f64::INFINITY {
        return sentinel("$Infinity");
    }
    if n == f64::NEG_INFINITY {
        return sentinel("$-Infinity");
    }
    if n == 0.0 && n.is_sign_negative() {
        return sentinel("$-0");
    }
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn child_reference(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        String::new()
    } else {
        format!("{parent}:{segment}")
    }
}

/// Record an inline aggregate's reference string, unless the position is not
/// addressable.
fn remember(state: &Arc<Mutex<State>>, value: &Value, my_ref: &str) {
    if my_ref.is_empty() {
        return;
    }
    if let Some(ptr) = value.ptr_token() {
        state.lock().written.insert(ptr, my_ref.to_owned());
    }
}

fn remember_as(state: &Arc<Mutex<State>>, value: &Value, reference: &str) {
    if let Some(ptr) = value.ptr_token() {
        state.lock().written.insert(ptr, reference.to_owned());
    }
}

/// Park a value in the temporary reference set, or fail with `error` when
/// none was provided.
fn park_or(
    state: &Arc<Mutex<State>>,
    value: &Value,
    error: EncodeError,
) -> Result<serde_json::Value, EncodeError> {
    let refs = match &state.lock().options.temporary_refs {
        Some(refs) => refs.clone(),
        None => return Err(error),
    };
    let key = refs.store(value.clone());
    let reference = format!("$T{key}");
    remember_as(state, value, &reference);
    Ok(serde_json::Value::String(reference))
}

fn outline_pairs(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    value: &Value,
    pairs: Vec<(Value, Value)>,
    tag: char,
) -> Result<serde_json::Value, EncodeError> {
    let id = alloc(state);
    let reference = format!("${tag}{id:x}");
    remember_as(state, value, &reference);
    let base = format!("${id:x}");
    let mut out = Vec::with_capacity(pairs.len());
    for (index, (k, v)) in pairs.iter().enumerate() {
        let entry_ref = child_reference(&base, &index.to_string());
        let key = serialize(state, notify, k, &child_reference(&entry_ref, "0"))?;
        let val = serialize(state, notify, v, &child_reference(&entry_ref, "1"))?;
        out.push(serde_json::Value::Array(vec![key, val]));
    }
    push_part(
        state,
        id,
        PartBody::Model(serde_json::Value::Array(out).to_string()),
    );
    Ok(serde_json::Value::String(reference))
}

fn serialize_callable(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    value: &Value,
    callable: &Callable,
) -> Result<serde_json::Value, EncodeError> {
    let Some(remote_id) = callable.remote_id() else {
        return park_or(state, value, EncodeError::LocalCallable);
    };
    let id = alloc(state);
    let reference = format!("$F{id:x}");
    remember_as(state, value, &reference);
    let base = format!("${id:x}");
    let bound = match callable.bound() {
        Some(bound) => serialize(state, notify, &bound, &child_reference(&base, "bound"))?,
        None => serde_json::Value::Null,
    };
    let model = serde_json::json!({ "id": remote_id, "bound": bound });
    push_part(state, id, PartBody::Model(model.to_string()));
    Ok(serde_json::Value::String(reference))
}

/// Job for a promise or unresolved lazy part: wait for it to settle, then
/// flush a model part (or an error row) under the reserved id.
fn spawn_settle_job(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    handle: ChunkHandle,
    id: u64,
) {
    let state2 = state.clone();
    let notify2 = notify.clone();
    spawn_job(
        state,
        Box::pin(async move {
            match abortable(&state2, &notify2, handle.value()).await {
                Ok(Ok(inner)) => {
                    let base = format!("${id:x}");
                    let model = serialize(&state2, &notify2, &inner, &base)?;
                    push_part(&state2, id, PartBody::Model(model.to_string()));
                }
                Ok(Err(error)) | Err(error) => {
                    push_part(&state2, id, PartBody::Error(error_model(&error)));
                }
            }
            Ok(())
        }),
    );
}

/// Serialize a stream or iterator entry. Entries have no id of their own, so
/// aggregates are outlined into a fresh part and referenced by id.
fn entry_model(
    state: &Arc<Mutex<State>>,
    notify: &Arc<Notify>,
    item: &Value,
) -> Result<String, EncodeError> {
    if item.ptr_token().is_some() {
        if let Some(existing) = item
            .ptr_token()
            .and_then(|ptr| state.lock().written.get(&ptr).cloned())
        {
            return Ok(serde_json::Value::String(existing).to_string());
        }
        let id = alloc(state);
        let base = format!("${id:x}");
        let model = serialize(state, notify, item, &base)?;
        push_part(state, id, PartBody::Model(model.to_string()));
        return Ok(serde_json::Value::String(base).to_string());
    }
    Ok(serialize(state, notify, item, "")?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeOptions, Decoder};
    use crate::value::ObjectCell;

    async fn roundtrip(value: &Value) -> Value {
        roundtrip_with(value, EncodeOptions::default(), DecodeOptions::default()).await
    }

    async fn roundtrip_with(
        value: &Value,
        encode_options: EncodeOptions,
        decode_options: DecodeOptions,
    ) -> Value {
        let reply = encode(value, encode_options).await.expect("encode");
        let mut decoder = Decoder::new(decode_options);
        decoder.feed_bytes(&reply.into_wire()).expect("feed");
        decoder.root().try_value().expect("root settled").expect("root ok")
    }

    #[tokio::test]
    async fn scalars_round_trip() {
        let value = Value::list(vec![
            Value::Null,
            Value::Undefined,
            Value::Bool(true),
            Value::Number(42.0),
            Value::Number(f64::NAN),
            Value::Number(-0.0),
            Value::BigInt("9007199254740993".into()),
            Value::from("plain"),
            Value::from("$needs-escaping"),
        ]);
        let back = roundtrip(&value).await;
        assert!(back.deep_eq(&value));
    }

    #[tokio::test]
    async fn shared_object_dedups_to_one_cell() {
        let shared = Value::object(vec![("n", Value::Number(1.0))]);
        let value = Value::list(vec![shared.clone(), shared.clone()]);
        let back = roundtrip(&value).await;
        let first = back.member("0");
        let second = back.member("1");
        assert_eq!(first.ptr_token(), second.ptr_token());
        assert_eq!(first.member("n"), Value::Number(1.0));
    }

    #[tokio::test]
    async fn self_cycle_round_trips() {
        let cell = ObjectCell::new(vec![]);
        cell.set("self", Value::Object(cell.clone()));
        let value = Value::Object(cell);

        let reply = encode(&value, EncodeOptions::default()).await.expect("encode");
        let root_model = match &reply.parts()[0].body {
            PartBody::Model(model) => model.clone(),
            other => panic!("root is not a model: {other:?}"),
        };
        assert_eq!(root_model, "{\"self\":\"$0\"}");

        let back = roundtrip(&value).await;
        assert_eq!(back.member("self").ptr_token(), back.ptr_token());
    }

    #[tokio::test]
    async fn promise_flushes_as_deferred_part() {
        let value = Value::object(vec![("x", Value::promise_ready(Value::Number(42.0)))]);

        let reply = encode(&value, EncodeOptions::default()).await.expect("encode");
        match &reply.parts()[0].body {
            PartBody::Model(model) => assert_eq!(model, "{\"x\":\"$@1\"}"),
            other => panic!("root is not a model: {other:?}"),
        }
        assert!(reply
            .parts()
            .iter()
            .any(|part| part.id == 1 && matches!(&part.body, PartBody::Model(m) if m == "42")));

        let back = roundtrip(&value).await;
        match back.member("x") {
            Value::Promise(handle) => {
                assert_eq!(handle.value().await.expect("ok"), Value::Number(42.0));
            }
            other => panic!("not a promise: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_promise_round_trips_as_error() {
        let value = Value::promise_err(
            WireError::Remote {
                name: "Boom".into(),
                message: "it broke".into(),
                digest: None,
                env: None,
            }
            .shared(),
        );
        let back = roundtrip(&value).await;
        match back {
            Value::Promise(handle) => {
                let error = handle.value().await.expect_err("must fail");
                assert!(error.to_string().contains("it broke"));
            }
            other => panic!("not a promise: {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_set_and_typed_arrays_round_trip() {
        let value = Value::object(vec![
            (
                "m",
                Value::map(vec![(Value::from("k"), Value::Number(1.0))]),
            ),
            ("s", Value::set(vec![Value::Number(1.0), Value::Number(2.0)])),
            ("b", Value::bytes(ElementKind::U32, vec![1, 0, 0, 0, 2, 0, 0, 0])),
        ]);
        let back = roundtrip(&value).await;
        assert!(back.deep_eq(&value));
    }

    #[tokio::test]
    async fn node_requires_temporary_refs() {
        let node = Value::node(Value::from("div"), None, Value::object(Vec::<(&str, Value)>::new()));
        let err = encode(&node, EncodeOptions::default()).await.expect_err("must fail");
        assert!(matches!(err, EncodeError::NodeWithoutTemporaryRefs));

        let refs = Arc::new(TemporaryReferenceSet::new());
        let back = roundtrip_with(
            &node,
            EncodeOptions {
                temporary_refs: Some(refs.clone()),
            },
            DecodeOptions {
                temporary_refs: Some(refs),
                ..Default::default()
            },
        )
        .await;
        // Same cell comes back through the reference set.
        assert_eq!(back.ptr_token(), node.ptr_token());
    }

    #[tokio::test]
    async fn remote_callable_round_trips() {
        let callable = Value::Callable(Callable::remote("mod#action", None, None));
        let back = roundtrip(&callable).await;
        match back {
            Value::Callable(callable) => assert_eq!(callable.remote_id(), Some("mod#action")),
            other => panic!("not callable: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_round_trips_in_order() {
        let (sender, handle) = crate::decode::StreamHandle::channel(StreamKind::Values);
        sender.send(Value::Number(1.0));
        sender.send(Value::from("two"));
        sender.send(Value::object(vec![("three", Value::Number(3.0))]));
        sender.close();

        let back = roundtrip(&Value::Stream(handle)).await;
        match back {
            Value::Stream(stream) => {
                let items = stream.collect().await.expect("ok");
                assert_eq!(items.len(), 3);
                assert_eq!(items[0], Value::Number(1.0));
                assert_eq!(items[1], Value::from("two"));
                assert_eq!(items[2].member("three"), Value::Number(3.0));
            }
            other => panic!("not a stream: {other:?}"),
        }
    }

    #[tokio::test]
    async fn iterable_round_trips() {
        let (sender, handle) = crate::decode::IterHandle::channel(false);
        sender.send(Value::Number(10.0));
        sender.send(Value::Number(20.0));
        sender.close(None);

        let back = roundtrip(&Value::AsyncIter(handle)).await;
        match back {
            Value::AsyncIter(iter) => {
                let mut reader = iter.iterate();
                assert_eq!(reader.next().await.unwrap().unwrap(), Value::Number(10.0));
                assert_eq!(reader.next().await.unwrap().unwrap(), Value::Number(20.0));
                assert!(reader.next().await.is_none());
            }
            other => panic!("not an iterable: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_flushes_error_parts() {
        let (_sender, handle) = crate::decode::StreamHandle::channel(StreamKind::Values);
        let pending =
            PendingReply::new(&Value::Stream(handle), EncodeOptions::default()).expect("encode");
        let aborter = pending.aborter();
        aborter.abort(WireError::Postponed("gave up".into()));
        let reply = pending.finish().await.expect("finish");
        assert!(reply
            .parts()
            .iter()
            .any(|part| matches!(&part.body, PartBody::Error(model) if model.contains("gave up"))));
    }

    #[tokio::test]
    async fn pending_placeholder_is_rejected() {
        let err = encode(&Value::Pending, EncodeOptions::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, EncodeError::PendingPlaceholder));
    }
}
