//! Incremental decode: sessions, row dispatch, and the chunk registry
//!
//! A [`Decoder`] owns one session. Transport fragments go in through
//! [`Decoder::feed_bytes`] or [`Decoder::feed_text`]; each completed row is
//! dispatched by tag into the registry. Rows arrive in any order relative to
//! the references that name them, so reading a chunk that has not arrived
//! yet parks a listener instead of failing.

pub mod chunk;
pub(crate) mod resolver;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub use chunk::{ChunkHandle, ChunkRead, PromiseResolver};
pub use stream::{IterHandle, IterReader, IterSender, StreamHandle, StreamSender};

use crate::error::{ProtocolError, SharedWireError, WireError};
use crate::value::{RemoteCallFn, Value};
use crate::wire::{BinaryRowFramer, Row, RowTag, StreamKind, TextRowFramer};

/// Loader invoked for module reference rows (`I`). Maps the descriptor model
/// to whatever the host considers a loaded module value.
pub type LoadModuleFn = Box<dyn Fn(Value) -> Result<Value, WireError> + Send + Sync>;

/// Callback for hint rows (`H`): the one-character hint code plus its model.
pub type HintFn = Box<dyn Fn(char, Value) + Send + Sync>;

/// Callback for debug and io-info rows (`D`, `J`).
pub type DebugFn = Box<dyn Fn(Value) + Send + Sync>;

/// Values parked across the boundary and referenced back by key (`$T`).
/// Shared between a reply encoder (which stores) and the decoder of the
/// response to that reply (which reads).
#[derive(Default)]
pub struct TemporaryReferenceSet {
    entries: Mutex<HashMap<String, Value>>,
}

impl TemporaryReferenceSet {
    /// An empty set.
    pub fn new() -> TemporaryReferenceSet {
        TemporaryReferenceSet::default()
    }

    /// Park a value, returning the key it can be referenced back by.
    pub fn store(&self, value: Value) -> String {
        let mut entries = self.entries.lock();
        let key = entries.len().to_string();
        entries.insert(key.clone(), value);
        key
    }

    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }
}

/// Session configuration. Everything is optional; a default decoder reads
/// plain value graphs and errors only when a feature it was not given is
/// actually exercised.
#[derive(Default)]
pub struct DecodeOptions {
    /// Invokes remote callables (`$F`) back across the boundary.
    pub call_remote: Option<RemoteCallFn>,
    /// Maps module descriptors (`I` rows) to loaded values.
    pub load_module: Option<LoadModuleFn>,
    /// Resolves `$T` references from a previous reply.
    pub temporary_refs: Option<Arc<TemporaryReferenceSet>>,
    /// Receives hint rows.
    pub on_hint: Option<HintFn>,
    /// Receives debug and io-info rows.
    pub on_debug: Option<DebugFn>,
}

pub(crate) struct SessionInner {
    pub(crate) options: DecodeOptions,
    chunks: Mutex<HashMap<u64, Arc<chunk::ChunkCell>>>,
    closed: Mutex<Option<SharedWireError>>,
    time_origin: Mutex<f64>,
}

impl SessionInner {
    /// Look up or create the cell for a row id. Ids created after close are
    /// born errored so late readers fail instead of hanging.
    pub(crate) fn chunk(this: &Arc<SessionInner>, id: u64) -> Arc<chunk::ChunkCell> {
        let mut chunks = this.chunks.lock();
        chunks
            .entry(id)
            .or_insert_with(|| {
                if let Some(error) = this.closed.lock().clone() {
                    chunk::ChunkCell::errored(Arc::downgrade(this), id, error)
                } else {
                    chunk::ChunkCell::pending(Arc::downgrade(this), id)
                }
            })
            .clone()
    }
}

/// One decode session over an inbound row stream.
pub struct Decoder {
    session: Arc<SessionInner>,
    binary: BinaryRowFramer,
    text: TextRowFramer,
}

impl Decoder {
    /// Start a session.
    pub fn new(options: DecodeOptions) -> Decoder {
        Decoder {
            session: Arc::new(SessionInner {
                options,
                chunks: Mutex::new(HashMap::new()),
                closed: Mutex::new(None),
                time_origin: Mutex::new(0.0),
            }),
            binary: BinaryRowFramer::new(),
            text: TextRowFramer::new(),
        }
    }

    /// Feed a raw transport fragment. Fragment boundaries are arbitrary.
    pub fn feed_bytes(&mut self, fragment: &[u8]) -> Result<(), ProtocolError> {
        let rows = self.binary.feed(fragment)?;
        for row in rows {
            self.dispatch(row)?;
        }
        Ok(())
    }

    /// Feed a pre-decoded text fragment. Row content must arrive whole.
    pub fn feed_text(&mut self, fragment: &str) -> Result<(), ProtocolError> {
        let rows = self.text.feed(fragment)?;
        for row in rows {
            self.dispatch(row)?;
        }
        Ok(())
    }

    /// The root chunk (row id 0), where the top-level value lands.
    pub fn root(&self) -> ChunkHandle {
        self.handle(0)
    }

    /// Handle to an arbitrary chunk id.
    pub fn handle(&self, id: u64) -> ChunkHandle {
        ChunkHandle {
            cell: SessionInner::chunk(&self.session, id),
        }
    }

    /// The peer's reported time origin in milliseconds, from the `N` row.
    pub fn time_origin(&self) -> f64 {
        *self.session.time_origin.lock()
    }

    /// The transport ended. Every chunk still pending fails with one shared
    /// connection-closed error; chunks with data already buffered survive.
    pub fn close(&self) {
        self.sweep(WireError::ConnectionClosed.shared());
    }

    /// The transport failed. Like [`Decoder::close`] but with the caller's
    /// error on every pending chunk.
    pub fn abort(&self, error: WireError) {
        self.sweep(error.shared());
    }

    fn sweep(&self, error: SharedWireError) {
        {
            let mut closed = self.session.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(error.clone());
        }
        tracing::debug!(%error, "sweeping pending chunks");
        let cells: Vec<_> = self.session.chunks.lock().values().cloned().collect();
        for cell in cells {
            let unsettled = matches!(
                &*cell.state.lock(),
                chunk::ChunkState::Pending { .. } | chunk::ChunkState::Blocked { .. }
            );
            if unsettled {
                chunk::settle_error(&cell, error.clone());
            }
        }
    }

    fn dispatch(&mut self, row: Row) -> Result<(), ProtocolError> {
        let cell = SessionInner::chunk(&self.session, row.id);
        match RowTag::classify(row.tag) {
            RowTag::Model => {
                if row.payload.is_empty() {
                    chunk::resolve_halt(&cell);
                    return Ok(());
                }
                let text = row.payload.as_text()?.into_owned();
                chunk::resolve_model_chunk(&cell, text);
            }
            RowTag::Module => {
                let text = row.payload.as_text()?;
                let mut cx = resolver::ParseCx::new();
                match resolver::parse_model(&self.session, &text, &mut cx) {
                    Ok(descriptor) => chunk::resolve_module_chunk(&cell, descriptor),
                    Err(error) => chunk::trigger_error_on_chunk(&cell, error),
                }
            }
            RowTag::Hint => {
                let text = row.payload.as_text()?;
                let Some(code) = text.chars().next() else {
                    return Ok(());
                };
                if let Some(on_hint) = &self.session.options.on_hint {
                    let mut cx = resolver::ParseCx::new();
                    match resolver::parse_model(&self.session, &text[code.len_utf8()..], &mut cx) {
                        Ok(model) => on_hint(code, model),
                        Err(error) => tracing::warn!(%error, "unparseable hint row dropped"),
                    }
                }
            }
            RowTag::ErrorModel => {
                let text = row.payload.as_text()?;
                let mut cx = resolver::ParseCx::new();
                let error = match resolver::parse_model(&self.session, &text, &mut cx) {
                    Ok(model) => resolver::error_from_model(&model),
                    Err(error) => error,
                };
                chunk::trigger_error_on_chunk(&cell, error);
            }
            RowTag::Text => {
                let text = row.payload.as_text()?.into_owned();
                chunk::resolve_value_chunk(&cell, Value::String(text));
            }
            RowTag::Debug | RowTag::IoInfo => {
                if let Some(on_debug) = &self.session.options.on_debug {
                    let text = row.payload.as_text()?;
                    let mut cx = resolver::ParseCx::new();
                    match resolver::parse_model(&self.session, &text, &mut cx) {
                        Ok(model) => on_debug(model),
                        Err(error) => tracing::warn!(%error, "unparseable debug row dropped"),
                    }
                }
            }
            RowTag::Console => {
                let text = row.payload.as_text()?;
                tracing::debug!(target: "filament::console", entry = %text, "console replay row");
            }
            RowTag::TimeOrigin => {
                let text = row.payload.as_text()?;
                *self.session.time_origin.lock() = text.trim().parse().unwrap_or(0.0);
            }
            RowTag::Postpone => {
                let text = row.payload.as_text()?;
                let reason = postpone_reason(&text);
                chunk::trigger_error_on_chunk(&cell, WireError::Postponed(reason).shared());
            }
            RowTag::StreamClose => {
                let text = row.payload.as_text()?.into_owned();
                let controller = {
                    let state = cell.state.lock();
                    match &*state {
                        chunk::ChunkState::Initialized {
                            controller: Some(controller),
                            ..
                        } => Some(controller.clone()),
                        _ => None,
                    }
                };
                match controller {
                    Some(controller) => {
                        controller.close(if text.is_empty() { None } else { Some(text) })
                    }
                    None => tracing::warn!(id = row.id, "close row for a non-stream chunk"),
                }
            }
            RowTag::StreamStart(kind) => {
                let (value, controller) = match kind {
                    StreamKind::Values | StreamKind::Bytes => {
                        stream::start_readable(&self.session, kind)
                    }
                    StreamKind::MultiShot => stream::start_iterable(&self.session, false),
                    StreamKind::SingleShot => stream::start_iterable(&self.session, true),
                };
                chunk::resolve_stream_chunk(&cell, value, controller);
            }
            RowTag::Binary(kind) => {
                let bytes = row.payload.into_bytes();
                let width = kind.width();
                if width > 1 && bytes.len() % width != 0 {
                    return Err(ProtocolError::ElementWidth {
                        len: bytes.len(),
                        width,
                    });
                }
                chunk::resolve_value_chunk(&cell, Value::bytes(kind, bytes));
            }
        }
        Ok(())
    }
}

/// Pull the human-readable reason out of a postpone payload, which is either
/// a JSON string or an object with a `reason` field.
fn postpone_reason(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::String(reason)) => reason,
        Ok(serde_json::Value::Object(map)) => map
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ElementKind;

    fn decode(wire: &str) -> Decoder {
        let mut decoder = Decoder::new(DecodeOptions::default());
        decoder.feed_bytes(wire.as_bytes()).expect("feed");
        decoder
    }

    fn read(decoder: &Decoder) -> Value {
        match decoder.root().read() {
            ChunkRead::Ready(value) => value,
            other => panic!("root not ready: {other:?}"),
        }
    }

    #[test]
    fn plain_model_row() {
        let decoder = decode("0:{\"a\":1,\"b\":\"two\"}\n");
        let root = read(&decoder);
        assert_eq!(root.member("a"), Value::Number(1.0));
        assert_eq!(root.member("b"), Value::from("two"));
    }

    #[test]
    fn forward_reference_resolves_when_row_arrives() {
        let mut decoder = decode("0:{\"a\":\"$1\",\"b\":2}\n");
        // Chunk 1 has not arrived; the root stays blocked on it.
        assert!(decoder.root().try_value().is_none());
        decoder.feed_bytes(b"1:\"hello\"\n").expect("feed");
        let root = read(&decoder);
        assert_eq!(root.member("a"), Value::from("hello"));
        assert_eq!(root.member("b"), Value::Number(2.0));
    }

    #[test]
    fn out_of_order_rows() {
        let mut decoder = decode("1:\"hello\"\n");
        decoder.feed_bytes(b"0:{\"a\":\"$1\"}\n").expect("feed");
        assert_eq!(read(&decoder).member("a"), Value::from("hello"));
    }

    #[test]
    fn self_referential_model() {
        let decoder = decode("0:{\"self\":\"$0\",\"n\":1}\n");
        let root = read(&decoder);
        let inner = root.member("self");
        assert_eq!(inner.member("n"), Value::Number(1.0));
        assert_eq!(root.ptr_token(), inner.ptr_token());
    }

    #[test]
    fn mutual_reference_cycle() {
        let mut decoder = decode("1:{\"b\":\"$0\"}\n");
        decoder.feed_bytes(b"0:{\"a\":\"$1\"}\n").expect("feed");
        let root = read(&decoder);
        let a = root.member("a");
        assert_eq!(a.member("b").ptr_token(), root.ptr_token());
    }

    #[tokio::test]
    async fn mutual_reference_cycle_with_waiting_reader() {
        // The reader attaches before any row arrives, so both chunks take
        // the eager-initialization path and the cycle has to resolve
        // through the parked reference chain.
        let mut decoder = Decoder::new(DecodeOptions::default());
        let root = decoder.root();
        let waiter = tokio::spawn(async move { root.value().await });
        tokio::task::yield_now().await;
        decoder.feed_bytes(b"0:{\"a\":\"$1\"}\n").expect("feed");
        decoder.feed_bytes(b"1:{\"b\":\"$0\"}\n").expect("feed");
        let root = waiter.await.expect("join").expect("resolved");
        let a = root.member("a");
        assert_eq!(a.member("b").ptr_token(), root.ptr_token());
    }

    #[test]
    fn buffered_rows_survive_decoder_drop() {
        let mut decoder = decode("0:{\"a\":\"$1\",\"n\":7}\n");
        decoder.feed_bytes(b"1:\"kept\"\n").expect("feed");
        let root = decoder.root();
        drop(decoder);
        // Both payloads arrived in full; reading through a retained handle
        // still parses them.
        let value = match root.read() {
            ChunkRead::Ready(value) => value,
            other => panic!("root not ready: {other:?}"),
        };
        assert_eq!(value.member("a"), Value::from("kept"));
        assert_eq!(value.member("n"), Value::Number(7.0));
    }

    #[test]
    fn sentinel_scalars() {
        let decoder = decode(
            "0:[\"$undefined\",\"$Infinity\",\"$-Infinity\",\"$NaN\",\"$-0\",\"$n123456789012345678901\",\"$$money\"]\n",
        );
        let root = read(&decoder);
        assert_eq!(root.member("0"), Value::Undefined);
        assert_eq!(root.member("1"), Value::Number(f64::INFINITY));
        assert_eq!(root.member("2"), Value::Number(f64::NEG_INFINITY));
        assert!(root.member("3").deep_eq(&Value::Number(f64::NAN)));
        assert!(root.member("4").deep_eq(&Value::Number(-0.0)));
        assert_eq!(
            root.member("5"),
            Value::BigInt("123456789012345678901".into())
        );
        assert_eq!(root.member("6"), Value::from("$money"));
    }

    #[test]
    fn outlined_map_and_set() {
        let mut decoder = decode("1:[[\"k\",1],[2,\"v\"]]\n2:[1,2,3]\n");
        decoder
            .feed_bytes(b"0:{\"m\":\"$Q1\",\"s\":\"$W2\"}\n")
            .expect("feed");
        let root = read(&decoder);
        match root.member("m") {
            Value::Map(pairs) => {
                let pairs = pairs.snapshot();
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].0, Value::from("k"));
                assert_eq!(pairs[1].1, Value::from("v"));
            }
            other => panic!("not a map: {other:?}"),
        }
        match root.member("s") {
            Value::Set(items) => assert_eq!(items.len(), 3),
            other => panic!("not a set: {other:?}"),
        }
    }

    #[test]
    fn outlined_reference_with_path() {
        let decoder = decode("1:{\"deep\":{\"list\":[10,20]}}\n0:\"$1:deep:list:1\"\n");
        assert_eq!(read(&decoder), Value::Number(20.0));
    }

    #[test]
    fn error_row_rejects_chunk_and_its_dependents() {
        let mut decoder = decode("0:{\"x\":\"$1\"}\n");
        assert!(decoder.root().try_value().is_none());
        decoder
            .feed_bytes(b"1:E{\"name\":\"Oops\",\"message\":\"broke\",\"digest\":\"abc\"}\n")
            .expect("feed");
        let root_err = match decoder.root().try_value() {
            Some(Err(error)) => error,
            other => panic!("expected error: {other:?}"),
        };
        let text = root_err.to_string();
        assert!(text.contains("Oops"), "{text}");
        assert!(text.contains("broke"), "{text}");
        // The dependent chunk fails with the very same error instance.
        match decoder.handle(1).try_value() {
            Some(Err(error)) => assert!(Arc::ptr_eq(&error, &root_err)),
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn close_rejects_all_pending_with_same_error() {
        let mut decoder = decode("0:[\"$1\",\"$2\",\"$3\"]\n");
        decoder.feed_bytes(b"1:\"done\"\n").expect("feed");
        decoder.close();
        let one = decoder.handle(2).try_value().expect("settled");
        let two = decoder.handle(3).try_value().expect("settled");
        let (e1, e2) = match (one, two) {
            (Err(e1), Err(e2)) => (e1, e2),
            other => panic!("expected errors: {other:?}"),
        };
        assert!(Arc::ptr_eq(&e1, &e2));
        assert!(matches!(
            decoder.handle(1).try_value(),
            Some(Ok(Value::String(_)))
        ));
    }

    #[test]
    fn late_chunks_after_close_are_born_errored() {
        let decoder = decode("0:1\n");
        decoder.close();
        assert!(matches!(
            decoder.handle(9).try_value(),
            Some(Err(_))
        ));
    }

    #[test]
    fn halt_row_never_resolves() {
        let mut decoder = decode("0:\"$1\"\n");
        decoder.feed_bytes(b"1:\n").expect("feed");
        assert!(decoder.handle(1).try_value().is_none());
        // Halting survives the close sweep.
        decoder.close();
        assert!(decoder.handle(1).try_value().is_none());
    }

    #[test]
    fn length_framed_text_row() {
        let decoder = decode("0:\"$1\"\n1:T5,hello");
        assert_eq!(read(&decoder), Value::from("hello"));
    }

    #[test]
    fn typed_array_row() {
        let mut decoder = Decoder::new(DecodeOptions::default());
        let mut wire = b"1:l8,".to_vec();
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&2u32.to_le_bytes());
        wire.extend_from_slice(b"0:\"$1\"\n");
        decoder.feed_bytes(&wire).expect("feed");
        match read(&decoder) {
            Value::Bytes(bytes) => {
                assert_eq!(bytes.kind, ElementKind::U32);
                assert_eq!(bytes.data.len(), 8);
            }
            other => panic!("not bytes: {other:?}"),
        }
    }

    #[test]
    fn typed_array_width_violation() {
        let mut decoder = Decoder::new(DecodeOptions::default());
        let mut wire = b"1:l5,".to_vec();
        wire.extend_from_slice(&[0, 0, 0, 0, 0]);
        let err = decoder.feed_bytes(&wire).expect_err("must reject");
        assert!(matches!(err, ProtocolError::ElementWidth { len: 5, width: 4 }));
    }

    #[test]
    fn postpone_row() {
        let decoder = decode("0:P{\"reason\":\"render later\"}\n");
        match decoder.root().try_value() {
            Some(Err(error)) => {
                assert!(matches!(&*error, WireError::Postponed(reason) if reason == "render later"))
            }
            other => panic!("expected postponed: {other:?}"),
        }
    }

    #[test]
    fn lazy_reference_defers_initialization() {
        let mut decoder = decode("0:{\"tree\":\"$L1\"}\n");
        let root = read(&decoder);
        let lazy = root.member("tree");
        match &lazy {
            Value::Lazy(handle) => assert!(handle.try_value().is_none()),
            other => panic!("not lazy: {other:?}"),
        }
        decoder.feed_bytes(b"1:[1,2]\n").expect("feed");
        match &lazy {
            Value::Lazy(handle) => {
                let value = handle.try_value().expect("ready").expect("ok");
                assert_eq!(value.member("1"), Value::Number(2.0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn node_tuple_decodes() {
        let decoder =
            decode("0:[\"$\",\"section\",\"hero\",{\"title\":\"hi\",\"children\":[\"$\",\"p\",null,{}]}]\n");
        let root = read(&decoder);
        assert_eq!(root.node_tag(), Some(Value::from("section")));
        assert_eq!(root.node_key(), Some("hero".to_owned()));
        let props = root.node_props().expect("props");
        assert_eq!(props.member("title"), Value::from("hi"));
        let child = props.member("children");
        assert_eq!(child.node_tag(), Some(Value::from("p")));
    }

    #[test]
    fn blocked_node_becomes_lazy_until_dep_arrives() {
        let mut decoder = decode("0:[\"$\",\"div\",null,{\"label\":\"$2\"}]\n");
        let root = read(&decoder);
        let handle = match &root {
            Value::Lazy(handle) => handle.clone(),
            other => panic!("expected lazy node: {other:?}"),
        };
        assert!(handle.try_value().is_none());
        decoder.feed_bytes(b"2:\"ready\"\n").expect("feed");
        let node = handle.try_value().expect("ready").expect("ok");
        assert_eq!(node.node_props().expect("props").member("label"), Value::from("ready"));
    }

    #[test]
    fn symbol_and_date_and_stub() {
        let decoder = decode(
            "0:[\"$Sinterned\",\"$D2024-05-06T07:08:09.100Z\",\"$E() => {}\"]\n",
        );
        let root = read(&decoder);
        assert_eq!(root.member("0"), Value::Symbol("interned".into()));
        match root.member("1") {
            Value::Date(date) => assert_eq!(date.timestamp_millis(), 1_714_979_289_100),
            other => panic!("not a date: {other:?}"),
        }
        match root.member("2") {
            Value::Callable(callable) => assert!(callable.remote_id().is_none()),
            other => panic!("not a stub: {other:?}"),
        }
    }

    #[test]
    fn hint_and_time_origin_rows() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut decoder = Decoder::new(DecodeOptions {
            on_hint: Some(Box::new(move |code, model| {
                sink.lock().push((code, model));
            })),
            ..Default::default()
        });
        decoder
            .feed_bytes(b"1:HC[\"/style.css\"]\n2:N1700000000000\n")
            .expect("feed");
        assert_eq!(decoder.time_origin(), 1_700_000_000_000.0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 'C');
    }

    #[test]
    fn console_replay_rows_log_without_touching_the_chunk() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("filament=trace"))
            .with_test_writer()
            .try_init();
        let decoder = decode("0:W[\"log\",[\"hello\"]]\n");
        // Console rows replay into the log stream only; the chunk stays
        // pending for whatever row actually carries its value.
        assert!(decoder.root().try_value().is_none());
    }
}
