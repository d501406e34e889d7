//! Streamed aggregates: readable streams and async iterables
//!
//! A stream chunk initializes immediately with a handle the consumer can
//! read from, and keeps a controller in its cell. Later rows with the same
//! id feed the controller, which is the one sanctioned mutation of an
//! already-initialized chunk.
//!
//! Ordering: enqueued models may themselves block on chunks that have not
//! arrived. The controller chains each blocked entry to the previous one so
//! values are emitted in row order even when an early entry resolves late.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::decode::chunk::{self, ChunkCell, ChunkHandle, ChunkState, Listener, DETACHED_ID};
use crate::decode::SessionInner;
use crate::error::SharedWireError;
use crate::value::Value;
use crate::wire::StreamKind;

const DONE_UNDEFINED: &str = "{\"done\":true,\"value\":\"$undefined\"}";

struct StreamBuf {
    queue: VecDeque<Value>,
    done: bool,
    error: Option<SharedWireError>,
}

struct StreamShared {
    buf: Mutex<StreamBuf>,
    notify: Notify,
}

impl StreamShared {
    fn new() -> Arc<StreamShared> {
        Arc::new(StreamShared {
            buf: Mutex::new(StreamBuf {
                queue: VecDeque::new(),
                done: false,
                error: None,
            }),
            notify: Notify::new(),
        })
    }

    fn push(&self, value: Value) {
        {
            let mut buf = self.buf.lock();
            if buf.done || buf.error.is_some() {
                return;
            }
            buf.queue.push_back(value);
        }
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.buf.lock().done = true;
        self.notify.notify_waiters();
    }

    fn fail(&self, error: SharedWireError) {
        {
            let mut buf = self.buf.lock();
            if buf.error.is_none() {
                buf.error = Some(error);
            }
        }
        self.notify.notify_waiters();
    }
}

/// Consumer handle to a readable stream (`R` and `r` rows).
#[derive(Clone)]
pub struct StreamHandle {
    kind: StreamKind,
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamHandle({:?})", self.kind)
    }
}

impl StreamHandle {
    /// The stream's flavor: decoded values or raw byte buffers.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Identity token for dedup and equality.
    pub fn ptr_token(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Next item, in row order. `None` once the stream closed; queued items
    /// drain before a terminal error is reported.
    pub async fn next(&self) -> Option<Result<Value, SharedWireError>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut buf = self.shared.buf.lock();
                if let Some(value) = buf.queue.pop_front() {
                    return Some(Ok(value));
                }
                if let Some(error) = &buf.error {
                    return Some(Err(error.clone()));
                }
                if buf.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Collect the remaining items, stopping at close or the first error.
    pub async fn collect(&self) -> Result<Vec<Value>, SharedWireError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// A locally fed stream, for building values that encode as streams.
    pub fn channel(kind: StreamKind) -> (StreamSender, StreamHandle) {
        let shared = StreamShared::new();
        (
            StreamSender {
                shared: shared.clone(),
            },
            StreamHandle { kind, shared },
        )
    }
}

/// Producer side of a locally constructed stream.
pub struct StreamSender {
    shared: Arc<StreamShared>,
}

impl StreamSender {
    /// Emit one item.
    pub fn send(&self, value: Value) {
        self.shared.push(value);
    }

    /// Close the stream.
    pub fn close(self) {
        self.shared.finish();
    }

    /// Fail the stream.
    pub fn fail(self, error: SharedWireError) {
        self.shared.fail(error);
    }
}

struct ReadableInner {
    session: Weak<SessionInner>,
    shared: Arc<StreamShared>,
    /// Most recent entry that could not emit synchronously; later entries
    /// chain behind it to preserve row order.
    blocked: Mutex<Option<Arc<ChunkCell>>>,
}

/// Controller feeding a readable stream.
#[derive(Clone)]
pub(crate) struct ReadableController {
    inner: Arc<ReadableInner>,
}

impl ReadableController {
    fn emit_or_chain(&self, cell: Arc<ChunkCell>) {
        let this = self.clone();
        *self.inner.blocked.lock() = Some(cell.clone());
        chunk::push_listener(
            &cell,
            Listener::Notify(Box::new(move |outcome| match outcome {
                Ok(value) => this.inner.shared.push(value),
                Err(error) => this.inner.shared.fail(error),
            })),
        );
    }

    fn enqueue_value(&self, value: Value) {
        let prev = self.inner.blocked.lock().clone();
        match prev {
            None => self.inner.shared.push(value),
            Some(prev) => {
                let this = self.clone();
                chunk::push_listener(
                    &prev,
                    Listener::Notify(Box::new(move |_| this.inner.shared.push(value))),
                );
            }
        }
    }

    fn enqueue_model(&self, raw: String) {
        let prev = self.inner.blocked.lock().clone();
        match prev {
            None => {
                let cell =
                    ChunkCell::resolved_model(self.inner.session.clone(), DETACHED_ID, raw);
                chunk::initialize_model_chunk(&cell);
                let settled = {
                    let state = cell.state.lock();
                    match &*state {
                        ChunkState::Initialized { value, .. } => Some(Ok(value.clone())),
                        ChunkState::Errored { error } => Some(Err(error.clone())),
                        _ => None,
                    }
                };
                match settled {
                    Some(Ok(value)) => self.inner.shared.push(value),
                    Some(Err(error)) => self.inner.shared.fail(error),
                    None => self.emit_or_chain(cell),
                }
            }
            Some(prev) => {
                let cell = ChunkCell::pending(self.inner.session.clone(), DETACHED_ID);
                self.emit_or_chain(cell.clone());
                let this = self.clone();
                chunk::push_listener(
                    &prev,
                    Listener::Notify(Box::new(move |_| {
                        {
                            let mut blocked = this.inner.blocked.lock();
                            if blocked.as_ref().is_some_and(|b| Arc::ptr_eq(b, &cell)) {
                                *blocked = None;
                            }
                        }
                        chunk::resolve_model_chunk(&cell, raw);
                    })),
                );
            }
        }
    }

    fn close(&self) {
        let prev = self.inner.blocked.lock().clone();
        match prev {
            None => self.inner.shared.finish(),
            Some(prev) => {
                let this = self.clone();
                chunk::push_listener(
                    &prev,
                    Listener::Notify(Box::new(move |_| this.inner.shared.finish())),
                );
            }
        }
    }

    fn error(&self, error: SharedWireError) {
        let prev = self.inner.blocked.lock().clone();
        match prev {
            None => self.inner.shared.fail(error),
            Some(prev) => {
                let this = self.clone();
                chunk::push_listener(
                    &prev,
                    Listener::Notify(Box::new(move |_| this.inner.shared.fail(error))),
                );
            }
        }
    }
}

struct IterBuf {
    /// One result cell per emitted item, in order. Readers may allocate
    /// pending cells ahead of the writer.
    cells: Vec<Arc<ChunkCell>>,
    next_write: usize,
    closed: bool,
    error: Option<SharedWireError>,
}

struct IterInner {
    session: Weak<SessionInner>,
    buf: Mutex<IterBuf>,
}

/// Consumer handle to an async iterable (`X`) or single-pass iterator (`x`).
#[derive(Clone)]
pub struct IterHandle {
    inner: Arc<IterInner>,
    single_shot: bool,
    shared_cursor: Arc<Mutex<usize>>,
}

impl std::fmt::Debug for IterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.single_shot { "single" } else { "multi" };
        write!(f, "IterHandle({mode})")
    }
}

impl IterHandle {
    /// Whether this iterates once (`x`) or replays from the start (`X`).
    pub fn is_single_shot(&self) -> bool {
        self.single_shot
    }

    /// Identity token for dedup and equality.
    pub fn ptr_token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Begin iterating. Multi-shot iterables replay the full history; a
    /// single-shot iterator shares one cursor across every call.
    pub fn iterate(&self) -> IterReader {
        IterReader {
            inner: self.inner.clone(),
            cursor: if self.single_shot {
                Cursor::Shared(self.shared_cursor.clone())
            } else {
                Cursor::Own(0)
            },
        }
    }

    /// A locally fed iterable, for building values that encode as iterables.
    pub fn channel(single_shot: bool) -> (IterSender, IterHandle) {
        let inner = Arc::new(IterInner {
            session: Weak::new(),
            buf: Mutex::new(IterBuf {
                cells: Vec::new(),
                next_write: 0,
                closed: false,
                error: None,
            }),
        });
        (
            IterSender {
                controller: IterController {
                    inner: inner.clone(),
                },
            },
            IterHandle {
                inner,
                single_shot,
                shared_cursor: Arc::new(Mutex::new(0)),
            },
        )
    }
}

enum Cursor {
    Own(usize),
    Shared(Arc<Mutex<usize>>),
}

/// One pass over an async iterable.
pub struct IterReader {
    inner: Arc<IterInner>,
    cursor: Cursor,
}

impl IterReader {
    /// Next yielded item, `None` once the iterator finished.
    pub async fn next(&mut self) -> Option<Result<Value, SharedWireError>> {
        let cell = {
            let mut buf = self.inner.buf.lock();
            let index = match &self.cursor {
                Cursor::Own(index) => *index,
                Cursor::Shared(shared) => *shared.lock(),
            };
            if index == buf.cells.len() {
                if buf.closed {
                    if let Some(error) = &buf.error {
                        return Some(Err(error.clone()));
                    }
                    return None;
                }
                // Read ahead of the writer: park a pending result cell.
                let cell = ChunkCell::pending(self.inner.session.clone(), DETACHED_ID);
                buf.cells.push(cell);
            }
            let cell = buf.cells[index].clone();
            match &mut self.cursor {
                Cursor::Own(own) => *own = index + 1,
                Cursor::Shared(shared) => *shared.lock() = index + 1,
            }
            cell
        };
        let result = match (ChunkHandle { cell }).value().await {
            Ok(result) => result,
            Err(error) => return Some(Err(error)),
        };
        let done = matches!(result.member("done"), Value::Bool(true));
        if done {
            // The final return value of the producer is not a yielded item.
            return None;
        }
        Some(Ok(result.member("value")))
    }
}

/// Producer side of a locally constructed iterable.
pub struct IterSender {
    controller: IterController,
}

impl IterSender {
    /// Yield one item.
    pub fn send(&self, value: Value) {
        self.controller.enqueue_value(value);
    }

    /// Finish the iterator, optionally with a final return value.
    pub fn close(self, final_value: Option<Value>) {
        self.controller.close_with(final_value.map(DoneValue::Value));
    }

    /// Fail the iterator.
    pub fn fail(self, error: SharedWireError) {
        self.controller.error(error);
    }
}

enum DoneValue {
    Value(Value),
    Model(String),
}

struct IterController {
    inner: Arc<IterInner>,
}

impl Clone for IterController {
    fn clone(&self) -> Self {
        IterController {
            inner: self.inner.clone(),
        }
    }
}

impl IterController {
    fn wrap_result(done: bool, value: Value) -> Value {
        Value::object(vec![("done", Value::Bool(done)), ("value", value)])
    }

    fn wrap_model(done: bool, raw: &str) -> String {
        format!("{{\"done\":{done},\"value\":{raw}}}")
    }

    /// Write into the next result slot, allocating it if no reader got
    /// there first.
    fn write_slot(&self, existing: impl FnOnce(&Arc<ChunkCell>), fresh: impl FnOnce() -> Arc<ChunkCell>) {
        let target = {
            let mut buf = self.inner.buf.lock();
            if buf.closed {
                return;
            }
            let index = buf.next_write;
            buf.next_write += 1;
            if index == buf.cells.len() {
                let cell = fresh();
                buf.cells.push(cell);
                None
            } else {
                Some(buf.cells[index].clone())
            }
        };
        if let Some(cell) = target {
            existing(&cell);
        }
    }

    fn enqueue_value(&self, value: Value) {
        let wrapped = Self::wrap_result(false, value);
        let session = self.inner.session.clone();
        self.write_slot(
            |cell| chunk::resolve_value_chunk(cell, wrapped.clone()),
            || ChunkCell::initialized(session, DETACHED_ID, wrapped.clone(), None),
        );
    }

    fn enqueue_model(&self, raw: String) {
        let wrapped = Self::wrap_model(false, &raw);
        let session = self.inner.session.clone();
        self.write_slot(
            |cell| chunk::resolve_model_chunk(cell, wrapped.clone()),
            || ChunkCell::resolved_model(session, DETACHED_ID, wrapped.clone()),
        );
    }

    fn close_with(&self, final_value: Option<DoneValue>) {
        let (target, trailing) = {
            let mut buf = self.inner.buf.lock();
            if buf.closed {
                return;
            }
            buf.closed = true;
            let index = buf.next_write;
            if index == buf.cells.len() {
                buf.cells
                    .push(ChunkCell::pending(self.inner.session.clone(), DETACHED_ID));
            }
            let target = buf.cells[index].clone();
            let trailing: Vec<_> = buf.cells[index + 1..].to_vec();
            buf.next_write = buf.cells.len();
            (target, trailing)
        };
        match final_value {
            Some(DoneValue::Value(value)) => {
                chunk::resolve_value_chunk(&target, Self::wrap_result(true, value))
            }
            Some(DoneValue::Model(raw)) => {
                chunk::resolve_model_chunk(&target, Self::wrap_model(true, &raw))
            }
            None => chunk::resolve_value_chunk(&target, Self::wrap_result(true, Value::Undefined)),
        }
        for cell in trailing {
            chunk::resolve_model_chunk(&cell, DONE_UNDEFINED.to_owned());
        }
    }

    fn error(&self, error: SharedWireError) {
        let trailing = {
            let mut buf = self.inner.buf.lock();
            if buf.closed {
                return;
            }
            buf.closed = true;
            buf.error = Some(error.clone());
            let trailing: Vec<_> = buf.cells[buf.next_write..].to_vec();
            buf.next_write = buf.cells.len();
            trailing
        };
        for cell in trailing {
            chunk::trigger_error_on_chunk(&cell, error.clone());
        }
    }
}

/// Controller stashed inside an initialized stream chunk. Later rows with
/// the chunk's id are fed through it.
#[derive(Clone)]
pub(crate) enum StreamController {
    Readable(ReadableController),
    Iter(IterController),
}

impl StreamController {
    pub(crate) fn enqueue_value(&self, value: Value) {
        match self {
            StreamController::Readable(c) => c.enqueue_value(value),
            StreamController::Iter(c) => c.enqueue_value(value),
        }
    }

    pub(crate) fn enqueue_model(&self, raw: String) {
        match self {
            StreamController::Readable(c) => c.enqueue_model(raw),
            StreamController::Iter(c) => c.enqueue_model(raw),
        }
    }

    /// Close. Readable streams take no final value; an iterator's close row
    /// may carry the producer's return value as a model.
    pub(crate) fn close(&self, final_model: Option<String>) {
        match self {
            StreamController::Readable(c) => c.close(),
            StreamController::Iter(c) => c.close_with(final_model.map(DoneValue::Model)),
        }
    }

    pub(crate) fn error(&self, error: SharedWireError) {
        match self {
            StreamController::Readable(c) => c.error(error),
            StreamController::Iter(c) => c.error(error),
        }
    }
}

/// Start a readable stream for a freshly arrived `R`/`r` row.
pub(crate) fn start_readable(
    session: &Arc<SessionInner>,
    kind: StreamKind,
) -> (Value, StreamController) {
    let shared = StreamShared::new();
    let controller = ReadableController {
        inner: Arc::new(ReadableInner {
            session: Arc::downgrade(session),
            shared: shared.clone(),
            blocked: Mutex::new(None),
        }),
    };
    (
        Value::Stream(StreamHandle { kind, shared }),
        StreamController::Readable(controller),
    )
}

/// Start an async iterable for a freshly arrived `X`/`x` row.
pub(crate) fn start_iterable(
    session: &Arc<SessionInner>,
    single_shot: bool,
) -> (Value, StreamController) {
    let inner = Arc::new(IterInner {
        session: Arc::downgrade(session),
        buf: Mutex::new(IterBuf {
            cells: Vec::new(),
            next_write: 0,
            closed: false,
            error: None,
        }),
    });
    (
        Value::AsyncIter(IterHandle {
            inner: inner.clone(),
            single_shot,
            shared_cursor: Arc::new(Mutex::new(0)),
        }),
        StreamController::Iter(IterController { inner }),
    )
}
