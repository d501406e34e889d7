//! Chunk cells: the unit of streaming on the decode side
//!
//! A chunk is a lazily-resolved cell identified by a row id. Its lifecycle is
//! an explicit sum type: `Pending` and `Blocked` carry listener lists,
//! `ResolvedModel`/`ResolvedModule` hold raw material that has not been
//! parsed yet (pinning the session so arrived data stays readable through a
//! retained handle), and the terminal states hold the outcome. Streams are
//! the one sanctioned post-terminal mutation: an initialized stream chunk keeps a
//! controller that accepts further rows.
//!
//! `Blocked` exists for cycles: a model parse flips its own chunk to
//! `Blocked` before parsing so that a self-referential payload can detect
//! the re-entry and resolve against the in-flight partial value.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::decode::resolver::{self, Reference};
use crate::decode::stream::StreamController;
use crate::decode::SessionInner;
use crate::error::{SharedWireError, WireError};
use crate::value::Value;

/// Id used for cells that live outside the registry (stream internals,
/// locally constructed promises).
pub(crate) const DETACHED_ID: u64 = u64::MAX;

/// Callback invoked when a chunk settles.
pub(crate) type NotifyFn = Box<dyn FnOnce(Result<Value, SharedWireError>) + Send>;

/// One entry on a chunk's listener list.
pub(crate) enum Listener {
    /// Plain settle callback (async waiters, stream ordering).
    Notify(NotifyFn),
    /// A deferred reference waiting to write into its container.
    Reference(Arc<Reference>),
}

/// Chunk lifecycle. Each state owns exactly the data that is meaningful in
/// it; there is no field whose interpretation depends on a status flag.
pub(crate) enum ChunkState {
    /// No row has arrived yet.
    Pending {
        /// Listeners to fire on settle
        listeners: Vec<Listener>,
    },
    /// A parse of this chunk's payload is in flight (or waiting on deps).
    Blocked {
        /// Listeners to fire on settle, including cyclic re-entries
        listeners: Vec<Listener>,
    },
    /// Raw model payload received, not parsed yet.
    ResolvedModel {
        /// Unparsed JSON text
        raw: String,
        /// Pinned so the payload stays parseable after the decoder goes away
        session: Option<Arc<SessionInner>>,
    },
    /// Module descriptor received, loader not run yet.
    ResolvedModule {
        /// Parsed descriptor model
        descriptor: Value,
        /// Pinned so the loader stays reachable after the decoder goes away
        session: Option<Arc<SessionInner>>,
    },
    /// Final value available.
    Initialized {
        /// The decoded value
        value: Value,
        /// Stream controller, for chunks that keep receiving rows
        controller: Option<StreamController>,
    },
    /// Failed; every reader sees the same shared error.
    Errored {
        /// The shared failure
        error: SharedWireError,
    },
    /// Diagnostic state that never resolves, not even at stream close.
    Halted,
}

impl ChunkState {
    fn name(&self) -> &'static str {
        match self {
            ChunkState::Pending { .. } => "pending",
            ChunkState::Blocked { .. } => "blocked",
            ChunkState::ResolvedModel { .. } => "resolved-model",
            ChunkState::ResolvedModule { .. } => "resolved-module",
            ChunkState::Initialized { .. } => "initialized",
            ChunkState::Errored { .. } => "errored",
            ChunkState::Halted => "halted",
        }
    }
}

/// A chunk cell. Owned by the registry (or detached for stream internals);
/// handles and references hold `Arc`s but never own the lifecycle.
pub(crate) struct ChunkCell {
    pub(crate) id: u64,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) state: Mutex<ChunkState>,
}

impl std::fmt::Debug for ChunkCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCell")
            .field("id", &self.id)
            .field("state", &self.state.lock().name())
            .finish()
    }
}

impl ChunkCell {
    pub(crate) fn pending(session: Weak<SessionInner>, id: u64) -> Arc<ChunkCell> {
        Arc::new(ChunkCell {
            id,
            session,
            state: Mutex::new(ChunkState::Pending {
                listeners: Vec::new(),
            }),
        })
    }

    /// A cell already in the blocked state, for values constructed mid-parse
    /// that are waiting on their own deferred references.
    pub(crate) fn blocked(session: Weak<SessionInner>, id: u64) -> Arc<ChunkCell> {
        Arc::new(ChunkCell {
            id,
            session,
            state: Mutex::new(ChunkState::Blocked {
                listeners: Vec::new(),
            }),
        })
    }

    pub(crate) fn resolved_model(
        session: Weak<SessionInner>,
        id: u64,
        raw: String,
    ) -> Arc<ChunkCell> {
        let pinned = session.upgrade();
        Arc::new(ChunkCell {
            id,
            session,
            state: Mutex::new(ChunkState::ResolvedModel {
                raw,
                session: pinned,
            }),
        })
    }

    pub(crate) fn initialized(
        session: Weak<SessionInner>,
        id: u64,
        value: Value,
        controller: Option<StreamController>,
    ) -> Arc<ChunkCell> {
        Arc::new(ChunkCell {
            id,
            session,
            state: Mutex::new(ChunkState::Initialized { value, controller }),
        })
    }

    pub(crate) fn errored(
        session: Weak<SessionInner>,
        id: u64,
        error: SharedWireError,
    ) -> Arc<ChunkCell> {
        Arc::new(ChunkCell {
            id,
            session,
            state: Mutex::new(ChunkState::Errored { error }),
        })
    }
}

/// Result of a synchronous chunk read.
#[derive(Debug, Clone)]
pub enum ChunkRead {
    /// The value is available.
    Ready(Value),
    /// Still pending, blocked, or halted; retry after awaiting.
    Pending,
    /// The chunk failed.
    Errored(SharedWireError),
}

/// Fire listeners with a resolution.
pub(crate) fn wake_listeners(listeners: Vec<Listener>, value: &Value) {
    for listener in listeners {
        match listener {
            Listener::Notify(notify) => notify(Ok(value.clone())),
            Listener::Reference(reference) => resolver::fulfill_reference(&reference, value.clone()),
        }
    }
}

/// Fire listeners with a rejection.
pub(crate) fn reject_listeners(listeners: Vec<Listener>, error: &SharedWireError) {
    for listener in listeners {
        match listener {
            Listener::Notify(notify) => notify(Err(error.clone())),
            Listener::Reference(reference) => resolver::reject_reference(&reference, error.clone()),
        }
    }
}

/// Drive a `ResolvedModel`/`ResolvedModule` chunk to a settled state. No-op
/// for every other state.
pub(crate) fn ensure_initialized(cell: &Arc<ChunkCell>) {
    let needs = {
        let state = cell.state.lock();
        matches!(
            &*state,
            ChunkState::ResolvedModel { .. } | ChunkState::ResolvedModule { .. }
        )
    };
    if !needs {
        return;
    }
    let state_kind = {
        let state = cell.state.lock();
        match &*state {
            ChunkState::ResolvedModel { .. } => 1,
            ChunkState::ResolvedModule { .. } => 2,
            _ => 0,
        }
    };
    match state_kind {
        1 => initialize_model_chunk(cell),
        2 => initialize_module_chunk(cell),
        _ => {}
    }
}

/// Parse a resolved model payload into a live value.
///
/// The chunk goes `ResolvedModel -> Blocked` before parsing begins so a
/// self-referential payload re-entering this id can be detected. Listeners
/// attached during the parse (cyclic references) are woken with the parsed
/// value even if the chunk itself stays blocked on other dependencies.
pub(crate) fn initialize_model_chunk(cell: &Arc<ChunkCell>) {
    let (raw, pinned) = {
        let mut state = cell.state.lock();
        match &*state {
            ChunkState::ResolvedModel { .. } => {
                let prev = std::mem::replace(
                    &mut *state,
                    ChunkState::Blocked {
                        listeners: Vec::new(),
                    },
                );
                match prev {
                    ChunkState::ResolvedModel { raw, session } => (raw, session),
                    _ => unreachable!(),
                }
            }
            _ => return,
        }
    };

    let Some(session) = pinned.or_else(|| cell.session.upgrade()) else {
        settle_error(cell, Arc::new(WireError::ConnectionClosed));
        return;
    };

    let mut cx = resolver::ParseCx::new();
    let parsed = resolver::parse_model(&session, &raw, &mut cx);
    match parsed {
        Ok(value) => {
            // Wake any cyclic listeners registered mid-parse with the value
            // as it stands; they may themselves still be blocked.
            let cyclic = {
                let mut state = cell.state.lock();
                match &mut *state {
                    ChunkState::Blocked { listeners } => std::mem::take(listeners),
                    _ => Vec::new(),
                }
            };
            if !cyclic.is_empty() {
                wake_listeners(cyclic, &value);
            }

            if let Some(handler) = cx.take_handler() {
                let mut inner = handler.lock();
                if inner.errored {
                    let error = inner
                        .reason
                        .clone()
                        .unwrap_or_else(|| Arc::new(WireError::ConnectionClosed));
                    drop(inner);
                    settle_error(cell, error);
                    return;
                }
                if inner.deps > 0 {
                    // Unresolved references remain; stay blocked and let the
                    // last fulfilled reference complete the chunk.
                    inner.value = Some(value);
                    inner.chunk = Some(cell.clone());
                    tracing::trace!(id = cell.id, deps = inner.deps, "model blocked on deps");
                    return;
                }
            }

            let mut state = cell.state.lock();
            tracing::trace!(id = cell.id, "model chunk initialized");
            *state = ChunkState::Initialized {
                value,
                controller: None,
            };
        }
        Err(error) => settle_error(cell, error),
    }
}

/// Run the module loader over a resolved module descriptor.
pub(crate) fn initialize_module_chunk(cell: &Arc<ChunkCell>) {
    let (descriptor, pinned) = {
        let mut state = cell.state.lock();
        match &*state {
            ChunkState::ResolvedModule { .. } => {
                let prev = std::mem::replace(
                    &mut *state,
                    ChunkState::Blocked {
                        listeners: Vec::new(),
                    },
                );
                match prev {
                    ChunkState::ResolvedModule {
                        descriptor,
                        session,
                    } => (descriptor, session),
                    _ => unreachable!(),
                }
            }
            _ => return,
        }
    };
    let Some(session) = pinned.or_else(|| cell.session.upgrade()) else {
        settle_error(cell, Arc::new(WireError::ConnectionClosed));
        return;
    };
    let loaded = match &session.options.load_module {
        Some(loader) => loader(descriptor),
        // No loader configured: the descriptor itself is the value.
        None => Ok(descriptor),
    };
    match loaded {
        Ok(value) => {
            let listeners = {
                let mut state = cell.state.lock();
                let listeners = match &mut *state {
                    ChunkState::Blocked { listeners } => std::mem::take(listeners),
                    _ => Vec::new(),
                };
                *state = ChunkState::Initialized {
                    value: value.clone(),
                    controller: None,
                };
                listeners
            };
            wake_listeners(listeners, &value);
        }
        Err(error) => settle_error(cell, Arc::new(error)),
    }
}

/// Transition to `Errored`, rejecting any listeners.
pub(crate) fn settle_error(cell: &Arc<ChunkCell>, error: SharedWireError) {
    let listeners = {
        let mut state = cell.state.lock();
        let listeners = match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                std::mem::take(listeners)
            }
            _ => Vec::new(),
        };
        *state = ChunkState::Errored {
            error: error.clone(),
        };
        listeners
    };
    tracing::debug!(id = cell.id, %error, "chunk errored");
    reject_listeners(listeners, &error);
}

/// Route an error to a chunk: pending/blocked chunks transition to
/// `Errored`; an initialized stream chunk forwards to its controller.
pub(crate) fn trigger_error_on_chunk(cell: &Arc<ChunkCell>, error: SharedWireError) {
    enum Disposition {
        Settle,
        Stream(StreamController),
        Ignore,
    }
    let disposition = {
        let state = cell.state.lock();
        match &*state {
            ChunkState::Pending { .. } | ChunkState::Blocked { .. } => Disposition::Settle,
            ChunkState::Initialized {
                controller: Some(controller),
                ..
            } => Disposition::Stream(controller.clone()),
            _ => Disposition::Ignore,
        }
    };
    match disposition {
        Disposition::Settle => settle_error(cell, error),
        Disposition::Stream(controller) => controller.error(error),
        Disposition::Ignore => {
            tracing::warn!(id = cell.id, %error, "error row for a settled chunk ignored")
        }
    }
}

/// Deliver a model payload to a chunk. Repeated payloads for an initialized
/// chunk are stream enqueues.
pub(crate) fn resolve_model_chunk(cell: &Arc<ChunkCell>, raw: String) {
    enum Disposition {
        Fresh(Vec<Listener>),
        Stream(StreamController),
        Ignore,
    }
    let disposition = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } => {
                let listeners = std::mem::take(listeners);
                *state = ChunkState::ResolvedModel {
                    raw: raw.clone(),
                    session: cell.session.upgrade(),
                };
                Disposition::Fresh(listeners)
            }
            ChunkState::Initialized {
                controller: Some(controller),
                ..
            } => Disposition::Stream(controller.clone()),
            _ => Disposition::Ignore,
        }
    };
    match disposition {
        Disposition::Fresh(listeners) => {
            if !listeners.is_empty() {
                // Someone is already waiting; parse eagerly.
                initialize_model_chunk(cell);
                wake_chunk_if_initialized(cell, listeners);
            }
        }
        Disposition::Stream(controller) => controller.enqueue_model(raw),
        Disposition::Ignore => {
            tracing::warn!(id = cell.id, "model row for a settled non-stream chunk ignored")
        }
    }
}

/// Deliver a module descriptor to a chunk.
pub(crate) fn resolve_module_chunk(cell: &Arc<ChunkCell>, descriptor: Value) {
    let listeners = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                let listeners = std::mem::take(listeners);
                *state = ChunkState::ResolvedModule {
                    descriptor,
                    session: cell.session.upgrade(),
                };
                listeners
            }
            _ => {
                tracing::warn!(id = cell.id, "module row for a settled chunk ignored");
                return;
            }
        }
    };
    if !listeners.is_empty() {
        initialize_module_chunk(cell);
        wake_chunk_if_initialized(cell, listeners);
    }
}

/// Re-dispatch listeners after an eager initialization attempt. Handles the
/// cycle case: a reference whose own in-flight value transitively feeds this
/// blocked chunk is satisfied from the partial on that cycle instead of
/// being parked again.
pub(crate) fn wake_chunk_if_initialized(cell: &Arc<ChunkCell>, listeners: Vec<Listener>) {
    enum Disposition {
        Wake(Value),
        Reject(SharedWireError),
        CycleCheck,
        Drop,
    }
    let disposition = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Initialized { value, .. } => Disposition::Wake(value.clone()),
            ChunkState::Errored { error } => Disposition::Reject(error.clone()),
            ChunkState::Blocked { .. } => Disposition::CycleCheck,
            ChunkState::Pending {
                listeners: existing,
            } => {
                existing.extend(listeners);
                return;
            }
            ChunkState::Halted => Disposition::Drop,
            ChunkState::ResolvedModel { .. } | ChunkState::ResolvedModule { .. } => {
                // Not initialized eagerly; reattach as plain pending work.
                Disposition::CycleCheck
            }
        }
    };
    let listeners = match disposition {
        Disposition::Wake(value) => return wake_listeners(listeners, &value),
        Disposition::Reject(error) => return reject_listeners(listeners, &error),
        Disposition::Drop => return,
        Disposition::CycleCheck => listeners,
    };

    // Blocked: check each waiting reference for a cycle back to this chunk
    // before parking it on the listener list.
    let mut parked = Vec::new();
    for listener in listeners {
        match listener {
            Listener::Reference(reference) => {
                if let Some(partial) = resolver::resolve_blocked_cycle(cell, &reference) {
                    resolver::fulfill_reference(&reference, partial);
                } else {
                    parked.push(Listener::Reference(reference));
                }
            }
            other => parked.push(other),
        }
    }
    if parked.is_empty() {
        return;
    }
    let leftover = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Blocked { listeners } | ChunkState::Pending { listeners } => {
                listeners.extend(parked);
                None
            }
            _ => Some(parked),
        }
    };
    if let Some(parked) = leftover {
        // The chunk settled while we were cycle-checking; go around again.
        wake_chunk_if_initialized(cell, parked);
    }
}

/// Initialize a chunk as a streamed aggregate: the handle value is available
/// immediately and the controller accepts the rows that follow.
pub(crate) fn resolve_stream_chunk(
    cell: &Arc<ChunkCell>,
    value: Value,
    controller: StreamController,
) {
    let listeners = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                let listeners = std::mem::take(listeners);
                *state = ChunkState::Initialized {
                    value: value.clone(),
                    controller: Some(controller),
                };
                listeners
            }
            _ => {
                tracing::warn!(id = cell.id, "stream start for a settled chunk ignored");
                return;
            }
        }
    };
    wake_listeners(listeners, &value);
}

/// Attach a listener, dispatching immediately when the chunk has already
/// settled. Halted chunks swallow the listener.
pub(crate) fn push_listener(cell: &Arc<ChunkCell>, listener: Listener) {
    ensure_initialized(cell);
    let outcome = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                listeners.push(listener);
                return;
            }
            ChunkState::Initialized { value, .. } => Ok(value.clone()),
            ChunkState::Errored { error } => Err(error.clone()),
            _ => return,
        }
    };
    match outcome {
        Ok(value) => wake_listeners(vec![listener], &value),
        Err(error) => reject_listeners(vec![listener], &error),
    }
}

/// Deliver an already-decoded value (text and binary row payloads skip the
/// model parse). Repeat deliveries to an initialized stream chunk enqueue.
pub(crate) fn resolve_value_chunk(cell: &Arc<ChunkCell>, value: Value) {
    enum Disposition {
        Wake(Vec<Listener>),
        Stream(StreamController),
        Ignore,
    }
    let disposition = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                let listeners = std::mem::take(listeners);
                *state = ChunkState::Initialized {
                    value: value.clone(),
                    controller: None,
                };
                Disposition::Wake(listeners)
            }
            ChunkState::Initialized {
                controller: Some(controller),
                ..
            } => Disposition::Stream(controller.clone()),
            _ => Disposition::Ignore,
        }
    };
    match disposition {
        Disposition::Wake(listeners) => wake_listeners(listeners, &value),
        Disposition::Stream(controller) => controller.enqueue_value(value),
        Disposition::Ignore => {
            tracing::warn!(id = cell.id, "value row for a settled non-stream chunk ignored")
        }
    }
}

/// Register a settle callback. Initializes resolved material first so the
/// callback observes a settled state whenever one is reachable.
pub(crate) fn on_settle(cell: &Arc<ChunkCell>, notify: NotifyFn) {
    ensure_initialized(cell);
    let immediate = {
        let mut state = cell.state.lock();
        match &mut *state {
            ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
                listeners.push(Listener::Notify(notify));
                return;
            }
            ChunkState::Initialized { value, .. } => Some(Ok(value.clone())),
            ChunkState::Errored { error } => Some(Err(error.clone())),
            // Halted chunks never settle; the callback is dropped.
            ChunkState::Halted => None,
            _ => None,
        }
    };
    if let Some(outcome) = immediate {
        notify(outcome);
    }
}

/// Force the halted diagnostic state. Listeners are dropped: halted means
/// "will never resolve", and that includes everyone already waiting.
pub(crate) fn resolve_halt(cell: &Arc<ChunkCell>) {
    let mut state = cell.state.lock();
    match &*state {
        ChunkState::Pending { .. } | ChunkState::Blocked { .. } => {
            tracing::debug!(id = cell.id, "chunk halted");
            *state = ChunkState::Halted;
        }
        _ => {}
    }
}

/// Public handle to a chunk: a thenable over the cell. Cloning shares the
/// cell; dropping a handle never tears the chunk down.
#[derive(Clone)]
pub struct ChunkHandle {
    pub(crate) cell: Arc<ChunkCell>,
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkHandle({:?})", self.cell)
    }
}

impl ChunkHandle {
    /// Synchronous read: the value when initialized, `Pending` while
    /// unresolved (or halted), the shared error when failed.
    pub fn read(&self) -> ChunkRead {
        ensure_initialized(&self.cell);
        let state = self.cell.state.lock();
        match &*state {
            ChunkState::Initialized { value, .. } => ChunkRead::Ready(value.clone()),
            ChunkState::Errored { error } => ChunkRead::Errored(error.clone()),
            _ => ChunkRead::Pending,
        }
    }

    /// The settled outcome, when there is one.
    pub fn try_value(&self) -> Option<Result<Value, SharedWireError>> {
        match self.read() {
            ChunkRead::Ready(value) => Some(Ok(value)),
            ChunkRead::Errored(error) => Some(Err(error)),
            ChunkRead::Pending => None,
        }
    }

    /// Await the settled value. A halted chunk never completes this future.
    pub async fn value(&self) -> Result<Value, SharedWireError> {
        if let Some(settled) = self.try_value() {
            return settled;
        }
        let halted = matches!(&*self.cell.state.lock(), ChunkState::Halted);
        if halted {
            return std::future::pending().await;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        on_settle(
            &self.cell,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        match rx.await {
            Ok(outcome) => outcome,
            // Listener dropped without firing: halted after registration.
            Err(_) => std::future::pending().await,
        }
    }

    /// Identity token, for dedup maps and equality.
    pub fn ptr_token(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }

    /// A detached, already-resolved handle.
    pub fn ready(value: Value) -> ChunkHandle {
        ChunkHandle {
            cell: ChunkCell::initialized(Weak::new(), DETACHED_ID, value, None),
        }
    }

    /// A detached, already-rejected handle.
    pub fn failed(error: SharedWireError) -> ChunkHandle {
        ChunkHandle {
            cell: ChunkCell::errored(Weak::new(), DETACHED_ID, error),
        }
    }

    /// A detached pending handle plus its resolver, for locally constructed
    /// promises.
    pub fn deferred() -> (ChunkHandle, PromiseResolver) {
        let cell = ChunkCell::pending(Weak::new(), DETACHED_ID);
        (
            ChunkHandle { cell: cell.clone() },
            PromiseResolver { cell },
        )
    }
}

/// Settles a locally constructed promise handle.
pub struct PromiseResolver {
    cell: Arc<ChunkCell>,
}

impl PromiseResolver {
    /// Resolve with a value. No-op if already settled.
    pub fn resolve(self, value: Value) {
        let listeners = {
            let mut state = self.cell.state.lock();
            match &mut *state {
                ChunkState::Pending { listeners } | ChunkState::Blocked { listeners } => {
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
        wake_listeners(listeners, &value);
    }

    /// Reject with an error. No-op if already settled.
    pub fn reject(self, error: SharedWireError) {
        trigger_error_on_chunk(&self.cell, error);
    }
}
