//! The worker session: lifecycle state machine between a caller and the
//! background inference worker.
//!
//! A [`Session`] spawns its worker lazily, drives the capability check and
//! staged load, turns worker replies into relay events and routes streamed
//! output to the callbacks of the most recent [`Session::ask`].
//!
//! Only one set of callbacks is pending at a time. A newer `ask` takes over
//! the slot without cancelling the older generation, so output still
//! streaming from the older one lands on the newer callbacks. The
//! displaced caller's `ask` resolves with [`BridgeError::Superseded`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ProgressFilter};
use crate::bridge::ChatHandler;
use crate::catalog::LazyCatalog;
use crate::consts::{NOT_READY_MESSAGE, READY_NOTICE};
use crate::error::BridgeError;
use crate::events::{Event, EventBus};
use crate::prompts::build_messages;
use crate::protocol::{Command, Reply};
use crate::relay::{Relay, RelayEvent};
use crate::worker::{self, WorkerHandle};

/// Relayed once the backend confirms it can run here.
pub const CAPABILITY_VERIFIED_NOTICE: &str = "Capability verified. Starting load...";

/// Prefix of the completion text sent when generation fails.
pub const GENERATION_ERROR_PREFIX: &str = "Sorry, I encountered an error: ";

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    CapabilityChecking,
    Loading,
    Ready,
    Generating,
    /// The last check or load failed. A later `load` starts over.
    Failed(String),
}

impl SessionState {
    /// Whether the model is loaded and can take requests.
    pub fn is_loaded(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Generating)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::CapabilityChecking | SessionState::Loading)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("not started"),
            SessionState::CapabilityChecking => f.write_str("checking capability"),
            SessionState::Loading => f.write_str("loading"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Generating => f.write_str("generating"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

type TextFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Where a request's streamed chunks and final text go.
#[derive(Clone)]
pub struct Callbacks {
    on_update: TextFn,
    on_complete: TextFn,
}

impl Callbacks {
    pub fn new(
        on_update: impl Fn(&str) + Send + Sync + 'static,
        on_complete: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_update: Arc::new(on_update),
            on_complete: Arc::new(on_complete),
        }
    }

    /// Forward chunks and the final text to the state sink.
    pub fn relay(relay: Relay) -> Self {
        let complete = relay.clone();
        Self::new(
            move |chunk| relay.emit(RelayEvent::Update(chunk.to_string())),
            move |text| complete.emit(RelayEvent::Complete(text.to_string())),
        )
    }

    /// Callbacks that ignore everything.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    pub fn update(&self, chunk: &str) {
        (self.on_update)(chunk)
    }

    pub fn complete(&self, text: &str) {
        (self.on_complete)(text)
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

struct Pending {
    callbacks: Callbacks,
    done: oneshot::Sender<Result<String, BridgeError>>,
}

type LoadWaiter = oneshot::Sender<Result<(), BridgeError>>;

/// State shared between the session and its reply pump.
struct Shared {
    relay: Relay,
    state: watch::Sender<SessionState>,
    events: Arc<EventBus>,
    pending: Mutex<Option<Pending>>,
    load_waiters: Mutex<Vec<LoadWaiter>>,
    progress: Mutex<HashMap<String, ProgressFilter>>,
    last_stats: Mutex<(u64, f64)>,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            debug!(from = %previous, to = %state, "session state");
            self.events.emit(Event::StateChanged { state });
        }
    }

    fn progress(&self, text: impl Into<String>) {
        self.relay.emit(RelayEvent::Progress(text.into()));
    }

    fn handle(&self, reply: Reply, worker: &WorkerHandle) {
        match reply {
            Reply::ReadyToLoad => {
                self.progress(CAPABILITY_VERIFIED_NOTICE);
                self.set_state(SessionState::Loading);
                if let Err(e) = worker.send(Command::Load) {
                    self.fail_load(e.reason(), |_| BridgeError::WorkerGone);
                }
            }
            Reply::Loading { data } => self.progress(data),
            Reply::Initiate { file } => {
                debug!(%file, "download started");
                self.progress.lock().unwrap().insert(file, ProgressFilter::new());
            }
            Reply::Progress { file, progress } => {
                let step = self
                    .progress
                    .lock()
                    .unwrap()
                    .entry(file)
                    .or_default()
                    .accept(progress);
                if let Some(percent) = step {
                    self.progress(format!("Downloading: {percent}%"));
                }
            }
            Reply::Done { file } => debug!(%file, "download finished"),
            Reply::Ready => {
                self.progress.lock().unwrap().clear();
                self.progress(READY_NOTICE);
                self.relay.emit(RelayEvent::Loaded);
                let mut waiters = self.load_waiters.lock().unwrap();
                self.set_state(SessionState::Ready);
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                info!("model ready");
            }
            Reply::Start => self.set_state(SessionState::Generating),
            Reply::Update {
                output,
                tps,
                num_tokens,
            } => {
                *self.last_stats.lock().unwrap() = (num_tokens, tps);
                let callbacks = self.pending.lock().unwrap().as_ref().map(|p| p.callbacks.clone());
                match callbacks {
                    Some(callbacks) => callbacks.update(&output),
                    None => debug!("update with no pending request"),
                }
            }
            Reply::Complete { output } => {
                self.set_state(SessionState::Ready);
                let (num_tokens, tps) = *self.last_stats.lock().unwrap();
                self.events.emit(Event::GenerationFinished { num_tokens, tps });
                let pending = self.pending.lock().unwrap().take();
                match pending {
                    Some(pending) => {
                        pending.callbacks.complete(&output);
                        let _ = pending.done.send(Ok(output));
                    }
                    None => debug!("completion with no pending request"),
                }
            }
            Reply::Error { data } => self.handle_error(data),
        }
    }

    fn handle_error(&self, data: String) {
        warn!("worker error: {data}");
        self.progress(format!("Error: {data}"));
        match self.state() {
            SessionState::CapabilityChecking => self.fail_load(data, BridgeError::CapabilityUnavailable),
            SessionState::Loading => self.fail_load(data, BridgeError::BackendFault),
            SessionState::Generating | SessionState::Ready => {
                self.set_state(SessionState::Ready);
                let pending = self.pending.lock().unwrap().take();
                if let Some(pending) = pending {
                    pending.callbacks.complete(&format!("{GENERATION_ERROR_PREFIX}{data}"));
                    let _ = pending.done.send(Err(BridgeError::BackendFault(data)));
                }
            }
            SessionState::Uninitialized | SessionState::Failed(_) => {}
        }
    }

    /// Move to `Failed` and reject every waiting `load`.
    fn fail_load(&self, reason: String, error: impl Fn(String) -> BridgeError) {
        let mut waiters = self.load_waiters.lock().unwrap();
        self.set_state(SessionState::Failed(reason.clone()));
        for waiter in waiters.drain(..) {
            let _ = waiter.send(Err(error(reason.clone())));
        }
    }
}

/// One chat session bound to one backend.
pub struct Session {
    backend: Arc<dyn Backend>,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    shared: Arc<Shared>,
    catalog: Arc<LazyCatalog>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, relay: Relay, catalog: LazyCatalog) -> Self {
        Self::with_events(backend, relay, catalog, Arc::new(EventBus::default()))
    }

    pub fn with_events(
        backend: Arc<dyn Backend>,
        relay: Relay,
        catalog: LazyCatalog,
        events: Arc<EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            backend,
            worker: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared {
                relay,
                state,
                events,
                pending: Mutex::new(None),
                load_waiters: Mutex::new(Vec::new()),
                progress: Mutex::new(HashMap::new()),
                last_stats: Mutex::new((0, 0.0)),
            }),
            catalog: Arc::new(catalog),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn catalog(&self) -> &LazyCatalog {
        &self.catalog
    }

    /// Token count and rate of the latest streamed update.
    pub fn last_stats(&self) -> (u64, f64) {
        *self.shared.last_stats.lock().unwrap()
    }

    /// Check capability and load the model, waiting until it is ready.
    ///
    /// Concurrent calls share one load; calling again once ready returns at
    /// once. After a failure the next call starts over from the check.
    pub async fn load(&self) -> Result<(), BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.start_load(Some(tx)).await?;
        rx.await.map_err(|_| BridgeError::WorkerGone)?
    }

    /// Generate a reply to `message`, streaming it to `callbacks`.
    ///
    /// Before the model is loaded this completes the callbacks with a
    /// "still preparing" notice straight away and kicks off loading.
    pub async fn ask(&self, message: &str, callbacks: Callbacks) -> Result<String, BridgeError> {
        let state = self.state();
        if !state.is_loaded() {
            if !state.is_loading()
                && let Err(e) = self.start_load(None).await
            {
                warn!("background load failed to start: {e}");
            }
            callbacks.complete(NOT_READY_MESSAGE);
            return Ok(NOT_READY_MESSAGE.to_string());
        }

        let context = self.catalog.build_context(message).await;
        let messages = build_messages(&context, message);

        let (tx, rx) = oneshot::channel();
        let displaced = self.shared.pending.lock().unwrap().replace(Pending { callbacks, done: tx });
        if let Some(previous) = displaced {
            warn!("new request takes over pending callbacks; the earlier generation keeps running");
            let _ = previous.done.send(Err(BridgeError::Superseded));
        }

        let worker = self.worker().await?;
        if let Err(e) = worker.send(Command::Generate(messages)) {
            self.shared.pending.lock().unwrap().take();
            return Err(e);
        }
        rx.await.map_err(|_| BridgeError::WorkerGone)?
    }

    /// Stop the in-flight generation; it completes with what it has so far.
    pub async fn interrupt(&self) -> Result<(), BridgeError> {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.send(Command::Interrupt),
            None => Ok(()),
        }
    }

    /// Stop generating and drop the conversation cache. The model stays loaded.
    pub async fn reset(&self) -> Result<(), BridgeError> {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.send(Command::Reset),
            None => Ok(()),
        }
    }

    async fn start_load(&self, waiter: Option<LoadWaiter>) -> Result<(), BridgeError> {
        let mut slot = self.worker.lock().await;
        {
            let mut waiters = self.shared.load_waiters.lock().unwrap();
            match self.shared.state() {
                SessionState::Ready | SessionState::Generating => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                    return Ok(());
                }
                SessionState::CapabilityChecking | SessionState::Loading => {
                    waiters.extend(waiter);
                    return Ok(());
                }
                SessionState::Uninitialized | SessionState::Failed(_) => waiters.extend(waiter),
            }
        }

        let worker = self.ensure_worker(&mut slot);
        self.shared.set_state(SessionState::CapabilityChecking);
        info!(backend = self.backend.name(), model = self.backend.model(), "checking capability");
        if let Err(e) = worker.send(Command::Check) {
            self.shared.fail_load(e.reason(), |_| BridgeError::WorkerGone);
            return Err(e);
        }
        Ok(())
    }

    async fn worker(&self) -> Result<WorkerHandle, BridgeError> {
        let mut slot = self.worker.lock().await;
        Ok(self.ensure_worker(&mut slot))
    }

    fn ensure_worker(&self, slot: &mut Option<WorkerHandle>) -> WorkerHandle {
        if let Some(worker) = slot.as_ref()
            && !worker.is_closed()
        {
            return worker.clone();
        }
        let (worker, replies) = worker::spawn(self.backend.clone());
        tokio::spawn(pump(
            self.shared.clone(),
            worker.clone(),
            replies,
            self.shutdown.child_token(),
        ));
        *slot = Some(worker.clone());
        worker
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump(
    shared: Arc<Shared>,
    worker: WorkerHandle,
    mut replies: mpsc::UnboundedReceiver<Reply>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            reply = replies.recv() => match reply {
                Some(reply) => shared.handle(reply, &worker),
                None => break,
            },
        }
    }
    debug!("reply pump stopped");
}

#[async_trait]
impl ChatHandler for Session {
    async fn load(&self) -> Result<(), BridgeError> {
        Session::load(self).await
    }

    async fn ask(&self, message: &str, callbacks: Callbacks) -> Result<String, BridgeError> {
        Session::ask(self, message, callbacks).await
    }
}
