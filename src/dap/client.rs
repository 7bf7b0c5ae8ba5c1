//! DAP protocol client.
//!
//! One [`ProtocolClient`] exists per physical backend connection. A dedicated reader thread
//! owns the receiving half of the transport: responses are matched to outstanding
//! requests by `request_seq`, events are dispatched to subscribers in registration order
//! and reverse requests are answered.
//!
//! Requests are only issued from the orchestration layer. Event handlers run on the
//! reader thread and any attempt to call [`ProtocolClient::send`] from one of them fails
//! with [`Error::Protocol`], because the response it would wait for could only be
//! delivered by the very thread that is blocked.

use crate::dap::protocol::{Event, Message, Request, Response, ReverseRequest, ReverseResponse};
use crate::dap::transport::{MessageReader, MessageWriter, Transport};
use crate::error::{Error, Result};
use crate::session::SessionId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Event handler. Second argument is the session the event was routed to.
pub type EventHandler = Arc<dyn Fn(&Event, Option<SessionId>) + Send + Sync>;

/// Reverse request handler, returns a response body or a failure message.
pub type ReverseHandler =
    Arc<dyn Fn(&ReverseRequest) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Liveness of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name used in logs and as reader thread name.
    pub name: String,
    /// Default bound for [`ProtocolClient::send`].
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: "dap".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct CloseReason {
    protocol: bool,
    message: String,
}

impl CloseReason {
    fn from_error(err: &Error) -> Self {
        Self {
            protocol: matches!(err, Error::Protocol(_)),
            message: match err {
                Error::Protocol(m) | Error::Connection(m) => m.clone(),
                other => other.to_string(),
            },
        }
    }

    fn to_error(&self) -> Error {
        if self.protocol {
            Error::Protocol(self.message.clone())
        } else {
            Error::Connection(self.message.clone())
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    event: String,
    scope: Option<SessionId>,
    handler: EventHandler,
}

struct Waiter {
    id: u64,
    event: String,
    tx: Sender<Result<Event>>,
}

/// Everything that must change atomically with the close state.
#[derive(Default)]
struct Inflight {
    closed: Option<CloseReason>,
    pending: HashMap<i64, Sender<Result<Response>>>,
    waiters: Vec<Waiter>,
}

/// Event routing table: parent session plus child sessions keyed by thread id.
#[derive(Default)]
struct Routes {
    owner: Option<SessionId>,
    threads: HashMap<i64, SessionId>,
}

struct Shared {
    name: String,
    writer: Mutex<Box<dyn MessageWriter>>,
    next_seq: AtomicI64,
    next_id: AtomicU64,
    inflight: Mutex<Inflight>,
    subscriptions: RwLock<Vec<Subscription>>,
    reverse_handlers: RwLock<HashMap<String, ReverseHandler>>,
    routes: RwLock<Routes>,
}

impl Shared {
    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn complete(&self, response: Response) {
        let tx = self.inflight.lock().pending.remove(&response.request_seq);
        match tx {
            Some(tx) => {
                _ = tx.send(Ok(response));
            }
            None => log::debug!(
                target: "dap",
                "[{}] dropping response to `{}` (request_seq {}), nobody waits for it",
                self.name,
                response.command,
                response.request_seq
            ),
        }
    }

    fn route(&self, event: &Event) -> Option<SessionId> {
        let routes = self.routes.read();
        event
            .thread_id()
            .and_then(|tid| routes.threads.get(&tid).copied())
            .or(routes.owner)
    }

    fn dispatch(&self, event: Event) {
        let target = self.route(&event);
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.event == event.event)
            .filter(|s| s.scope.is_none() || s.scope == target)
            .map(|s| s.handler.clone())
            .collect();

        DISPATCHING.with(|d| d.set(true));
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event, target))).is_err() {
                log::error!(target: "dap", "[{}] `{}` event handler panicked", self.name, event.event);
            }
        }
        DISPATCHING.with(|d| d.set(false));

        let waiters: Vec<Waiter> = {
            let mut inflight = self.inflight.lock();
            let (matched, rest): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut inflight.waiters)
                .into_iter()
                .partition(|w| w.event == event.event);
            inflight.waiters = rest;
            matched
        };
        for w in waiters {
            _ = w.tx.send(Ok(event.clone()));
        }
    }

    fn answer(&self, request: ReverseRequest) {
        let handler = self.reverse_handlers.read().get(&request.command).cloned();
        let outcome = match handler {
            Some(handler) => {
                DISPATCHING.with(|d| d.set(true));
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&request)))
                    .unwrap_or_else(|_| Err("reverse request handler panicked".to_string()));
                DISPATCHING.with(|d| d.set(false));
                outcome
            }
            None => Err(format!("reverse request `{}` is not supported", request.command)),
        };

        let (success, message, body) = match outcome {
            Ok(body) => (true, None, body),
            Err(message) => (false, Some(message), Value::Null),
        };
        let mut writer = self.writer.lock();
        let response = ReverseResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command,
            message,
            body,
        };
        let written = serde_json::to_value(&response)
            .map_err(Error::from)
            .and_then(|v| writer.write_message(&v));
        if let Err(e) = written {
            log::warn!(target: "dap", "[{}] answer reverse request: {e:#}", self.name);
        }
    }

    /// Mark connection closed and fail everything that waits on it. First reason wins.
    fn close(&self, reason: CloseReason) {
        let (pending, waiters) = {
            let mut inflight = self.inflight.lock();
            if inflight.closed.is_none() {
                inflight.closed = Some(reason);
            }
            (
                std::mem::take(&mut inflight.pending),
                std::mem::take(&mut inflight.waiters),
            )
        };
        let reason = self.close_reason().unwrap_or(CloseReason {
            protocol: false,
            message: "closed".to_string(),
        });
        for (_, tx) in pending {
            _ = tx.send(Err(reason.to_error()));
        }
        for w in waiters {
            _ = w.tx.send(Err(reason.to_error()));
        }
        self.writer.lock().shutdown();
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.inflight.lock().closed.clone()
    }

    fn forget_pending(&self, seq: i64) {
        self.inflight.lock().pending.remove(&seq);
    }

    fn forget_waiter(&self, id: u64) {
        self.inflight.lock().waiters.retain(|w| w.id != id);
    }
}

/// Closes the connection however the reader thread ends, unwinding included.
struct ReaderGuard(Arc<Shared>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if self.0.close_reason().is_none() {
            log::error!(target: "dap", "[{}] reader thread stopped unexpectedly", self.0.name);
            self.0.close(CloseReason {
                protocol: true,
                message: "reader thread stopped unexpectedly".to_string(),
            });
        }
    }
}

fn reader_loop(shared: Arc<Shared>, mut reader: Box<dyn MessageReader>) {
    let _guard = ReaderGuard(shared.clone());
    loop {
        let message = reader.read_message().and_then(Message::from_value);
        match message {
            Ok(Message::Response(response)) => shared.complete(response),
            Ok(Message::Event(event)) => {
                log::trace!(target: "dap", "[{}] event `{}`", shared.name, event.event);
                shared.dispatch(event)
            }
            Ok(Message::Request(request)) => shared.answer(request),
            Err(err) => {
                if matches!(err, Error::Protocol(_)) {
                    log::error!(target: "dap", "[{}] closing transport: {err}", shared.name);
                } else {
                    log::debug!(target: "dap", "[{}] transport closed: {err}", shared.name);
                }
                shared.close(CloseReason::from_error(&err));
                return;
            }
        }
    }
}

/// Response that has been requested but not awaited yet.
pub struct PendingResponse {
    seq: i64,
    command: String,
    rx: Receiver<Result<Response>>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Wait for the response. Expiry means "stop waiting", the request is not revoked.
    pub fn wait(self, timeout: Duration) -> Result<Response> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::timeout(
                format!("`{}` response", self.command),
                timeout,
            )),
            Err(RecvTimeoutError::Disconnected) => Err(self
                .shared
                .close_reason()
                .map(|r| r.to_error())
                .unwrap_or_else(|| Error::Connection("response channel closed".to_string()))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.forget_pending(self.seq);
    }
}

/// One-shot waiter for an event, registered before the request that triggers it.
pub struct EventWaiter {
    id: u64,
    event: String,
    rx: Receiver<Result<Event>>,
    shared: Arc<Shared>,
}

impl EventWaiter {
    pub fn wait(self, timeout: Duration) -> Result<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::timeout(format!("`{}` event", self.event), timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self
                .shared
                .close_reason()
                .map(|r| r.to_error())
                .unwrap_or_else(|| Error::Connection("event channel closed".to_string()))),
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.shared.forget_waiter(self.id);
    }
}

pub struct ProtocolClient {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl ProtocolClient {
    /// Take ownership of a transport and start the reader thread.
    pub fn start(transport: Transport, options: ClientOptions) -> Result<Arc<Self>> {
        let Transport { reader, writer } = transport;
        let shared = Arc::new(Shared {
            name: options.name.clone(),
            writer: Mutex::new(writer),
            next_seq: AtomicI64::new(1),
            next_id: AtomicU64::new(1),
            inflight: Mutex::new(Inflight::default()),
            subscriptions: RwLock::new(vec![]),
            reverse_handlers: RwLock::new(HashMap::new()),
            routes: RwLock::new(Routes::default()),
        });

        thread::Builder::new()
            .name(format!("{}-reader", options.name))
            .spawn({
                let shared = shared.clone();
                move || reader_loop(shared, reader)
            })?;

        Ok(Arc::new(Self {
            shared,
            request_timeout: options.request_timeout,
        }))
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request without waiting for its response.
    pub fn send_no_wait(&self, command: &str, arguments: Value) -> Result<PendingResponse> {
        if DISPATCHING.with(Cell::get) {
            return Err(Error::Protocol(format!(
                "request `{command}` issued from an event handler"
            )));
        }

        let (tx, rx) = bounded(1);
        let mut writer = self.shared.writer.lock();
        let seq = self.shared.next_seq();
        {
            let mut inflight = self.shared.inflight.lock();
            if let Some(reason) = &inflight.closed {
                return Err(reason.to_error());
            }
            inflight.pending.insert(seq, tx);
        }
        let pending = PendingResponse {
            seq,
            command: command.to_string(),
            rx,
            shared: self.shared.clone(),
        };

        log::debug!(target: "dap", "[{}] -> `{command}` (seq {seq})", self.shared.name);
        let request = serde_json::to_value(Request::new(seq, command, arguments))?;
        // dropping `pending` on error forgets the registration
        writer.write_message(&request)?;
        Ok(pending)
    }

    /// Send a request and wait for the matching response with the default timeout.
    ///
    /// The response is returned as is, unsuccessful responses are not an error here.
    pub fn send(&self, command: &str, arguments: Value) -> Result<Response> {
        self.send_with_timeout(command, arguments, self.request_timeout)
    }

    pub fn send_with_timeout(
        &self,
        command: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Response> {
        self.send_no_wait(command, arguments)?.wait(timeout)
    }

    /// Like [`ProtocolClient::send`] but unsuccessful responses turn into [`Error::RequestFailed`].
    pub fn request(&self, command: &str, arguments: Value) -> Result<Response> {
        self.send(command, arguments)?.into_result()
    }

    /// Register a handler for every event named `event`, whatever session it routes to.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Event, Option<SessionId>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add_subscription(event, None, Arc::new(handler))
    }

    /// Register a handler for events named `event` routed to `session` only.
    pub fn subscribe_session(
        &self,
        session: SessionId,
        event: &str,
        handler: impl Fn(&Event, Option<SessionId>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add_subscription(event, Some(session), Arc::new(handler))
    }

    fn add_subscription(
        &self,
        event: &str,
        scope: Option<SessionId>,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.shared.subscriptions.write().push(Subscription {
            id,
            event: event.to_string(),
            scope,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscriptions.write().retain(|s| s.id != id);
    }

    /// Register a one-shot waiter for the next `event`.
    pub fn expect_event(&self, event: &str) -> EventWaiter {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        {
            let mut inflight = self.shared.inflight.lock();
            match &inflight.closed {
                Some(reason) => {
                    _ = tx.send(Err(reason.to_error()));
                }
                None => inflight.waiters.push(Waiter {
                    id,
                    event: event.to_string(),
                    tx,
                }),
            }
        }
        EventWaiter {
            id,
            event: event.to_string(),
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Answer reverse requests named `command` with `handler`.
    pub fn on_reverse_request(
        &self,
        command: &str,
        handler: impl Fn(&ReverseRequest) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) {
        self.shared
            .reverse_handlers
            .write()
            .insert(command.to_string(), Arc::new(handler));
    }

    /// Set session that receives every event not claimed by a child route.
    pub fn set_owner(&self, session: SessionId) {
        self.shared.routes.write().owner = Some(session);
    }

    /// Route events carrying `thread_id` to a child session.
    pub fn add_route(&self, thread_id: i64, session: SessionId) {
        self.shared.routes.write().threads.insert(thread_id, session);
    }

    /// Drop every route pointing at `session`.
    pub fn remove_routes(&self, session: SessionId) {
        self.shared
            .routes
            .write()
            .threads
            .retain(|_, s| *s != session);
    }

    /// Session an event would be delivered to.
    pub fn route(&self, event: &Event) -> Option<SessionId> {
        self.shared.route(event)
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.close_reason() {
            None => ConnectionState::Connected,
            Some(_) => ConnectionState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Close the transport. Outstanding requests fail with [`Error::Connection`].
    pub fn close(&self) {
        self.shared.close(CloseReason {
            protocol: false,
            message: "connection closed by client".to_string(),
        });
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
