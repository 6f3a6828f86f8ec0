use std::{
    collections::{BTreeMap, BTreeSet, HashMap, hash_map},
    future::Future,
    mem,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
};

use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    CANCEL_REQUEST_METHOD, CancelParams, Error, ErrorCode, ErrorListener, ErrorMapper,
    ErrorObject, Interface, LocalEndpoint, Message, NotificationMessage, ProtocolError, ReadError,
    RequestContext, RequestId, RequestMessage, ResponseMessage, SessionContext, SessionError,
    SessionResult,
};


// Ids of locally cancelled requests whose late responses are dropped without a report.
const MAX_CANCELLED_IDS: usize = 1024;

enum OutgoingRequestState {
    None,
    Waker(Waker),
    Ready(SessionResult<Value>),
    End,
}
impl OutgoingRequestState {
    fn poll(&mut self, waker: &Waker) -> Poll<SessionResult<Value>> {
        match mem::replace(self, Self::End) {
            Self::None | Self::Waker(_) => {
                *self = Self::Waker(waker.clone());
                Poll::Pending
            }
            Self::Ready(result) => Poll::Ready(result),
            Self::End => panic!("poll after ready"),
        }
    }
    fn set_ready(&mut self, result: SessionResult<Value>) {
        match mem::replace(self, Self::Ready(result)) {
            Self::None => {}
            Self::Waker(waker) => waker.wake(),
            Self::Ready(_) => unreachable!(),
            Self::End => *self = Self::End,
        }
    }
}

struct OutgoingRequest {
    method: String,
    state: Arc<Mutex<OutgoingRequestState>>,
}

#[derive(Default)]
struct OutgoingRequests {
    pending: BTreeMap<u64, OutgoingRequest>,
    cancelled: BTreeSet<u64>,
}
impl OutgoingRequests {
    fn remember_cancelled(&mut self, id: u64) {
        self.cancelled.insert(id);
        if self.cancelled.len() > MAX_CANCELLED_IDS {
            self.cancelled.pop_first();
        }
    }
}

struct IncomingRequest {
    method: String,
    token: CancellationToken,
}

pub(crate) struct RawRemote {
    out: tokio::sync::mpsc::UnboundedSender<Message>,
    local: Box<dyn LocalEndpoint>,
    runtime: Handle,
    map_error: ErrorMapper,
    listener: ErrorListener,
    remote_interface: Option<Interface>,
    next_id: AtomicU64,
    outgoing: Mutex<OutgoingRequests>,
    incoming: Mutex<HashMap<RequestId, IncomingRequest>>,
}

impl RawRemote {
    fn outgoing(&self) -> MutexGuard<OutgoingRequests> {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn incoming(&self) -> MutexGuard<HashMap<RequestId, IncomingRequest>> {
        self.incoming.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: Message) -> SessionResult<()> {
        self.out.send(message).map_err(|_| SessionError::Shutdown)
    }
    fn report(&self, error: ProtocolError) {
        (self.listener)(&error);
    }

    fn cancel_outgoing(&self, id: u64) {
        let entry = {
            let mut outgoing = self.outgoing();
            let entry = outgoing.pending.remove(&id);
            if entry.is_some() {
                outgoing.remember_cancelled(id);
            }
            entry
        };
        let Some(entry) = entry else {
            return;
        };
        tracing::debug!(id, method = %entry.method, "cancelling outgoing request");
        lock(&entry.state).set_ready(Err(SessionError::Cancelled));
        let params = json!({ "id": id });
        if let Err(e) = self.send(Message::notification(CANCEL_REQUEST_METHOD, Some(params))) {
            tracing::debug!(id, "cancel notification not sent: {e}");
        }
    }
}

/// The protocol state machine of one connection.
///
/// Turns local calls into outgoing messages and routes incoming messages to the
/// pending outgoing request they answer or to the [`LocalEndpoint`].
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct RemoteEndpoint(Arc<RawRemote>);

impl RemoteEndpoint {
    pub fn new(
        out: tokio::sync::mpsc::UnboundedSender<Message>,
        local: impl LocalEndpoint,
        runtime: Handle,
    ) -> Self {
        RemoteEndpointBuilder::new(local).build(out, runtime)
    }
    pub fn builder(local: impl LocalEndpoint) -> RemoteEndpointBuilder {
        RemoteEndpointBuilder::new(local)
    }

    pub(crate) fn downgrade(&self) -> Weak<RawRemote> {
        Arc::downgrade(&self.0)
    }
    pub(crate) fn from_raw(raw: Arc<RawRemote>) -> Self {
        Self(raw)
    }

    pub fn remote_interface(&self) -> Option<&Interface> {
        self.0.remote_interface.as_ref()
    }

    /// Sends a notification to the peer.
    pub fn notify(&self, method: &str, params: Option<Value>) -> SessionResult<()> {
        self.0.send(Message::notification(method, params))
    }

    /// Sends a request to the peer.
    ///
    /// Cancelling or dropping the returned future before it completes sends
    /// `$/cancelRequest` to the peer.
    pub fn request(&self, method: &str, params: Option<Value>) -> ResponseFuture {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(OutgoingRequestState::None));
        let future = ResponseFuture {
            id,
            state: state.clone(),
            remote: self.downgrade(),
        };
        if id > i64::MAX as u64 {
            lock(&state).set_ready(Err(SessionError::RequestIdOverflow));
            return future;
        }
        self.0.outgoing().pending.insert(
            id,
            OutgoingRequest {
                method: method.to_string(),
                state: state.clone(),
            },
        );
        let m = Message::request(id as i64, method, params);
        if let Err(e) = self.0.send(m) {
            if self.0.outgoing().pending.remove(&id).is_some() {
                lock(&state).set_ready(Err(e));
            }
        }
        future
    }

    /// Method of a still pending outgoing request.
    pub fn resolve_method(&self, id: &RequestId) -> Option<String> {
        let id = u64::try_from(id).ok()?;
        let outgoing = self.0.outgoing();
        outgoing.pending.get(&id).map(|r| r.method.clone())
    }

    /// Routes one incoming message.
    ///
    /// Only starts handling: request handlers run on the runtime and answer
    /// when they complete, in completion order.
    pub fn consume(&self, message: Message) {
        match message {
            Message::Response(m) => self.on_response(m),
            Message::Notification(m) if m.method == CANCEL_REQUEST_METHOD => {
                self.on_cancel_request(m)
            }
            Message::Notification(m) => self.on_notification(m),
            Message::Request(m) => self.on_request(m),
        }
    }

    /// Reports a recoverable read failure, answering `InvalidRequest` when the
    /// malformed message was a request.
    pub fn reject(&self, error: ReadError) {
        if let ReadError::InvalidMessage(e) = &error {
            if let Some(id) = e.request_id() {
                let error = ErrorObject::new(ErrorCode::INVALID_REQUEST, e.to_string());
                self.send_response(id.clone(), Err(error));
            }
        }
        self.0.report(ProtocolError::Read(error));
    }

    /// Fails every pending outgoing request with [`SessionError::Shutdown`] and
    /// cancels every running request handler.
    pub fn close(&self) {
        let pending = mem::take(&mut self.0.outgoing().pending);
        for (_, r) in pending {
            lock(&r.state).set_ready(Err(SessionError::Shutdown));
        }
        for r in self.0.incoming().values() {
            r.token.cancel();
        }
    }

    fn on_response(&self, m: ResponseMessage) {
        let entry = match u64::try_from(&m.id) {
            Ok(id) => {
                let mut outgoing = self.0.outgoing();
                let entry = outgoing.pending.remove(&id);
                if entry.is_none() && outgoing.cancelled.remove(&id) {
                    tracing::trace!(id = %m.id, "dropping response to cancelled request");
                    return;
                }
                entry
            }
            Err(()) => None,
        };
        let Some(entry) = entry else {
            self.0.report(ProtocolError::UnmatchedResponse(m.id));
            return;
        };
        tracing::trace!(id = %m.id, method = %entry.method, ok = m.result.is_ok(), "response");
        lock(&entry.state).set_ready(m.result.map_err(SessionError::Remote));
    }

    fn on_cancel_request(&self, m: NotificationMessage) {
        let params = match CancelParams::from_params(m.params) {
            Ok(params) => params,
            Err(e) => return self.0.report(ProtocolError::InvalidCancelParams(e)),
        };
        let incoming = self.0.incoming();
        if let Some(r) = incoming.get(&params.id) {
            tracing::debug!(id = %params.id, method = %r.method, "request cancelled by peer");
            r.token.cancel();
        } else {
            drop(incoming);
            self.0.report(ProtocolError::UnmatchedCancel(params.id));
        }
    }

    fn on_notification(&self, m: NotificationMessage) {
        tracing::trace!(method = %m.method, "notification");
        if let Err(error) = self.0.local.notify(&m.method, m.params) {
            let e = if error.code() == ErrorCode::METHOD_NOT_FOUND {
                ProtocolError::UnknownNotification(m.method)
            } else {
                ProtocolError::NotificationFailed {
                    method: m.method,
                    error,
                }
            };
            self.0.report(e);
        }
    }

    fn on_request(&self, m: RequestMessage) {
        tracing::trace!(id = %m.id, method = %m.method, "request");
        let token = CancellationToken::new();
        let inserted = match self.0.incoming().entry(m.id.clone()) {
            hash_map::Entry::Occupied(_) => false,
            hash_map::Entry::Vacant(e) => {
                e.insert(IncomingRequest {
                    method: m.method.clone(),
                    token: token.clone(),
                });
                true
            }
        };
        if inserted {
            return self.spawn_request(m, token);
        }
        let error = ErrorObject::new(
            ErrorCode::INVALID_REQUEST,
            format!("request id {} is already in use", m.id),
        );
        self.send_response(m.id.clone(), Err(error));
        self.0.report(ProtocolError::DuplicateRequestId(m.id));
    }

    fn spawn_request(&self, m: RequestMessage, token: CancellationToken) {
        let cx = RequestContext::new(
            m.id.clone(),
            token.clone(),
            SessionContext::new(self.downgrade()),
        );
        let handler = self
            .0
            .runtime
            .spawn(self.0.local.request(&m.method, m.params, cx));
        let remote = self.clone();
        let id = m.id;
        self.0.runtime.spawn(async move {
            let abort = handler.abort_handle();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    abort.abort();
                    Err(Error::cancelled())
                }
                result = handler => match result {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(Error::from_message("request handler panicked")),
                    Err(_) => Err(Error::cancelled()),
                },
            };
            remote.complete_request(id, result);
        });
    }

    fn complete_request(&self, id: RequestId, result: crate::Result<Value>) {
        let result = result.map_err(|e| {
            if e.is_cancelled() {
                ErrorObject::cancelled()
            } else {
                (self.0.map_error)(&e)
            }
        });
        // Removed before the response is queued so the peer may reuse the id at once.
        self.0.incoming().remove(&id);
        self.send_response(id, result);
    }

    fn send_response(&self, id: RequestId, result: Result<Value, ErrorObject>) {
        if let Err(e) = self.0.send(Message::response(id.clone(), result)) {
            tracing::debug!(%id, "response not sent: {e}");
        }
    }
}

/// Configures a [`RemoteEndpoint`].
pub struct RemoteEndpointBuilder {
    local: Box<dyn LocalEndpoint>,
    map_error: Option<ErrorMapper>,
    listener: Option<ErrorListener>,
    remote_interface: Option<Interface>,
    expose_internals: bool,
}

impl RemoteEndpointBuilder {
    fn new(local: impl LocalEndpoint) -> Self {
        Self {
            local: Box::new(local),
            map_error: None,
            listener: None,
            remote_interface: None,
            expose_internals: cfg!(debug_assertions),
        }
    }
    /// Used by the default error mapper.
    pub fn expose_internals(mut self, expose_internals: bool) -> Self {
        self.expose_internals = expose_internals;
        self
    }
    pub fn error_mapper(
        mut self,
        f: impl Fn(&Error) -> ErrorObject + Send + Sync + 'static,
    ) -> Self {
        self.map_error = Some(Arc::new(f));
        self
    }
    pub fn error_listener(mut self, f: impl Fn(&ProtocolError) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(f));
        self
    }
    pub fn remote_interface(mut self, interface: Interface) -> Self {
        self.remote_interface = Some(interface);
        self
    }

    pub fn build(
        self,
        out: tokio::sync::mpsc::UnboundedSender<Message>,
        runtime: Handle,
    ) -> RemoteEndpoint {
        RemoteEndpoint(Arc::new(RawRemote {
            out,
            local: self.local,
            runtime,
            map_error: self
                .map_error
                .unwrap_or_else(|| crate::error::default_error_mapper(self.expose_internals)),
            listener: self
                .listener
                .unwrap_or_else(crate::error::default_error_listener),
            remote_interface: self.remote_interface,
            next_id: AtomicU64::new(1),
            outgoing: Mutex::new(OutgoingRequests::default()),
            incoming: Mutex::new(HashMap::new()),
        }))
    }
}

/// Result of [`RemoteEndpoint::request`].
///
/// Completes with the peer's result, the peer's error as [`SessionError::Remote`],
/// or [`SessionError::Cancelled`] once cancelled locally.
pub struct ResponseFuture {
    id: u64,
    state: Arc<Mutex<OutgoingRequestState>>,
    remote: Weak<RawRemote>,
}

impl ResponseFuture {
    pub fn id(&self) -> RequestId {
        RequestId::Number(self.id as i64)
    }

    /// Cancels the request if it is still pending.
    ///
    /// The future completes with [`SessionError::Cancelled`] immediately; the peer
    /// is notified with `$/cancelRequest` at most once.
    pub fn cancel(&self) {
        if let Some(remote) = self.remote.upgrade() {
            remote.cancel_outgoing(self.id);
        }
    }
}

impl Future for ResponseFuture {
    type Output = SessionResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        lock(&self.state).poll(cx.waker())
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
