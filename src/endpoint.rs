use std::{future::ready, sync::Arc};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    BoxFuture, Error, MethodRegistry, Params, RequestId, Result, SessionContext, registry::Route,
};

/// The local side of a connection: receives the peer's requests and notifications.
pub trait LocalEndpoint: Send + Sync + 'static {
    /// Handles a notification.
    ///
    /// Returns an error with [`ErrorCode::METHOD_NOT_FOUND`](crate::ErrorCode::METHOD_NOT_FOUND)
    /// for unknown methods; the error is reported, never answered.
    fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Starts handling a request and returns its result as a future.
    ///
    /// The future is dropped if the peer cancels the request.
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cx: RequestContext,
    ) -> BoxFuture<Result<Value>>;
}

/// Accepts nothing: every request is answered with `MethodNotFound`.
impl LocalEndpoint for () {
    fn notify(&self, method: &str, _params: Option<Value>) -> Result<()> {
        Err(Error::method_not_found(method))
    }
    fn request(
        &self,
        method: &str,
        _params: Option<Value>,
        _cx: RequestContext,
    ) -> BoxFuture<Result<Value>> {
        Box::pin(ready(Err(Error::method_not_found(method))))
    }
}

impl<T: LocalEndpoint> LocalEndpoint for Arc<T> {
    fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        (**self).notify(method, params)
    }
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cx: RequestContext,
    ) -> BoxFuture<Result<Value>> {
        (**self).request(method, params, cx)
    }
}

/// Dispatches to a service object through its [`MethodRegistry`].
pub struct ServiceEndpoint<S> {
    service: Arc<S>,
    registry: Arc<MethodRegistry<S>>,
}

impl<S> ServiceEndpoint<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(service: S, registry: MethodRegistry<S>) -> Self {
        Self::from_arc(Arc::new(service), Arc::new(registry))
    }
    pub fn from_arc(service: Arc<S>, registry: Arc<MethodRegistry<S>>) -> Self {
        Self { service, registry }
    }
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }
    pub fn registry(&self) -> &Arc<MethodRegistry<S>> {
        &self.registry
    }
}

impl<S> LocalEndpoint for ServiceEndpoint<S>
where
    S: Send + Sync + 'static,
{
    fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        match self.registry.route(method) {
            Some(Route::Notification(f)) => f(&self.service, Params::new(params)),
            Some(Route::Request(_)) => Err(wrong_kind(method, "request")),
            None => Err(Error::method_not_found(method)),
        }
    }

    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cx: RequestContext,
    ) -> BoxFuture<Result<Value>> {
        match self.registry.route(method) {
            Some(Route::Request(f)) => f(self.service.clone(), Params::new(params), cx),
            Some(Route::Notification(_)) => {
                Box::pin(ready(Err(wrong_kind(method, "notification"))))
            }
            None => Box::pin(ready(Err(Error::method_not_found(method)))),
        }
    }
}

fn wrong_kind(method: &str, kind: &str) -> Error {
    Error::new(crate::ErrorCode::INVALID_REQUEST)
        .with_message(format!("method `{method}` is a {kind}"), true)
}

/// Handed to a request handler: the request's id, its cancellation state, and
/// access to the peer.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    token: CancellationToken,
    session: SessionContext,
}

impl RequestContext {
    pub(crate) fn new(id: RequestId, token: CancellationToken, session: SessionContext) -> Self {
        Self { id, token, session }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }
    /// Whether the peer sent `$/cancelRequest` for this request.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
    /// Completes when the peer cancels this request.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
    /// Fails with a cancellation error if the peer cancelled this request.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }
    pub fn session(&self) -> &SessionContext {
        &self.session
    }
}
