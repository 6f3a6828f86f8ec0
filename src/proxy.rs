use std::sync::{Arc, Weak};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    MethodKind, RemoteEndpoint, ResponseFuture, SessionError, SessionResult, remote::RawRemote,
};

/// Params for methods that take none.
pub const NO_PARAMS: Option<&()> = None;

/// Typed access to the peer of a session.
#[derive(Clone)]
pub struct RemoteProxy(RemoteEndpoint);

impl RemoteProxy {
    pub fn new(remote: RemoteEndpoint) -> Self {
        Self(remote)
    }
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.0
    }

    /// Sends a request and waits for its result.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn request<R>(
        &self,
        method: &str,
        params: Option<&impl Serialize>,
    ) -> SessionResult<R>
    where
        R: DeserializeOwned,
    {
        let value = self.call(method, params)?.await?;
        serde_json::from_value(value).map_err(|e| SessionError::Deserialize(Arc::new(e)))
    }

    /// Sends a request and returns the pending response, which can be cancelled
    /// with [`ResponseFuture::cancel`].
    pub fn call(
        &self,
        method: &str,
        params: Option<&impl Serialize>,
    ) -> SessionResult<ResponseFuture> {
        self.check(method, MethodKind::Request)?;
        Ok(self.0.request(method, to_params(params)?))
    }

    pub fn notification(&self, method: &str, params: Option<&impl Serialize>) -> SessionResult<()> {
        self.check(method, MethodKind::Notification)?;
        self.0.notify(method, to_params(params)?)
    }

    fn check(&self, method: &str, kind: MethodKind) -> SessionResult<()> {
        let Some(interface) = self.0.remote_interface() else {
            return Ok(());
        };
        let Some(entry) = interface.resolve(method) else {
            return Err(SessionError::UnknownMethod(method.to_string()));
        };
        if entry.kind() != kind {
            return Err(SessionError::MethodKindMismatch {
                method: method.to_string(),
                expected: entry.kind(),
                actual: kind,
            });
        }
        Ok(())
    }
}

fn to_params(params: Option<&impl Serialize>) -> SessionResult<Option<Value>> {
    params
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| SessionError::Serialize(Arc::new(e)))
}

/// Access to the peer from inside a request handler.
///
/// Does not keep the session alive; calls fail with [`SessionError::Shutdown`]
/// once it is gone.
#[derive(Clone)]
pub struct SessionContext(Weak<RawRemote>);

impl SessionContext {
    pub(crate) fn new(remote: Weak<RawRemote>) -> Self {
        Self(remote)
    }

    pub fn remote(&self) -> SessionResult<RemoteProxy> {
        let raw = self.0.upgrade().ok_or(SessionError::Shutdown)?;
        Ok(RemoteProxy(RemoteEndpoint::from_raw(raw)))
    }

    pub async fn request<R>(
        &self,
        method: &str,
        params: Option<&impl Serialize>,
    ) -> SessionResult<R>
    where
        R: DeserializeOwned,
    {
        let call = self.remote()?.call(method, params)?;
        let value = call.await?;
        serde_json::from_value(value).map_err(|e| SessionError::Deserialize(Arc::new(e)))
    }

    pub fn notification(&self, method: &str, params: Option<&impl Serialize>) -> SessionResult<()> {
        self.remote()?.notification(method, params)
    }
}
