use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt::{self, Display},
    io,
    sync::Arc,
};

use serde_json::{Map, Value};

use crate::{ErrorCode, ErrorObject, ReadError, RequestId};

/// Error returned by request and notification handlers.
///
/// Any `std::error::Error` converts into it with `?`. Its message is kept
/// private unless created through [`bail_public!`](crate::bail_public) or
/// [`Error::with_message`] with `is_public` set, so internal details only reach the
/// peer when `expose_internals` is enabled.
#[derive(Clone)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
    message_is_public: bool,
    data: Option<Value>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    backtrace: Arc<Backtrace>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
            message_is_public: false,
            data: None,
            source: None,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
    pub fn from_message(message: impl Display) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR).with_message(message, false)
    }
    pub fn with_message(self, message: impl Display, is_public: bool) -> Self {
        Self {
            message: Some(message.to_string()),
            message_is_public: is_public,
            ..self
        }
    }
    pub fn with_data(self, data: Value) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::METHOD_NOT_FOUND)
            .with_message(format!("method `{method}` not found"), true)
    }
    pub fn invalid_params(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS).with_message(e, true)
    }
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::REQUEST_CANCELLED)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::REQUEST_CANCELLED
    }
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Converts this error into the object sent to the peer.
    pub fn to_error_object(&self, expose_internals: bool) -> ErrorObject {
        if self.is_cancelled() {
            return ErrorObject::cancelled();
        }
        let message = match &self.message {
            Some(message) if self.message_is_public || expose_internals => message.clone(),
            None if expose_internals => match &self.source {
                Some(source) => source.to_string(),
                None => self.code.message().to_string(),
            },
            _ => self.code.message().to_string(),
        };
        let data = if let Some(data) = &self.data {
            Some(data.clone())
        } else if expose_internals {
            self.internals()
        } else {
            None
        };
        ErrorObject {
            code: self.code,
            message,
            data,
        }
    }
    fn internals(&self) -> Option<Value> {
        let mut data = Map::new();
        if let Some(message) = &self.message {
            data.insert("message".into(), message.clone().into());
        }
        if let Some(source) = &self.source {
            data.insert("source".into(), source.to_string().into());
        }
        if self.backtrace.status() == BacktraceStatus::Captured {
            data.insert(
                "backtrace".into(),
                format!("{:#?}", self.backtrace).into(),
            );
        }
        if data.is_empty() {
            None
        } else {
            Some(Value::Object(data))
        }
    }
}
impl<E> From<E> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self {
            source: Some(Arc::new(e)),
            ..Self::new(ErrorCode::INTERNAL_ERROR)
        }
    }
}
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\n\n{}", self.backtrace)?;
        }
        Ok(())
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(message), Some(source)) => write!(f, "{message}: {source}"),
            (Some(message), None) => write!(f, "{message}"),
            (None, Some(source)) => write!(f, "{source}"),
            (None, None) => write!(f, "{}", self.code.message()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returns early from a handler with a private internal error.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return ::std::result::Result::Err(
            $crate::Error::from_message(::std::format!($($arg)*)).into()
        )
    };
}

/// Returns early from a handler with an error whose message is sent to the peer.
///
/// Pass `_` as the code for `InternalError`.
#[macro_export]
macro_rules! bail_public {
    (_, $($arg:tt)*) => {
        $crate::bail_public!($crate::ErrorCode::INTERNAL_ERROR, $($arg)*)
    };
    ($code:expr, $($arg:tt)*) => {
        return ::std::result::Result::Err(
            $crate::Error::new($code)
                .with_message(::std::format!($($arg)*), true)
                .into()
        )
    };
}

/// Error observed by the local side of a session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Remote(ErrorObject),
    #[error("request cancelled")]
    Cancelled,
    #[error("session shut down")]
    Shutdown,
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("failed to serialize params: {0}")]
    Serialize(Arc<serde_json::Error>),
    #[error("failed to deserialize result: {0}")]
    Deserialize(Arc<serde_json::Error>),
    #[error("method `{0}` is not part of the remote interface")]
    UnknownMethod(String),
    #[error("method `{method}` is a {expected}, not a {actual}")]
    MethodKindMismatch {
        method: String,
        expected: crate::MethodKind,
        actual: crate::MethodKind,
    },
    #[error("request id overflow")]
    RequestIdOverflow,
}
impl SessionError {
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Remote(e) => e.code == ErrorCode::REQUEST_CANCELLED,
            _ => false,
        }
    }
}
impl From<ErrorObject> for SessionError {
    fn from(e: ErrorObject) -> Self {
        Self::Remote(e)
    }
}
impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Non-fatal condition reported to the session's error listener.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Read(ReadError),
    #[error("unmatched response for request id {0}")]
    UnmatchedResponse(RequestId),
    #[error("unmatched cancel notification for request id {0}")]
    UnmatchedCancel(RequestId),
    #[error("invalid `$/cancelRequest` params: {0}")]
    InvalidCancelParams(#[source] serde_json::Error),
    #[error("notification for unknown method `{0}`")]
    UnknownNotification(String),
    #[error("notification `{method}` failed: {error}")]
    NotificationFailed { method: String, error: Error },
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(RequestId),
}

/// Receives every non-fatal protocol error of a session.
pub type ErrorListener = Arc<dyn Fn(&ProtocolError) + Send + Sync>;

/// Converts a failed handler result into the error sent to the peer.
pub type ErrorMapper = Arc<dyn Fn(&Error) -> ErrorObject + Send + Sync>;

pub(crate) fn default_error_listener() -> ErrorListener {
    Arc::new(|e: &ProtocolError| tracing::warn!(error = %e, "jsonrpc protocol error"))
}

pub(crate) fn default_error_mapper(expose_internals: bool) -> ErrorMapper {
    Arc::new(move |e: &Error| e.to_error_object(expose_internals))
}
