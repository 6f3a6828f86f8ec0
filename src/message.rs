use std::fmt;

use derive_ex::derive_ex;
use ordered_float::OrderedFloat;
use parse_display::Display;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, DeserializeOwned},
    ser::SerializeStruct,
};
use serde_json::Value;

use crate::utils::write_string_no_escape;


pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the notification that asks the peer to cancel an in-flight request.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

#[derive(Debug, Serialize, Deserialize, Clone, Display)]
#[derive_ex(Eq, PartialEq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    #[display("{0}")]
    Number(i64),
    #[display("{0}")]
    Float(#[eq(key = OrderedFloat($))] f64),
    #[display("\"{0}\"")]
    String(String),
}
const MAX_SAFE_INTEGER: u64 = 9007199254740991;

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}
impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}
impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}
impl TryFrom<&RequestId> for u64 {
    type Error = ();
    fn try_from(id: &RequestId) -> Result<u64, ()> {
        match id {
            RequestId::Number(n) => u64::try_from(*n).map_err(|_| ()),
            RequestId::Float(f) => {
                if f.fract() == 0.0 && 0.0 <= *f && *f <= MAX_SAFE_INTEGER as f64 {
                    Ok(*f as u64)
                } else {
                    Err(())
                }
            }
            RequestId::String(s) => s.parse().map_err(|_| ()),
        }
    }
}

/// A message as it appears on the wire, before its shape has been checked.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct RawMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

// Keeps `"result": null` distinct from a missing `result`.
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RawMessage {
    pub fn into_message(self) -> Result<Message, InvalidMessage> {
        let invalid = |reason| InvalidMessage {
            reason,
            id: self.id.clone(),
            method: self.method.clone(),
        };
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(invalid(InvalidMessageReason::Version(self.jsonrpc.clone())));
        }
        if self.method.as_deref() == Some("") {
            return Err(invalid(InvalidMessageReason::EmptyMethod));
        }
        let reason = match (&self.method, &self.result, &self.error) {
            (Some(_), None, None) => None,
            (Some(_), _, _) => Some(InvalidMessageReason::MethodWithResult),
            (None, Some(_), Some(_)) => Some(InvalidMessageReason::ResultAndError),
            (None, None, None) => Some(InvalidMessageReason::Empty),
            (None, _, _) => match &self.id {
                None => Some(InvalidMessageReason::ResponseWithoutId),
                Some(RequestId::String(id)) if id.is_empty() => {
                    Some(InvalidMessageReason::EmptyResponseId)
                }
                Some(_) => None,
            },
        };
        if let Some(reason) = reason {
            return Err(invalid(reason));
        }
        Ok(match (self.id, self.method, self.result, self.error) {
            (Some(id), Some(method), _, _) => Message::Request(RequestMessage {
                id,
                method,
                params: self.params,
            }),
            (None, Some(method), _, _) => Message::Notification(NotificationMessage {
                method,
                params: self.params,
            }),
            (Some(id), None, Some(result), _) => Message::Response(ResponseMessage {
                id,
                result: Ok(result),
            }),
            (Some(id), None, None, Some(error)) => Message::Response(ResponseMessage {
                id,
                result: Err(error),
            }),
            _ => unreachable!(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct InvalidMessage {
    pub reason: InvalidMessageReason,
    pub id: Option<RequestId>,
    pub method: Option<String>,
}
impl InvalidMessage {
    /// The id to answer with `InvalidRequest`, if the message was meant to be a request.
    pub fn request_id(&self) -> Option<&RequestId> {
        if self.method.is_some() {
            self.id.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug, Display, PartialEq)]
pub enum InvalidMessageReason {
    #[display("unsupported jsonrpc version `{0}`")]
    Version(String),
    #[display("method must not be empty")]
    EmptyMethod,
    #[display("message has both `method` and `result`/`error`")]
    MethodWithResult,
    #[display("response has both `result` and `error`")]
    ResultAndError,
    #[display("response has no `id`")]
    ResponseWithoutId,
    #[display("response `id` must not be empty")]
    EmptyResponseId,
    #[display("message has neither `method` nor `result`/`error`")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}
impl Message {
    pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Message::Request(RequestMessage {
            id: id.into(),
            method: method.to_string(),
            params,
        })
    }
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message::Notification(NotificationMessage {
            method: method.to_string(),
            params,
        })
    }
    pub fn response(id: RequestId, result: Result<Value, ErrorObject>) -> Self {
        Message::Response(ResponseMessage { id, result })
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, MessageParseError> {
        let raw: RawMessage = serde_json::from_slice(body).map_err(MessageParseError::Json)?;
        Ok(raw.into_message()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("failed to parse message body: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid message: {0}")]
    Invalid(#[from] InvalidMessage),
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("Message", 4)?;
        s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Message::Request(m) => {
                s.serialize_field("id", &m.id)?;
                s.serialize_field("method", &m.method)?;
                if let Some(params) = &m.params {
                    s.serialize_field("params", params)?;
                }
            }
            Message::Notification(m) => {
                s.serialize_field("method", &m.method)?;
                if let Some(params) = &m.params {
                    s.serialize_field("params", params)?;
                }
            }
            Message::Response(m) => {
                s.serialize_field("id", &m.id)?;
                match &m.result {
                    Ok(result) => s.serialize_field("result", result)?,
                    Err(error) => s.serialize_field("error", error)?,
                }
            }
        }
        s.end()
    }
}
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawMessage::deserialize(deserializer)?
            .into_message()
            .map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: RequestId,
    pub result: Result<Value, ErrorObject>,
}

/// Parameters of [`CANCEL_REQUEST_METHOD`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}
impl CancelParams {
    pub(crate) fn from_params(params: Option<Value>) -> Result<Self, serde_json::Error> {
        from_value_or_null(params)
    }
}

pub(crate) fn from_value_or_null<T: DeserializeOwned>(
    value: Option<Value>,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(value.unwrap_or(Value::Null))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.message())
    }
    pub fn cancelled() -> Self {
        Self::from_code(ErrorCode::REQUEST_CANCELLED)
    }
}
impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)?;
        if let Some(data) = &self.data {
            writeln!(f)?;
            write_string_no_escape(data, f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{0}")]
pub struct ErrorCode(pub i64);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const REQUEST_CANCELLED: Self = Self(-32800);

    pub fn message(self) -> &'static str {
        match self {
            Self::PARSE_ERROR => "Parse error",
            Self::INVALID_REQUEST => "Invalid Request",
            Self::METHOD_NOT_FOUND => "Method not found",
            Self::INVALID_PARAMS => "Invalid params",
            Self::INTERNAL_ERROR => "Internal error",
            Self::REQUEST_CANCELLED => "Request cancelled",
            _ => "Server error",
        }
    }
}
