//! A bidirectional JSON-RPC 2.0 runtime for `Content-Length` framed streams,
//! with request cancellation through `$/cancelRequest`.
//!
//! Both sides of a [`Session`] can send requests and notifications. Incoming
//! requests are dispatched to a [`LocalEndpoint`], usually a [`ServiceEndpoint`]
//! built from a [`MethodRegistry`], and run concurrently on the tokio runtime.

mod codec;
mod endpoint;
mod error;
mod message;
mod processor;
mod proxy;
mod registry;
mod remote;
mod session;
mod utils;

pub use codec::*;
pub use endpoint::*;
pub use error::*;
pub use message::*;
pub use processor::*;
pub use proxy::*;
pub use registry::*;
pub use remote::{RemoteEndpoint, RemoteEndpointBuilder, ResponseFuture};
pub use session::*;
