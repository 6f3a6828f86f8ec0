use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Charset, DEFAULT_MAX_CONTENT_LENGTH, Error, ErrorObject, Interface, LocalEndpoint, Message,
    MessageProcessor, MessageRead, MessageReader, MessageWrite, MessageWriter, ProcessorHandle,
    ProtocolError, RemoteEndpoint, RemoteEndpointBuilder, RemoteProxy, SessionContext,
    SessionResult,
};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Whether handler error messages, sources and backtraces are sent to the peer.
    ///
    /// `None` enables it in debug builds only.
    pub expose_internals: Option<bool>,
    /// Encoding of outgoing message bodies.
    pub charset: Charset,
    /// Largest incoming body accepted, [`DEFAULT_MAX_CONTENT_LENGTH`] if `None`.
    ///
    /// Larger messages are reported to the error listener and skipped.
    pub max_content_length: Option<usize>,
}

impl SessionOptions {
    fn expose_internals(&self) -> bool {
        self.expose_internals.unwrap_or(cfg!(debug_assertions))
    }
}

/// Assembles a [`Session`] from a local endpoint and a pair of streams.
pub struct Launcher {
    remote: RemoteEndpointBuilder,
    options: SessionOptions,
    runtime: Option<Handle>,
}

impl Launcher {
    pub fn new(local: impl LocalEndpoint) -> Self {
        Self {
            remote: RemoteEndpoint::builder(local),
            options: SessionOptions::default(),
            runtime: None,
        }
    }

    pub fn options(mut self, options: &SessionOptions) -> Self {
        self.options = options.clone();
        self
    }
    /// Runtime that runs the session's tasks and request handlers.
    ///
    /// Defaults to the runtime `launch` is called on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
    pub fn error_mapper(
        mut self,
        f: impl Fn(&Error) -> ErrorObject + Send + Sync + 'static,
    ) -> Self {
        self.remote = self.remote.error_mapper(f);
        self
    }
    pub fn error_listener(mut self, f: impl Fn(&ProtocolError) + Send + Sync + 'static) -> Self {
        self.remote = self.remote.error_listener(f);
        self
    }
    /// Checks outgoing calls against the methods the peer is known to accept.
    pub fn remote_interface(mut self, interface: Interface) -> Self {
        self.remote = self.remote.remote_interface(interface);
        self
    }

    /// Starts a session over a byte stream pair.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was set and this is called outside a tokio runtime.
    pub fn launch(
        self,
        reader: impl AsyncBufRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Session {
        let charset = self.options.charset;
        let max_content_length = self
            .options
            .max_content_length
            .unwrap_or(DEFAULT_MAX_CONTENT_LENGTH);
        self.launch_with(
            MessageReader::new(reader).with_max_content_length(max_content_length),
            MessageWriter::with_charset(writer, charset),
        )
    }

    /// Starts a session over custom message transports.
    pub fn launch_with(
        self,
        reader: impl MessageRead + Send + 'static,
        writer: impl MessageWrite + Send + Sync + 'static,
    ) -> Session {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = self
            .remote
            .expose_internals(self.options.expose_internals())
            .build(tx, runtime.clone());
        let writer = WriterHandle::start(writer, rx, &runtime);
        let processor = MessageProcessor::new(reader, remote.clone()).start(&runtime);
        tracing::debug!(charset = %self.options.charset, "session started");
        Session {
            remote,
            processor,
            writer,
        }
    }
}

/// A running connection to a peer.
///
/// Dropping the session stops reading and closes the output stream once
/// queued messages are written.
pub struct Session {
    remote: RemoteEndpoint,
    processor: ProcessorHandle,
    writer: WriterHandle,
}

impl Session {
    pub fn new(
        local: impl LocalEndpoint,
        reader: impl AsyncBufRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
        options: &SessionOptions,
    ) -> Self {
        Launcher::new(local).options(options).launch(reader, writer)
    }

    /// Two sessions connected to each other through an in-memory stream.
    pub fn new_channel(
        local0: impl LocalEndpoint,
        local1: impl LocalEndpoint,
        options: &SessionOptions,
    ) -> (Self, Self) {
        let (d0, d1) = tokio::io::duplex(1024);
        let (r0, w0) = tokio::io::split(d0);
        let (r1, w1) = tokio::io::split(d1);
        (
            Self::new(local0, BufReader::new(r0), w0, options),
            Self::new(local1, BufReader::new(r1), w1, options),
        )
    }

    /// A session over the process's stdin and stdout.
    pub fn from_stdio(local: impl LocalEndpoint, options: &SessionOptions) -> Self {
        Self::new(
            local,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            options,
        )
    }

    pub fn remote(&self) -> RemoteProxy {
        RemoteProxy::new(self.remote.clone())
    }
    pub fn context(&self) -> SessionContext {
        SessionContext::new(self.remote.downgrade())
    }
    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub async fn request<R>(
        &self,
        method: &str,
        params: Option<&impl Serialize>,
    ) -> SessionResult<R>
    where
        R: DeserializeOwned,
    {
        self.remote().request(method, params).await
    }
    pub fn notification(&self, method: &str, params: Option<&impl Serialize>) -> SessionResult<()> {
        self.remote().notification(method, params)
    }

    /// Waits until the peer closes the connection or reading fails.
    ///
    /// Pending outgoing requests then fail with
    /// [`SessionError::Shutdown`](crate::SessionError::Shutdown).
    pub async fn wait(self) -> SessionResult<()> {
        let result = self.processor.join().await;
        self.remote.close();
        self.writer.join().await;
        result
    }

    /// Stops reading, fails pending outgoing requests and closes the output
    /// stream once queued messages are written.
    pub async fn shutdown(self) -> SessionResult<()> {
        self.processor.stop();
        let result = self.processor.join().await;
        self.remote.close();
        self.writer.join().await;
        result
    }
}

struct WriterHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl WriterHandle {
    fn start(
        writer: impl MessageWrite + Send + Sync + 'static,
        rx: UnboundedReceiver<Message>,
        runtime: &Handle,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = runtime.spawn(write_messages(writer, rx, stop.clone()));
        Self { stop, task }
    }

    async fn join(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "message writer failed");
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn write_messages(
    writer: impl MessageWrite,
    mut rx: UnboundedReceiver<Message>,
    stop: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = stop.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(message) = message else {
            break;
        };
        tracing::trace!(?message, "write");
        if let Err(e) = writer.write(&message).await {
            tracing::error!(error = %e, "failed to write message");
            return;
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(error = %e, "failed to close output stream");
    }
}
