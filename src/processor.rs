use std::{io, sync::Arc};

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{MessageRead, ReadError, RemoteEndpoint, SessionError, SessionResult};

/// Reads messages from a stream and hands each one to a [`RemoteEndpoint`].
///
/// Malformed messages are reported and skipped. The loop ends at end of stream,
/// on an I/O error, or when stopped.
pub struct MessageProcessor<R> {
    reader: R,
    remote: RemoteEndpoint,
}

impl<R> MessageProcessor<R>
where
    R: MessageRead + Send + 'static,
{
    pub fn new(reader: R, remote: RemoteEndpoint) -> Self {
        Self { reader, remote }
    }

    pub async fn run(mut self, stop: CancellationToken) -> SessionResult<()> {
        loop {
            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::debug!("message processor stopped");
                    return Ok(());
                }
                result = self.reader.read() => result,
            };
            match result {
                Ok(Some(message)) => self.remote.consume(message),
                Ok(None) => {
                    tracing::debug!("end of input stream");
                    return Ok(());
                }
                Err(ReadError::Io(e)) => {
                    tracing::error!(error = %e, "failed to read message");
                    return Err(e.into());
                }
                Err(e) => self.remote.reject(e),
            }
        }
    }

    /// Runs the processor as a task on `runtime`.
    pub fn start(self, runtime: &Handle) -> ProcessorHandle {
        tracing::debug!("message processor started");
        let stop = CancellationToken::new();
        let task = runtime.spawn(self.run(stop.clone()));
        ProcessorHandle { stop, task }
    }
}

/// A running [`MessageProcessor`]. Dropping it stops the processor.
pub struct ProcessorHandle {
    stop: CancellationToken,
    task: JoinHandle<SessionResult<()>>,
}

impl ProcessorHandle {
    pub fn stop(&self) {
        self.stop.cancel();
    }
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Waits until the processor has ended.
    pub async fn join(mut self) -> SessionResult<()> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Io(Arc::new(io::Error::other(e)))),
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
