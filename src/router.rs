//! Message routing policy
//!
//! Every relayed line passes through here exactly once. Client-bound writes
//! all go through [`ClientWriter`], the single serialization point for the
//! client-facing stream; two tasks can never interleave partial lines.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::process::Supervisor;
use crate::protocol::{
    self, ERROR_SERVER_RESTARTING, METHOD_INITIALIZE, NOTIF_INITIALIZED,
    NOTIF_TOOLS_LIST_CHANGED, RpcEnvelope, SERVER_RESTARTING_MESSAGE,
};
use crate::session::SessionTracker;

/// Delay before the client is told the tool list changed, giving the freshly
/// handshaken server a moment to finish its own startup
const LIST_CHANGED_DELAY: Duration = Duration::from_millis(150);

// ============================================================================
// Client Output Stream
// ============================================================================

/// Sole writer to the client-facing output stream.
///
/// Relayed bytes and synthesized messages share one lock so lines are always
/// written whole.
pub struct ClientWriter {
    stream: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ClientWriter {
    pub fn new(stream: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    /// Writer bound to the process's stdout (the real client connection)
    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    /// Write one protocol line plus trailing newline, atomically
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Pending Queue
// ============================================================================

/// Ordered raw message lines waiting for a live server process.
///
/// Holds client-sent `initialize` lines that arrive while no server is
/// alive, plus lines whose server write hit a broken pipe. Cleared entirely
/// whenever a new server process becomes current.
pub struct PendingQueue {
    inner: std::sync::Mutex<Vec<String>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, line: &str) {
        self.lock().push(line.to_string());
    }

    pub fn clear(&self) {
        let mut queue = self.lock();
        if !queue.is_empty() {
            debug!(dropped = queue.len(), "clearing pending message queue");
            queue.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        // Poisoning here means a panic mid-push; nothing to salvage
        self.inner.lock().unwrap()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Message Router
// ============================================================================

/// Applies session policy to every relayed line in both directions
pub struct MessageRouter {
    session: Arc<SessionTracker>,
    supervisor: Arc<Supervisor>,
    writer: Arc<ClientWriter>,
    pending: Arc<PendingQueue>,
}

impl MessageRouter {
    pub fn new(
        session: Arc<SessionTracker>,
        supervisor: Arc<Supervisor>,
        writer: Arc<ClientWriter>,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Self {
            session,
            supervisor,
            writer,
            pending,
        }
    }

    /// Decide what happens to one client-sent line.
    ///
    /// Handshake messages update session state regardless of the relay
    /// outcome. A line that fails shallow decode is relayed under the same
    /// policy with neither method nor id.
    pub async fn on_client_line(&self, line: &str) {
        let envelope = RpcEnvelope::parse(line);
        let method = envelope.method.as_deref();

        match method {
            Some(METHOD_INITIALIZE) => self.session.cache_initialize(line),
            Some(NOTIF_INITIALIZED) => self.session.mark_initialized(),
            _ => {}
        }

        if self.supervisor.is_server_alive().await {
            if self.session.awaiting_reinit() {
                match method {
                    Some(m) if protocol::is_safe_method(m) => {
                        self.session.recover_on_safe_method(m);
                    }
                    _ => {
                        debug!(
                            ?method,
                            state = ?self.session.state(),
                            "refusing message while awaiting re-initialization"
                        );
                        if let Some(id) = &envelope.id {
                            let response = protocol::error_response(
                                id,
                                ERROR_SERVER_RESTARTING,
                                SERVER_RESTARTING_MESSAGE,
                            );
                            if let Err(e) = self.writer.write_line(&response).await {
                                error!("failed to write error response to client: {e}");
                            }
                        }
                        return;
                    }
                }
            }

            if let Err(e) = self.supervisor.write_to_server(line).await {
                self.pending.push(line);
                warn!(queued = self.pending.len(), "server write failed, message queued: {e}");
            }
        } else if method == Some(METHOD_INITIALIZE) {
            debug!("no server process, queueing initialize request");
            self.pending.push(line);
        } else {
            debug!(?method, "no server process, dropping stale message");
        }
    }

    /// Decide what happens to one server-emitted line.
    ///
    /// The response to an auto-replayed `initialize` is intercepted: the
    /// proxy completes the server-side handshake itself and tells the client
    /// to refresh its tool list. Everything else is forwarded untouched,
    /// including lines that fail to decode.
    pub async fn on_server_line(&self, line: &str) {
        if protocol::is_initialize_response(line) && self.session.settle_replay() {
            info!("intercepted replayed initialize response, completing handshake");

            let initialized = protocol::notification(NOTIF_INITIALIZED);
            if let Err(e) = self.supervisor.write_to_server(&initialized).await {
                warn!("failed to complete server handshake: {e}");
            }

            let writer = Arc::clone(&self.writer);
            tokio::spawn(async move {
                tokio::time::sleep(LIST_CHANGED_DELAY).await;
                let changed = protocol::notification(NOTIF_TOOLS_LIST_CHANGED);
                if let Err(e) = writer.write_line(&changed).await {
                    error!("failed to notify client of tool list change: {e}");
                }
            });
            return;
        }

        if let Err(e) = self.writer.write_line(line).await {
            error!("failed to write to client: {e}");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
