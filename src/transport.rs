//! Stdio relay loops
//!
//! Two independent line-oriented loops connect the client to the routing
//! policy: one reads the client's stdin, one consumes the server output
//! channel fed by the supervisor's per-process reader task. Order is
//! preserved within each direction; none is needed across them. Both loops
//! check the shutdown token so teardown is never blocked behind a read.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::router::MessageRouter;

/// Read client input line by line until EOF or shutdown.
///
/// EOF means the client disconnected; the shutdown token is cancelled so
/// the rest of the proxy tears down.
pub async fn relay_client_input<R>(
    input: R,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => {
                info!("client disconnected");
                break;
            }
            Ok(_) => {
                let message = line.trim_end_matches(['\r', '\n']);
                if message.is_empty() {
                    continue;
                }
                router.on_client_line(message).await;
            }
            Err(e) => {
                error!("failed to read client input: {e}");
                break;
            }
        }
    }

    debug!("client input relay stopped");
    shutdown.cancel();
}

/// Consume server output lines until shutdown.
///
/// The channel is quiet whenever no server is alive; a closed channel means
/// the supervisor itself is gone.
pub async fn relay_server_output(
    router: Arc<MessageRouter>,
    mut output: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = output.recv() => match line {
                Some(line) => router.on_server_line(&line).await,
                None => break,
            }
        }
    }

    debug!("server output relay stopped");
}

// ============================================================================
// Tests
// ============================================================================
