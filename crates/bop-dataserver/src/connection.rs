//! Network-side loop of one connection.
//!
//! The loop owns the connection's [`WriteHandler`] and is the only task that
//! touches it. It reacts to whichever comes first: an inbound event, the exit
//! of the active stream's writer, or server shutdown. While the handler waits
//! on a full packet queue, no further inbound events are read.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handler::WriteHandler;
use crate::protocol::InboundEvent;
use crate::writer::WriteReport;

/// Counters for one finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub requests: u64,
    /// Requests answered with an error or ending their stream with one.
    pub failed_requests: u64,
    pub cancels: u64,
}

enum Step {
    Inbound(Option<InboundEvent>),
    WriterExit(WriteReport),
    Shutdown,
}

/// Drives `handler` until the connection ends.
///
/// A closed inbound channel is treated as a connection error. `shutdown`
/// ends the loop and abandons any active stream.
pub async fn serve_connection(
    mut handler: WriteHandler,
    mut inbound: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
) -> ConnectionStats {
    let mut stats = ConnectionStats::default();
    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Step::Shutdown,
            report = handler.writer_exited() => Step::WriterExit(report),
            event = inbound.recv() => Step::Inbound(event),
        };

        match step {
            Step::WriterExit(report) => handler.on_writer_exit(report).await,
            Step::Inbound(Some(InboundEvent::Request(request))) => {
                stats.requests += 1;
                if let Err(error) = handler.handle(request).await {
                    stats.failed_requests += 1;
                    debug!(code = error.code().as_str(), "write request failed");
                }
            }
            Step::Inbound(Some(InboundEvent::Cancel)) => {
                stats.cancels += 1;
                handler.cancel().await;
            }
            Step::Inbound(Some(InboundEvent::Error(reason))) => {
                handler.connection_error(&reason).await;
                break;
            }
            Step::Inbound(None) => {
                handler.connection_error("inbound channel closed").await;
                break;
            }
            Step::Shutdown => {
                handler.connection_error("server shutting down").await;
                break;
            }
        }
    }
    debug!(
        requests = stats.requests,
        failed = stats.failed_requests,
        "connection closed"
    );
    stats
}
