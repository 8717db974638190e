//! Per-connection reader task and its supervisor.

use crate::connection::ConnectionId;
use crate::dispatcher::RelayHandle;
use crate::protocol::ClientPayload;
use futures::{Stream, StreamExt};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Why a reader loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Close frame or end of stream
    Closed,
    /// Transport error while receiving
    ReceiveFailed(String),
    /// A frame that is not a valid client payload
    DecodeFailed(String),
    /// Nothing received within the idle timeout
    IdleTimeout,
    /// The dispatcher no longer accepts events
    DispatcherGone,
    /// The relay closed the connection (eviction, `leave`, or shutdown)
    Stopped,
}

/// Receive frames until the session ends, forwarding decoded events to the
/// dispatcher tagged with `id`.
///
/// Any receive or decode failure ends the loop, and so does `stop`, which
/// resolves once the relay has closed or dropped the connection. Pings and
/// pongs are answered by the transport and skipped here.
pub(crate) async fn read_loop<St>(
    id: ConnectionId,
    mut stream: St,
    relay: RelayHandle,
    idle_timeout: Option<Duration>,
    mut stop: oneshot::Receiver<()>,
) -> ReadOutcome
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => return ReadOutcome::Stopped,
            next = next_frame(&mut stream, idle_timeout) => next,
        };

        let text = match next {
            Err(_) => return ReadOutcome::IdleTimeout,
            Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_owned(),
            Ok(Some(Ok(Message::Binary(data)))) => match std::str::from_utf8(&data) {
                Ok(text) => text.to_owned(),
                Err(e) => return ReadOutcome::DecodeFailed(e.to_string()),
            },
            Ok(Some(Ok(Message::Close(frame)))) => {
                debug!(connection = %id, reason = ?frame, "Client initiated close");
                return ReadOutcome::Closed;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return ReadOutcome::ReceiveFailed(e.to_string()),
            Ok(None) => return ReadOutcome::Closed,
        };

        let payload = match ClientPayload::decode(&text) {
            Ok(payload) => payload,
            Err(e) => return ReadOutcome::DecodeFailed(e.to_string()),
        };

        debug!(connection = %id, action = ?payload.action, "Received client message");
        let submitted = tokio::select! {
            biased;
            _ = &mut stop => return ReadOutcome::Stopped,
            submitted = relay.submit(payload.into_event(id)) => submitted,
        };
        if submitted.is_err() {
            return ReadOutcome::DispatcherGone;
        }
    }
}

async fn next_frame<St>(
    stream: &mut St,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, Elapsed>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match idle_timeout {
        Some(limit) => timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Counts a live reader against the connection cap for as long as it is held.
#[derive(Debug)]
pub(crate) struct LiveSlot {
    live: Arc<AtomicUsize>,
}

impl LiveSlot {
    /// Take a slot unless `max` readers are already live.
    pub(crate) fn acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < max).then_some(current + 1)
        })
        .ok()
        .map(|_| Self { live: live.clone() })
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run `reader` on its own task and watch it.
///
/// A panic inside the reader is caught and logged here and affects no other
/// task. Unless the relay itself stopped the reader, the dispatcher is told
/// the connection is gone when `leave_on_disconnect` is set. The live slot is
/// released in every case.
pub(crate) fn supervise<F>(
    id: ConnectionId,
    reader: F,
    relay: RelayHandle,
    leave_on_disconnect: bool,
    slot: LiveSlot,
) -> JoinHandle<()>
where
    F: Future<Output = ReadOutcome> + Send + 'static,
{
    tokio::spawn(async move {
        let _slot = slot;
        match tokio::spawn(reader).await {
            Ok(ReadOutcome::Closed) => info!(connection = %id, "Connection closed"),
            Ok(ReadOutcome::DispatcherGone) => {
                warn!(connection = %id, "Dispatcher stopped, abandoning connection");
                return;
            }
            Ok(ReadOutcome::Stopped) => {
                debug!(connection = %id, "Reader stopped by relay");
                return;
            }
            Ok(outcome) => info!(connection = %id, ?outcome, "Reader stopped"),
            Err(e) if e.is_panic() => {
                error!(
                    connection = %id,
                    panic = %panic_message(e.into_panic()),
                    "Reader task panicked"
                );
            }
            Err(e) => warn!(connection = %id, error = %e, "Reader task cancelled"),
        }

        if leave_on_disconnect {
            if let Err(e) = relay.disconnected(id).await {
                debug!(connection = %id, error = %e, "Could not report disconnect");
            }
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
