//! Connection gateway: upgrade handshake, admission, and handing the session
//! over to the dispatcher and a supervised reader.

use super::reader::{read_loop, supervise, LiveSlot};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatcher::RelayHandle;
use crate::error::RelayError;
use crate::protocol::ServerResponse;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Upgrade `stream` and start serving it.
///
/// Requests for any path other than the configured one are answered with
/// `404 Not Found`. When the server is at capacity the session is closed
/// with a policy close frame right after the upgrade. Otherwise the client
/// is greeted, registered, and its reader is spawned under a supervisor. The
/// reader ends when the dispatcher closes or drops the connection, which
/// releases the socket and the connection slot.
///
/// # Errors
/// `RelayError::Network` if the handshake fails, `RelayError::Send` if the
/// greeting cannot be written, and `RelayError::DispatcherClosed` if the
/// dispatcher has already stopped.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: RelayHandle,
    config: Arc<ServerConfig>,
    live: Arc<AtomicUsize>,
) -> Result<(), RelayError> {
    let expected_path = config.ws_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            return Ok(response);
        }
        debug!(path = %request.uri().path(), "Rejecting upgrade for unknown path");
        let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let ws_stream = accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| RelayError::Network(format!("WebSocket handshake failed for {addr}: {e}")))?;

    let (mut sink, stream) = ws_stream.split();

    let Some(slot) = LiveSlot::acquire(&live, config.max_connections) else {
        warn!(remote_addr = %addr, limit = config.max_connections, "Connection limit reached, refusing client");
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "server full".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(remote_addr = %addr, error = %e, "Could not send close frame");
        }
        return Ok(());
    };

    let mut connection = Connection::new(addr, sink);
    let id = connection.id();
    let stop = connection.reader_stop();
    info!(connection = %id, remote_addr = %addr, "Connection established");

    connection.send(&ServerResponse::greeting()).await?;
    relay.register(connection).await?;

    supervise(
        id,
        read_loop(id, stream, relay.clone(), config.idle_timeout(), stop),
        relay,
        config.leave_on_disconnect,
        slot,
    );
    Ok(())
}
