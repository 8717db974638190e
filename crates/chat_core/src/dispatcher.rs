//! The dispatcher: single consumer of the event queue and sole owner of the
//! registry.
//!
//! Every state change goes through [`Command`]s sent over a bounded channel.
//! The dispatcher handles them one at a time, in the order they were
//! enqueued, so the registry needs no lock. Other tasks talk to it through a
//! cloneable [`RelayHandle`].
//!
//! # Transitions
//!
//! * `join` - set the connection's username, broadcast the roster
//! * `leave` - remove and close the connection, broadcast the roster
//! * `broadcast` - broadcast `"{username}: {message}"`, HTML-escaped
//! * anything else - ignored
//!
//! `leave` ends the session: the transport is closed and the reader stopped,
//! so a client cannot rejoin on the same socket and has to reconnect.
//! Events from connections no longer in the registry are dropped, except
//! `leave`, which still republishes the roster.

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::RelayError;
use crate::protocol::{ClientAction, InboundEvent, ServerResponse};
use crate::registry::Registry;
use futures::future::join_all;
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Work items carried by the event queue.
#[derive(Debug)]
pub enum Command {
    /// A freshly upgraded connection, registered with a blank username
    Register(Connection),
    /// A decoded client message
    Client(InboundEvent),
    /// The connection's reader stopped; handled like `leave` if still registered
    Disconnected(ConnectionId),
    /// Read-only snapshot of the registry
    Roster(oneshot::Sender<RosterSnapshot>),
    /// Close every connection and stop
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSnapshot {
    /// Sorted, non-blank usernames
    pub users: Vec<String>,
    /// Number of registered connections, named or not
    pub connections: usize,
}

/// Cloneable handle for submitting work to the dispatcher.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<Command>,
}

impl RelayHandle {
    pub(crate) fn from_sender(sender: mpsc::Sender<Command>) -> Self {
        Self { sender }
    }

    async fn send(&self, command: Command) -> Result<(), RelayError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }

    /// Hand a new connection over to the dispatcher.
    pub async fn register(&self, connection: Connection) -> Result<(), RelayError> {
        self.send(Command::Register(connection)).await
    }

    /// Enqueue a decoded client message. Waits while the queue is full.
    pub async fn submit(&self, event: InboundEvent) -> Result<(), RelayError> {
        self.send(Command::Client(event)).await
    }

    /// Report that a connection's reader has stopped.
    pub async fn disconnected(&self, id: ConnectionId) -> Result<(), RelayError> {
        self.send(Command::Disconnected(id)).await
    }

    /// Ask for the current roster.
    pub async fn roster(&self) -> Result<RosterSnapshot, RelayError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Roster(reply)).await?;
        response.await.map_err(|_| RelayError::DispatcherClosed)
    }

    /// Close every connection and stop the dispatcher, waiting until it is done.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        done.await.map_err(|_| RelayError::DispatcherClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Serializes all registry mutation and drives the broadcaster.
pub struct Dispatcher {
    registry: Registry,
    broadcaster: Broadcaster,
    receiver: mpsc::Receiver<Command>,
}

impl Dispatcher {
    /// Create a dispatcher and the handle that feeds it.
    pub fn new(config: &ServerConfig) -> (Self, RelayHandle) {
        let (sender, receiver) = mpsc::channel(config.event_queue_capacity.max(1));
        let dispatcher = Self {
            registry: Registry::new(),
            broadcaster: Broadcaster::new(config.send_timeout()),
            receiver,
        };
        (dispatcher, RelayHandle::from_sender(sender))
    }

    /// Create a dispatcher and run it on its own task.
    pub fn spawn(config: &ServerConfig) -> (JoinHandle<()>, RelayHandle) {
        let (dispatcher, handle) = Self::new(config);
        (tokio::spawn(dispatcher.run()), handle)
    }

    /// Process commands until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!("Dispatcher started");
        while let Some(command) = self.receiver.recv().await {
            if self.handle(command).await.is_break() {
                break;
            }
        }
        info!(remaining = self.registry.len(), "Dispatcher stopped");
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Register(connection) => {
                debug!(
                    connection = %connection.id(),
                    remote_addr = %connection.remote_addr(),
                    "Connection registered"
                );
                self.registry.insert(connection);
            }
            Command::Client(event) => self.on_client_event(event).await,
            Command::Disconnected(id) => {
                if self.registry.contains(id) {
                    info!(connection = %id, "Connection dropped without leaving, removing");
                    self.on_leave(id).await;
                }
            }
            Command::Roster(reply) => {
                let _ = reply.send(RosterSnapshot {
                    users: self.registry.user_list(),
                    connections: self.registry.len(),
                });
            }
            Command::Shutdown(done) => {
                let connections: Vec<Connection> = self.registry.drain().collect();
                info!(connections = connections.len(), "Closing all connections");
                let broadcaster = &self.broadcaster;
                join_all(connections.into_iter().map(|c| broadcaster.retire(c))).await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_client_event(&mut self, event: InboundEvent) {
        match event.action {
            ClientAction::Join => self.on_join(event.connection, event.username).await,
            ClientAction::Leave => self.on_leave(event.connection).await,
            ClientAction::Broadcast if !self.registry.contains(event.connection) => {
                debug!(connection = %event.connection, "Broadcast from unregistered connection ignored");
            }
            ClientAction::Broadcast => {
                let response =
                    ServerResponse::chat(&event.username, &event.message, self.registry.user_list());
                self.publish(response).await;
            }
            ClientAction::Unknown => {
                debug!(connection = %event.connection, "Ignoring message with unknown action");
            }
        }
    }

    async fn on_join(&mut self, id: ConnectionId, username: String) {
        if !self.registry.set_username(id, username.as_str()) {
            debug!(connection = %id, "Join from unregistered connection ignored");
            return;
        }
        info!(connection = %id, username = %username, "User joined");
        self.publish_roster().await;
    }

    async fn on_leave(&mut self, id: ConnectionId) {
        if let Some(connection) = self.registry.remove(id) {
            info!(connection = %id, "User left");
            self.broadcaster.retire(connection).await;
        }
        self.publish_roster().await;
    }

    async fn publish_roster(&mut self) {
        let response = ServerResponse::user_list(self.registry.user_list());
        self.publish(response).await;
    }

    /// Broadcast a response. Evictions change the roster, so they are
    /// followed by a fresh roster until a round completes without any.
    async fn publish(&mut self, response: ServerResponse) {
        let mut pending = Some(response);
        while let Some(response) = pending.take() {
            match self.broadcaster.broadcast(&mut self.registry, &response).await {
                Ok(evicted) if !evicted.is_empty() => {
                    pending = Some(ServerResponse::user_list(self.registry.user_list()));
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to broadcast response"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundSink;
    use crate::protocol::{ClientPayload, ResponseAction};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        id: ConnectionId,
        rx: UnboundedReceiver<String>,
    }

    impl Client {
        fn responses(&mut self) -> Vec<ServerResponse> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn last_roster(&mut self) -> Option<Vec<String>> {
            self.responses()
                .into_iter()
                .filter(|r| r.action == Some(ResponseAction::ListUsers))
                .last()
                .map(|r| r.connected_users)
        }

        fn event(&self, action: ClientAction, username: &str, message: &str) -> Command {
            Command::Client(ClientPayload::new(action, username, message).into_event(self.id))
        }
    }

    fn dispatcher() -> (Dispatcher, RelayHandle) {
        Dispatcher::new(&ServerConfig::default())
    }

    async fn connect(dispatcher: &mut Dispatcher) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new("127.0.0.1:7000".parse().unwrap(), tx);
        let id = connection.id();
        assert!(dispatcher.handle(Command::Register(connection)).await.is_continue());
        Client { id, rx }
    }

    #[tokio::test]
    async fn test_joins_produce_sorted_roster() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(connect(&mut dispatcher).await);
        }

        for (client, name) in clients.iter().zip(["dave", "alice", "", "carol"]) {
            let _ = dispatcher.handle(client.event(ClientAction::Join, name, "")).await;
        }

        for client in clients.iter_mut() {
            assert_eq!(client.last_roster().unwrap(), vec!["alice", "carol", "dave"]);
        }
        assert_eq!(dispatcher.registry().len(), 4);
    }

    #[tokio::test]
    async fn test_register_does_not_broadcast() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut first = connect(&mut dispatcher).await;
        let _second = connect(&mut dispatcher).await;
        assert!(first.responses().is_empty());
    }

    #[tokio::test]
    async fn test_leave_removes_user_and_is_idempotent() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let bob = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;
        let _ = dispatcher.handle(bob.event(ClientAction::Join, "bob", "")).await;
        alice.responses();

        let _ = dispatcher.handle(bob.event(ClientAction::Leave, "bob", "")).await;
        assert!(!dispatcher.registry().contains(bob.id));
        assert_eq!(alice.last_roster().unwrap(), vec!["alice"]);

        let _ = dispatcher.handle(bob.event(ClientAction::Leave, "bob", "")).await;
        assert_eq!(dispatcher.registry().len(), 1);
        assert_eq!(alice.last_roster().unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_registry_size_after_joins_and_leaves() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut clients = Vec::new();
        for i in 0..6 {
            let client = connect(&mut dispatcher).await;
            let _ = dispatcher
                .handle(client.event(ClientAction::Join, &format!("user{i}"), ""))
                .await;
            clients.push(client);
        }
        for client in clients.iter().take(2) {
            let _ = dispatcher.handle(client.event(ClientAction::Leave, "", "")).await;
        }

        assert_eq!(dispatcher.registry().len(), 4);
        assert_eq!(
            dispatcher.registry().user_list(),
            vec!["user2", "user3", "user4", "user5"]
        );
    }

    #[tokio::test]
    async fn test_broadcast_is_escaped_and_reaches_everyone() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let mut lurker = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;
        alice.responses();
        lurker.responses();

        let _ = dispatcher
            .handle(alice.event(ClientAction::Broadcast, "alice", "<i>hi</i> & bye"))
            .await;

        for client in [&mut alice, &mut lurker] {
            let responses = client.responses();
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].action, Some(ResponseAction::Broadcast));
            assert_eq!(responses[0].message, "alice: &lt;i&gt;hi&lt;/i&gt; &amp; bye");
            assert_eq!(responses[0].connected_users, vec!["alice"]);
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_ignored() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let flow = dispatcher.handle(alice.event(ClientAction::Unknown, "alice", "x")).await;

        assert!(flow.is_continue());
        assert!(alice.responses().is_empty());
        assert_eq!(dispatcher.registry().username(alice.id), Some(""));
    }

    #[tokio::test]
    async fn test_failed_send_evicts_during_roster_broadcast() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let bob = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(bob.event(ClientAction::Join, "bob", "")).await;
        let bob_id = bob.id;
        drop(bob);

        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;

        assert!(!dispatcher.registry().contains(bob_id));
        assert_eq!(dispatcher.registry().user_list(), vec!["alice"]);
        // The join roster still lists bob; the follow-up after eviction does not.
        let rosters: Vec<Vec<String>> = alice
            .responses()
            .into_iter()
            .map(|r| r.connected_users)
            .collect();
        assert_eq!(rosters.last().unwrap(), &vec!["alice".to_string()]);
        assert!(rosters.contains(&vec!["alice".to_string(), "bob".to_string()]));
    }

    #[tokio::test]
    async fn test_disconnect_is_implicit_leave() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let bob = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;
        let _ = dispatcher.handle(bob.event(ClientAction::Join, "bob", "")).await;
        alice.responses();

        let _ = dispatcher.handle(Command::Disconnected(bob.id)).await;
        assert_eq!(alice.last_roster().unwrap(), vec!["alice"]);

        // Already gone: no second roster broadcast.
        let _ = dispatcher.handle(Command::Disconnected(bob.id)).await;
        assert!(alice.responses().is_empty());
    }

    #[tokio::test]
    async fn test_join_from_unregistered_connection_is_ignored() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let ghost = ClientPayload::new(ClientAction::Join, "ghost", "").into_event(ConnectionId::new());

        let _ = dispatcher.handle(Command::Client(ghost)).await;

        assert!(alice.responses().is_empty());
        assert_eq!(dispatcher.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (mut dispatcher, _handle) = dispatcher();
        let _alice = connect(&mut dispatcher).await;
        let (done_tx, done_rx) = oneshot::channel();

        assert!(dispatcher.handle(Command::Shutdown(done_tx)).await.is_break());
        assert!(dispatcher.registry().is_empty());
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_from_evicted_connection_is_dropped() {
        let (mut dispatcher, _handle) = dispatcher();
        let mut alice = connect(&mut dispatcher).await;
        let sloth = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;
        let _ = dispatcher.handle(sloth.event(ClientAction::Join, "sloth", "")).await;
        let sloth_event = sloth.event(ClientAction::Broadcast, "sloth", "still here");
        drop(sloth);

        // The next broadcast fails to reach sloth and evicts it.
        let _ = dispatcher.handle(alice.event(ClientAction::Broadcast, "alice", "ping")).await;
        alice.responses();

        let _ = dispatcher.handle(sloth_event).await;
        assert!(alice.responses().is_empty());
        assert_eq!(dispatcher.registry().user_list(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_eviction_stops_the_reader() {
        let (mut dispatcher, _handle) = dispatcher();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let mut connection = Connection::new("127.0.0.1:7000".parse().unwrap(), tx);
        let stopped = connection.reader_stop();
        let _ = dispatcher.handle(Command::Register(connection)).await;
        drop(rx);

        let mut alice = connect(&mut dispatcher).await;
        let _ = dispatcher.handle(alice.event(ClientAction::Join, "alice", "")).await;

        assert_eq!(dispatcher.registry().len(), 1);
        assert!(stopped.await.is_ok());
        assert_eq!(alice.last_roster().unwrap(), vec!["alice"]);
    }

    struct StalledClose;

    #[async_trait]
    impl OutboundSink for StalledClose {
        async fn send_text(&mut self, _text: String) -> Result<(), RelayError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), RelayError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connections_concurrently() {
        let config = ServerConfig::default().with_send_timeout_ms(1000);
        let (mut dispatcher, _handle) = Dispatcher::new(&config);
        for _ in 0..5 {
            let connection = Connection::new("127.0.0.1:7000".parse().unwrap(), StalledClose);
            let _ = dispatcher.handle(Command::Register(connection)).await;
        }

        let started = tokio::time::Instant::now();
        let (done_tx, done_rx) = oneshot::channel();
        assert!(dispatcher.handle(Command::Shutdown(done_tx)).await.is_break());

        assert!(done_rx.await.is_ok());
        assert!(started.elapsed() < Duration::from_millis(2000));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_handle_round_trip_through_spawned_dispatcher() {
        let (task, handle) = Dispatcher::spawn(&ServerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new("127.0.0.1:7000".parse().unwrap(), tx);
        let id = connection.id();

        handle.register(connection).await.unwrap();
        handle
            .submit(ClientPayload::new(ClientAction::Join, "alice", "").into_event(id))
            .await
            .unwrap();

        let snapshot = handle.roster().await.unwrap();
        assert_eq!(snapshot.users, vec!["alice"]);
        assert_eq!(snapshot.connections, 1);
        assert!(rx.recv().await.is_some());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(handle.roster().await, Err(RelayError::DispatcherClosed)));
    }
}
