//! The roster of connected clients.
//!
//! The registry maps each live connection to the username it announced
//! (empty until the client joins). It is owned by the dispatcher task and has
//! no interior locking; nothing else may reach it.

use crate::connection::{Connection, ConnectionId};
use std::collections::HashMap;

/// A registered connection and the name it is displayed under.
#[derive(Debug)]
pub struct Participant {
    pub connection: Connection,
    pub username: String,
}

/// Mapping from connection identity to participant.
#[derive(Debug, Default)]
pub struct Registry {
    participants: HashMap<ConnectionId, Participant>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection that has not announced a username yet.
    pub fn insert(&mut self, connection: Connection) {
        self.participants.insert(
            connection.id(),
            Participant {
                connection,
                username: String::new(),
            },
        );
    }

    /// Set the username for a registered connection.
    ///
    /// Returns `false` when the connection is not (or no longer) registered.
    pub fn set_username(&mut self, id: ConnectionId, username: impl Into<String>) -> bool {
        match self.participants.get_mut(&id) {
            Some(participant) => {
                participant.username = username.into();
                true
            }
            None => false,
        }
    }

    /// Remove a connection, handing it back so the caller can close it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.participants.remove(&id).map(|p| p.connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn username(&self, id: ConnectionId) -> Option<&str> {
        self.participants.get(&id).map(|p| p.username.as_str())
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Sorted usernames of everyone who has joined. Blank names are skipped.
    pub fn user_list(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .participants
            .values()
            .filter(|p| !p.username.is_empty())
            .map(|p| p.username.clone())
            .collect();
        users.sort();
        users
    }

    /// Identities of every registered connection, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.participants.keys().copied().collect()
    }

    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.participants.get_mut(&id).map(|p| &mut p.connection)
    }

    /// Empty the registry, yielding every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.participants.drain().map(|(_, p)| p.connection)
    }
}
