//! Wire format for client-server communication.
//!
//! Every frame is a JSON text message. Clients send [`ClientPayload`]s and
//! the server answers with [`ServerResponse`]s.
//!
//! # Inbound
//!
//! ```json
//! { "action": "join", "username": "alice", "message": "" }
//! ```
//!
//! # Outbound
//!
//! ```json
//! {
//!   "action": "list_users",
//!   "message": "",
//!   "message_type": "",
//!   "connected_users": ["alice", "bob"]
//! }
//! ```

use crate::connection::ConnectionId;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};

/// Greeting text sent to every client right after the upgrade.
pub const GREETING: &str = "<em><small>Connected to server</small></em>";

/// Action requested by a client.
///
/// `username` and `left` are the names older clients use for `join` and
/// `leave`. Anything else decodes as [`ClientAction::Unknown`] and is ignored
/// by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    #[serde(alias = "username")]
    Join,
    #[serde(alias = "left")]
    Leave,
    Broadcast,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A message as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPayload {
    #[serde(default)]
    pub action: ClientAction,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub message: String,
}

impl ClientPayload {
    pub fn new(action: ClientAction, username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action,
            username: username.into(),
            message: message.into(),
        }
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Attach the connection the payload arrived on.
    pub fn into_event(self, connection: ConnectionId) -> InboundEvent {
        InboundEvent {
            action: self.action,
            username: self.username,
            message: self.message,
            connection,
        }
    }
}

/// A decoded client message, tagged with the connection it arrived on.
///
/// The `connection` field is filled in by the reader task; clients never
/// transmit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub action: ClientAction,
    pub username: String,
    pub message: String,
    pub connection: ConnectionId,
}

/// Kind of response the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    ListUsers,
    Broadcast,
}

/// A message as sent by the server.
///
/// `connected_users` is always sorted and never contains blank usernames.
/// The greeting is the only response without an `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ResponseAction>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub connected_users: Vec<String>,
}

impl ServerResponse {
    /// The greeting sent right after the upgrade.
    pub fn greeting() -> Self {
        Self {
            action: None,
            message: GREETING.to_string(),
            message_type: String::new(),
            connected_users: Vec::new(),
        }
    }

    /// A roster update.
    pub fn user_list(connected_users: Vec<String>) -> Self {
        Self {
            action: Some(ResponseAction::ListUsers),
            message: String::new(),
            message_type: String::new(),
            connected_users,
        }
    }

    /// A chat line, rendered as `"{username}: {message}"` and HTML-escaped.
    pub fn chat(username: &str, message: &str, connected_users: Vec<String>) -> Self {
        Self {
            action: Some(ResponseAction::Broadcast),
            message: escape_html(&format!("{username}: {message}")),
            message_type: String::new(),
            connected_users,
        }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Escape the five characters that can open markup in HTML text or attributes.
///
/// Only `&`, `'`, `<`, `>` and `"` are rewritten; every other character passes
/// through untouched.
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '\'' => escaped.push_str("&#39;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html(r#"<script>alert("x" & 'y')</script>"#),
            "&lt;script&gt;alert(&#34;x&#34; &amp; &#39;y&#39;)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_escape_html_leaves_other_characters() {
        let input = "plain text / with = symbols; ünïcödé \\ `backticks` %20";
        assert_eq!(escape_html(input), input);
    }

    #[test]
    fn test_chat_formats_then_escapes() {
        let response = ServerResponse::chat("<b>bob</b>", "1 < 2", vec!["bob".to_string()]);
        assert_eq!(response.action, Some(ResponseAction::Broadcast));
        assert_eq!(response.message, "&lt;b&gt;bob&lt;/b&gt;: 1 &lt; 2");
    }

    #[test]
    fn test_decode_actions_and_aliases() {
        let join = ClientPayload::decode(r#"{"action":"join","username":"alice","message":""}"#).unwrap();
        assert_eq!(join.action, ClientAction::Join);
        assert_eq!(join.username, "alice");

        let legacy = ClientPayload::decode(r#"{"action":"username","username":"bob"}"#).unwrap();
        assert_eq!(legacy.action, ClientAction::Join);

        let left = ClientPayload::decode(r#"{"action":"left"}"#).unwrap();
        assert_eq!(left.action, ClientAction::Leave);
        assert_eq!(left.username, "");

        let other = ClientPayload::decode(r#"{"action":"dance","username":"x"}"#).unwrap();
        assert_eq!(other.action, ClientAction::Unknown);

        let missing = ClientPayload::decode(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(missing.action, ClientAction::Unknown);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ClientPayload::decode("not json"),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn test_into_event_attaches_connection() {
        let id = ConnectionId::new();
        let event = ClientPayload::new(ClientAction::Broadcast, "alice", "hi").into_event(id);
        assert_eq!(event.connection, id);
        assert_eq!(event.message, "hi");
    }

    #[test]
    fn test_greeting_has_no_action() {
        let value: serde_json::Value =
            serde_json::from_str(&ServerResponse::greeting().encode().unwrap()).unwrap();
        assert!(value.get("action").is_none());
        assert_eq!(value["message"], GREETING);
        assert_eq!(value["connected_users"], serde_json::json!([]));
    }

    #[test]
    fn test_user_list_wire_shape() {
        let value: serde_json::Value = serde_json::from_str(
            &ServerResponse::user_list(vec!["alice".into(), "bob".into()])
                .encode()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "action": "list_users",
                "message": "",
                "message_type": "",
                "connected_users": ["alice", "bob"]
            })
        );
    }
}
