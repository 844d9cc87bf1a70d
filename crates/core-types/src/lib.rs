use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Shared message error for the PagePilot crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PilotError {
    #[error("{message}")]
    Message { message: String },
}

impl PilotError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Logical key of a browser page, one per automation ("whatsapp", "declaraguate").
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PageKey(pub String);

impl PageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Login status of one automation's browser session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LoginStatus {
    #[default]
    NotLoggedIn,
    LoginInProgress,
    LoggedIn,
}

impl LoginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStatus::NotLoggedIn => "not_logged_in",
            LoginStatus::LoginInProgress => "login_in_progress",
            LoginStatus::LoggedIn => "logged_in",
        }
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat entry as reported by the in-page mutation observer.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedMessage {
    pub sender: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default, alias = "time")]
    pub time_text: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub has_unread: bool,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    LoginStatusChanged,
    NewQrScreenshot,
    MessageArrived,
}

/// Events carried on the bus. Transient: published and forgotten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PilotEvent {
    LoginStatusChanged { key: PageKey, status: LoginStatus },
    NewQrScreenshot { key: PageKey, path: PathBuf },
    MessageArrived { key: PageKey, message: ObservedMessage },
}

impl PilotEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PilotEvent::LoginStatusChanged { .. } => EventKind::LoginStatusChanged,
            PilotEvent::NewQrScreenshot { .. } => EventKind::NewQrScreenshot,
            PilotEvent::MessageArrived { .. } => EventKind::MessageArrived,
        }
    }

    pub fn key(&self) -> &PageKey {
        match self {
            PilotEvent::LoginStatusChanged { key, .. }
            | PilotEvent::NewQrScreenshot { key, .. }
            | PilotEvent::MessageArrived { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_payload_deserializes_with_defaults() {
        let raw = r#"{"sender":"Ana","time":"3:45 p. m.","body":"hola","hasUnread":true,"unreadCount":2}"#;
        let message: ObservedMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.sender, "Ana");
        assert_eq!(message.time_text, "3:45 p. m.");
        assert!(!message.is_self);
        assert_eq!(message.unread_count, 2);
    }

    #[test]
    fn event_kind_matches_variant() {
        let event = PilotEvent::LoginStatusChanged {
            key: PageKey::from("whatsapp"),
            status: LoginStatus::LoggedIn,
        };
        assert_eq!(event.kind(), EventKind::LoginStatusChanged);
        assert_eq!(event.key().as_str(), "whatsapp");
    }
}
