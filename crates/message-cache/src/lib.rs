//! Last-seen message cache used to drop duplicate and stale observations
//! from the chat list observer.

pub mod time;

use std::collections::HashMap;

use chrono::NaiveTime;
use parking_lot::Mutex;
use tracing::debug;

use pagepilot_core_types::ObservedMessage;

pub use time::{parse_chat_time, try_parse_chat_time};

#[derive(Clone, Debug)]
struct CachedMessage {
    message: ObservedMessage,
    time: NaiveTime,
}

/// Sender -> last emitted message. Entries are overwritten, never removed.
#[derive(Default)]
pub struct MessageDedupCache {
    last: Mutex<HashMap<String, CachedMessage>>,
}

impl MessageDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_emit(&self, message: &ObservedMessage) -> bool {
        let guard = self.last.lock();
        Self::is_fresh(guard.get(&message.sender), message)
    }

    pub fn record(&self, message: ObservedMessage) {
        let time = parse_chat_time(&message.time_text);
        self.last
            .lock()
            .insert(message.sender.clone(), CachedMessage { message, time });
    }

    /// Checks and records in one step; returns whether to emit.
    pub fn observe(&self, message: &ObservedMessage) -> bool {
        let mut guard = self.last.lock();
        if !Self::is_fresh(guard.get(&message.sender), message) {
            return false;
        }
        guard.insert(
            message.sender.clone(),
            CachedMessage {
                message: message.clone(),
                time: parse_chat_time(&message.time_text),
            },
        );
        true
    }

    pub fn last(&self, sender: &str) -> Option<ObservedMessage> {
        self.last
            .lock()
            .get(sender)
            .map(|cached| cached.message.clone())
    }

    pub fn len(&self) -> usize {
        self.last.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(cached: Option<&CachedMessage>, message: &ObservedMessage) -> bool {
        let Some(cached) = cached else {
            return true;
        };
        if cached.message.body == message.body {
            debug!(target: "message-cache", sender = %message.sender, "duplicate body suppressed");
            return false;
        }
        if parse_chat_time(&message.time_text) < cached.time {
            debug!(
                target: "message-cache",
                sender = %message.sender,
                time = %message.time_text,
                "stale observation suppressed"
            );
            return false;
        }
        true
    }
}

/// First run of 4 to 8 ASCII digits in `body`, the shape of a one-time code.
pub fn extract_code(body: &str) -> Option<String> {
    body.split(|c: char| !c.is_ascii_digit())
        .find(|run| (4..=8).contains(&run.len()))
        .map(str::to_string)
}
