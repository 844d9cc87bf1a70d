use std::time::Duration;

use page_broker::PageError;
use pagepilot_core_types::PilotError;
use pagepilot_event_bus::BusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Neither the authenticated nor the unauthenticated marker showed up.
    #[error("session probe timed out after {0:?}")]
    SessionProbeTimeout(Duration),
    #[error("login was not confirmed within {0:?}")]
    LoginTimedOut(Duration),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("event bus: {0}")]
    Bus(#[from] BusError),
}

impl From<SessionError> for PilotError {
    fn from(value: SessionError) -> Self {
        PilotError::new(value.to_string())
    }
}
