use std::error::Error as StdError;

use page_broker::BrokerError;
use pagepilot_core_types::PilotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    QueueClosed,
    /// The command body failed, panicked or timed out. Only its own handle
    /// carries this; the worker keeps running.
    #[error("command failed: {0}")]
    CommandFailed(#[source] Box<dyn StdError + Send + Sync>),
    #[error("page unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("command dropped before completion")]
    Dropped,
}

impl QueueError {
    pub fn failed(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::CommandFailed(Box::new(cause))
    }

    /// Typed access to the error raised inside a command body.
    pub fn cause<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            QueueError::CommandFailed(cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<QueueError> for PilotError {
    fn from(value: QueueError) -> Self {
        PilotError::new(value.to_string())
    }
}
