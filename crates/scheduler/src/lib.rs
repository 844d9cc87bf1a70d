pub mod error;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod set;

pub use error::QueueError;
pub use model::{CommandHandle, CommandTimeline, QueueConfig};
pub use queue::CommandQueue;
pub use set::QueueSet;
