//! The device command pipeline: command instances and the queue
//! dispatching them to per-component handlers.

mod instance;
mod queue;

pub use instance::CommandInstance;
pub use queue::{CommandHandler, CommandQueue, SharedCommand, COMMAND_REMOVE_DELAY_SECS};
