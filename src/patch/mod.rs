//! Stream patch lifecycle: commands, session threads and statistics

mod command;
mod session;

pub use command::{Command, CommandQueue, CommandSender, COMMAND_QUEUE_DEPTH};
pub use session::{PatchSession, SessionConfig, SessionState, SessionStats};
