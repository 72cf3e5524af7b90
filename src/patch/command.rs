//! Lifecycle commands and the bounded queue that carries them

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Commands queued at most before new ones are dropped
pub const COMMAND_QUEUE_DEPTH: usize = 16;

/// Stream lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Pause => "PAUSE",
            Command::Resume => "RESUME",
        };
        f.write_str(name)
    }
}

/// Fixed-depth FIFO between command producers and the session loop
pub struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    accepting: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CommandQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            tx,
            rx,
            accepting: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle for submitting from other threads
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
            accepting: self.accepting.clone(),
            dropped: self.dropped.clone(),
        }
    }

    /// Next queued command, `None` when the queue is empty
    pub fn try_pop(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Commands dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting commands and discard any still queued
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(COMMAND_QUEUE_DEPTH)
    }
}

/// Cloneable submit side of a `CommandQueue`
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    accepting: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CommandSender {
    /// Queue a command without blocking
    ///
    /// Returns false when the command was dropped.
    pub fn submit(&self, command: Command) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping {}: session not accepting commands", command);
            return false;
        }
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Command queue full, dropping {}", command);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
