use std::fmt;
use thiserror::Error;

use super::event::RunEvent;

/// Abstract event emitter the scheduler holds; cloneable across tasks.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event synchronously without blocking.
    fn emit(&self, event: RunEvent) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event bus closed")]
    Closed,
    #[error("event emission failed: {0}")]
    Other(String),
}

/// Emitter backed by an [`EventBus`](super::EventBus) sender.
#[derive(Clone, Debug)]
pub struct BusEmitter {
    sender: flume::Sender<RunEvent>,
}

impl BusEmitter {
    pub fn new(sender: flume::Sender<RunEvent>) -> Self {
        Self { sender }
    }
}

impl EventEmitter for BusEmitter {
    fn emit(&self, event: RunEvent) -> Result<(), EmitterError> {
        self.sender.send(event).map_err(|_| EmitterError::Closed)
    }
}

/// Emitter that discards everything, for embedded use without a bus.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: RunEvent) -> Result<(), EmitterError> {
        Ok(())
    }
}
