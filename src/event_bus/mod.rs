//! Run event fan-out: a flume-backed bus broadcasting lifecycle events to
//! pluggable sinks.
//!
//! The scheduler emits [`RunEvent`]s through an [`EventEmitter`]; the
//! [`EventBus`] listener task forwards each event to every configured
//! [`EventSink`] (stdout, in-memory capture, or a channel feeding an
//! external consumer).

pub mod bus;
pub mod emitter;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{BusEmitter, EmitterError, EventEmitter, NullEmitter};
pub use event::RunEvent;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
