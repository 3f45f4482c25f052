//! Event fan-out for orchestrator output.
//!
//! The orchestrator's only output is a stream of typed [`Event`]s sent through
//! a flume channel. [`EventBus`] owns the channel and broadcasts received
//! events to any number of [`EventSink`]s from a background listener task.

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::{EventBus, SinkId};
pub use event::Event;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink, WriterSink};
