use std::io::{self, Result as IoResult, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event::Event;

/// Output target consuming typed [`Event`]s from the bus listener.
///
/// Sinks run on the listener task, so `handle` should not block for long.
/// A sink error is logged by the bus and never stops delivery to the
/// remaining sinks.
pub trait EventSink: Send + Sync {
    fn handle(&mut self, event: &Event) -> IoResult<()>;
}

/// Writes one display line per event to any [`Write`] target.
pub struct WriterSink<W: Write + Send + Sync> {
    writer: W,
}

impl<W: Write + Send + Sync> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send + Sync> EventSink for WriterSink<W> {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        writeln!(self.writer, "{event}")?;
        self.writer.flush()
    }
}

/// Line-per-event stdout sink, the default bus output.
pub struct StdOutSink(WriterSink<io::Stdout>);

impl Default for StdOutSink {
    fn default() -> Self {
        Self(WriterSink::new(io::stdout()))
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.0.handle(event)
    }
}

/// Captures events in memory; clones share the same buffer, so a test can
/// keep one handle and give the other to the bus.
#[derive(Clone, Default)]
pub struct MemorySink {
    captured: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.captured.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.captured.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captured.lock().is_empty()
    }

    pub fn clear(&self) {
        self.captured.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.captured.lock().push(event.clone());
        Ok(())
    }
}

/// Forwards events into a tokio mpsc channel without blocking, bridging the
/// bus to an async consumer such as the external task executor that
/// dispatches `node:ready` work.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// # Example
    /// ```no_run
    /// use tokio::sync::mpsc;
    /// use taskloom::event_bus::{ChannelSink, EventBus};
    ///
    /// let (tx, mut rx) = mpsc::unbounded_channel();
    /// let bus = EventBus::with_sink(ChannelSink::new(tx));
    /// bus.listen_for_events();
    ///
    /// tokio::spawn(async move {
    ///     while let Some(event) = rx.recv().await {
    ///         println!("dispatch: {event}");
    ///     }
    /// });
    /// ```
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}
