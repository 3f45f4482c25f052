use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::event::Event;
use super::sink::{EventSink, StdOutSink};

/// Handle returned by sink registration, accepted by
/// [`remove_sink`](EventBus::remove_sink).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

struct Registered {
    id: SinkId,
    sink: Box<dyn EventSink>,
}

type SharedSinks = Arc<Mutex<Vec<Registered>>>;

/// Fan-out point between orchestrators and event consumers.
///
/// Orchestrators push [`Event`]s into a flume channel obtained from
/// [`get_sender`](EventBus::get_sender); a background listener task drains
/// the channel and delivers each event to every registered [`EventSink`] in
/// registration order. One bus serves any number of executions. Sinks come
/// and go over the bus's lifetime: registration hands back a [`SinkId`] for
/// explicit removal, and a sink whose far side disconnects (reports
/// `BrokenPipe`) is evicted automatically.
pub struct EventBus {
    sinks: SharedSinks,
    next_sink_id: AtomicU64,
    sender: flume::Sender<Event>,
    receiver: flume::Receiver<Event>,
    listener: Mutex<Option<Listener>>,
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    /// A bus with a single sink.
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        let bus = Self::empty();
        bus.add_sink(sink);
        bus
    }

    /// A bus delivering to the given sinks, in order.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let bus = Self::empty();
        {
            let mut registered = bus.sinks.lock();
            for sink in sinks {
                let id = SinkId(bus.next_sink_id.fetch_add(1, Ordering::Relaxed));
                registered.push(Registered { id, sink });
            }
        }
        bus
    }

    fn empty() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_sink_id: AtomicU64::new(0),
            sender,
            receiver,
            listener: Mutex::new(None),
        }
    }

    /// Register another sink; takes effect for all later events. The
    /// returned id unregisters it again via [`remove_sink`](Self::remove_sink).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) -> SinkId {
        let id = SinkId(self.next_sink_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.lock().push(Registered {
            id,
            sink: Box::new(sink),
        });
        id
    }

    /// Unregister a sink. Returns false if the id was already gone (removed
    /// before, or evicted after a disconnect).
    pub fn remove_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|entry| entry.id != id);
        sinks.len() != before
    }

    /// Number of currently registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Producer handle for emitting events into the bus.
    #[must_use]
    pub fn get_sender(&self) -> flume::Sender<Event> {
        self.sender.clone()
    }

    /// Start the listener task. Idempotent; must run inside a tokio runtime.
    pub fn listen_for_events(&self) {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return;
        }

        let receiver = self.receiver.clone();
        let sinks = Arc::clone(&self.sinks);
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        // Flush whatever is already queued, then stop.
                        for event in receiver.try_iter() {
                            broadcast(&sinks, &event);
                        }
                        break;
                    }
                    received = receiver.recv_async() => {
                        let Ok(event) = received else {
                            break; // All senders dropped.
                        };
                        broadcast(&sinks, &event);
                    }
                }
            }
        });

        *slot = Some(Listener { shutdown, task });
    }

    /// Stop the listener after flushing already-queued events. Events sent
    /// after this point sit in the channel until a new listener starts.
    pub async fn stop_listener(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.shutdown.send(());
            let _ = listener.task.await;
        }
    }
}

/// Deliver to every sink. A `BrokenPipe` means the sink's consumer is gone
/// for good, so the sink is dropped from the registry instead of failing on
/// every event for the rest of the bus's life.
fn broadcast(sinks: &SharedSinks, event: &Event) {
    sinks.lock().retain_mut(|entry| match entry.sink.handle(event) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::warn!(sink_id = ?entry.id, "sink disconnected; evicting");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, event_kind = event.kind(), "event sink error");
            true
        }
    });
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            let _ = listener.shutdown.send(());
            listener.task.abort();
        }
    }
}
