use std::time::Duration;

use taskloom::definition::DagNode;
use taskloom::event_bus::{ChannelSink, Event, EventBus, EventSink, MemorySink};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn ready(node_id: &str) -> Event {
    Event::NodeReady {
        node_id: node_id.to_string(),
        node: DagNode::new(node_id),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn listener_fans_out_to_every_sink() {
    let first = MemorySink::new();
    let second = MemorySink::new();
    let bus = EventBus::with_sink(first.clone());
    bus.add_sink(second.clone());
    bus.listen_for_events();

    let tx = bus.get_sender();
    tx.send(ready("a")).unwrap();
    tx.send(ready("b")).unwrap();

    wait_for(|| second.snapshot().len() == 2).await;
    let ids: Vec<Option<String>> = first
        .snapshot()
        .iter()
        .map(|e| e.node_id().map(str::to_string))
        .collect();
    assert_eq!(ids, vec![Some("a".to_string()), Some("b".to_string())]);
    assert_eq!(first.snapshot(), second.snapshot());
}

#[tokio::test]
async fn removed_sink_no_longer_receives_events() {
    let first = MemorySink::new();
    let second = MemorySink::new();
    let bus = EventBus::with_sink(first.clone());
    let second_id = bus.add_sink(second.clone());
    bus.listen_for_events();

    bus.get_sender().send(ready("a")).unwrap();
    wait_for(|| second.len() == 1).await;

    assert!(bus.remove_sink(second_id));
    assert!(!bus.remove_sink(second_id), "id is spent after removal");

    bus.get_sender().send(ready("b")).unwrap();
    wait_for(|| first.len() == 2).await;
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn disconnected_channel_sink_is_evicted() {
    let memory = MemorySink::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let bus = EventBus::with_sinks(vec![
        Box::new(ChannelSink::new(tx)) as Box<dyn EventSink>,
        Box::new(memory.clone()),
    ]);
    bus.listen_for_events();
    assert_eq!(bus.sink_count(), 2);

    // Receiver gone: the first delivery attempt evicts the channel sink.
    drop(rx);
    bus.get_sender().send(ready("a")).unwrap();
    wait_for(|| bus.sink_count() == 1).await;

    // Delivery keeps working for the surviving sink.
    bus.get_sender().send(ready("b")).unwrap();
    wait_for(|| memory.len() == 2).await;
}

#[tokio::test]
async fn channel_sink_streams_to_async_consumer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus = EventBus::with_sink(ChannelSink::new(tx));
    bus.listen_for_events();

    bus.get_sender().send(ready("fetch")).unwrap();
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within 2s")
        .expect("channel open");
    assert_eq!(event.node_id(), Some("fetch"));
}

#[tokio::test]
async fn listen_for_events_is_idempotent() {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen_for_events();
    bus.listen_for_events();

    bus.get_sender().send(ready("a")).unwrap();
    wait_for(|| !sink.snapshot().is_empty()).await;
    // A second listener would have raced for the event; exactly one copy
    // per sink proves only one is running.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.snapshot().len(), 1);
}

#[tokio::test]
async fn stop_listener_halts_delivery() {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen_for_events();

    bus.get_sender().send(ready("a")).unwrap();
    wait_for(|| sink.snapshot().len() == 1).await;

    bus.stop_listener().await;
    bus.get_sender().send(ready("b")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.snapshot().len(), 1);
}
