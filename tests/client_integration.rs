//! End-to-end tests: client, multiplexer and in-memory broker together.

use std::{sync::Arc, thread};

use futures::StreamExt;
use parking_lot::Mutex;
use rxmqtt::prelude::*;

fn recorded(feed: EventFeed<String>) -> Arc<Mutex<Vec<String>>> {
  let calls = Arc::new(Mutex::new(vec![]));
  let c_calls = calls.clone();
  feed.subscribe(move |f| c_calls.lock().push(f));
  calls
}

fn connect(broker: &MemoryBroker, url: &str) -> RxMqttClient {
  RxMqttClient::connect(broker, url, ConnectOptions::default()).unwrap()
}

fn client_over(transport: &MemoryTransport, options: ClientOptions) -> RxMqttClient {
  RxMqttClient::with_transport(Arc::new(transport.clone()), options)
}

async fn publish(client: &RxMqttClient, topic: &str) {
  client
    .publish(topic, topic.to_owned(), PublishOptions::default())
    .await
    .unwrap();
}

#[rxmqtt_macro::test]
async fn observers_of_one_pattern_share_a_wire_subscription() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "mqtt://broker.local");
  let subscribes = recorded(client.subscribe_calls());
  let unsubscribes = recorded(client.unsubscribe_calls());

  let first = client.observe("a/+", SubscribeOptions::default()).unwrap();
  let second = client.observe("a/+", SubscribeOptions::default()).unwrap();
  let mut s1 = first.into_stream();
  let mut s2 = second.into_stream();
  client.flush().await;
  assert_eq!(*subscribes.lock(), vec!["a/+"]);

  publish(&client, "a/x").await;
  assert_eq!(s1.next().await.unwrap().topic, "a/x");
  assert_eq!(s2.next().await.unwrap().topic, "a/x");

  drop(s1);
  client.flush().await;
  assert!(unsubscribes.lock().is_empty());
  publish(&client, "a/y").await;
  assert_eq!(s2.next().await.unwrap().topic, "a/y");

  drop(s2);
  client.flush().await;
  assert_eq!(*subscribes.lock(), vec!["a/+"]);
  assert_eq!(*unsubscribes.lock(), vec!["a/+"]);
}

#[rxmqtt_macro::test]
async fn overlapping_patterns_deliver_once_per_observer() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "memory://overlap");

  let mut plus = client.observe("a/+", SubscribeOptions::default()).unwrap().into_stream();
  let mut hash = client.observe("a/#", SubscribeOptions::default()).unwrap().into_stream();
  client.flush().await;

  publish(&client, "a/b").await;
  publish(&client, "a/b/c").await;

  assert_eq!(plus.pending_len(), 1);
  assert_eq!(hash.pending_len(), 2);
  assert_eq!(plus.next().await.unwrap().topic, "a/b");
  assert_eq!(hash.next().await.unwrap().topic, "a/b");
  assert_eq!(hash.next().await.unwrap().topic, "a/b/c");
}

#[rxmqtt_macro::test]
async fn disconnect_completes_feeds_without_unsubscribing() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "memory://bye");
  let unsubscribes = recorded(client.unsubscribe_calls());
  let mut closes = client.closes().into_stream();

  let mut feed = client.observe("x/#", SubscribeOptions::default()).unwrap().into_stream();
  let _other = client.observe("y", SubscribeOptions::default()).unwrap().subscribe(|_| {});
  client.flush().await;

  client.disconnect();
  assert!(feed.next().await.is_none());
  assert_eq!(closes.next().await, Some(()));
  assert!(closes.next().await.is_none());
  assert!(unsubscribes.lock().is_empty());

  let late = client.observe("x/#", SubscribeOptions::default()).unwrap();
  assert!(late.into_stream().next().await.is_none());
  assert_eq!(
    client.publish("x/1", "v", PublishOptions::default()).await,
    Err(TransportError::NotConnected)
  );
}

#[rxmqtt_macro::test]
async fn retained_feed_replays_to_late_consumers() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "memory://retain");

  let feed = client.observe("status/+", SubscribeOptions::default().retain(true)).unwrap();
  let _early = feed.subscribe(|_| {});
  client.flush().await;
  publish(&client, "status/a").await;
  publish(&client, "status/b").await;

  let mut late = feed.into_stream();
  assert_eq!(late.pending_len(), 1);
  assert_eq!(late.next().await.unwrap().topic, "status/b");
}

#[rxmqtt_macro::test]
async fn broker_retained_messages_reach_new_observers() {
  let broker = MemoryBroker::new();
  broker.publish(Message::new("config/mode", "eco"), true);
  let client = connect(&broker, "memory://retained");

  let mut feed = client.observe("config/#", SubscribeOptions::default()).unwrap().into_stream();
  let message = feed.next().await.unwrap();
  assert_eq!(message, Message::new("config/mode", "eco"));
}

#[rxmqtt_macro::test]
async fn observe_during_in_flight_unsubscribe_resubscribes() {
  let broker = MemoryBroker::new();
  let transport = broker.open("memory://inflight", ConnectOptions::default()).unwrap();
  let client = client_over(&transport, ClientOptions::default());
  let subscribes = recorded(client.subscribe_calls());
  let mut unsubscribe_calls = client.unsubscribe_calls().into_stream();

  let first = client.observe("q/#", SubscribeOptions::default()).unwrap().subscribe(|_| {});
  client.flush().await;

  transport.hold_acks();
  first.unsubscribe();
  assert_eq!(unsubscribe_calls.next().await.as_deref(), Some("q/#"));
  assert_eq!(client.multiplexer().state("q/#"), WireState::Unsubscribing);

  let mut second = client.observe("q/#", SubscribeOptions::default()).unwrap().into_stream();
  assert_eq!(subscribes.lock().len(), 1);

  transport.release_acks();
  client.flush().await;
  assert_eq!(*subscribes.lock(), vec!["q/#", "q/#"]);
  assert_eq!(client.multiplexer().state("q/#"), WireState::Subscribed);
  assert_eq!(transport.subscriptions(), vec!["q/#"]);

  publish(&client, "q/1").await;
  assert_eq!(second.next().await.unwrap().topic, "q/1");
}

#[rxmqtt_macro::test]
fn invalid_patterns_fail_observe() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "memory://invalid");
  for pattern in ["a/#/b", "a+", "#b", ""] {
    assert!(client.observe(pattern, SubscribeOptions::default()).is_err(), "{pattern}");
  }
  assert!(client.multiplexer().patterns().is_empty());
}

#[rxmqtt_macro::test]
async fn publish_errors_propagate() {
  let broker = MemoryBroker::new();
  let client = connect(&broker, "memory://errors");
  let result = client.publish("a/+", "v", PublishOptions::default()).await;
  assert!(matches!(result, Err(TransportError::Protocol(_))));
}

#[rxmqtt_macro::test]
async fn transport_errors_reach_error_feed() {
  let broker = MemoryBroker::new();
  let transport = broker.open("memory://errfeed", ConnectOptions::default()).unwrap();
  let client = client_over(&transport, ClientOptions::default());
  let mut errors = client.errors().into_stream();

  transport.emit_error(TransportError::Other("boom".into()));
  assert_eq!(errors.next().await, Some(TransportError::Other("boom".into())));
}

#[rxmqtt_macro::test]
async fn failed_wire_subscribe_reaches_error_feed() {
  let broker = MemoryBroker::new();
  let transport = broker.open("memory://wirefail", ConnectOptions::default()).unwrap();
  let client = client_over(&transport, ClientOptions::default());
  let mut errors = client.errors().into_stream();

  transport.fail_next(TransportError::Protocol("not authorized".into()));
  let _feed = client.observe("secret/#", SubscribeOptions::default()).unwrap().subscribe(|_| {});
  assert_eq!(errors.next().await, Some(TransportError::Protocol("not authorized".into())));
}

#[rxmqtt_macro::test]
async fn resubscribes_after_reconnect_when_enabled() {
  let broker = MemoryBroker::new();
  let transport = broker.open("memory://reconnect", ConnectOptions::default()).unwrap();
  let client = client_over(&transport, ClientOptions::default().resubscribe_on_reconnect(true));
  let subscribes = recorded(client.subscribe_calls());

  let mut feed = client.observe("r/#", SubscribeOptions::default()).unwrap().into_stream();
  client.flush().await;

  transport.drop_connection();
  assert!(transport.subscriptions().is_empty());
  transport.restore_connection();
  client.flush().await;

  assert_eq!(*subscribes.lock(), vec!["r/#", "r/#"]);
  assert_eq!(transport.subscriptions(), vec!["r/#"]);
  publish(&client, "r/1").await;
  assert_eq!(feed.next().await.unwrap().topic, "r/1");
}

#[rxmqtt_macro::test]
async fn reconnect_is_left_to_the_transport_by_default() {
  let broker = MemoryBroker::new();
  let transport = broker
    .open("memory://durable", ConnectOptions::default().clean_session(false))
    .unwrap();
  let client = client_over(&transport, ClientOptions::default());
  let subscribes = recorded(client.subscribe_calls());

  let mut feed = client.observe("d/+", SubscribeOptions::default()).unwrap().into_stream();
  client.flush().await;
  transport.drop_connection();
  transport.restore_connection();
  client.flush().await;

  assert_eq!(subscribes.lock().len(), 1);
  publish(&client, "d/1").await;
  assert_eq!(feed.next().await.unwrap().topic, "d/1");
}

#[rxmqtt_macro::test]
async fn concurrent_observers_issue_one_subscribe() {
  let broker = MemoryBroker::new();
  let client = Arc::new(connect(&broker, "memory://concurrent"));
  let subscribes = recorded(client.subscribe_calls());
  let unsubscribes = recorded(client.unsubscribe_calls());

  let handles: Vec<_> = (0..8)
    .map(|_| {
      let client = client.clone();
      thread::spawn(move || {
        client
          .observe("c/+/v", SubscribeOptions::default())
          .unwrap()
          .subscribe(|_| {})
      })
    })
    .collect();
  let subscriptions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
  client.flush().await;
  assert_eq!(*subscribes.lock(), vec!["c/+/v"]);
  assert_eq!(client.multiplexer().ref_count("c/+/v"), 8);

  let handles: Vec<_> = subscriptions
    .into_iter()
    .map(|s| thread::spawn(move || s.unsubscribe()))
    .collect();
  for h in handles {
    h.join().unwrap();
  }
  client.flush().await;
  assert_eq!(*unsubscribes.lock(), vec!["c/+/v"]);
  assert_eq!(client.multiplexer().state("c/+/v"), WireState::Unsubscribed);
}
