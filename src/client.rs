//! The client facade.
//!
//! [`RxMqttClient`] ties a transport to the [`EventHub`], the
//! [`Multiplexer`] and the [`CallLog`]:
//!
//! ```rust
//! use futures::StreamExt;
//! use rxmqtt::prelude::*;
//!
//! # futures::executor::block_on(async {
//! let broker = MemoryBroker::new();
//! let client =
//!   RxMqttClient::connect(&broker, "memory://demo", ConnectOptions::default()).unwrap();
//!
//! let temps = client.observe("sensors/+/temp", SubscribeOptions::default()).unwrap();
//! let mut temps = temps.into_stream();
//! client.flush().await;
//! client.publish("sensors/kitchen/temp", "21.5", PublishOptions::default()).await.unwrap();
//!
//! let message = temps.next().await.unwrap();
//! assert_eq!(message.topic, "sensors/kitchen/temp");
//! client.disconnect();
//! # });
//! ```

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::{
  call_log::CallLog,
  error::{PatternError, TransportError},
  feed::TopicFeed,
  hub::{EventFeed, EventHub},
  multiplexer::Multiplexer,
  scheduler::Scheduler,
  subject::SubjectSubscription,
  subscription::Subscription,
  topic,
  transport::{ConnectOptions, Connector, Message, PublishOptions, SubscribeOptions, Transport},
};

/// Client-side behaviour that is not part of the connection itself.
#[derive(Clone)]
pub struct ClientOptions {
  /// Re-issue every active wire subscription after the transport reconnects.
  /// Off by default: most transports restore subscriptions themselves.
  pub resubscribe_on_reconnect: bool,
  /// Where the wire driver runs.
  pub scheduler: Arc<dyn Scheduler>,
}

impl ClientOptions {
  pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
    Self { resubscribe_on_reconnect: false, scheduler }
  }

  pub fn resubscribe_on_reconnect(mut self, enabled: bool) -> Self {
    self.resubscribe_on_reconnect = enabled;
    self
  }
}

impl Default for ClientOptions {
  fn default() -> Self {
    #[cfg(feature = "futures-scheduler")]
    let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::ThreadPoolScheduler::default());
    #[cfg(not(feature = "futures-scheduler"))]
    let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::NewThreadScheduler);
    Self::new(scheduler)
  }
}

/// Reactive MQTT client.
pub struct RxMqttClient {
  transport: Arc<CallLog>,
  hub: EventHub,
  multiplexer: Arc<Multiplexer>,
  connect_options: Option<ConnectOptions>,
  watchers: Mutex<SmallVec<[SubjectSubscription<(), std::convert::Infallible>; 3]>>,
  disconnected: AtomicBool,
}

impl RxMqttClient {
  /// Connect through `connector` with default [`ClientOptions`].
  pub fn connect<C>(
    connector: &C,
    url: &str,
    options: ConnectOptions,
  ) -> Result<Self, TransportError>
  where
    C: Connector + ?Sized,
  {
    Self::connect_with(connector, url, options, ClientOptions::default())
  }

  pub fn connect_with<C>(
    connector: &C,
    url: &str,
    options: ConnectOptions,
    client_options: ClientOptions,
  ) -> Result<Self, TransportError>
  where
    C: Connector + ?Sized,
  {
    debug!(%url, ?options, "connecting");
    let transport = connector.connect(url, options.clone())?;
    let mut client = Self::with_transport(transport, client_options);
    client.connect_options = Some(options);
    Ok(client)
  }

  /// Wrap an already connected transport.
  pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
    let transport = Arc::new(CallLog::new(transport));
    let hub = EventHub::attach(&*transport);
    let multiplexer = Multiplexer::new(transport.clone(), &hub, &*options.scheduler);

    let mut watchers = SmallVec::new();
    if options.resubscribe_on_reconnect {
      let dropped = Arc::new(AtomicBool::new(false));
      let c_dropped = dropped.clone();
      watchers.push(hub.offlines().subscribe(move |_| c_dropped.store(true, Ordering::Release)));
      let c_dropped = dropped.clone();
      watchers.push(hub.closes().subscribe(move |_| c_dropped.store(true, Ordering::Release)));
      let weak = Arc::downgrade(&multiplexer);
      watchers.push(hub.connects().subscribe(move |_| {
        if !dropped.swap(false, Ordering::AcqRel) {
          return;
        }
        if let Some(multiplexer) = weak.upgrade() {
          info!("reconnected, restoring subscriptions");
          multiplexer.restore();
        }
      }));
    }

    RxMqttClient {
      transport,
      hub,
      multiplexer,
      connect_options: None,
      watchers: Mutex::new(watchers),
      disconnected: AtomicBool::new(false),
    }
  }

  /// A feed of every message whose topic matches `pattern`.
  ///
  /// Nothing reaches the wire until the feed gets its first consumer.
  pub fn observe(
    &self,
    pattern: &str,
    options: SubscribeOptions,
  ) -> Result<TopicFeed, PatternError> {
    let filter = topic::compile(pattern)?;
    Ok(TopicFeed::new(Arc::new(filter), options, self.multiplexer.clone()))
  }

  /// Forward a publish to the transport and resolve with its outcome.
  pub async fn publish(
    &self,
    topic: &str,
    payload: impl Into<Bytes>,
    options: PublishOptions,
  ) -> Result<(), TransportError> {
    self.transport.publish(topic, payload.into(), options).await
  }

  /// Publish a prepared [`Message`].
  pub async fn publish_message(
    &self,
    message: Message,
    options: PublishOptions,
  ) -> Result<(), TransportError> {
    self.transport.publish(&message.topic, message.payload, options).await
  }

  /// Tear everything down.
  ///
  /// Wire subscriptions are not unsubscribed one by one: the connection is
  /// forcibly ended instead. Every feed completes. Idempotent.
  pub fn disconnect(&self) {
    if self.disconnected.swap(true, Ordering::AcqRel) {
      return;
    }
    debug!("disconnecting");
    self.multiplexer.shutdown();
    for watcher in self.watchers.lock().drain(..) {
      watcher.unsubscribe();
    }
    self.transport.end(true);
    self.hub.complete();
    self.transport.complete();
  }

  pub fn is_disconnected(&self) -> bool { self.disconnected.load(Ordering::Acquire) }

  pub fn connects(&self) -> EventFeed<()> { self.hub.connects() }

  pub fn closes(&self) -> EventFeed<()> { self.hub.closes() }

  pub fn offlines(&self) -> EventFeed<()> { self.hub.offlines() }

  pub fn errors(&self) -> EventFeed<TransportError> { self.hub.errors() }

  /// Every inbound message, before any pattern routing.
  pub fn messages(&self) -> EventFeed<Message> { self.hub.messages() }

  /// Filter of every wire subscribe that was issued.
  pub fn subscribe_calls(&self) -> EventFeed<String> { self.transport.subscribe_calls() }

  /// Filter of every wire unsubscribe that was issued.
  pub fn unsubscribe_calls(&self) -> EventFeed<String> { self.transport.unsubscribe_calls() }

  /// Options the client connected with, when built through a connector.
  pub fn connect_options(&self) -> Option<&ConnectOptions> { self.connect_options.as_ref() }

  pub fn multiplexer(&self) -> &Multiplexer { &self.multiplexer }

  /// Resolves once every queued wire call has been acknowledged.
  pub async fn flush(&self) { self.multiplexer.flush().await }
}

#[cfg(test)]
mod test {
  use futures::StreamExt;

  use super::*;
  use crate::{memory::MemoryBroker, scheduler::NewThreadScheduler};

  fn options() -> ClientOptions { ClientOptions::new(Arc::new(NewThreadScheduler)) }

  fn connected(broker: &MemoryBroker) -> RxMqttClient {
    RxMqttClient::connect_with(broker, "memory://c", Default::default(), options()).unwrap()
  }

  #[rxmqtt_macro::test]
  fn invalid_pattern_is_rejected_synchronously() {
    let broker = MemoryBroker::new();
    let client = connected(&broker);
    assert_eq!(
      client.observe("a/#/b", SubscribeOptions::default()).err(),
      Some(PatternError::MultiLevelNotLast { pattern: "a/#/b".into() })
    );
    assert_eq!(client.observe("", SubscribeOptions::default()).err(), Some(PatternError::Empty));
  }

  #[rxmqtt_macro::test]
  fn invalid_url_fails_connect() {
    let broker = MemoryBroker::new();
    let result = RxMqttClient::connect_with(&broker, "ftp://nope", Default::default(), options());
    assert_eq!(result.err(), Some(TransportError::InvalidUrl("ftp://nope".into())));
  }

  #[rxmqtt_macro::test]
  fn keeps_connect_options() {
    let broker = MemoryBroker::new();
    let connect = ConnectOptions::default().client_id("sensor-gateway");
    let client =
      RxMqttClient::connect_with(&broker, "memory://c", connect.clone(), options()).unwrap();
    assert_eq!(client.connect_options(), Some(&connect));
  }

  #[rxmqtt_macro::test]
  fn disconnect_is_idempotent() {
    let broker = MemoryBroker::new();
    let client = connected(&broker);
    let closes = Arc::new(Mutex::new(0));
    let c_closes = closes.clone();
    client.closes().subscribe(move |_| *c_closes.lock() += 1);

    client.disconnect();
    client.disconnect();
    assert!(client.is_disconnected());
    assert_eq!(*closes.lock(), 1);
    assert!(client.messages().is_stopped());
    assert!(client.subscribe_calls().is_stopped());
  }

  #[rxmqtt_macro::test]
  fn connect_is_visible_after_construction() {
    let broker = MemoryBroker::new();
    let client = connected(&broker);
    let connects = Arc::new(Mutex::new(0));
    let c_connects = connects.clone();
    client.connects().subscribe(move |_| *c_connects.lock() += 1);
    assert_eq!(*connects.lock(), 1);
  }

  #[rxmqtt_macro::test]
  async fn disconnect_mid_subscribe_reports_no_error() {
    let broker = MemoryBroker::new();
    let transport = broker.open("memory://c", Default::default()).unwrap();
    let client = RxMqttClient::with_transport(Arc::new(transport.clone()), options());
    let errors = Arc::new(Mutex::new(vec![]));
    let c_errors = errors.clone();
    client.errors().subscribe(move |e| c_errors.lock().push(e));
    let mut calls = client.subscribe_calls().into_stream();

    transport.hold_acks();
    let _feed = client.observe("a", SubscribeOptions::default()).unwrap().subscribe(|_| {});
    assert_eq!(calls.next().await.as_deref(), Some("a"));

    client.disconnect();
    client.flush().await;
    assert!(errors.lock().is_empty());
  }
}
