//! The consumer side of `observe`.
//!
//! A [`TopicFeed`] is cold until someone attaches: the first consumer
//! registers the pattern with the multiplexer, later consumers share that
//! registration, and the last one to leave releases it. With
//! [`SubscribeOptions::retain`] the feed keeps the most recent message and
//! hands it to consumers that attach late.

use std::{convert::Infallible, sync::Arc};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
  multiplexer::{Multiplexer, Registration},
  observer::{FnMutObserver, Observer},
  stream::{into_stream, FeedStream},
  subject::{Subject, SubjectSubscription},
  subscription::Subscription,
  topic::TopicFilter,
  transport::{Message, SubscribeOptions},
};

#[derive(Default)]
struct FeedState {
  consumers: usize,
  registration: Option<Registration>,
}

struct FeedInner {
  filter: Arc<TopicFilter>,
  options: SubscribeOptions,
  multiplexer: Arc<Multiplexer>,
  subject: Subject<Message, Infallible>,
  state: Mutex<FeedState>,
}

impl FeedInner {
  fn connect(&self) {
    let mut state = self.state.lock();
    state.consumers += 1;
    if state.registration.is_some() {
      return;
    }
    let registered = self
      .multiplexer
      .register(self.filter.clone(), self.options.qos, self.subject.clone());
    match registered {
      Ok(registration) => {
        trace!(pattern = %self.filter, "feed connected");
        state.registration = Some(registration);
      }
      Err(_closed) => {
        drop(state);
        self.subject.complete();
      }
    }
  }

  fn disconnect(&self) {
    let registration = {
      let mut state = self.state.lock();
      state.consumers = state.consumers.saturating_sub(1);
      if state.consumers > 0 {
        return;
      }
      // Cleared under the lock so it cannot wipe a message cached for a
      // consumer that attached after this one left.
      self.subject.clear_replay();
      state.registration.take()
    };
    if let Some(registration) = registration {
      trace!(pattern = %self.filter, "feed released");
      registration.unsubscribe();
    }
  }
}

/// Messages matching one pattern, shared by every consumer of the feed.
#[derive(Clone)]
pub struct TopicFeed {
  inner: Arc<FeedInner>,
}

impl TopicFeed {
  pub(crate) fn new(
    filter: Arc<TopicFilter>,
    options: SubscribeOptions,
    multiplexer: Arc<Multiplexer>,
  ) -> Self {
    let subject = if options.retain { Subject::replay_last() } else { Subject::new() };
    let state = Mutex::new(FeedState::default());
    let inner = FeedInner { filter, options, multiplexer, subject, state };
    Self { inner: Arc::new(inner) }
  }

  pub fn pattern(&self) -> &str { self.inner.filter.pattern() }

  pub fn filter(&self) -> &TopicFilter { &self.inner.filter }

  pub fn options(&self) -> SubscribeOptions { self.inner.options }

  /// Consumers currently attached.
  pub fn consumer_count(&self) -> usize { self.inner.state.lock().consumers }

  pub fn actual_subscribe<O>(&self, observer: O) -> FeedSubscription
  where
    O: Observer<Message, Infallible> + Send + 'static,
  {
    let subscription = self.inner.subject.actual_subscribe(observer);
    self.inner.connect();
    FeedSubscription { feed: self.inner.clone(), subscription }
  }

  pub fn subscribe<F>(&self, next: F) -> FeedSubscription
  where
    F: FnMut(Message) + Send + 'static,
  {
    self.actual_subscribe(FnMutObserver(next))
  }

  /// Consume the feed as a `futures` stream. Dropping the stream detaches.
  pub fn into_stream(&self) -> FeedStream<Message, FeedSubscription> {
    into_stream(|observer| self.actual_subscribe(observer))
  }
}

/// One consumer of a [`TopicFeed`].
pub struct FeedSubscription {
  feed: Arc<FeedInner>,
  subscription: SubjectSubscription<Message, Infallible>,
}

impl Subscription for FeedSubscription {
  fn unsubscribe(self) {
    self.subscription.unsubscribe();
    self.feed.disconnect();
  }

  fn is_closed(&self) -> bool { self.subscription.is_closed() }
}

#[cfg(test)]
mod test {
  use futures::StreamExt;

  use super::*;
  use crate::{
    call_log::CallLog,
    hub::EventHub,
    memory::{MemoryBroker, MemoryTransport},
    multiplexer::WireState,
    observer::ObserverComplete,
    scheduler::NewThreadScheduler,
    topic::compile,
    transport::{PublishOptions, Transport},
  };

  fn setup() -> (MemoryTransport, Arc<Multiplexer>) {
    let broker = MemoryBroker::new();
    let transport = broker.open("memory://feed", Default::default()).unwrap();
    let log: Arc<dyn Transport> = Arc::new(CallLog::new(Arc::new(transport.clone())));
    let hub = EventHub::attach(&*log);
    let multiplexer = Multiplexer::new(log, &hub, &NewThreadScheduler);
    (transport, multiplexer)
  }

  fn feed(multiplexer: &Arc<Multiplexer>, pattern: &str, options: SubscribeOptions) -> TopicFeed {
    TopicFeed::new(Arc::new(compile(pattern).unwrap()), options, multiplexer.clone())
  }

  async fn publish(transport: &MemoryTransport, topic: &str, payload: &'static str, retain: bool) {
    transport
      .publish(topic, payload.into(), PublishOptions::default().retain(retain))
      .await
      .unwrap();
  }

  #[rxmqtt_macro::test]
  async fn lazy_until_first_consumer() {
    let (_transport, multiplexer) = setup();
    let feed = feed(&multiplexer, "l/+", SubscribeOptions::default());
    multiplexer.flush().await;
    assert!(multiplexer.patterns().is_empty());

    let first = feed.subscribe(|_| {});
    let second = feed.subscribe(|_| {});
    assert_eq!(feed.consumer_count(), 2);
    assert_eq!(multiplexer.ref_count("l/+"), 1);

    first.unsubscribe();
    multiplexer.flush().await;
    assert_eq!(multiplexer.state("l/+"), WireState::Subscribed);
    second.unsubscribe();
    multiplexer.flush().await;
    assert_eq!(multiplexer.state("l/+"), WireState::Unsubscribed);
  }

  #[rxmqtt_macro::test]
  async fn consumers_share_messages() {
    let (transport, multiplexer) = setup();
    let feed = feed(&multiplexer, "m/#", SubscribeOptions::default());
    let mut a = feed.into_stream();
    let mut b = feed.into_stream();
    multiplexer.flush().await;

    publish(&transport, "m/1", "x", false).await;
    assert_eq!(a.next().await.map(|m| m.topic), Some("m/1".to_owned()));
    assert_eq!(b.next().await.map(|m| m.topic), Some("m/1".to_owned()));

    drop(a);
    assert_eq!(feed.consumer_count(), 1);
    publish(&transport, "m/2", "y", false).await;
    assert_eq!(b.next().await.map(|m| m.topic), Some("m/2".to_owned()));
  }

  #[rxmqtt_macro::test]
  async fn retain_replays_latest_to_late_consumers() {
    let (transport, multiplexer) = setup();
    let feed = feed(&multiplexer, "r", SubscribeOptions::default().retain(true));
    let early = feed.subscribe(|_| {});
    multiplexer.flush().await;
    publish(&transport, "r", "1", false).await;
    publish(&transport, "r", "2", false).await;

    let late = Arc::new(Mutex::new(vec![]));
    let c_late = late.clone();
    let late_sub = feed.subscribe(move |m| c_late.lock().push(m.payload));
    assert_eq!(*late.lock(), vec![bytes::Bytes::from_static(b"2")]);

    late_sub.unsubscribe();
    early.unsubscribe();
    let after = Arc::new(Mutex::new(vec![]));
    let c_after = after.clone();
    let _again = feed.subscribe(move |m| c_after.lock().push(m.payload));
    assert!(after.lock().is_empty());
  }

  #[rxmqtt_macro::test]
  async fn replay_restarts_after_last_consumer_leaves() {
    let (transport, multiplexer) = setup();
    let feed = feed(&multiplexer, "s", SubscribeOptions::default().retain(true));
    let first = feed.subscribe(|_| {});
    multiplexer.flush().await;
    publish(&transport, "s", "stale", false).await;
    first.unsubscribe();

    let second = feed.subscribe(|_| {});
    multiplexer.flush().await;
    publish(&transport, "s", "fresh", false).await;

    let late = Arc::new(Mutex::new(vec![]));
    let c_late = late.clone();
    let _late = feed.subscribe(move |m| c_late.lock().push(m.payload));
    assert_eq!(*late.lock(), vec![bytes::Bytes::from_static(b"fresh")]);
    second.unsubscribe();
    assert_eq!(feed.consumer_count(), 1);
  }

  #[rxmqtt_macro::test]
  async fn completes_on_shutdown() {
    let (_transport, multiplexer) = setup();
    let feed = feed(&multiplexer, "c", SubscribeOptions::default());
    let completed = Arc::new(Mutex::new(0));
    let c_completed = completed.clone();
    let sub = feed
      .actual_subscribe(ObserverComplete::new(|_: Message| {}, move || *c_completed.lock() += 1));

    multiplexer.shutdown();
    assert_eq!(*completed.lock(), 1);
    assert!(sub.is_closed());

    let c_completed = completed.clone();
    feed.actual_subscribe(ObserverComplete::new(|_: Message| {}, move || *c_completed.lock() += 1));
    assert_eq!(*completed.lock(), 2);
  }

  #[rxmqtt_macro::test]
  async fn closed_multiplexer_completes_new_feeds() {
    let (_transport, multiplexer) = setup();
    multiplexer.shutdown();
    let feed = feed(&multiplexer, "late", SubscribeOptions::default());
    let mut stream = feed.into_stream();
    assert!(stream.next().await.is_none());
  }
}
