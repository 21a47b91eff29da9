//! Reference-counted subscription multiplexing.
//!
//! Many observers, one wire subscription per distinct pattern. Each pattern
//! moves through
//!
//! ```text
//! Unsubscribed -> Subscribing -> Subscribed -> Unsubscribing -> Unsubscribed
//! ```
//!
//! - The first registration of a pattern issues the wire subscribe. Later
//!   registrations only bump the reference count, even while the subscribe
//!   is still in flight.
//! - Releasing the last registration issues the wire unsubscribe.
//! - Acknowledgements reconcile: a subscribe acknowledged after everyone left
//!   is followed by an unsubscribe, and an unsubscribe acknowledged after
//!   someone registered again is followed by a fresh subscribe. A
//!   registration arriving during `Unsubscribing` therefore waits for the
//!   unsubscribe to finish and then re-subscribes; the in-flight unsubscribe
//!   is never cancelled.
//!
//! All wire calls are issued from one driver task in FIFO order, so calls for
//! the same pattern can never overtake each other. Registration and release
//! only enqueue; they never wait on the transport.

use std::{
  collections::HashMap,
  convert::Infallible,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
};

use futures::{
  channel::{mpsc, oneshot},
  FutureExt, StreamExt,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
  error::{StateError, TransportError},
  hub::EventHub,
  scheduler::Scheduler,
  subject::{Subject, SubjectSubscription},
  subscription::Subscription,
  topic::TopicFilter,
  transport::{Message, QoS, Transport},
};

/// Wire-level state of one pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
  Unsubscribed,
  Subscribing,
  Subscribed,
  Unsubscribing,
}

/// Where routed messages for one registration are delivered.
pub type Sink = Subject<Message, Infallible>;

/// Returned by [`Multiplexer::register`] after [`Multiplexer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the multiplexer has been shut down")]
pub struct Closed;

struct Record {
  filter: Arc<TopicFilter>,
  qos: Option<QoS>,
  refs: usize,
  observers: SmallVec<[(usize, Sink); 2]>,
  state: WireState,
}

#[derive(Default)]
struct Registry {
  records: HashMap<String, Record>,
  next_id: usize,
  closed: bool,
}

enum Command {
  Subscribe { pattern: String, qos: Option<QoS> },
  Unsubscribe { pattern: String },
  Restore { pattern: String, qos: Option<QoS> },
  Flush(oneshot::Sender<()>),
}

pub struct Multiplexer {
  registry: Mutex<Registry>,
  transport: Arc<dyn Transport>,
  commands: mpsc::UnboundedSender<Command>,
  hub: EventHub,
  routing: Mutex<Option<SubjectSubscription<Message, Infallible>>>,
}

impl Multiplexer {
  /// Build a multiplexer over `transport`, routing the messages of `hub`.
  ///
  /// The wire driver is spawned on `scheduler` and lives as long as the
  /// multiplexer.
  pub fn new(
    transport: Arc<dyn Transport>,
    hub: &EventHub,
    scheduler: &dyn Scheduler,
  ) -> Arc<Self> {
    let (commands, receiver) = mpsc::unbounded();
    let multiplexer = Arc::new(Multiplexer {
      registry: Mutex::new(Registry::default()),
      transport,
      commands,
      hub: hub.clone(),
      routing: Mutex::new(None),
    });

    scheduler.spawn(drive(Arc::downgrade(&multiplexer), receiver).boxed());

    let weak = Arc::downgrade(&multiplexer);
    let routing = hub.messages().subscribe(move |message| {
      if let Some(multiplexer) = weak.upgrade() {
        multiplexer.route(message);
      }
    });
    *multiplexer.routing.lock() = Some(routing);
    multiplexer
  }

  /// Add one observer of `filter`, delivering matches to `sink`.
  ///
  /// Never waits for the wire: messages start flowing once the subscribe is
  /// acknowledged.
  pub fn register(
    self: &Arc<Self>,
    filter: Arc<TopicFilter>,
    qos: Option<QoS>,
    sink: Sink,
  ) -> Result<Registration, Closed> {
    let mut registry = self.registry.lock();
    if registry.closed {
      return Err(Closed);
    }
    let id = registry.next_id;
    registry.next_id += 1;

    let pattern = filter.pattern().to_owned();
    let record = registry.records.entry(pattern.clone()).or_insert_with(|| Record {
      filter,
      qos,
      refs: 0,
      observers: SmallVec::new(),
      state: WireState::Unsubscribed,
    });
    record.refs += 1;
    record.observers.push((id, sink));
    trace!(%pattern, refs = record.refs, state = ?record.state, "registered");

    match record.state {
      WireState::Unsubscribed => {
        record.qos = qos;
        record.state = WireState::Subscribing;
        self.send(Command::Subscribe { pattern: pattern.clone(), qos });
      }
      WireState::Unsubscribing => {
        record.qos = qos;
        debug!(%pattern, "re-subscribe queued behind in-flight unsubscribe");
      }
      WireState::Subscribing | WireState::Subscribed => {}
    }

    Ok(Registration {
      multiplexer: Arc::downgrade(self),
      pattern,
      id,
      released: AtomicBool::new(false),
    })
  }

  fn release(&self, pattern: &str, id: usize) {
    // The sink may hold the last reference to observers whose drop re-enters
    // the multiplexer, so it is dropped after the registry lock.
    let _sink = self.detach(pattern, id);
  }

  fn detach(&self, pattern: &str, id: usize) -> Option<Sink> {
    let mut registry = self.registry.lock();
    if registry.closed {
      return None;
    }
    let record = registry.records.get_mut(pattern)?;
    let pos = record.observers.iter().position(|(i, _)| *i == id)?;
    let (_, sink) = record.observers.remove(pos);
    if record.refs == 0 {
      StateError::ReleaseWithoutReference { pattern: pattern.to_owned() }.raise();
    }
    record.refs -= 1;
    trace!(%pattern, refs = record.refs, state = ?record.state, "released");

    if record.refs == 0 && record.state == WireState::Subscribed {
      record.state = WireState::Unsubscribing;
      self.send(Command::Unsubscribe { pattern: pattern.to_owned() });
    }
    Some(sink)
  }

  /// Deliver `message` to every sink whose pattern matches, once per sink.
  pub fn route(&self, message: Message) {
    let targets = {
      let registry = self.registry.lock();
      let mut targets: SmallVec<[Sink; 4]> = SmallVec::new();
      for record in registry.records.values() {
        let live = matches!(record.state, WireState::Subscribing | WireState::Subscribed);
        if !live || !record.filter.matches(&message.topic) {
          continue;
        }
        for (_, sink) in &record.observers {
          if !targets.iter().any(|t| t.ptr_eq(sink)) {
            targets.push(sink.clone());
          }
        }
      }
      targets
    };

    trace!(topic = %message.topic, sinks = targets.len(), "routing");
    for sink in targets {
      sink.next(message.clone());
    }
  }

  /// Forget every pattern without touching the wire and complete all sinks.
  ///
  /// Used when the connection is already gone. Idempotent.
  pub fn shutdown(&self) {
    let records = {
      let mut registry = self.registry.lock();
      if registry.closed {
        return;
      }
      registry.closed = true;
      std::mem::take(&mut registry.records)
    };
    if let Some(routing) = self.routing.lock().take() {
      routing.unsubscribe();
    }
    debug!(patterns = records.len(), "multiplexer shut down");
    for (_, record) in records {
      for (_, sink) in record.observers {
        sink.complete();
      }
    }
  }

  /// Re-issue the wire subscribe of every `Subscribed` pattern, for
  /// transports that lose their subscriptions on reconnect.
  pub fn restore(&self) {
    let registry = self.registry.lock();
    if registry.closed {
      return;
    }
    for (pattern, record) in &registry.records {
      if record.state == WireState::Subscribed {
        self.send(Command::Restore { pattern: pattern.clone(), qos: record.qos });
      }
    }
  }

  /// Resolves once the driver has drained its queue and no pattern is
  /// `Subscribing` or `Unsubscribing`.
  pub async fn flush(&self) {
    loop {
      let (done, wait) = oneshot::channel();
      if self.commands.unbounded_send(Command::Flush(done)).is_err() || wait.await.is_err() {
        return;
      }
      if !self.is_settling() {
        return;
      }
    }
  }

  /// Current wire state of `pattern`.
  pub fn state(&self, pattern: &str) -> WireState {
    self
      .registry
      .lock()
      .records
      .get(pattern)
      .map_or(WireState::Unsubscribed, |r| r.state)
  }

  /// Number of live registrations of `pattern`.
  pub fn ref_count(&self, pattern: &str) -> usize {
    self.registry.lock().records.get(pattern).map_or(0, |r| r.refs)
  }

  /// Every pattern with a record, sorted.
  pub fn patterns(&self) -> Vec<String> {
    let mut patterns: Vec<String> = self.registry.lock().records.keys().cloned().collect();
    patterns.sort();
    patterns
  }

  pub fn is_closed(&self) -> bool { self.registry.lock().closed }

  fn is_settling(&self) -> bool {
    self
      .registry
      .lock()
      .records
      .values()
      .any(|r| matches!(r.state, WireState::Subscribing | WireState::Unsubscribing))
  }

  fn send(&self, command: Command) {
    if self.commands.unbounded_send(command).is_err() {
      warn!("wire driver is gone, command dropped");
    }
  }

  async fn execute(&self, command: Command) {
    match command {
      Command::Subscribe { pattern, qos } => {
        if self.is_closed() {
          return;
        }
        debug!(%pattern, ?qos, "wire subscribe");
        let result = self.transport.subscribe(&pattern, qos).await;
        self.report(&pattern, result);
        self.subscribe_settled(&pattern);
      }
      Command::Unsubscribe { pattern } => {
        if self.is_closed() {
          return;
        }
        debug!(%pattern, "wire unsubscribe");
        let result = self.transport.unsubscribe(&pattern).await;
        self.report(&pattern, result);
        self.unsubscribe_settled(&pattern);
      }
      Command::Restore { pattern, qos } => {
        if self.is_closed() {
          return;
        }
        debug!(%pattern, ?qos, "wire re-subscribe after reconnect");
        let result = self.transport.subscribe(&pattern, qos).await;
        self.report(&pattern, result);
      }
      Command::Flush(done) => {
        let _ = done.send(());
      }
    }
  }

  // A failed wire call still counts as settled: the record stays logically
  // active and the failure goes to the error feed.
  fn report(&self, pattern: &str, result: Result<(), TransportError>) {
    let Err(err) = result else { return };
    // A call still in flight at shutdown fails once the transport ends.
    if self.is_closed() {
      debug!(%pattern, error = %err, "wire call failed after shutdown");
      return;
    }
    warn!(%pattern, error = %err, "wire call failed");
    self.hub.report(err);
  }

  fn subscribe_settled(&self, pattern: &str) {
    let mut registry = self.registry.lock();
    if registry.closed {
      return;
    }
    let Some(record) = registry.records.get_mut(pattern) else {
      StateError::UnknownPattern { pattern: pattern.to_owned() }.raise();
    };
    if record.state != WireState::Subscribing {
      StateError::UnexpectedAck { pattern: pattern.to_owned(), state: record.state }.raise();
    }
    if record.refs == 0 {
      debug!(%pattern, "last observer left before subscribe was acknowledged");
      record.state = WireState::Unsubscribing;
      self.send(Command::Unsubscribe { pattern: pattern.to_owned() });
    } else {
      record.state = WireState::Subscribed;
    }
  }

  fn unsubscribe_settled(&self, pattern: &str) {
    let mut registry = self.registry.lock();
    if registry.closed {
      return;
    }
    let Some(record) = registry.records.get_mut(pattern) else {
      StateError::UnknownPattern { pattern: pattern.to_owned() }.raise();
    };
    if record.state != WireState::Unsubscribing {
      StateError::UnexpectedAck { pattern: pattern.to_owned(), state: record.state }.raise();
    }
    if record.refs > 0 {
      record.state = WireState::Subscribing;
      let qos = record.qos;
      self.send(Command::Subscribe { pattern: pattern.to_owned(), qos });
    } else {
      registry.records.remove(pattern);
    }
  }
}

async fn drive(multiplexer: Weak<Multiplexer>, mut receiver: mpsc::UnboundedReceiver<Command>) {
  while let Some(command) = receiver.next().await {
    let Some(multiplexer) = multiplexer.upgrade() else {
      break;
    };
    multiplexer.execute(command).await;
  }
  trace!("wire driver stopped");
}

/// One observer's interest in one pattern.
///
/// Releasing (by `unsubscribe` or by drop) is idempotent and never blocks.
pub struct Registration {
  multiplexer: Weak<Multiplexer>,
  pattern: String,
  id: usize,
  released: AtomicBool,
}

impl Registration {
  pub fn pattern(&self) -> &str { &self.pattern }

  fn release(&self) {
    if self.released.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(multiplexer) = self.multiplexer.upgrade() {
      multiplexer.release(&self.pattern, self.id);
    }
  }
}

impl Subscription for Registration {
  fn unsubscribe(self) { self.release(); }

  fn is_closed(&self) -> bool {
    self.released.load(Ordering::Acquire)
      || self
        .multiplexer
        .upgrade()
        .map_or(true, |m| m.is_closed())
  }
}

impl Drop for Registration {
  fn drop(&mut self) { self.release(); }
}
