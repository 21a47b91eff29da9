//! An in-process broker.
//!
//! [`MemoryBroker`] routes publishes between the [`MemoryTransport`]s opened
//! on it and keeps retained messages. Transports expose the knobs tests need
//! to drive the client through its edge cases: holding acknowledgements,
//! failing the next wire call, dropping and restoring the connection.

use std::{
  collections::{BTreeMap, VecDeque},
  sync::{Arc, Weak},
};

use bytes::Bytes;
use futures::{channel::oneshot, future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
  error::TransportError,
  topic::{self, TopicFilter},
  transport::{
    ConnectOptions, Connector, EventListener, Message, PublishOptions, QoS, Transport,
    TransportEvent,
  },
};

const SCHEMES: &[&str] = &["mqtt", "mqtts", "tcp", "tls", "ws", "wss", "memory"];

#[derive(Default)]
struct BrokerState {
  sessions: Vec<Weak<Session>>,
  retained: BTreeMap<String, Message>,
  credentials: Option<(String, Bytes)>,
}

impl BrokerState {
  fn live_sessions(&mut self) -> Vec<Arc<Session>> {
    self.sessions.retain(|s| s.strong_count() > 0);
    self.sessions.iter().filter_map(Weak::upgrade).collect()
  }
}

/// Routes messages between every transport opened on it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
  state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
  pub fn new() -> Self { Self::default() }

  /// Refuse connections that do not present these credentials.
  pub fn with_credentials(self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
    self.state.lock().credentials = Some((username.into(), password.into()));
    self
  }

  /// Open a session. The connect event is queued until a listener is set.
  pub fn open(
    &self,
    url: &str,
    options: ConnectOptions,
  ) -> Result<MemoryTransport, TransportError> {
    check_url(url)?;
    let accepted = match &self.state.lock().credentials {
      None => true,
      Some((user, pass)) => {
        options.username.as_deref() == Some(user.as_str())
          && options.password.as_ref() == Some(pass)
      }
    };

    let session = Arc::new(Session {
      broker: self.state.clone(),
      clean_session: options.clean_session,
      state: Mutex::new(SessionState { connected: accepted, ..Default::default() }),
      events: Mutex::new(EventQueue::default()),
    });
    self.state.lock().sessions.push(Arc::downgrade(&session));

    if accepted {
      debug!(%url, client_id = ?options.client_id, "memory session opened");
      session.emit(TransportEvent::Connect);
    } else {
      debug!(%url, "memory session refused");
      session.state.lock().ended = true;
      session.emit(TransportEvent::Error(TransportError::ConnectionRefused(
        "bad username or password".into(),
      )));
      session.emit(TransportEvent::Close);
    }
    Ok(MemoryTransport { session })
  }

  /// Publish as the broker itself, outside of any session.
  pub fn publish(&self, message: Message, retain: bool) { route(&self.state, message, retain); }

  pub fn retained(&self, topic: &str) -> Option<Message> {
    self.state.lock().retained.get(topic).cloned()
  }
}

impl Connector for MemoryBroker {
  fn connect(
    &self,
    url: &str,
    options: ConnectOptions,
  ) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(Arc::new(self.open(url, options)?))
  }
}

fn check_url(url: &str) -> Result<(), TransportError> {
  match url.split_once("://") {
    Some((scheme, rest)) if SCHEMES.contains(&scheme) && !rest.is_empty() => Ok(()),
    _ => Err(TransportError::InvalidUrl(url.to_owned())),
  }
}

fn route(broker: &Mutex<BrokerState>, message: Message, retain: bool) {
  let sessions = {
    let mut broker = broker.lock();
    if retain {
      if message.payload.is_empty() {
        broker.retained.remove(&message.topic);
      } else {
        broker.retained.insert(message.topic.clone(), message.clone());
      }
    }
    broker.live_sessions()
  };
  for session in sessions {
    if session.wants(&message.topic) {
      session.emit(TransportEvent::Message(message.clone()));
    }
  }
}

#[derive(Default)]
struct SessionState {
  connected: bool,
  ended: bool,
  subscriptions: BTreeMap<String, (TopicFilter, Option<QoS>)>,
  hold_acks: bool,
  held: Vec<oneshot::Sender<()>>,
  fail_next: Option<TransportError>,
}

#[derive(Default)]
struct EventQueue {
  listener: Option<EventListener>,
  pending: VecDeque<TransportEvent>,
  dispatching: bool,
}

struct Session {
  broker: Arc<Mutex<BrokerState>>,
  clean_session: bool,
  state: Mutex<SessionState>,
  events: Mutex<EventQueue>,
}

enum Ack {
  Now(Result<(), TransportError>),
  Held(oneshot::Receiver<()>),
}

impl Ack {
  async fn wait(self) -> Result<(), TransportError> {
    match self {
      Ack::Now(result) => result,
      Ack::Held(rx) => rx.await.map_err(|_| TransportError::NotConnected),
    }
  }
}

impl Session {
  fn wants(&self, topic: &str) -> bool {
    let state = self.state.lock();
    state.connected && state.subscriptions.values().any(|(f, _)| f.matches(topic))
  }

  fn ack(&self) -> Ack {
    let mut state = self.state.lock();
    if !state.connected {
      return Ack::Now(Err(TransportError::NotConnected));
    }
    if let Some(err) = state.fail_next.take() {
      return Ack::Now(Err(err));
    }
    if state.hold_acks {
      let (tx, rx) = oneshot::channel();
      state.held.push(tx);
      Ack::Held(rx)
    } else {
      Ack::Now(Ok(()))
    }
  }

  fn apply_subscribe(&self, pattern: &str, qos: Option<QoS>) -> Result<(), TransportError> {
    let filter = topic::compile(pattern).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let retained: Vec<Message> = self
      .broker
      .lock()
      .retained
      .values()
      .filter(|m| filter.matches(&m.topic))
      .cloned()
      .collect();
    self.state.lock().subscriptions.insert(pattern.to_owned(), (filter, qos));
    for message in retained {
      self.emit(TransportEvent::Message(message));
    }
    Ok(())
  }

  // Listener calls may re-enter (publish from inside a callback). The queue
  // keeps delivery ordered and the lock is never held across a callback.
  fn emit(&self, event: TransportEvent) {
    self.events.lock().pending.push_back(event);
    self.drain();
  }

  fn drain(&self) {
    let mut queue = self.events.lock();
    if queue.dispatching {
      return;
    }
    queue.dispatching = true;
    loop {
      let Some(mut listener) = queue.listener.take() else {
        break;
      };
      let Some(event) = queue.pending.pop_front() else {
        queue.listener = Some(listener);
        break;
      };
      drop(queue);
      listener(event);
      queue = self.events.lock();
      // a listener installed during the callback wins
      if queue.listener.is_none() {
        queue.listener = Some(listener);
      }
    }
    queue.dispatching = false;
  }
}

/// One client session on a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
  session: Arc<Session>,
}

impl MemoryTransport {
  /// Filters the broker currently holds for this session, sorted.
  pub fn subscriptions(&self) -> Vec<String> {
    self.session.state.lock().subscriptions.keys().cloned().collect()
  }

  /// QoS recorded for `pattern`, or `None` if it is not subscribed.
  pub fn subscription_qos(&self, pattern: &str) -> Option<Option<QoS>> {
    self.session.state.lock().subscriptions.get(pattern).map(|(_, qos)| *qos)
  }

  pub fn is_connected(&self) -> bool { self.session.state.lock().connected }

  /// Deliver `message` as if the broker had sent it, ignoring subscriptions.
  pub fn inject(&self, message: Message) { self.session.emit(TransportEvent::Message(message)); }

  pub fn emit_error(&self, err: TransportError) { self.session.emit(TransportEvent::Error(err)); }

  /// Simulate a network loss. A clean session loses its subscriptions.
  pub fn drop_connection(&self) {
    {
      let mut state = self.session.state.lock();
      if !state.connected {
        return;
      }
      state.connected = false;
      if self.session.clean_session {
        state.subscriptions.clear();
      }
    }
    debug!("memory session dropped");
    self.session.emit(TransportEvent::Offline);
    self.session.emit(TransportEvent::Close);
  }

  /// Reconnect after [`MemoryTransport::drop_connection`].
  pub fn restore_connection(&self) {
    {
      let mut state = self.session.state.lock();
      if state.ended || state.connected {
        return;
      }
      state.connected = true;
    }
    debug!("memory session restored");
    self.session.emit(TransportEvent::Connect);
  }

  /// Park every subscribe and unsubscribe acknowledgement until
  /// [`MemoryTransport::release_acks`].
  pub fn hold_acks(&self) { self.session.state.lock().hold_acks = true; }

  pub fn release_acks(&self) {
    let held = {
      let mut state = self.session.state.lock();
      state.hold_acks = false;
      std::mem::take(&mut state.held)
    };
    trace!(count = held.len(), "releasing acknowledgements");
    for tx in held {
      let _ = tx.send(());
    }
  }

  /// Fail the next subscribe or unsubscribe with `err`.
  pub fn fail_next(&self, err: TransportError) { self.session.state.lock().fail_next = Some(err); }
}

impl Transport for MemoryTransport {
  fn subscribe(
    &self,
    filter: &str,
    qos: Option<QoS>,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    let session = self.session.clone();
    let filter = filter.to_owned();
    let ack = session.ack();
    async move {
      ack.wait().await?;
      session.apply_subscribe(&filter, qos)
    }
    .boxed()
  }

  fn unsubscribe(&self, filter: &str) -> BoxFuture<'static, Result<(), TransportError>> {
    let session = self.session.clone();
    let filter = filter.to_owned();
    let ack = session.ack();
    async move {
      ack.wait().await?;
      session.state.lock().subscriptions.remove(&filter);
      Ok(())
    }
    .boxed()
  }

  fn publish(
    &self,
    topic: &str,
    payload: Bytes,
    options: PublishOptions,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    let result = if !self.session.state.lock().connected {
      Err(TransportError::NotConnected)
    } else if topic.is_empty() || topic.contains(|c: char| c == '+' || c == '#') {
      Err(TransportError::Protocol(format!("invalid publish topic {topic:?}")))
    } else {
      trace!(%topic, qos = ?options.qos, retain = options.retain, "memory publish");
      route(&self.session.broker, Message { topic: topic.to_owned(), payload }, options.retain);
      Ok(())
    };
    futures::future::ready(result).boxed()
  }

  fn end(&self, force: bool) {
    let held = {
      let mut state = self.session.state.lock();
      if state.ended {
        return;
      }
      state.ended = true;
      state.connected = false;
      state.subscriptions.clear();
      std::mem::take(&mut state.held)
    };
    debug!(force, "memory session ended");
    drop(held);
    self.session.emit(TransportEvent::Close);
  }

  fn set_listener(&self, listener: EventListener) {
    self.session.events.lock().listener = Some(listener);
    self.session.drain();
  }
}
