//! The contract with the underlying connection.
//!
//! A transport owns the socket, the wire protocol, keep-alive and reconnect.
//! This crate only needs five operations from it plus one event listener:
//!
//! | operation | effect |
//! |---|---|
//! | [`Transport::subscribe`] | wire SUBSCRIBE, resolves on acknowledgement |
//! | [`Transport::unsubscribe`] | wire UNSUBSCRIBE, resolves on acknowledgement |
//! | [`Transport::publish`] | wire PUBLISH |
//! | [`Transport::end`] | close the connection |
//! | [`Transport::set_listener`] | install the single event callback |
//!
//! Fire-and-forget transports resolve the subscribe/unsubscribe futures
//! immediately.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::TransportError;

/// Delivery guarantee requested on the wire. Never interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
  #[default]
  AtMostOnce = 0,
  AtLeastOnce = 1,
  ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
  type Error = TransportError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(QoS::AtMostOnce),
      1 => Ok(QoS::AtLeastOnce),
      2 => Ok(QoS::ExactlyOnce),
      other => Err(TransportError::Protocol(format!("invalid qos {other}"))),
    }
  }
}

/// An inbound or outbound application message.
///
/// The payload is a reference-counted buffer shared by every observer the
/// message is multicast to.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
  pub topic: String,
  pub payload: Bytes,
}

impl Message {
  pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
    Self { topic: topic.into(), payload: payload.into() }
  }
}

impl fmt::Debug for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Message")
      .field("topic", &self.topic)
      .field("payload_len", &self.payload.len())
      .finish()
  }
}

/// Per-observe options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
  /// Passed verbatim to the wire subscribe. `None` leaves the choice to the
  /// transport.
  pub qos: Option<QoS>,
  /// Replay the most recent matching message to late consumers of the feed.
  pub retain: bool,
}

impl SubscribeOptions {
  pub fn qos(mut self, qos: QoS) -> Self {
    self.qos = Some(qos);
    self
  }

  pub fn retain(mut self, retain: bool) -> Self {
    self.retain = retain;
    self
  }
}

/// Per-publish options, forwarded to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
  pub qos: QoS,
  pub retain: bool,
  pub dup: bool,
}

impl PublishOptions {
  pub fn qos(mut self, qos: QoS) -> Self {
    self.qos = qos;
    self
  }

  pub fn retain(mut self, retain: bool) -> Self {
    self.retain = retain;
    self
  }

  pub fn dup(mut self, dup: bool) -> Self {
    self.dup = dup;
    self
  }
}

/// Connection options understood by transports.
///
/// Defaults: keep-alive 60 s, clean session, reconnect every second, 30 s
/// connect timeout.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
  pub client_id: Option<String>,
  pub username: Option<String>,
  pub password: Option<Bytes>,
  pub keep_alive: Duration,
  pub clean_session: bool,
  pub reconnect_period: Duration,
  pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
  fn default() -> Self {
    Self {
      client_id: None,
      username: None,
      password: None,
      keep_alive: Duration::from_secs(60),
      clean_session: true,
      reconnect_period: Duration::from_secs(1),
      connect_timeout: Duration::from_secs(30),
    }
  }
}

impl ConnectOptions {
  pub fn client_id(mut self, id: impl Into<String>) -> Self {
    self.client_id = Some(id.into());
    self
  }

  pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
    self.username = Some(username.into());
    self.password = Some(password.into());
    self
  }

  pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
    self.keep_alive = keep_alive;
    self
  }

  pub fn clean_session(mut self, clean: bool) -> Self {
    self.clean_session = clean;
    self
  }

  pub fn reconnect_period(mut self, period: Duration) -> Self {
    self.reconnect_period = period;
    self
  }

  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }
}

impl fmt::Debug for ConnectOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectOptions")
      .field("client_id", &self.client_id)
      .field("username", &self.username)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("keep_alive", &self.keep_alive)
      .field("clean_session", &self.clean_session)
      .field("reconnect_period", &self.reconnect_period)
      .field("connect_timeout", &self.connect_timeout)
      .finish()
  }
}

/// Everything a transport reports through its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
  Connect,
  Close,
  Offline,
  Error(TransportError),
  Message(Message),
}

/// The transport's single event callback.
pub type EventListener = Box<dyn FnMut(TransportEvent) + Send>;

/// A live connection handle.
pub trait Transport: Send + Sync {
  fn subscribe(
    &self,
    filter: &str,
    qos: Option<QoS>,
  ) -> BoxFuture<'static, Result<(), TransportError>>;

  fn unsubscribe(&self, filter: &str) -> BoxFuture<'static, Result<(), TransportError>>;

  fn publish(
    &self,
    topic: &str,
    payload: Bytes,
    options: PublishOptions,
  ) -> BoxFuture<'static, Result<(), TransportError>>;

  /// Close the connection. `force` skips waiting for in-flight messages.
  fn end(&self, force: bool);

  /// Install the event callback, replacing any previous one.
  fn set_listener(&self, listener: EventListener);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
  fn subscribe(
    &self,
    filter: &str,
    qos: Option<QoS>,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    (**self).subscribe(filter, qos)
  }

  fn unsubscribe(&self, filter: &str) -> BoxFuture<'static, Result<(), TransportError>> {
    (**self).unsubscribe(filter)
  }

  fn publish(
    &self,
    topic: &str,
    payload: Bytes,
    options: PublishOptions,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    (**self).publish(topic, payload, options)
  }

  fn end(&self, force: bool) { (**self).end(force) }

  fn set_listener(&self, listener: EventListener) { (**self).set_listener(listener) }
}

/// Builds a transport for a URL; the `connect(url, options)` entry point.
pub trait Connector {
  fn connect(
    &self,
    url: &str,
    options: ConnectOptions,
  ) -> Result<Arc<dyn Transport>, TransportError>;
}
