//! Wire call introspection.
//!
//! [`CallLog`] decorates a transport and records the filter argument of every
//! subscribe and unsubscribe call that reaches it. Wrapped around the
//! multiplexer's transport it shows exactly which wire calls survived
//! de-duplication and reference counting.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
  error::TransportError,
  hub::EventFeed,
  subject::Subject,
  transport::{EventListener, PublishOptions, QoS, Transport},
};

pub struct CallLog {
  inner: Arc<dyn Transport>,
  subscribes: Subject<String, Infallible>,
  unsubscribes: Subject<String, Infallible>,
}

impl CallLog {
  pub fn new(inner: Arc<dyn Transport>) -> Self {
    Self { inner, subscribes: Subject::new(), unsubscribes: Subject::new() }
  }

  /// Filter of every subscribe call, emitted before the call is made.
  pub fn subscribe_calls(&self) -> EventFeed<String> { EventFeed::new(self.subscribes.clone()) }

  /// Filter of every unsubscribe call, emitted before the call is made.
  pub fn unsubscribe_calls(&self) -> EventFeed<String> {
    EventFeed::new(self.unsubscribes.clone())
  }

  /// Complete both call feeds.
  pub fn complete(&self) {
    self.subscribes.complete();
    self.unsubscribes.complete();
  }
}

impl Transport for CallLog {
  fn subscribe(
    &self,
    filter: &str,
    qos: Option<QoS>,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    self.subscribes.next(filter.to_owned());
    self.inner.subscribe(filter, qos)
  }

  fn unsubscribe(&self, filter: &str) -> BoxFuture<'static, Result<(), TransportError>> {
    self.unsubscribes.next(filter.to_owned());
    self.inner.unsubscribe(filter)
  }

  fn publish(
    &self,
    topic: &str,
    payload: Bytes,
    options: PublishOptions,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    self.inner.publish(topic, payload, options)
  }

  fn end(&self, force: bool) { self.inner.end(force) }

  fn set_listener(&self, listener: EventListener) { self.inner.set_listener(listener) }
}
