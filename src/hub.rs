//! EventHub: one transport listener, many independent feeds.
//!
//! A transport accepts exactly one event callback. The hub installs it once
//! and splits the events into one [`EventFeed`] per kind, so any number of
//! components can watch connects, errors or messages without stepping on
//! each other.
//!
//! The connect feed replays the connect of the current connection to
//! consumers that attach while it is up, so a consumer attaching right after
//! construction still learns that the transport is connected. Offline and
//! close forget it.

use std::{convert::Infallible, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
  error::TransportError,
  observer::Observer,
  stream::{into_stream, FeedStream},
  subject::{Subject, SubjectSubscription},
  transport::{Message, Transport, TransportEvent},
};

/// Read-only view of a [`Subject`]: attach, never emit.
pub struct EventFeed<T> {
  subject: Subject<T, Infallible>,
}

impl<T> Clone for EventFeed<T> {
  fn clone(&self) -> Self { Self { subject: self.subject.clone() } }
}

impl<T> EventFeed<T>
where
  T: Clone + Send + 'static,
{
  pub(crate) fn new(subject: Subject<T, Infallible>) -> Self { Self { subject } }

  pub fn subscribe<F>(&self, next: F) -> SubjectSubscription<T, Infallible>
  where
    F: FnMut(T) + Send + 'static,
  {
    self.subject.subscribe(next)
  }

  pub fn actual_subscribe<O>(&self, observer: O) -> SubjectSubscription<T, Infallible>
  where
    O: Observer<T, Infallible> + Send + 'static,
  {
    self.subject.actual_subscribe(observer)
  }

  pub fn into_stream(&self) -> FeedStream<T, SubjectSubscription<T, Infallible>> {
    into_stream(|observer| self.subject.actual_subscribe(observer))
  }

  pub fn subscriber_count(&self) -> usize { self.subject.subscriber_count() }

  pub fn is_stopped(&self) -> bool { self.subject.is_stopped() }
}

struct Channels {
  connect: Subject<(), Infallible>,
  close: Subject<(), Infallible>,
  offline: Subject<(), Infallible>,
  error: Subject<TransportError, Infallible>,
  message: Subject<Message, Infallible>,
}

impl Default for Channels {
  fn default() -> Self {
    Self {
      connect: Subject::replay_last(),
      close: Subject::new(),
      offline: Subject::new(),
      error: Subject::new(),
      message: Subject::new(),
    }
  }
}

impl Channels {
  fn dispatch(&self, event: TransportEvent) {
    match event {
      TransportEvent::Connect => {
        debug!("transport connected");
        self.connect.next(());
      }
      TransportEvent::Close => {
        debug!("transport closed");
        self.connect.clear_replay();
        self.close.next(());
      }
      TransportEvent::Offline => {
        debug!("transport offline");
        self.connect.clear_replay();
        self.offline.next(());
      }
      TransportEvent::Error(err) => {
        warn!(error = %err, "transport error");
        self.error.next(err);
      }
      TransportEvent::Message(message) => {
        trace!(topic = %message.topic, len = message.payload.len(), "inbound message");
        self.message.next(message);
      }
    }
  }
}

/// Multicast point for one transport's events.
#[derive(Clone)]
pub struct EventHub {
  channels: Arc<Channels>,
}

impl EventHub {
  /// Create a hub and install its listener on `transport`.
  pub fn attach(transport: &dyn Transport) -> Self {
    let hub = EventHub { channels: Arc::new(Channels::default()) };
    let channels = hub.channels.clone();
    transport.set_listener(Box::new(move |event| channels.dispatch(event)));
    hub
  }

  pub fn connects(&self) -> EventFeed<()> { EventFeed::new(self.channels.connect.clone()) }

  pub fn closes(&self) -> EventFeed<()> { EventFeed::new(self.channels.close.clone()) }

  pub fn offlines(&self) -> EventFeed<()> { EventFeed::new(self.channels.offline.clone()) }

  pub fn errors(&self) -> EventFeed<TransportError> {
    EventFeed::new(self.channels.error.clone())
  }

  pub fn messages(&self) -> EventFeed<Message> { EventFeed::new(self.channels.message.clone()) }

  /// Push an error that did not come through the transport listener, such
  /// as a failed wire subscribe.
  pub fn report(&self, err: TransportError) { self.channels.error.next(err); }

  /// Complete every feed.
  pub fn complete(&self) {
    let channels = &self.channels;
    channels.connect.complete();
    channels.close.complete();
    channels.offline.complete();
    channels.error.complete();
    channels.message.complete();
  }
}
