//! Prelude module for convenient imports

#[cfg(feature = "futures-scheduler")]
pub use crate::scheduler::ThreadPoolScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use crate::scheduler::TokioScheduler;
pub use crate::{
  call_log::CallLog,
  client::{ClientOptions, RxMqttClient},
  error::{Error, PatternError, Result, TransportError},
  feed::{FeedSubscription, TopicFeed},
  hub::{EventFeed, EventHub},
  memory::{MemoryBroker, MemoryTransport},
  multiplexer::{Multiplexer, Registration, WireState},
  observer::{DynObserver, FnMutObserver, Observer, ObserverComplete},
  scheduler::{NewThreadScheduler, Scheduler},
  stream::{into_stream, FeedStream},
  subject::{Subject, SubjectSubscription},
  subscription::{Subscription, SubscriptionGuard},
  topic::{compile, validate, TopicFilter},
  transport::{
    ConnectOptions, Connector, EventListener, Message, PublishOptions, QoS, SubscribeOptions,
    Transport, TransportEvent,
  },
};
