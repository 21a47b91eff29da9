//! # rxmqtt: reactive topic feeds over a shared MQTT connection
//!
//! Observe topic patterns as multicast feeds while the client keeps exactly
//! one wire subscription per distinct pattern, however many observers ask
//! for it.
//!
//! ```rust
//! use rxmqtt::prelude::*;
//!
//! let filter = compile("home/+/temperature").unwrap();
//! assert!(filter.matches("home/kitchen/temperature"));
//! assert!(!validate("home/#/temperature"));
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TopicFilter`] | Compiled `+`/`#` pattern |
//! | [`EventHub`] | Splits the transport's single listener into per-kind feeds |
//! | [`Multiplexer`] | Reference-counted wire subscriptions |
//! | [`TopicFeed`] | What `observe` hands out |
//! | [`RxMqttClient`] | The facade tying it all together |
//! | [`CallLog`] | Records the wire subscribe/unsubscribe calls |
//!
//! ## Feature Flags
//!
//! - **`futures-scheduler`** (default): run the wire driver on a `futures`
//!   thread pool.
//! - **`tokio-scheduler`**: run it on a tokio runtime instead.
//!
//! [`TopicFilter`]: topic::TopicFilter
//! [`EventHub`]: hub::EventHub
//! [`Multiplexer`]: multiplexer::Multiplexer
//! [`TopicFeed`]: feed::TopicFeed
//! [`RxMqttClient`]: client::RxMqttClient
//! [`CallLog`]: call_log::CallLog

pub mod call_log;
pub mod client;
pub mod error;
pub mod feed;
pub mod hub;
pub mod memory;
pub mod multiplexer;
pub mod observer;
pub mod prelude;
pub mod scheduler;
pub mod stream;
pub mod subject;
pub mod subscription;
pub mod topic;
pub mod transport;

pub use prelude::*;
