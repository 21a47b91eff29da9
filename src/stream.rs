//! Feed → `futures::Stream` adapter.
//!
//! Every feed in the crate can be consumed with `while let Some(v) =
//! stream.next().await`. The stream detaches from its feed when dropped and
//! ends when the feed completes.
//!
//! ```rust
//! use std::convert::Infallible;
//!
//! use futures::{executor::block_on, StreamExt};
//! use rxmqtt::subject::Subject;
//!
//! let subject = Subject::<i32, Infallible>::new();
//! let mut stream = rxmqtt::stream::into_stream(|observer| subject.actual_subscribe(observer));
//! subject.next(7);
//! subject.complete();
//! assert_eq!(block_on(stream.next()), Some(7));
//! assert_eq!(block_on(stream.next()), None);
//! ```

use std::{
  collections::VecDeque,
  convert::Infallible,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll, Waker},
};

use futures::Stream;
use parking_lot::Mutex;

use crate::{observer::Observer, subscription::Subscription};

struct StreamState<T> {
  queue: VecDeque<T>,
  waker: Option<Waker>,
  closed: bool,
}

impl<T> Default for StreamState<T> {
  fn default() -> Self { Self { queue: VecDeque::new(), waker: None, closed: false } }
}

/// Observer half: pushes into the shared queue and wakes the consumer.
pub struct StreamObserver<T> {
  state: Arc<Mutex<StreamState<T>>>,
}

impl<T> StreamObserver<T> {
  fn close(&self) {
    let mut state = self.state.lock();
    state.closed = true;
    if let Some(waker) = state.waker.take() {
      waker.wake();
    }
  }
}

impl<T> Observer<T, Infallible> for StreamObserver<T> {
  fn next(&mut self, value: T) {
    let mut state = self.state.lock();
    state.queue.push_back(value);
    if let Some(waker) = state.waker.take() {
      waker.wake();
    }
  }

  fn error(self, err: Infallible) { match err {} }

  fn complete(self) { self.close(); }

  fn is_closed(&self) -> bool { self.state.lock().closed }
}

/// Stream half, created by [`into_stream`].
pub struct FeedStream<T, U: Subscription> {
  state: Arc<Mutex<StreamState<T>>>,
  unsub: Option<U>,
}

/// Build a stream by handing a fresh observer to `subscribe`.
pub fn into_stream<T, U, F>(subscribe: F) -> FeedStream<T, U>
where
  U: Subscription,
  F: FnOnce(StreamObserver<T>) -> U,
{
  let state = Arc::new(Mutex::new(StreamState::default()));
  let unsub = subscribe(StreamObserver { state: state.clone() });
  FeedStream { state, unsub: Some(unsub) }
}

impl<T, U: Subscription> FeedStream<T, U> {
  /// Values received but not yet polled.
  pub fn pending_len(&self) -> usize { self.state.lock().queue.len() }
}

impl<T, U: Subscription + Unpin> Stream for FeedStream<T, U> {
  type Item = T;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
    let this = self.get_mut();
    let mut state = this.state.lock();

    if let Some(item) = state.queue.pop_front() {
      return Poll::Ready(Some(item));
    }
    if state.closed {
      return Poll::Ready(None);
    }
    state.waker = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl<T, U: Subscription> Drop for FeedStream<T, U> {
  fn drop(&mut self) {
    if let Some(unsub) = self.unsub.take() {
      unsub.unsubscribe();
    }
  }
}
