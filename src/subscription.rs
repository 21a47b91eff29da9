//! Subscription handles.
//!
//! Every attach to a feed returns a handle implementing [`Subscription`].
//! Unsubscribing consumes the handle, so a handle can only detach once;
//! detaching through any other path afterwards is a no-op.

/// A handle that can detach its observer from a feed.
pub trait Subscription {
  /// Detach. Never fails, whatever state the feed is in.
  fn unsubscribe(self);

  /// Whether the observer is already detached or the feed has terminated.
  fn is_closed(&self) -> bool;

  /// Activates RAII behavior: the returned guard unsubscribes on drop.
  ///
  /// **Attention:** if the guard is not bound to a variable it is dropped,
  /// and the subscription cancelled, immediately.
  fn unsubscribe_when_dropped(self) -> SubscriptionGuard<Self>
  where
    Self: Sized,
  {
    SubscriptionGuard::new(self)
  }
}

impl Subscription for () {
  #[inline]
  fn unsubscribe(self) {}

  #[inline]
  fn is_closed(&self) -> bool { true }
}

impl<T: Subscription> Subscription for Option<T> {
  fn unsubscribe(self) {
    if let Some(inner) = self {
      inner.unsubscribe();
    }
  }

  fn is_closed(&self) -> bool { self.as_ref().map_or(true, Subscription::is_closed) }
}

/// Unsubscribes the wrapped subscription when dropped.
#[derive(Debug)]
#[must_use]
pub struct SubscriptionGuard<T: Subscription>(Option<T>);

impl<T: Subscription> SubscriptionGuard<T> {
  pub fn new(subscription: T) -> SubscriptionGuard<T> { SubscriptionGuard(Some(subscription)) }

  /// Give the subscription back without unsubscribing.
  pub fn into_inner(mut self) -> T {
    // The option is only emptied here and in `drop`.
    match self.0.take() {
      Some(inner) => inner,
      None => unreachable!("guard emptied before into_inner"),
    }
  }
}

impl<T: Subscription> Drop for SubscriptionGuard<T> {
  #[inline]
  fn drop(&mut self) {
    if let Some(inner) = self.0.take() {
      inner.unsubscribe();
    }
  }
}
