//! Subject: a hot, thread-safe multicast point.
//!
//! A `Subject` is both the emitting side (`next`/`error`/`complete`) and an
//! attach point for any number of observers. Every observer receives the
//! values emitted after it attaches; attaching or detaching one observer
//! never affects delivery to the others.
//!
//! # Re-entrancy
//!
//! Observer callbacks may attach new observers or detach any observer,
//! including themselves, while a value is being broadcast. A newly attached
//! observer does not receive the value currently in flight. `unsubscribe`
//! waits for a delivery to that observer running on another thread, so the
//! observer receives nothing once it returns.
//!
//! A callback may complete or error its own subject; the observer running
//! that callback is terminated as soon as the callback returns. A value
//! emitted on a subject from inside one of its own callbacks skips the
//! observer that is running.
//!
//! # Replay
//!
//! [`Subject::replay_last`] builds a subject that remembers the most recent
//! value and hands it to every observer that attaches later, before any
//! newer value.

use std::{
  cell::RefCell,
  convert::Infallible,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;

use crate::{
  observer::{BoxedObserver, FnMutObserver, Observer},
  subscription::Subscription,
};

enum Terminal<Err> {
  Complete,
  Error(Err),
}

impl<Err> Terminal<Err> {
  fn finish<Item>(self, observer: BoxedObserver<Item, Err>) {
    match self {
      Terminal::Complete => observer.complete(),
      Terminal::Error(err) => observer.error(err),
    }
  }
}

type ObserverCell<Item, Err> = RefCell<Option<BoxedObserver<Item, Err>>>;

struct Slot<Item, Err> {
  closed: AtomicBool,
  // Re-entrant: a callback may detach or terminate its own slot.
  observer: ReentrantMutex<ObserverCell<Item, Err>>,
  // Terminal raised from inside this slot's own callback.
  deferred: Mutex<Option<Terminal<Err>>>,
}

impl<Item, Err> Slot<Item, Err> {
  fn new(observer: BoxedObserver<Item, Err>) -> Self {
    Self {
      closed: AtomicBool::new(false),
      observer: ReentrantMutex::new(RefCell::new(Some(observer))),
      deferred: Mutex::new(None),
    }
  }

  fn deliver(&self, value: Item) {
    if self.closed.load(Ordering::Acquire) {
      return;
    }
    let cell = self.observer.lock();
    // Re-check: an unsubscribe may have landed while we waited for the lock.
    if self.closed.load(Ordering::Acquire) {
      return;
    }
    self.call_next(cell, value);
  }

  fn call_next(&self, cell: ReentrantMutexGuard<'_, ObserverCell<Item, Err>>, value: Item) {
    match cell.try_borrow_mut() {
      Ok(mut observer) => {
        if let Some(observer) = observer.as_mut() {
          observer.next(value);
        }
      }
      // This thread is already inside the observer.
      Err(_) => return,
    }

    let deferred = self.deferred.lock().take();
    if let Some(terminal) = deferred {
      let observer = cell.borrow_mut().take();
      drop(cell);
      if let Some(observer) = observer {
        terminal.finish(observer);
      }
    }
  }

  fn terminate(&self, terminal: Terminal<Err>) {
    self.closed.store(true, Ordering::Release);
    let cell = self.observer.lock();
    let observer = match cell.try_borrow_mut() {
      Ok(mut observer) => observer.take(),
      Err(_) => {
        *self.deferred.lock() = Some(terminal);
        return;
      }
    };
    drop(cell);
    if let Some(observer) = observer {
      terminal.finish(observer);
    }
  }

  /// Returns once no delivery to this slot is running on another thread.
  fn close(&self) {
    self.closed.store(true, Ordering::Release);
    drop(self.observer.lock());
  }
}

struct Subscribers<Item, Err> {
  next_id: usize,
  items: SmallVec<[(usize, Arc<Slot<Item, Err>>); 2]>,
  stopped: bool,
  replay: bool,
  last: Option<Item>,
}

impl<Item, Err> Subscribers<Item, Err> {
  fn new(replay: bool) -> Self {
    Self { next_id: 0, items: SmallVec::new(), stopped: false, replay, last: None }
  }

  fn add(&mut self, slot: Arc<Slot<Item, Err>>) -> usize {
    let id = self.next_id;
    self.next_id += 1;
    self.items.push((id, slot));
    id
  }

  fn remove(&mut self, id: usize) -> Option<Arc<Slot<Item, Err>>> {
    self
      .items
      .iter()
      .position(|(i, _)| *i == id)
      .map(|pos| self.items.remove(pos).1)
  }

  fn snapshot(&self) -> SmallVec<[Arc<Slot<Item, Err>>; 4]> {
    self.items.iter().map(|(_, slot)| slot.clone()).collect()
  }

  fn drain(&mut self) -> SmallVec<[Arc<Slot<Item, Err>>; 4]> {
    self.stopped = true;
    self.last = None;
    self.items.drain(..).map(|(_, slot)| slot).collect()
  }
}

/// Hot multicast observable. Cloning yields another handle to the same
/// subject.
pub struct Subject<Item, Err> {
  observers: Arc<Mutex<Subscribers<Item, Err>>>,
}

impl<Item, Err> Clone for Subject<Item, Err> {
  fn clone(&self) -> Self { Self { observers: self.observers.clone() } }
}

impl<Item, Err> Default for Subject<Item, Err> {
  fn default() -> Self { Self::new() }
}

impl<Item, Err> Subject<Item, Err> {
  /// A subject without replay.
  pub fn new() -> Self { Self { observers: Arc::new(Mutex::new(Subscribers::new(false))) } }

  /// A subject that replays its most recent value to late observers.
  pub fn replay_last() -> Self {
    Self { observers: Arc::new(Mutex::new(Subscribers::new(true))) }
  }

  /// Number of attached observers.
  pub fn subscriber_count(&self) -> usize { self.observers.lock().items.len() }

  /// Whether `complete` or `error` has been called.
  pub fn is_stopped(&self) -> bool { self.observers.lock().stopped }

  /// Forget the value kept for replay.
  pub fn clear_replay(&self) { self.observers.lock().last = None; }

  /// Whether both handles point at the same subject.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.observers, &other.observers) }
}

impl<Item, Err> Subject<Item, Err>
where
  Item: Clone + Send + 'static,
  Err: Send + 'static,
{
  /// Attach an observer.
  ///
  /// A stopped subject completes the observer straight away and returns a
  /// closed subscription.
  pub fn actual_subscribe<O>(&self, observer: O) -> SubjectSubscription<Item, Err>
  where
    O: Observer<Item, Err> + Send + 'static,
  {
    let slot = Arc::new(Slot::new(Box::new(observer)));

    let mut subscribers = self.observers.lock();
    if subscribers.stopped {
      drop(subscribers);
      slot.terminate(Terminal::Complete);
      return SubjectSubscription { observers: Weak::new(), id: usize::MAX, slot };
    }

    let id = subscribers.add(slot.clone());
    match subscribers.last.clone() {
      Some(value) => {
        // Hold the slot while the list is still locked so no concurrent
        // broadcast can overtake the replayed value.
        let cell = slot.observer.lock();
        drop(subscribers);
        slot.call_next(cell, value);
      }
      None => drop(subscribers),
    }

    SubjectSubscription { observers: Arc::downgrade(&self.observers), id, slot }
  }

  /// Broadcast a value to every attached observer.
  pub fn next(&self, value: Item) {
    let targets = {
      let mut subscribers = self.observers.lock();
      if subscribers.stopped {
        return;
      }
      if subscribers.replay {
        subscribers.last = Some(value.clone());
      }
      subscribers.snapshot()
    };

    let mut iter = targets.into_iter().peekable();
    while let Some(slot) = iter.next() {
      if iter.peek().is_some() {
        slot.deliver(value.clone());
      } else {
        slot.deliver(value);
        break;
      }
    }
  }

  /// Terminate every observer with `err` and stop the subject.
  pub fn error(&self, err: Err)
  where
    Err: Clone,
  {
    let targets = {
      let mut subscribers = self.observers.lock();
      if subscribers.stopped {
        return;
      }
      subscribers.drain()
    };
    for slot in targets {
      slot.terminate(Terminal::Error(err.clone()));
    }
  }

  /// Complete every observer and stop the subject.
  pub fn complete(&self) {
    let targets = {
      let mut subscribers = self.observers.lock();
      if subscribers.stopped {
        return;
      }
      subscribers.drain()
    };
    for slot in targets {
      slot.terminate(Terminal::Complete);
    }
  }
}

impl<Item> Subject<Item, Infallible>
where
  Item: Clone + Send + 'static,
{
  /// Attach a closure as the `next` handler.
  pub fn subscribe<F>(&self, next: F) -> SubjectSubscription<Item, Infallible>
  where
    F: FnMut(Item) + Send + 'static,
  {
    self.actual_subscribe(FnMutObserver(next))
  }
}

/// Handle returned by [`Subject::actual_subscribe`].
pub struct SubjectSubscription<Item, Err> {
  observers: Weak<Mutex<Subscribers<Item, Err>>>,
  id: usize,
  slot: Arc<Slot<Item, Err>>,
}

impl<Item, Err> Subscription for SubjectSubscription<Item, Err> {
  fn unsubscribe(self) {
    self.slot.close();
    if let Some(observers) = self.observers.upgrade() {
      observers.lock().remove(self.id);
    }
  }

  fn is_closed(&self) -> bool { self.slot.closed.load(Ordering::Acquire) }
}
