//! Where background work runs.
//!
//! The multiplexer issues every wire call from one long-lived driver task.
//! A [`Scheduler`] decides which executor that task lives on:
//!
//! - `futures-scheduler` (default feature): [`ThreadPoolScheduler`], a
//!   process-wide `futures` thread pool.
//! - `tokio-scheduler`: [`TokioScheduler`], any tokio runtime handle.
//! - always: [`NewThreadScheduler`], one OS thread per task.

use futures::future::BoxFuture;

/// Spawns detached futures.
pub trait Scheduler: Send + Sync {
  fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Runs every task to completion on its own OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewThreadScheduler;

impl Scheduler for NewThreadScheduler {
  fn spawn(&self, task: BoxFuture<'static, ()>) {
    let spawned = std::thread::Builder::new()
      .name("rxmqtt-driver".into())
      .spawn(move || futures::executor::block_on(task));
    if let Err(err) = spawned {
      tracing::error!(error = %err, "failed to spawn scheduler thread");
    }
  }
}

#[cfg(feature = "futures-scheduler")]
mod thread_pool {
  use futures::{executor::ThreadPool, future::BoxFuture};
  use once_cell::sync::Lazy;

  use super::Scheduler;

  static DEFAULT_POOL: Lazy<ThreadPool> = Lazy::new(|| {
    ThreadPool::builder()
      .name_prefix("rxmqtt-")
      .create()
      .expect("failed to start the rxmqtt thread pool")
  });

  /// Runs tasks on a shared `futures` thread pool.
  #[derive(Clone)]
  pub struct ThreadPoolScheduler {
    pool: ThreadPool,
  }

  impl ThreadPoolScheduler {
    /// Use a caller-provided pool instead of the process-wide one.
    pub fn with_pool(pool: ThreadPool) -> Self { Self { pool } }
  }

  impl Default for ThreadPoolScheduler {
    fn default() -> Self { Self { pool: DEFAULT_POOL.clone() } }
  }

  impl Scheduler for ThreadPoolScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) { self.pool.spawn_ok(task); }
  }
}

#[cfg(feature = "futures-scheduler")]
pub use thread_pool::ThreadPoolScheduler;

#[cfg(feature = "tokio-scheduler")]
mod tokio_runtime {
  use futures::future::BoxFuture;
  use tokio::runtime::Handle;

  use super::Scheduler;

  /// Runs tasks on a tokio runtime.
  #[derive(Clone)]
  pub struct TokioScheduler {
    handle: Handle,
  }

  impl TokioScheduler {
    pub fn new(handle: Handle) -> Self { Self { handle } }

    /// Binds to the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Outside of a tokio runtime.
    pub fn current() -> Self { Self { handle: Handle::current() } }
  }

  impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
      let _detached = self.handle.spawn(task);
    }
  }
}

#[cfg(feature = "tokio-scheduler")]
pub use tokio_runtime::TokioScheduler;

#[cfg(test)]
mod test {
  use futures::{channel::oneshot, FutureExt};

  use super::*;

  #[rxmqtt_macro::test]
  async fn new_thread_runs_task() {
    let (tx, rx) = oneshot::channel();
    NewThreadScheduler.spawn(
      async move {
        let _ = tx.send(std::thread::current().name().map(String::from));
      }
      .boxed(),
    );
    assert_eq!(rx.await, Ok(Some("rxmqtt-driver".to_owned())));
  }

  #[cfg(feature = "futures-scheduler")]
  #[rxmqtt_macro::test]
  async fn thread_pool_runs_task() {
    let (tx, rx) = oneshot::channel();
    ThreadPoolScheduler::default().spawn(
      async move {
        let _ = tx.send(42);
      }
      .boxed(),
    );
    assert_eq!(rx.await, Ok(42));
  }
}
