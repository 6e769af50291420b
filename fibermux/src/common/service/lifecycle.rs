// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use arc_swap::ArcSwapOption;
use futures::{future::BoxFuture, Future, FutureExt};
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc, Mutex, MutexGuard, PoisonError,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

use super::{ServiceContext, ServiceError, ServiceState, ServiceTypeId};
use crate::{
  common::fiber::{LocalId, Multiplexer},
  ext::future::{FutureExtExt, Guarded},
  util::dropkick::Dropkick,
};

const LOCAL_ID_UNSET: u64 = u64::MAX;

/// Lifecycle, cancellation, and task bookkeeping shared by every [`Service`](super::Service)
///
/// Transitions (`set_local_id`, `start_with`, `stop_with`) are serialized by an
/// internal lock; the accessors never take it, so a start closure may read them.
/// A start or stop closure must not itself attempt another transition.
pub struct ServiceCore {
  type_id: ServiceTypeId,
  context: ServiceContext,
  transitions: Mutex<()>,
  local_id: AtomicU64,
  state: watch::Sender<ServiceState>,
  failure: Arc<ArcSwapOption<ServiceError>>,
  shutdown: CancellationToken,
  tasks: TaskTracker,
  _cancel_on_drop: Dropkick<CancellationToken>,
}

impl std::fmt::Debug for ServiceCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceCore")
      .field("type_id", &self.type_id)
      .field("local_id", &self.local_id())
      .field("state", &self.state())
      .field("tasks", &self.tasks.len())
      .finish_non_exhaustive()
  }
}

impl ServiceCore {
  pub fn new(type_id: ServiceTypeId, context: ServiceContext) -> Self {
    let shutdown = CancellationToken::new();
    Self {
      type_id,
      context,
      transitions: Mutex::new(()),
      local_id: AtomicU64::new(LOCAL_ID_UNSET),
      state: watch::channel(ServiceState::Created).0,
      failure: Arc::new(ArcSwapOption::empty()),
      _cancel_on_drop: Dropkick::new(shutdown.clone()),
      shutdown,
      tasks: TaskTracker::new(),
    }
  }

  pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
    self.context.multiplexer()
  }

  pub fn local_id(&self) -> Option<LocalId> {
    match self.local_id.load(Ordering::Acquire) {
      LOCAL_ID_UNSET => None,
      id => u32::try_from(id).ok().map(LocalId::new),
    }
  }

  pub fn state(&self) -> ServiceState {
    *self.state.borrow()
  }

  pub fn is_stopped(&self) -> bool {
    self.state().is_stopped()
  }

  pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
    self.state.subscribe()
  }

  fn lock_transitions(&self) -> MutexGuard<'_, ()> {
    // The guarded data is a unit; a panic elsewhere leaves nothing inconsistent
    self
      .transitions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn transition(&self, next: ServiceState) {
    self.state.send_replace(next);
  }

  pub fn set_local_id(&self, local_id: LocalId) -> Result<(), ServiceError> {
    let _transition = self.lock_transitions();
    match self.state() {
      ServiceState::Created => {
        self
          .local_id
          .store(u64::from(local_id.inner()), Ordering::Release);
        Ok(())
      }
      ServiceState::Running => Err(ServiceError::AlreadyStarted),
      ServiceState::Stopped => Err(ServiceError::AlreadyStopped),
    }
  }

  /// Runs `acquire` with the assigned id and moves to `Running` if it succeeds
  ///
  /// If `acquire` fails, the service remains `Created`; anything it acquired
  /// must be dropped on its error path so that no registration survives.
  pub fn start_with<F>(&self, acquire: F) -> Result<(), ServiceError>
  where
    F: FnOnce(LocalId) -> Result<(), ServiceError>,
  {
    let _transition = self.lock_transitions();
    match self.state() {
      ServiceState::Created => (),
      ServiceState::Running => return Err(ServiceError::AlreadyStarted),
      ServiceState::Stopped => return Err(ServiceError::AlreadyStopped),
    }
    let local_id = self.local_id().ok_or(ServiceError::LocalIdUnset)?;
    match acquire(local_id) {
      Ok(()) => {
        self.transition(ServiceState::Running);
        tracing::info!(type_id = %self.type_id, %local_id, "service started");
        Ok(())
      }
      Err(error) => {
        tracing::debug!(type_id = %self.type_id, %local_id, %error, "service failed to start");
        Err(error)
      }
    }
  }

  /// Moves to `Stopped`, cancels outstanding work, then runs `release`
  ///
  /// Idempotent; `release` only runs when stopping a running service.
  pub fn stop_with<F>(&self, release: F) -> Result<(), ServiceError>
  where
    F: FnOnce() -> Result<(), ServiceError>,
  {
    let _transition = self.lock_transitions();
    let previous = self.state();
    if previous.is_stopped() {
      return Ok(());
    }
    self.transition(ServiceState::Stopped);
    self.shutdown.cancel();
    self.tasks.close();
    match previous {
      ServiceState::Running => {
        let released = release();
        tracing::info!(type_id = %self.type_id, local_id = ?self.local_id(), "service stopped");
        released
      }
      _ => {
        tracing::debug!(type_id = %self.type_id, "service stopped before starting");
        Ok(())
      }
    }
  }

  /// Records the failure that is about to stop a running service
  ///
  /// Returns `false` if the service is not running, in which case the failure is
  /// not recorded and the caller has nothing further to do. Only the first
  /// failure is kept.
  pub fn fail(&self, error: ServiceError) -> bool {
    if self.state() != ServiceState::Running {
      tracing::debug!(type_id = %self.type_id, %error, "ignoring failure of an inactive service");
      return false;
    }
    tracing::warn!(
      type_id = %self.type_id,
      local_id = ?self.local_id(),
      %error,
      "service failed; stopping"
    );
    let unset: Option<Arc<ServiceError>> = None;
    self
      .failure
      .compare_and_swap(&unset, Some(Arc::new(error)));
    true
  }

  /// Wraps one operation so it resolves to `None` once the service stops
  ///
  /// `keepalive` is held for exactly as long as the operation is outstanding.
  pub fn guard<Fut, K>(&self, keepalive: K, operation: Fut) -> Guarded<Fut, K>
  where
    Fut: Future,
  {
    operation.guarded(&self.shutdown, keepalive)
  }

  /// Spawns a tracked task on the service's reactor, cancelled when the service stops
  pub fn spawn<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    let span = tracing::debug_span!(
      "service",
      type_id = %self.type_id,
      local_id = ?self.local_id(),
    );
    self.tasks.spawn_on(
      task.guarded(&self.shutdown, ()).instrument(span),
      self.context.reactor(),
    )
  }

  pub fn on_stopped(&self) -> BoxFuture<'static, Option<Arc<ServiceError>>> {
    let mut state = self.subscribe();
    let failure = Arc::clone(&self.failure);
    async move {
      while !state.borrow_and_update().is_stopped() {
        if state.changed().await.is_err() {
          break;
        }
      }
      failure.load_full()
    }
    .boxed()
  }

  pub fn drained(&self) -> BoxFuture<'static, ()> {
    let tasks = self.tasks.clone();
    let stopped = self.on_stopped();
    async move {
      stopped.await;
      tasks.wait().await
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::ServiceCore;
  use crate::common::{
    fiber::{LocalId, MockMultiplexer},
    service::{ServiceContext, ServiceError, ServiceState, ServiceTypeId},
  };
  use std::{
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
    time::Duration,
  };

  const TEST_TYPE: ServiceTypeId = ServiceTypeId::new(99, "test");

  // The lifecycle never touches the multiplexer; an expectation-free mock proves it
  fn test_core() -> ServiceCore {
    let context = ServiceContext::new(
      tokio::runtime::Handle::current(),
      Arc::new(MockMultiplexer::new()),
    );
    ServiceCore::new(TEST_TYPE, context)
  }

  #[tokio::test]
  async fn start_requires_a_local_id() {
    let core = test_core();
    assert_eq!(core.start_with(|_| Ok(())), Err(ServiceError::LocalIdUnset));
    assert_eq!(core.state(), ServiceState::Created);
    core.set_local_id(LocalId::new(0)).unwrap();
    core.start_with(|id| {
      assert_eq!(id, LocalId::new(0));
      Ok(())
    })
    .unwrap();
    assert_eq!(core.state(), ServiceState::Running);
    assert_eq!(
      core.set_local_id(LocalId::new(1)),
      Err(ServiceError::AlreadyStarted)
    );
  }

  #[tokio::test]
  async fn failed_start_remains_created() {
    let core = test_core();
    core.set_local_id(LocalId::new(3)).unwrap();
    assert_eq!(
      core.start_with(|id| Err(ServiceError::AlreadyBound(id))),
      Err(ServiceError::AlreadyBound(LocalId::new(3)))
    );
    assert_eq!(core.state(), ServiceState::Created);
    core.set_local_id(LocalId::new(4)).unwrap();
    core.start_with(|_| Ok(())).unwrap();
    assert_eq!(core.local_id(), Some(LocalId::new(4)));
  }

  #[tokio::test]
  async fn stop_runs_release_once_and_only_when_running() {
    let core = test_core();
    let released = AtomicBool::new(false);
    core.stop_with(|| panic!("Nothing to release before start")).unwrap();
    assert_eq!(core.state(), ServiceState::Stopped);
    assert_eq!(
      core.start_with(|_| Ok(())),
      Err(ServiceError::AlreadyStopped)
    );

    let core = test_core();
    core.set_local_id(LocalId::new(1)).unwrap();
    core.start_with(|_| Ok(())).unwrap();
    core
      .stop_with(|| {
        assert!(!released.swap(true, Ordering::SeqCst));
        Ok(())
      })
      .unwrap();
    core.stop_with(|| panic!("Release must not run twice")).unwrap();
    assert!(released.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn stop_cancels_spawned_work_and_drains() {
    let core = test_core();
    core.set_local_id(LocalId::new(1)).unwrap();
    core.start_with(|_| Ok(())).unwrap();
    let owner = Arc::new(());
    let held = Arc::clone(&owner);
    let task = core.spawn(async move {
      let _held = held;
      tokio::time::sleep(Duration::from_secs(60)).await;
    });
    let drained = core.drained();
    let mut states = core.subscribe();
    core.stop_with(|| Ok(())).unwrap();
    assert_eq!(*states.borrow_and_update(), ServiceState::Stopped);
    let fut = async move {
      assert_eq!(task.await.unwrap(), None);
      drained.await;
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Stopping must cancel and drain tracked tasks");
    assert_eq!(Arc::strong_count(&owner), 1);
  }

  #[tokio::test]
  async fn failure_is_reported_to_stop_observers() {
    let core = test_core();
    let stopped = core.on_stopped();
    assert!(!core.fail(ServiceError::TransportClosed));
    core.set_local_id(LocalId::new(1)).unwrap();
    core.start_with(|_| Ok(())).unwrap();
    assert!(core.fail(ServiceError::TransportClosed));
    assert!(core.fail(ServiceError::Cancelled));
    core.stop_with(|| Ok(())).unwrap();
    let failure = tokio::time::timeout(Duration::from_secs(5), stopped)
      .await
      .expect("Stop observers must be woken");
    assert_eq!(failure.as_deref(), Some(&ServiceError::TransportClosed));
  }
}
