// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The contract every multiplexed service satisfies, and the machinery to host them

use downcast_rs::{impl_downcast, DowncastSync};
use futures::future::BoxFuture;
use std::{fmt::Display, sync::Arc};

use super::fiber::{FiberError, LocalId, Multiplexer};

pub mod host;
mod lifecycle;
mod parameters;
pub mod registry;

pub use host::ServiceHost;
pub use lifecycle::ServiceCore;
pub use parameters::{ParameterError, ServiceParameters};
pub use registry::{ServiceFactory, ServiceRegistry};

/// Identifies the kind of behaviour a service implements; fixed at construction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTypeId {
  id: u32,
  name: &'static str,
}

impl ServiceTypeId {
  pub const fn new(id: u32, name: &'static str) -> Self {
    Self { id, name }
  }

  pub const fn id(&self) -> u32 {
    self.id
  }

  pub const fn name(&self) -> &'static str {
    self.name
  }
}

impl Display for ServiceTypeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}#{}", self.name, self.id)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ServiceState {
  Created,
  Running,
  Stopped,
}

impl ServiceState {
  pub fn is_stopped(&self) -> bool {
    matches!(self, ServiceState::Stopped)
  }
}

impl Display for ServiceState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ServiceState::Created => "created",
      ServiceState::Running => "running",
      ServiceState::Stopped => "stopped",
    })
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
  #[error("Service was already started")]
  AlreadyStarted,
  #[error("Service was already stopped")]
  AlreadyStopped,
  #[error("Service has no local id assigned")]
  LocalIdUnset,
  #[error("Local id {0} is already bound on this multiplexer")]
  AlreadyBound(LocalId),
  #[error("Transport closed")]
  TransportClosed,
  #[error("Operation cancelled")]
  Cancelled,
  #[error("Invalid service configuration: {0}")]
  InvalidConfiguration(#[from] ParameterError),
  #[error("No service type is registered as `{0}`")]
  UnknownServiceType(String),
  #[error(transparent)]
  Fiber(FiberError),
}

impl From<FiberError> for ServiceError {
  fn from(e: FiberError) -> Self {
    match e {
      FiberError::AlreadyBound(local_id) => ServiceError::AlreadyBound(local_id),
      FiberError::TransportClosed => ServiceError::TransportClosed,
      FiberError::Cancelled => ServiceError::Cancelled,
      other => ServiceError::Fiber(other),
    }
  }
}

/// The reactor and multiplexer a service runs against
///
/// Services share both; neither is owned by any single service.
#[derive(Clone)]
pub struct ServiceContext {
  reactor: tokio::runtime::Handle,
  multiplexer: Arc<dyn Multiplexer>,
}

impl ServiceContext {
  pub fn new(reactor: tokio::runtime::Handle, multiplexer: Arc<dyn Multiplexer>) -> Self {
    Self {
      reactor,
      multiplexer,
    }
  }

  pub fn reactor(&self) -> &tokio::runtime::Handle {
    &self.reactor
  }

  pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
    &self.multiplexer
  }
}

impl std::fmt::Debug for ServiceContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceContext")
      .field("bound", &self.multiplexer.bound_count())
      .field("closed", &self.multiplexer.is_closed())
      .finish_non_exhaustive()
  }
}

/// A unit of network behaviour bound to one [`LocalId`] of a [`Multiplexer`]
///
/// Lifecycle is `Created → Running → Stopped`; `Stopped` is terminal.
/// Implementations embed a [`ServiceCore`], which carries the lifecycle and
/// cancellation machinery shared by every service.
pub trait Service: DowncastSync {
  /// Acquires the service's bindings and begins its asynchronous work
  ///
  /// Valid exactly once. On failure no binding remains and the service stays
  /// `Created`, so a different id may be assigned before retrying.
  fn start(self: Arc<Self>) -> Result<(), ServiceError>;

  /// Cancels all outstanding work and releases every binding; idempotent
  fn stop(&self) -> Result<(), ServiceError>;

  fn service_type_id(&self) -> ServiceTypeId;

  fn core(&self) -> &ServiceCore;

  fn set_local_id(&self, local_id: LocalId) -> Result<(), ServiceError> {
    self.core().set_local_id(local_id)
  }

  fn local_id(&self) -> Option<LocalId> {
    self.core().local_id()
  }

  fn state(&self) -> ServiceState {
    self.core().state()
  }

  /// Records a runtime failure of the service's own bindings and stops it
  fn fail(&self, error: ServiceError) {
    if self.core().fail(error) {
      if let Err(release_error) = self.stop() {
        tracing::debug!(
          type_id = %self.service_type_id(),
          error = %release_error,
          "release after failure reported an error"
        );
      }
    }
  }

  /// Resolves once the service is stopped, yielding the failure that stopped it, if any
  fn on_stopped(&self) -> BoxFuture<'static, Option<Arc<ServiceError>>> {
    self.core().on_stopped()
  }

  /// Resolves once the service is stopped and every tracked task has finished
  fn drained(&self) -> BoxFuture<'static, ()> {
    self.core().drained()
  }
}
impl_downcast!(sync Service);
