// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The multiplexer-facing side of the framework: fiber addressing, endpoints,
//! and the [`Multiplexer`] contract services are written against.
//!
//! A fiber is a virtual stream or datagram channel carried over one shared
//! transport. Multiplexer implementations own that transport; services only
//! ever see the endpoints produced here.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

mod datagram;
pub mod duplex;
pub mod id;
mod stream;
mod table;

pub use self::{
  datagram::{Datagram, DatagramFiber, DatagramSink},
  id::{LocalId, LocalIdGenerator, MonotonicAtomicGenerator},
  stream::{Fiber, FiberAcceptor},
};
pub(crate) use self::stream::BindingRelease;

/// Full address of a fiber endpoint: the service's [`LocalId`] and an
/// optional sub-address distinguishing individual fibers to that id
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct FiberAddress {
  pub local_id: LocalId,
  pub sub: Option<u32>,
}

impl FiberAddress {
  pub fn new(local_id: LocalId, sub: Option<u32>) -> Self {
    Self { local_id, sub }
  }

  pub fn service(local_id: LocalId) -> Self {
    Self::new(local_id, None)
  }
}

impl From<LocalId> for FiberAddress {
  fn from(local_id: LocalId) -> Self {
    Self::service(local_id)
  }
}

impl std::fmt::Display for FiberAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.sub {
      Some(sub) => write!(f, "{}:{}", self.local_id, sub),
      None => write!(f, "{}", self.local_id),
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FiberKind {
  Stream,
  Datagram,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
  #[error("Local id {0} is already bound on this multiplexer")]
  AlreadyBound(LocalId),
  #[error("No acceptor is bound at {0}")]
  ConnectionRefused(FiberAddress),
  #[error("Transport closed")]
  TransportClosed,
  #[error("Operation cancelled")]
  Cancelled,
}

/// Demultiplexes one transport into many fibers addressed by [`LocalId`]
///
/// Implementations guarantee that at most one acceptor and at most one
/// datagram socket are bound per id at any time, rejecting collisions with
/// [`FiberError::AlreadyBound`]. Dropping an endpoint releases its binding
/// and discards any completion still pending on it.
#[cfg_attr(test, mockall::automock)]
pub trait Multiplexer: Send + Sync {
  /// Binds a stream acceptor yielding fibers opened by the remote towards `local_id`
  fn bind_acceptor(&self, local_id: LocalId) -> Result<FiberAcceptor, FiberError>;

  /// Binds the datagram socket for `local_id`
  fn bind_datagram(&self, local_id: LocalId) -> Result<DatagramFiber, FiberError>;

  /// Opens a stream fiber to the remote side's acceptor at `remote`
  fn connect(&self, remote: FiberAddress) -> BoxFuture<'static, Result<Fiber, FiberError>>;

  fn is_bound(&self, local_id: LocalId, kind: FiberKind) -> bool;

  /// Count of acceptor and datagram bindings currently held
  fn bound_count(&self) -> usize;

  /// Closes the transport; pending and future operations fail with [`FiberError::TransportClosed`]
  fn close(&self);

  fn is_closed(&self) -> bool;
}
