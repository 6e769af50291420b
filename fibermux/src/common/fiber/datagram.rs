// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  sync::Arc,
  task::{Context, Poll},
};
use tokio::sync::mpsc::Receiver;

use super::{BindingRelease, FiberAddress, FiberError};
use crate::util::dropkick::Dropkick;

/// One message received on a [`DatagramFiber`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
  pub from: FiberAddress,
  pub payload: Vec<u8>,
}

/// Outbound half of a datagram binding, provided by the multiplexer
///
/// Delivery is unordered and may be lossy; implementations only report
/// failures of the transport itself.
pub trait DatagramSink: Send + Sync {
  fn deliver(&self, to: FiberAddress, datagram: Datagram) -> Result<(), FiberError>;
}

/// An unordered, possibly lossy message endpoint bound to one local id
pub struct DatagramFiber {
  local: FiberAddress,
  incoming: Receiver<Datagram>,
  sink: Arc<dyn DatagramSink>,
  _binding: Dropkick<BindingRelease>,
}

impl std::fmt::Debug for DatagramFiber {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DatagramFiber")
      .field("local", &self.local)
      .finish_non_exhaustive()
  }
}

impl DatagramFiber {
  /// `release` runs exactly once, when the fiber is dropped
  pub fn new<F>(
    local: FiberAddress,
    incoming: Receiver<Datagram>,
    sink: Arc<dyn DatagramSink>,
    release: F,
  ) -> Self
  where
    F: FnOnce() + Send + Sync + 'static,
  {
    Self {
      local,
      incoming,
      sink,
      _binding: Dropkick::new(Box::new(release) as BindingRelease),
    }
  }

  pub fn local_addr(&self) -> FiberAddress {
    self.local
  }

  pub async fn send_to(&self, to: FiberAddress, payload: &[u8]) -> Result<usize, FiberError> {
    self.try_send_to(to, payload)
  }

  /// Hands a datagram to the multiplexer without waiting; delivery never applies backpressure
  pub fn try_send_to(&self, to: FiberAddress, payload: &[u8]) -> Result<usize, FiberError> {
    let datagram = Datagram {
      from: self.local,
      payload: payload.to_vec(),
    };
    self.sink.deliver(to, datagram)?;
    Ok(payload.len())
  }

  pub async fn recv_from(&mut self) -> Result<Datagram, FiberError> {
    futures::future::poll_fn(|cx| self.poll_recv_from(cx)).await
  }

  pub fn poll_recv_from(&mut self, cx: &mut Context<'_>) -> Poll<Result<Datagram, FiberError>> {
    self
      .incoming
      .poll_recv(cx)
      .map(|datagram| datagram.ok_or(FiberError::TransportClosed))
  }
}
