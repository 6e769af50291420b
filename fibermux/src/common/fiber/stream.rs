// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::Error as IOError,
  pin::Pin,
  task::{Context, Poll},
};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
  sync::mpsc::UnboundedReceiver,
};

use super::{FiberAddress, FiberError, LocalId};
use crate::util::dropkick::Dropkick;

pub(crate) type BindingRelease = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A reliable, ordered virtual stream connection
///
/// Dropping a fiber closes it; any read or write future still pending on it
/// is dropped along with it and never completes.
#[derive(Debug)]
pub struct Fiber {
  local: FiberAddress,
  peer: FiberAddress,
  stream: DuplexStream,
}

impl Fiber {
  pub fn new(local: FiberAddress, peer: FiberAddress, stream: DuplexStream) -> Self {
    Self {
      local,
      peer,
      stream,
    }
  }

  pub fn local_addr(&self) -> FiberAddress {
    self.local
  }

  pub fn peer_addr(&self) -> FiberAddress {
    self.peer
  }

  /// Shuts down the write half, signalling end-of-stream to the peer
  pub async fn close(&mut self) -> Result<(), IOError> {
    self.stream.shutdown().await
  }
}

impl AsyncRead for Fiber {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    AsyncRead::poll_read(Pin::new(&mut self.get_mut().stream), cx, buf)
  }
}

impl AsyncWrite for Fiber {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    AsyncWrite::poll_write(Pin::new(&mut self.get_mut().stream), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().stream), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().stream), cx)
  }
}

/// Yields inbound [`Fiber`]s addressed to one [`LocalId`]
///
/// The binding is held for as long as the acceptor lives.
pub struct FiberAcceptor {
  local_id: LocalId,
  incoming: UnboundedReceiver<Fiber>,
  _binding: Dropkick<BindingRelease>,
}

impl std::fmt::Debug for FiberAcceptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FiberAcceptor")
      .field("local_id", &self.local_id)
      .finish_non_exhaustive()
  }
}

impl FiberAcceptor {
  /// Builds an acceptor over a channel of inbound fibers
  ///
  /// `release` runs exactly once, when the acceptor is dropped, and must
  /// remove the multiplexer's binding for `local_id`.
  pub fn new<F>(local_id: LocalId, incoming: UnboundedReceiver<Fiber>, release: F) -> Self
  where
    F: FnOnce() + Send + Sync + 'static,
  {
    Self {
      local_id,
      incoming,
      _binding: Dropkick::new(Box::new(release) as BindingRelease),
    }
  }

  pub fn local_id(&self) -> LocalId {
    self.local_id
  }

  /// Waits for the next inbound fiber
  ///
  /// Fails with [`FiberError::TransportClosed`] once the multiplexer can no
  /// longer deliver fibers to this binding.
  pub async fn accept(&mut self) -> Result<Fiber, FiberError> {
    futures::future::poll_fn(|cx| self.poll_accept(cx)).await
  }

  /// Polls for the next inbound fiber; the transport closing ends the stream of fibers
  pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<Fiber, FiberError>> {
    self
      .incoming
      .poll_recv(cx)
      .map(|fiber| fiber.ok_or(FiberError::TransportClosed))
  }
}
