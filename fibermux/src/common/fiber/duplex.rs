// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(unused_imports, dead_code)]
//! An in-process [`Multiplexer`] pair, entangled through channels rather than a transport

use futures::{future::BoxFuture, FutureExt};
use std::sync::{Arc, Weak};

use super::{
  table::FiberTable, Datagram, DatagramFiber, DatagramSink, Fiber, FiberAcceptor, FiberAddress,
  FiberError, FiberKind, LocalId, MonotonicAtomicGenerator, Multiplexer,
};

/// Default capacity of each in-memory stream fiber's pipe, in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Outbound fibers take their local address from this range, away from service ids
const EPHEMERAL_ID_BASE: u32 = 1 << 31;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MultiplexerSide {
  Connect,
  Listen,
}

pub struct DuplexMultiplexer {
  side: MultiplexerSide,
  local: Arc<FiberTable>,
  peer: Weak<FiberTable>,
  ephemeral: MonotonicAtomicGenerator,
  buffer_size: usize,
}

impl std::fmt::Debug for DuplexMultiplexer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DuplexMultiplexer")
      .field("side", &self.side)
      .field("bound", &self.local.len())
      .field("closed", &self.local.is_closed())
      .finish_non_exhaustive()
  }
}

struct DuplexDatagramSink {
  local: Weak<FiberTable>,
  peer: Weak<FiberTable>,
}

impl DatagramSink for DuplexDatagramSink {
  fn deliver(&self, to: FiberAddress, datagram: Datagram) -> Result<(), FiberError> {
    let local = self.local.upgrade().ok_or(FiberError::TransportClosed)?;
    let peer = self.peer.upgrade().ok_or(FiberError::TransportClosed)?;
    if local.is_closed() || peer.is_closed() {
      return Err(FiberError::TransportClosed);
    }
    peer.deliver_datagram(to.local_id, datagram);
    Ok(())
  }
}

impl Multiplexer for DuplexMultiplexer {
  fn bind_acceptor(&self, local_id: LocalId) -> Result<FiberAcceptor, FiberError> {
    let bound = self.local.bind_stream(local_id)?;
    let table = Arc::downgrade(&self.local);
    let generation = bound.generation;
    Ok(FiberAcceptor::new(local_id, bound.incoming, move || {
      if let Some(table) = table.upgrade() {
        table.release(FiberKind::Stream, local_id, generation);
      }
    }))
  }

  fn bind_datagram(&self, local_id: LocalId) -> Result<DatagramFiber, FiberError> {
    let bound = self.local.bind_datagram(local_id)?;
    let table = Arc::downgrade(&self.local);
    let generation = bound.generation;
    let sink = Arc::new(DuplexDatagramSink {
      local: Arc::downgrade(&self.local),
      peer: self.peer.clone(),
    });
    Ok(DatagramFiber::new(
      FiberAddress::service(local_id),
      bound.incoming,
      sink,
      move || {
        if let Some(table) = table.upgrade() {
          table.release(FiberKind::Datagram, local_id, generation);
        }
      },
    ))
  }

  fn connect(&self, remote: FiberAddress) -> BoxFuture<'static, Result<Fiber, FiberError>> {
    let opened = (|| {
      if self.local.is_closed() {
        return Err(FiberError::TransportClosed);
      }
      let peer = self.peer.upgrade().ok_or(FiberError::TransportClosed)?;
      if peer.is_closed() {
        return Err(FiberError::TransportClosed);
      }
      let ephemeral = self.ephemeral.next();
      let (near, far) = tokio::io::duplex(self.buffer_size);
      let inbound = Fiber::new(
        FiberAddress::new(remote.local_id, Some(ephemeral.inner())),
        FiberAddress::service(ephemeral),
        far,
      );
      peer
        .deliver_stream(remote.local_id, inbound)
        .map_err(|_refused| FiberError::ConnectionRefused(remote))?;
      tracing::trace!(side = ?self.side, %remote, %ephemeral, "fiber opened");
      Ok(Fiber::new(
        FiberAddress::service(ephemeral),
        FiberAddress::service(remote.local_id),
        near,
      ))
    })();
    futures::future::ready(opened).boxed()
  }

  fn is_bound(&self, local_id: LocalId, kind: FiberKind) -> bool {
    self.local.is_bound(local_id, kind)
  }

  fn bound_count(&self) -> usize {
    self.local.len()
  }

  /// Closes both ends, as a transport failure would
  fn close(&self) {
    if !self.local.is_closed() {
      tracing::debug!(side = ?self.side, "closing duplex multiplexer");
    }
    self.local.close();
    if let Some(peer) = self.peer.upgrade() {
      peer.close();
    }
  }

  fn is_closed(&self) -> bool {
    self.local.is_closed()
  }
}

impl Drop for DuplexMultiplexer {
  fn drop(&mut self) {
    self.close();
  }
}

/// Two entangled multiplexers; fibers opened on one are accepted on the other
pub struct EntangledMultiplexers {
  pub listener: DuplexMultiplexer,
  pub connector: DuplexMultiplexer,
}

impl From<EntangledMultiplexers> for (DuplexMultiplexer, DuplexMultiplexer) {
  fn from(pair: EntangledMultiplexers) -> Self {
    (pair.listener, pair.connector)
  }
}

pub fn channel() -> EntangledMultiplexers {
  channel_with_buffer_size(DEFAULT_BUFFER_SIZE)
}

pub fn channel_with_buffer_size(buffer_size: usize) -> EntangledMultiplexers {
  let (listen_table, connect_table) = (FiberTable::new(), FiberTable::new());
  let side = |side, local: &Arc<FiberTable>, peer: &Arc<FiberTable>| DuplexMultiplexer {
    side,
    local: Arc::clone(local),
    peer: Arc::downgrade(peer),
    ephemeral: MonotonicAtomicGenerator::new(EPHEMERAL_ID_BASE),
    buffer_size,
  };
  EntangledMultiplexers {
    listener: side(MultiplexerSide::Listen, &listen_table, &connect_table),
    connector: side(MultiplexerSide::Connect, &connect_table, &listen_table),
  }
}
