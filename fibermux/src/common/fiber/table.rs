// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(dead_code, unused_imports)]
//! The `local_id → endpoint` table of one side of a multiplexer

use dashmap::{mapref::entry::Entry, DashMap};
use std::{
  hash::Hash,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
};
use tokio::sync::mpsc::{
  self, error::TrySendError, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};

use super::{Datagram, Fiber, FiberError, FiberKind, LocalId};

/// Datagrams queued per socket before further arrivals are dropped
pub const DATAGRAM_QUEUE_DEPTH: usize = 256;

struct Slot<S> {
  generation: u64,
  sender: S,
}

/// Bindings of one multiplexer side, keyed by [`LocalId`]
///
/// Each binding is tagged with a generation so that a release can never
/// remove a later binding of the same id.
pub(crate) struct FiberTable {
  streams: DashMap<LocalId, Slot<UnboundedSender<Fiber>>>,
  datagrams: DashMap<LocalId, Slot<Sender<Datagram>>>,
  generation: AtomicU64,
  closed: AtomicBool,
}

/// A freshly inserted binding; the caller wraps it into an endpoint and
/// arranges for [`FiberTable::release`] to run when that endpoint drops
pub(crate) struct Bound<R> {
  pub generation: u64,
  pub incoming: R,
}

impl FiberTable {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      streams: DashMap::new(),
      datagrams: DashMap::new(),
      generation: AtomicU64::new(0),
      closed: AtomicBool::new(false),
    })
  }

  pub fn bind_stream(
    &self,
    local_id: LocalId,
  ) -> Result<Bound<UnboundedReceiver<Fiber>>, FiberError> {
    self.bind_in(&self.streams, local_id, mpsc::unbounded_channel)
  }

  pub fn bind_datagram(&self, local_id: LocalId) -> Result<Bound<Receiver<Datagram>>, FiberError> {
    self.bind_in(&self.datagrams, local_id, || mpsc::channel(DATAGRAM_QUEUE_DEPTH))
  }

  fn bind_in<S, R, C>(
    &self,
    slots: &DashMap<LocalId, Slot<S>>,
    local_id: LocalId,
    channel: C,
  ) -> Result<Bound<R>, FiberError>
  where
    C: FnOnce() -> (S, R),
  {
    if self.is_closed() {
      return Err(FiberError::TransportClosed);
    }
    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
    let (sender, incoming) = channel();
    match slots.entry(local_id) {
      Entry::Occupied(_) => return Err(FiberError::AlreadyBound(local_id)),
      Entry::Vacant(vacant) => {
        vacant.insert(Slot { generation, sender });
      }
    }
    // A concurrent close may have cleared the table before our insert landed
    if self.is_closed() {
      remove_generation(slots, local_id, generation);
      return Err(FiberError::TransportClosed);
    }
    tracing::trace!(%local_id, generation, "fiber binding created");
    Ok(Bound {
      generation,
      incoming,
    })
  }

  pub fn release(&self, kind: FiberKind, local_id: LocalId, generation: u64) {
    let removed = match kind {
      FiberKind::Stream => remove_generation(&self.streams, local_id, generation),
      FiberKind::Datagram => remove_generation(&self.datagrams, local_id, generation),
    };
    if removed {
      tracing::trace!(%local_id, ?kind, generation, "fiber binding released");
    }
  }

  /// Hands an inbound stream fiber to the acceptor bound at `local_id`
  ///
  /// Returns the fiber back if no acceptor is listening.
  pub fn deliver_stream(&self, local_id: LocalId, fiber: Fiber) -> Result<(), Fiber> {
    match self.streams.get(&local_id) {
      Some(slot) => slot.sender.send(fiber).map_err(|rejected| rejected.0),
      None => Err(fiber),
    }
  }

  /// Hands a datagram to the socket bound at `local_id`
  ///
  /// The datagram is dropped if nothing is bound or the socket's queue is full.
  pub fn deliver_datagram(&self, local_id: LocalId, datagram: Datagram) {
    let Some(slot) = self.datagrams.get(&local_id) else {
      tracing::trace!(%local_id, "datagram dropped; no socket bound");
      return;
    };
    match slot.sender.try_send(datagram) {
      Ok(()) => (),
      Err(TrySendError::Full(_)) => tracing::trace!(%local_id, "datagram dropped; queue full"),
      Err(TrySendError::Closed(_)) => {
        tracing::trace!(%local_id, "datagram dropped; socket is closing")
      }
    }
  }

  pub fn is_bound(&self, local_id: LocalId, kind: FiberKind) -> bool {
    match kind {
      FiberKind::Stream => self.streams.contains_key(&local_id),
      FiberKind::Datagram => self.datagrams.contains_key(&local_id),
    }
  }

  pub fn len(&self) -> usize {
    self.streams.len() + self.datagrams.len()
  }

  /// Drops every binding's sender, so pending receives end with [`FiberError::TransportClosed`]
  pub fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.streams.clear();
    self.datagrams.clear();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

fn remove_generation<K, S>(slots: &DashMap<K, Slot<S>>, key: K, generation: u64) -> bool
where
  K: Eq + Hash,
{
  slots
    .remove_if(&key, |_, slot| slot.generation == generation)
    .is_some()
}
