// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

/// The address of a service within one multiplexer's namespace
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct LocalId(u32);

impl LocalId {
  pub const fn new(inner: u32) -> LocalId {
    Self(inner)
  }

  pub fn inner(&self) -> u32 {
    self.0
  }
}

impl From<u32> for LocalId {
  fn from(inner: u32) -> Self {
    Self::new(inner)
  }
}

impl From<LocalId> for u32 {
  fn from(id: LocalId) -> u32 {
    id.inner()
  }
}

impl std::str::FromStr for LocalId {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.parse::<u32>().map(LocalId::new)
  }
}

impl std::fmt::Debug for LocalId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("LocalId").field(&self.0).finish()
  }
}

impl std::fmt::Display for LocalId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

pub trait LocalIdGenerator {
  fn next(&self) -> LocalId;
}

/// Hands out ids in increasing order, wrapping at `u32::MAX`
#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU32,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u32) -> Self {
    Self {
      next: std::sync::atomic::AtomicU32::new(next),
    }
  }

  pub fn next(&self) -> LocalId {
    LocalId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

impl LocalIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> LocalId {
    MonotonicAtomicGenerator::next(self)
  }
}
