// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(dead_code, unused_imports)]
use crate::common::fiber::BindingRelease;

/// A trait describing the concept of "dropkicking", in an allusion to percusive maintenance.
///
/// Dropkicking an object tells it to do something specific to its type when dropped.
/// Fiber endpoints use this to release their multiplexer binding; services use it
/// to cancel their outstanding work when the last handle goes away.
pub trait DropkickSync {
  fn dropkick(self);
}

/// A wrapper-type which [DropkickSync::dropkick]s its contents when dropped
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Dropkick<T: DropkickSync> {
  inner: Option<T>,
}

impl<T> Dropkick<T>
where
  T: DropkickSync,
{
  pub fn new(target: T) -> Self {
    Self {
      inner: Some(target),
    }
  }
}

impl<T> Drop for Dropkick<T>
where
  T: DropkickSync,
{
  fn drop(&mut self) {
    if let Some(inner) = self.inner.take() {
      DropkickSync::dropkick(inner);
    }
  }
}

/// Changes the semantics of a [::tokio_util::sync::CancellationToken] to cancel on drop
impl DropkickSync for ::tokio_util::sync::CancellationToken {
  fn dropkick(self) {
    if !self.is_cancelled() {
      self.cancel()
    }
  }
}

/// Runs a binding's release hook when its endpoint is dropped
impl DropkickSync for BindingRelease {
  fn dropkick(self) {
    (self)();
  }
}

#[cfg(test)]
mod tests {
  use super::Dropkick;
  use crate::common::fiber::BindingRelease;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };
  use tokio_util::sync::CancellationToken;

  #[test]
  fn release_hooks_run_once_on_drop() {
    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let release: BindingRelease = Box::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let kick = Dropkick::new(release);
    assert_eq!(releases.load(Ordering::SeqCst), 0);
    drop(kick);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn dropkick_cancels_tokens() {
    let token = CancellationToken::new();
    drop(Dropkick::new(token.clone()));
    assert!(token.is_cancelled());
  }
}
