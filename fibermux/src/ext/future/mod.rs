// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use futures::Future;
use tokio_util::sync::CancellationToken;

mod guarded;
pub use guarded::Guarded;

pub trait FutureExtExt: Future {
  /// Holds `keepalive` for as long as this future is outstanding, resolving to
  /// `None` instead of its output if `cancellation` fires first or fires while
  /// the output is being produced
  fn guarded<K>(self, cancellation: &CancellationToken, keepalive: K) -> Guarded<Self, K>
  where
    Self: Sized,
  {
    Guarded::new(self, cancellation.clone(), keepalive)
  }
}

impl<Fut: ?Sized + Future> FutureExtExt for Fut {}
