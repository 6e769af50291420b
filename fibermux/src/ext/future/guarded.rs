// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  pin::Pin,
  task::{Context, Poll},
};

use futures::{future::FusedFuture, Future};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

pin_project_lite::pin_project! {
  /// A single in-flight operation bound to the lifetime of its owner
  ///
  /// The keepalive (typically an `Arc` of the owning service) is released as
  /// soon as the operation resolves or is cancelled, never later.
  pub struct Guarded<Fut, Keepalive> {
    #[pin]
    fut: Fut,
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
    token: CancellationToken,
    keepalive: Option<Keepalive>,
  }
}

impl<Fut, Keepalive> Guarded<Fut, Keepalive> {
  pub(super) fn new(fut: Fut, token: CancellationToken, keepalive: Keepalive) -> Self {
    Self {
      fut,
      cancelled: token.clone().cancelled_owned(),
      token,
      keepalive: Some(keepalive),
    }
  }
}

impl<Fut, Keepalive> Future for Guarded<Fut, Keepalive>
where
  Fut: Future,
{
  type Output = Option<Fut::Output>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.project();
    if this.keepalive.is_none() {
      // Already resolved
      return Poll::Pending;
    }
    if this.cancelled.poll(cx).is_ready() {
      this.keepalive.take();
      return Poll::Ready(None);
    }
    let output = futures::ready!(this.fut.poll(cx));
    // A completion racing with cancellation is discarded
    let delivered = (!this.token.is_cancelled()).then_some(output);
    this.keepalive.take();
    Poll::Ready(delivered)
  }
}

impl<Fut, Keepalive> FusedFuture for Guarded<Fut, Keepalive>
where
  Fut: Future,
{
  fn is_terminated(&self) -> bool {
    self.keepalive.is_none()
  }
}
