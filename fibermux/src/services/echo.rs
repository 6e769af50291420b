// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Diagnostic service: returns every byte and datagram it receives to its sender

use futures::{future::poll_fn, Future};
use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
  task::Poll,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
  common::{
    fiber::{DatagramFiber, Fiber, FiberAcceptor, FiberError},
    service::{
      Service, ServiceContext, ServiceCore, ServiceError, ServiceParameters, ServiceTypeId,
    },
  },
  ext::future::Guarded,
};

const READ_BUFFER_SIZE: usize = 4096;

/// An endpoint shared between a service and its receive loop
///
/// The loop only holds the lock while polling, so `stop` can take and drop the
/// endpoint at any time, releasing its binding immediately.
type EndpointSlot<T> = Arc<Mutex<Option<T>>>;

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
  slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct EchoService {
  core: ServiceCore,
  echo_datagrams: bool,
  acceptor: EndpointSlot<FiberAcceptor>,
  datagrams: EndpointSlot<DatagramFiber>,
}

impl std::fmt::Debug for EchoService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EchoService")
      .field("core", &self.core)
      .field("echo_datagrams", &self.echo_datagrams)
      .finish_non_exhaustive()
  }
}

impl EchoService {
  pub const TYPE_ID: ServiceTypeId = ServiceTypeId::new(1, "echo");

  /// Recognizes `datagram` (`true`/`false`, default `false`): also echo datagrams sent to the service's id
  pub fn new(context: ServiceContext, params: &ServiceParameters) -> Result<Arc<Self>, ServiceError> {
    let echo_datagrams = params.parse_or("datagram", false)?;
    Ok(Arc::new(Self {
      core: ServiceCore::new(Self::TYPE_ID, context),
      echo_datagrams,
      acceptor: Default::default(),
      datagrams: Default::default(),
    }))
  }

  fn guard<Fut: Future>(self: &Arc<Self>, operation: Fut) -> Guarded<Fut, Arc<Self>> {
    self.core.guard(Arc::clone(self), operation)
  }

  async fn accept_loop(service: Weak<Self>, acceptor: EndpointSlot<FiberAcceptor>) {
    loop {
      let accepted = poll_fn(|cx| match lock(&acceptor).as_mut() {
        Some(acceptor) => acceptor.poll_accept(cx),
        None => Poll::Ready(Err(FiberError::Cancelled)),
      })
      .await;
      let Some(this) = service.upgrade() else {
        return;
      };
      if this.core.is_stopped() {
        return;
      }
      match accepted {
        Ok(fiber) => {
          tracing::debug!(peer = %fiber.peer_addr(), "fiber accepted");
          this
            .core
            .spawn(Self::echo_fiber(Arc::downgrade(&this), fiber));
        }
        // The acceptor was released by a stop
        Err(FiberError::Cancelled) => return,
        Err(error) => {
          this.fail(error.into());
          return;
        }
      }
    }
  }

  async fn echo_fiber(service: Weak<Self>, mut fiber: Fiber) {
    let peer = fiber.peer_addr();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
      let Some(this) = service.upgrade() else {
        break;
      };
      let read = this.guard(fiber.read(&mut buffer));
      drop(this);
      let read = match read.await {
        Some(Ok(0)) => {
          tracing::trace!(%peer, "peer finished sending");
          if let Some(this) = service.upgrade() {
            let closed = this.guard(fiber.close());
            drop(this);
            if let Some(Err(error)) = closed.await {
              tracing::debug!(%peer, %error, "fiber close failed");
            }
          }
          break;
        }
        Some(Ok(read)) => read,
        Some(Err(error)) => {
          tracing::debug!(%peer, %error, "fiber read failed");
          break;
        }
        None => break,
      };

      let Some(this) = service.upgrade() else {
        break;
      };
      let written = this.guard(fiber.write_all(&buffer[..read]));
      drop(this);
      match written.await {
        Some(Ok(())) => (),
        Some(Err(error)) => {
          tracing::debug!(%peer, %error, "fiber write failed");
          break;
        }
        None => break,
      }
    }
    tracing::trace!(%peer, "fiber finished");
  }

  async fn datagram_loop(service: Weak<Self>, socket: EndpointSlot<DatagramFiber>) {
    loop {
      let received = poll_fn(|cx| match lock(&socket).as_mut() {
        Some(socket) => socket.poll_recv_from(cx),
        None => Poll::Ready(Err(FiberError::Cancelled)),
      })
      .await;
      let Some(this) = service.upgrade() else {
        return;
      };
      if this.core.is_stopped() {
        return;
      }
      let datagram = match received {
        Ok(datagram) => datagram,
        Err(FiberError::Cancelled) => return,
        Err(error) => {
          this.fail(error.into());
          return;
        }
      };
      let sent = match lock(&socket).as_ref() {
        Some(socket) => socket.try_send_to(datagram.from, &datagram.payload),
        None => return,
      };
      if let Err(error) = sent {
        this.fail(error.into());
        return;
      }
    }
  }
}

impl Service for EchoService {
  fn start(self: Arc<Self>) -> Result<(), ServiceError> {
    self.core.start_with(|local_id| {
      let multiplexer = self.core.multiplexer();
      let acceptor = multiplexer.bind_acceptor(local_id)?;
      // An error here drops `acceptor`, releasing its binding with it
      let datagrams = if self.echo_datagrams {
        Some(multiplexer.bind_datagram(local_id)?)
      } else {
        None
      };
      *lock(&self.acceptor) = Some(acceptor);
      *lock(&self.datagrams) = datagrams;
      Ok(())
    })?;

    let service = Arc::downgrade(&self);
    self
      .core
      .spawn(Self::accept_loop(service.clone(), Arc::clone(&self.acceptor)));
    if self.echo_datagrams {
      self
        .core
        .spawn(Self::datagram_loop(service, Arc::clone(&self.datagrams)));
    }
    Ok(())
  }

  fn stop(&self) -> Result<(), ServiceError> {
    self.core.stop_with(|| {
      drop(lock(&self.acceptor).take());
      drop(lock(&self.datagrams).take());
      Ok(())
    })
  }

  fn service_type_id(&self) -> ServiceTypeId {
    Self::TYPE_ID
  }

  fn core(&self) -> &ServiceCore {
    &self.core
  }
}
