// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

use super::{Service, ServiceContext, ServiceError, ServiceParameters, ServiceRegistry};
use crate::{
  common::fiber::{LocalId, LocalIdGenerator, MonotonicAtomicGenerator},
  ext::future::FutureExtExt,
  util::dropkick::Dropkick,
};

/// Upper bound on automatic id assignments tried before giving up on a spawn
const MAX_ID_ATTEMPTS: usize = 64;

type LiveServices = DashMap<LocalId, Arc<dyn Service>>;

/// Owns the canonical reference to every live service on one multiplexer
///
/// Services that stop themselves (their transport closed, for instance) are
/// removed from the host once their stop completes. Dropping the host stops
/// every service still live on it.
pub struct ServiceHost {
  context: ServiceContext,
  registry: Arc<ServiceRegistry>,
  live: Arc<LiveServices>,
  ids: Box<dyn LocalIdGenerator + Send + Sync>,
  watchers: TaskTracker,
  shutdown: CancellationToken,
  _cancel_on_drop: Dropkick<CancellationToken>,
}

impl std::fmt::Debug for ServiceHost {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceHost")
      .field("context", &self.context)
      .field("live", &self.live_ids())
      .finish_non_exhaustive()
  }
}

impl ServiceHost {
  /// Creates a host which assigns ids upward from 1 when none is requested
  pub fn new(context: ServiceContext, registry: Arc<ServiceRegistry>) -> Self {
    Self::with_id_generator(context, registry, MonotonicAtomicGenerator::new(1))
  }

  pub fn with_id_generator<G>(context: ServiceContext, registry: Arc<ServiceRegistry>, ids: G) -> Self
  where
    G: LocalIdGenerator + Send + Sync + 'static,
  {
    let shutdown = CancellationToken::new();
    Self {
      context,
      registry,
      live: Arc::new(DashMap::new()),
      ids: Box::new(ids),
      watchers: TaskTracker::new(),
      _cancel_on_drop: Dropkick::new(shutdown.clone()),
      shutdown,
    }
  }

  pub fn registry(&self) -> &Arc<ServiceRegistry> {
    &self.registry
  }

  /// Constructs a service of `type_name` and starts it
  ///
  /// With an explicit `local_id`, a collision fails with [`ServiceError::AlreadyBound`].
  /// Without one, ids are drawn from the host's generator until one binds.
  pub fn spawn_service(
    &self,
    type_name: &str,
    params: &ServiceParameters,
    local_id: Option<LocalId>,
  ) -> Result<Arc<dyn Service>, ServiceError> {
    let service = self
      .registry
      .create(type_name, self.context.clone(), params)?;
    let local_id = match local_id {
      Some(local_id) => {
        self.start_at(&service, local_id)?;
        local_id
      }
      None => self.start_anywhere(&service)?,
    };
    self.watch(&service, local_id);
    Ok(service)
  }

  fn start_anywhere(&self, service: &Arc<dyn Service>) -> Result<LocalId, ServiceError> {
    let mut last_error = ServiceError::LocalIdUnset;
    for _ in 0..MAX_ID_ATTEMPTS {
      let local_id = self.ids.next();
      match self.start_at(service, local_id) {
        Ok(()) => return Ok(local_id),
        Err(error @ ServiceError::AlreadyBound(_)) => {
          tracing::trace!(%local_id, "local id in use; trying the next");
          last_error = error;
        }
        Err(error) => return Err(error),
      }
    }
    tracing::warn!(
      type_id = %service.service_type_id(),
      attempts = MAX_ID_ATTEMPTS,
      "no free local id found"
    );
    Err(last_error)
  }

  fn start_at(&self, service: &Arc<dyn Service>, local_id: LocalId) -> Result<(), ServiceError> {
    match self.live.entry(local_id) {
      Entry::Occupied(_) => Err(ServiceError::AlreadyBound(local_id)),
      Entry::Vacant(vacant) => {
        service.set_local_id(local_id)?;
        Arc::clone(service).start()?;
        vacant.insert(Arc::clone(service));
        Ok(())
      }
    }
  }

  /// Removes the service from the live table once it stops, however it stopped
  fn watch(&self, service: &Arc<dyn Service>, local_id: LocalId) {
    let type_id = service.service_type_id();
    let stopped = service.on_stopped();
    let live = Arc::downgrade(&self.live);
    let watcher = async move {
      let failure = stopped.await;
      if let Some(live) = live.upgrade() {
        // Only a stopped occupant is ours; a live one was started after our removal
        live.remove_if(&local_id, |_, occupant| occupant.state().is_stopped());
      }
      match failure {
        Some(error) => tracing::warn!(%type_id, %local_id, %error, "service stopped after failure"),
        None => tracing::debug!(%type_id, %local_id, "service left the host"),
      }
    };
    self.watchers.spawn_on(
      watcher
        .guarded(&self.shutdown, ())
        .instrument(tracing::trace_span!("service_watcher", %type_id, %local_id)),
      self.context.reactor(),
    );
  }

  pub fn get(&self, local_id: LocalId) -> Option<Arc<dyn Service>> {
    self.live.get(&local_id).map(|entry| Arc::clone(entry.value()))
  }

  pub fn live_ids(&self) -> Vec<LocalId> {
    let mut ids: Vec<_> = self.live.iter().map(|entry| *entry.key()).collect();
    ids.sort();
    ids
  }

  /// Stops and forgets the service at `local_id`; returns `false` if none was live
  pub fn stop_service(&self, local_id: LocalId) -> Result<bool, ServiceError> {
    match self.live.remove(&local_id) {
      Some((_, service)) => service.stop().map(|()| true),
      None => Ok(false),
    }
  }

  /// Removes and stops every live service, returning their drain futures
  fn stop_all(&self) -> Vec<BoxFuture<'static, ()>> {
    let ids = self.live_ids();
    let mut drained = Vec::with_capacity(ids.len());
    for local_id in ids {
      if let Some((_, service)) = self.live.remove(&local_id) {
        drained.push(service.drained());
        if let Err(error) = service.stop() {
          tracing::warn!(
            type_id = %service.service_type_id(),
            %local_id,
            %error,
            "service reported an error while stopping"
          );
        }
      }
    }
    drained
  }

  /// Stops every live service and waits for their outstanding work to finish
  pub async fn shutdown(&self) {
    futures::future::join_all(self.stop_all()).await;
    self.shutdown.cancel();
    self.watchers.close();
    self.watchers.wait().await;
    tracing::debug!("service host shut down");
  }
}

impl Drop for ServiceHost {
  fn drop(&mut self) {
    let stopped = self.stop_all().len();
    if stopped > 0 {
      tracing::debug!(stopped, "service host dropped with live services");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::ServiceHost;
  use crate::common::{
    fiber::{
      duplex::{self, DuplexMultiplexer},
      FiberAddress, LocalId, Multiplexer,
    },
    service::{ServiceContext, ServiceError, ServiceParameters, ServiceRegistry, ServiceState},
  };
  use std::{sync::Arc, time::Duration};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn host() -> (ServiceHost, Arc<DuplexMultiplexer>, DuplexMultiplexer) {
    let duplex::EntangledMultiplexers {
      listener,
      connector,
    } = duplex::channel();
    let listener = Arc::new(listener);
    let context = ServiceContext::new(
      tokio::runtime::Handle::current(),
      Arc::clone(&listener) as Arc<dyn Multiplexer>,
    );
    let host = ServiceHost::new(context, Arc::new(ServiceRegistry::with_builtin()));
    (host, listener, connector)
  }

  #[tokio::test]
  async fn assigns_ids_and_skips_occupied_ones() {
    let (host, listener, _connector) = host();
    let params = ServiceParameters::new();
    let first = host.spawn_service("echo", &params, None).unwrap();
    assert_eq!(first.local_id(), Some(LocalId::new(1)));

    // Id 2 is taken directly on the multiplexer, outside the host's knowledge
    let _squatter = listener.bind_acceptor(LocalId::new(2)).unwrap();
    let second = host.spawn_service("echo", &params, None).unwrap();
    assert_eq!(second.local_id(), Some(LocalId::new(3)));
    assert_eq!(host.live_ids(), vec![LocalId::new(1), LocalId::new(3)]);
  }

  #[tokio::test]
  async fn explicit_collisions_are_rejected() {
    let (host, listener, _connector) = host();
    let params = ServiceParameters::new();
    let id = LocalId::new(10);
    let first = host.spawn_service("echo", &params, Some(id)).unwrap();
    assert_eq!(
      host.spawn_service("echo", &params, Some(id)).map(|_| ()),
      Err(ServiceError::AlreadyBound(id))
    );
    assert_eq!(listener.bound_count(), 1);
    assert_eq!(
      Arc::as_ptr(&host.get(id).unwrap()) as *const (),
      Arc::as_ptr(&first) as *const ()
    );
    assert_eq!(
      host.spawn_service("nonesuch", &params, None).map(|_| ()),
      Err(ServiceError::UnknownServiceType("nonesuch".into()))
    );
  }

  #[tokio::test]
  async fn stop_service_releases_the_id() {
    let (host, listener, _connector) = host();
    let params = ServiceParameters::new();
    let id = LocalId::new(5);
    let service = host.spawn_service("echo", &params, Some(id)).unwrap();
    assert!(host.stop_service(id).unwrap());
    assert!(!host.stop_service(id).unwrap());
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(listener.bound_count(), 0);
    host.spawn_service("echo", &params, Some(id)).unwrap();
  }

  #[tokio::test]
  async fn self_stopped_services_are_reaped() {
    let (host, listener, _connector) = host();
    let service = host
      .spawn_service("echo", &ServiceParameters::new(), None)
      .unwrap();
    let id = service.local_id().unwrap();
    listener.close();
    let fut = async {
      let failure = service.on_stopped().await;
      assert_eq!(failure.as_deref(), Some(&ServiceError::TransportClosed));
      while host.get(id).is_some() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("A service whose transport closed must stop and leave the host");
  }

  #[tokio::test]
  async fn shutdown_stops_everything() {
    let (host, listener, connector) = host();
    let params = ServiceParameters::new().with("datagram", "true");
    let a = host.spawn_service("echo", &params, None).unwrap();
    let b = host.spawn_service("echo", &params, None).unwrap();
    let fiber = connector
      .connect(FiberAddress::service(a.local_id().unwrap()))
      .await
      .unwrap();
    tokio::time::timeout(Duration::from_secs(5), host.shutdown())
      .await
      .expect("Shutdown must not wait on idle fibers");
    assert!(host.live_ids().is_empty());
    assert_eq!(a.state(), ServiceState::Stopped);
    assert_eq!(b.state(), ServiceState::Stopped);
    assert_eq!(listener.bound_count(), 0);
    drop(fiber);
  }

  #[tokio::test]
  async fn dropping_the_host_stops_services_with_open_fibers() {
    let (host, listener, connector) = host();
    let service = host
      .spawn_service("echo", &ServiceParameters::new(), None)
      .unwrap();
    let mut client = connector
      .connect(FiberAddress::service(service.local_id().unwrap()))
      .await
      .unwrap();
    // One round trip guarantees the fiber was accepted and a read is parked on it
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
      .await
      .expect("Echo round trip may be deadlocked")
      .unwrap();

    let drained = service.drained();
    drop(host);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(listener.bound_count(), 0);
    tokio::time::timeout(Duration::from_secs(5), drained)
      .await
      .expect("Services stopped by a host drop must drain");
    assert_eq!(Arc::strong_count(&service), 1);
    drop(client);
  }
}
