// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::BTreeMap,
  sync::{Arc, PoisonError, RwLock},
};

use super::{Service, ServiceContext, ServiceError, ServiceParameters};

/// Constructs a service of one type from its context and parameters
pub type ServiceFactory = Arc<
  dyn Fn(ServiceContext, &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError>
    + Send
    + Sync,
>;

/// Maps a service type's name to the factory that builds it
#[derive(Default)]
pub struct ServiceRegistry {
  factories: RwLock<BTreeMap<String, ServiceFactory>>,
}

impl std::fmt::Debug for ServiceRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceRegistry")
      .field("service_types", &self.service_types())
      .finish()
  }
}

impl ServiceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry preloaded with the services this crate ships
  pub fn with_builtin() -> Self {
    let registry = Self::new();
    registry.register(
      crate::services::echo::EchoService::TYPE_ID.name(),
      |context, params| {
        crate::services::echo::EchoService::new(context, params)
          .map(|service| service as Arc<dyn Service>)
      },
    );
    registry
  }

  /// Registers `factory` under `name`, returning the factory it replaced, if any
  pub fn register<N, F>(&self, name: N, factory: F) -> Option<ServiceFactory>
  where
    N: Into<String>,
    F: Fn(ServiceContext, &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError>
      + Send
      + Sync
      + 'static,
  {
    let name = name.into();
    tracing::trace!(service_type = %name, "registering service factory");
    self
      .factories
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(name, Arc::new(factory))
  }

  pub fn create(
    &self,
    name: &str,
    context: ServiceContext,
    params: &ServiceParameters,
  ) -> Result<Arc<dyn Service>, ServiceError> {
    // Clone the factory out so construction runs without holding the lock
    let factory = self
      .factories
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
      .ok_or_else(|| ServiceError::UnknownServiceType(name.to_string()))?;
    factory(context, params)
  }

  pub fn service_types(&self) -> Vec<String> {
    self
      .factories
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::ServiceRegistry;
  use crate::{
    common::{
      fiber::MockMultiplexer,
      service::{ServiceContext, ServiceError, ServiceParameters},
    },
    services::echo::EchoService,
  };
  use std::sync::Arc;

  fn context() -> ServiceContext {
    ServiceContext::new(
      tokio::runtime::Handle::current(),
      Arc::new(MockMultiplexer::new()),
    )
  }

  #[tokio::test]
  async fn builtin_registry_creates_echo() {
    let registry = ServiceRegistry::with_builtin();
    assert_eq!(registry.service_types(), vec!["echo".to_string()]);
    let service = registry
      .create("echo", context(), &ServiceParameters::new())
      .unwrap();
    assert_eq!(service.service_type_id(), EchoService::TYPE_ID);
    assert!(service.downcast_arc::<EchoService>().is_ok());
  }

  #[tokio::test]
  async fn unknown_types_and_bad_parameters_are_reported() {
    let registry = ServiceRegistry::with_builtin();
    assert_eq!(
      registry
        .create("socks5", context(), &ServiceParameters::new())
        .map(|_| ()),
      Err(ServiceError::UnknownServiceType("socks5".into()))
    );
    let params = ServiceParameters::new().with("datagram", "sometimes");
    assert!(matches!(
      registry.create("echo", context(), &params).map(|_| ()),
      Err(ServiceError::InvalidConfiguration(_))
    ));
  }
}
