// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Service multiplexing over fibers: many independent services sharing one
//! transport, each addressed by a numeric [`LocalId`](common::fiber::LocalId).

pub mod common;
pub mod ext;
pub mod services;
pub mod util;

pub mod prelude {
  pub use crate::common::fiber::{
    DatagramFiber, Fiber, FiberAcceptor, FiberAddress, FiberError, FiberKind, LocalId,
    Multiplexer,
  };
  pub use crate::common::service::{
    Service, ServiceContext, ServiceCore, ServiceError, ServiceHost, ServiceParameters,
    ServiceRegistry, ServiceState, ServiceTypeId,
  };
}
