// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Services shipped with the framework; see [`ServiceRegistry::with_builtin`](crate::common::service::ServiceRegistry::with_builtin)

pub mod echo;
