// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use fibermux::common::{
  fiber::{
    duplex::{self, EntangledMultiplexers},
    DatagramFiber, Fiber, FiberAddress, LocalId, Multiplexer,
  },
  service::{Service, ServiceContext, ServiceHost, ServiceParameters, ServiceRegistry},
};
use futures::{future::BoxFuture, FutureExt};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Local id the loopback client binds for its own datagram socket
const CLIENT_DATAGRAM_ID: LocalId = LocalId::new(u32::MAX);

/// How long to wait for a datagram reply; datagrams are lossy
const DATAGRAM_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct LoopbackArgs {
  pub service: String,
  pub local_id: Option<LocalId>,
  pub params: ServiceParameters,
  pub message: Option<String>,
  pub datagram: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum LoopbackError {
  #[error("Service `{service}` stopped during the session: {reason}")]
  ServiceStopped { service: String, reason: String },
  #[error("No datagram reply arrived within {0:?}")]
  NoReply(Duration),
}

pub async fn loopback_main(config: LoopbackArgs) -> Result<()> {
  let EntangledMultiplexers {
    listener,
    connector,
  } = duplex::channel();
  let context = ServiceContext::new(
    tokio::runtime::Handle::current(),
    Arc::new(listener) as Arc<dyn Multiplexer>,
  );
  let host = ServiceHost::new(context, Arc::new(ServiceRegistry::with_builtin()));

  let service: Arc<dyn Service> = host
    .spawn_service(&config.service, &config.params, config.local_id)
    .with_context(|| format!("Failed to start service `{}`", config.service))?;
  let local_id = service
    .local_id()
    .context("Started service must have a local id")?;
  tracing::info!(type_id = %service.service_type_id(), %local_id, "service running");

  let session: BoxFuture<'_, Result<()>> = match (&config.message, config.datagram) {
    (Some(message), true) => send_datagram(&connector, local_id, message).boxed(),
    (Some(message), false) => {
      let fiber = open_fiber(&connector, local_id).await?;
      send_message(fiber, message).boxed()
    }
    (None, _) => {
      let fiber = open_fiber(&connector, local_id).await?;
      relay_stdio(fiber).boxed()
    }
  };
  let session = session.instrument(tracing::debug_span!("loopback_session", %local_id));

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let stopped = service.on_stopped();
  let outcome = tokio::select! {
    res = session => res,
    failure = stopped => Err(LoopbackError::ServiceStopped {
      service: config.service.clone(),
      reason: failure.map_or_else(|| "stopped".to_string(), |e| e.to_string()),
    }.into()),
    _ = shutdown.cancelled() => {
      tracing::info!("Interrupted; stopping services");
      Ok(())
    }
  };

  host.shutdown().await;
  sigint_handler_task.abort();
  outcome
}

async fn open_fiber<M: Multiplexer>(connector: &M, local_id: LocalId) -> Result<Fiber> {
  connector
    .connect(FiberAddress::service(local_id))
    .await
    .with_context(|| format!("Failed to open a fiber to local id {}", local_id))
}

async fn send_message(mut fiber: Fiber, message: &str) -> Result<()> {
  fiber.write_all(message.as_bytes()).await?;
  fiber.close().await?;
  let mut reply = Vec::new();
  fiber.read_to_end(&mut reply).await?;
  println!("{}", String::from_utf8_lossy(&reply));
  Ok(())
}

async fn send_datagram<M: Multiplexer>(connector: &M, local_id: LocalId, message: &str) -> Result<()> {
  let mut socket: DatagramFiber = connector
    .bind_datagram(CLIENT_DATAGRAM_ID)
    .context("Failed to bind the client datagram socket")?;
  socket
    .send_to(FiberAddress::service(local_id), message.as_bytes())
    .await?;
  let reply = tokio::time::timeout(DATAGRAM_REPLY_TIMEOUT, socket.recv_from())
    .await
    .map_err(|_elapsed| LoopbackError::NoReply(DATAGRAM_REPLY_TIMEOUT))??;
  tracing::debug!(from = %reply.from, len = reply.payload.len(), "datagram reply");
  println!("{}", String::from_utf8_lossy(&reply.payload));
  Ok(())
}

async fn relay_stdio(fiber: Fiber) -> Result<()> {
  let (mut reader, mut writer) = tokio::io::split(fiber);
  let upload = async {
    tokio::io::copy(&mut tokio::io::stdin(), &mut writer).await?;
    writer.shutdown().await
  };
  let download = async {
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut reader, &mut stdout).await?;
    stdout.flush().await
  };
  futures::try_join!(upload, download)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::{loopback_main, LoopbackArgs};
  use fibermux::common::service::ServiceParameters;
  use std::time::Duration;

  fn args(message: &str) -> LoopbackArgs {
    LoopbackArgs {
      service: "echo".into(),
      local_id: None,
      params: ServiceParameters::new(),
      message: Some(message.into()),
      datagram: false,
    }
  }

  #[tokio::test]
  async fn stream_and_datagram_sessions_complete() {
    let fut = async {
      loopback_main(args("over a stream")).await.unwrap();
      loopback_main(LoopbackArgs {
        params: ServiceParameters::new().with("datagram", "true"),
        datagram: true,
        ..args("as a datagram")
      })
      .await
      .unwrap();
    };
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("Loopback sessions must finish on their own");
  }

  #[tokio::test]
  async fn unknown_services_fail_to_start() {
    let err = loopback_main(LoopbackArgs {
      service: "nonesuch".into(),
      ..args("hello")
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("nonesuch"));
  }
}
