//! # Server module
//!
//! This module serves the telemetry router using [`hyper`]

use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    service::{make_service_fn, service_fn},
    Server,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::svc::telemetry::router;

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind on socket '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve on socket '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// Helpers

#[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
/// serves the telemetry router until the token is cancelled
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<(), Error> {
    let builder = Server::try_bind(&addr).map_err(|err| Error::Bind(addr, err))?;
    let service = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(router)) });

    info!(addr = addr.to_string(), "Begin to listen on address");
    builder
        .serve(service)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| Error::Serve(addr, err))?;

    info!(addr = addr.to_string(), "Stop to listen on address");
    Ok(())
}
