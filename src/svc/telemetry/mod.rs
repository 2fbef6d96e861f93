//! # Telemetry module
//!
//! This module expose telemetry measurements through a small http router
//! answering health checks and, with the `metrics` feature, prometheus
//! scrapes

use std::{collections::BTreeMap, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::info;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "aurora_provisioner_server_request",
            "number of request handled by the telemetry server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'aurora_provisioner_server_request' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "aurora_provisioner_server_request_duration",
            "duration of request handled by the telemetry server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'aurora_provisioner_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(&req).await,
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler(&req).await.map_err(Error::Metrics),
        _ => not_found(&req).await,
    };

    // -------------------------------------------------------------------------
    // Answer errors as json payload

    let res = match result {
        Ok(res) => res,
        Err(err) => {
            let map = BTreeMap::from([("error".to_string(), err.to_string())]);
            let mut res = Response::default();

            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );

            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() =
                Body::from(serde_json::to_string_pretty(&map).map_err(Error::Serialize)?);
            res
        }
    };

    let duration = Instant::now().duration_since(begin).as_micros();
    info!(
        method = req.method().as_str(),
        path = req.uri().path(),
        status = res.status().as_u16(),
        duration = duration as u64,
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    {
        let status = res.status().as_u16().to_string();

        SERVER_REQUEST
            .with_label_values(&[req.method().as_str(), req.uri().path(), &status])
            .inc();

        SERVER_REQUEST_DURATION
            .with_label_values(&[req.method().as_str(), req.uri().path(), &status, "us"])
            .inc_by(duration as f64);
    }

    Ok(res)
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn healthz(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;

    Ok(res)
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn not_found(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;

    Ok(res)
}
