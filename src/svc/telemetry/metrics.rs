//! # Metrics module
//!
//! This module encodes the metrics registered by the application using the
//! prometheus text format

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Request, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode metrics, {0}")]
    Encode(prometheus::Error),
    #[error("failed to parse content type given by prometheus, {0}")]
    InvalidHeader(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper methods

#[cfg_attr(feature = "trace", tracing::instrument)]
/// returns the encoded metrics gathered from the default registry
pub async fn handler(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder
        .encode(&gather(), &mut buf)
        .map_err(Error::Encode)?;

    let mut res = Response::default();
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::InvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}
