//! # Postgres module
//!
//! This module checks that a freshly provisioned database accepts
//! connections with the administrator credentials.

use std::time::Duration;

use sqlx::{
    postgres::{PgConnectOptions, PgSslMode},
    ConnectOptions, Connection,
};
use tracing::{debug, info};

use crate::svc::provisioner::Endpoint;

// -----------------------------------------------------------------------------
// Constants

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to database '{1}' at '{0}', {2}")]
    Connect(Endpoint, String, sqlx::Error),
    #[error("failed to close connection to '{0}', {1}")]
    Close(Endpoint, sqlx::Error),
    #[error("timed out after {1:?} while connecting to '{0}'")]
    Timeout(Endpoint, Duration),
}

// -----------------------------------------------------------------------------
// Helpers

#[cfg_attr(feature = "trace", tracing::instrument(skip(password)))]
/// opens then closes a connection to the given endpoint
pub async fn check(
    endpoint: &Endpoint,
    database: &str,
    user: &str,
    password: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let options = PgConnectOptions::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .username(user)
        .password(password)
        .database(database)
        .ssl_mode(PgSslMode::Prefer);

    debug!(endpoint = endpoint.to_string(), database = database, "Connect to database");
    let conn = tokio::time::timeout(timeout, options.connect())
        .await
        .map_err(|_| Error::Timeout(endpoint.to_owned(), timeout))?
        .map_err(|err| Error::Connect(endpoint.to_owned(), database.to_owned(), err))?;

    conn.close()
        .await
        .map_err(|err| Error::Close(endpoint.to_owned(), err))?;

    info!(endpoint = endpoint.to_string(), database = database, "Database accepts connections");
    Ok(())
}
