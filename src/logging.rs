//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the maximum level of logs emitted for the given number of `-v`
pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// installs the global subscriber, logs are written on the standard error
/// output to keep the standard output for patched documents
pub fn initialize(verbosity: usize) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level(verbosity))
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_target(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}
