//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::svc::{
    cfg::Configuration,
    flow::Flow,
    poll::Poller,
    rds::{self, client::Client},
    telemetry::server,
};

pub mod create;
pub mod delete;

// -----------------------------------------------------------------------------
// Context structure

/// contains what every command needs to interact with aws and kubernetes
#[derive(Clone, Debug)]
pub struct Context {
    pub config: Arc<Configuration>,
    pub kubeconfig: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl Context {
    /// returns a flow bound to the rds api, the flow stops polling once the
    /// context is cancelled
    pub async fn flow(&self) -> Flow<Client> {
        let api = rds::client::new(&self.config.aws).await;
        let poller = Poller::new(&self.config.polling, self.cancel.to_owned());

        Flow::new(Arc::new(api), poller, &self.config)
    }
}

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, ctx: &Context) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("{0}")]
    Create(create::Error),
    #[error("{0}")]
    Delete(delete::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to serve telemetry, {0}")]
    Telemetry(server::Error),
    #[error("no command given, see '--help' for available ones")]
    MissingCommand,
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Provision a database and patch workloads to use it
    #[clap(name = "create", aliases = &["c"])]
    Create(create::Create),
    /// Delete the database named by a resource record
    #[clap(name = "delete", aliases = &["d"])]
    Delete(delete::Delete),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, ctx: &Context) -> Result<(), Self::Error> {
        match self {
            Self::Create(cmd) => cmd
                .execute(ctx)
                .await
                .map_err(Error::Create)
                .map_err(|err| Error::Execution("create".into(), Arc::new(err))),
            Self::Delete(cmd) => cmd
                .execute(ctx)
                .await
                .map_err(Error::Delete)
                .map_err(|err| Error::Execution("delete".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    /// Serve health checks and metrics on the given address while running
    #[clap(long = "listen", global = true)]
    pub listen: Option<SocketAddr>,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// run function

/// executes the command given by arguments. A termination signal cancels the
/// context which interrupts pending waits.
pub async fn run(args: &Args, config: Arc<Configuration>) -> Result<(), Error> {
    let command = args.command.as_ref().ok_or(Error::MissingCommand)?;
    let ctx = Context {
        config,
        kubeconfig: args.kubeconfig.to_owned(),
        cancel: CancellationToken::new(),
    };

    // -------------------------------------------------------------------------
    // Cancel the context on termination signal

    let cancel = ctx.cancel.to_owned();
    let signal = tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                warn!("Received termination signal, cancel pending operations");
                cancel.cancel();
                result
            }
            _ = cancel.cancelled() => Ok(()),
        }
    });

    // -------------------------------------------------------------------------
    // Serve telemetry if asked

    let telemetry = args.listen.map(|addr| {
        let cancel = ctx.cancel.to_owned();
        tokio::spawn(async move { server::serve(addr, cancel).await })
    });

    // -------------------------------------------------------------------------
    // Execute command then stop background tasks

    let result = command.execute(&ctx).await;
    ctx.cancel.cancel();

    let signal = match signal.await {
        Ok(result) => result.map_err(Error::SigTerm),
        Err(err) => {
            error!(error = err.to_string(), "Could not wait for the signal handler to complete");
            Ok(())
        }
    };

    let telemetry = match telemetry {
        None => Ok(()),
        Some(handle) => match handle.await {
            Ok(result) => {
                info!("Telemetry server halted");
                result.map_err(Error::Telemetry)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "Could not wait for the telemetry server to complete"
                );
                Ok(())
            }
        },
    };

    result?;
    signal?;
    telemetry
}
