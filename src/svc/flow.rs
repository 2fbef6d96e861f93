//! # Flow module
//!
//! This module composes the provisioner, the patcher and the deprovisioner
//! into the two operations exposed to users: creating a database for a set
//! of pod specifications and deleting what a record names.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PodSpec;
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{error, info, warn};

use crate::svc::{
    cfg::{self, Configuration},
    deprovisioner::{DeprovisionError, Deprovisioner},
    patcher::{self, SpecPatcher},
    poll::Poller,
    postgres,
    provisioner::{Endpoint, ProvisionError, ProvisionRequest, Provisioner},
    rds::RdsApi,
    record::ResourceRecord,
};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static FLOW: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("aurora_provisioner_flow", "number of flows by operation and outcome"),
        &["operation", "outcome"]
    )
    .expect("metrics 'aurora_provisioner_flow' to not be already registered")
});

#[cfg(feature = "metrics")]
fn observe<T, E>(operation: &str, result: &Result<T, E>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };

    FLOW.with_label_values(&[operation, outcome]).inc();
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to patch pod specifications, {0}")]
    Patch(patcher::Error),
    #[error("failed to provision '{record}', {source}")]
    Provision {
        record: ResourceRecord,
        source: ProvisionError,
    },
    #[error("{source}, then failed to roll back, {rollback}")]
    Rollback {
        source: Box<Error>,
        rollback: DeprovisionError,
    },
    #[error("database of '{record}' does not accept connections, {source}")]
    Connectivity {
        record: ResourceRecord,
        source: postgres::Error,
    },
    #[error("failed to deprovision, {0}")]
    Deprovision(DeprovisionError),
}

impl From<patcher::Error> for Error {
    fn from(err: patcher::Error) -> Self {
        Self::Patch(err)
    }
}

impl From<DeprovisionError> for Error {
    fn from(err: DeprovisionError) -> Self {
        Self::Deprovision(err)
    }
}

impl Error {
    /// returns the record of resources which may exist in the cloud provider
    /// after this error
    pub fn record(&self) -> Option<&ResourceRecord> {
        match self {
            Self::Provision { record, .. } | Self::Connectivity { record, .. } => Some(record),
            Self::Rollback { source, .. } => source.record(),
            Self::Patch(_) | Self::Deprovision(_) => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Created structure

#[derive(Clone, Debug)]
pub struct Created {
    pub pod_specs: Vec<PodSpec>,
    pub record: ResourceRecord,
    pub endpoint: Endpoint,
}

// -----------------------------------------------------------------------------
// Flow structure

pub struct Flow<A> {
    provisioner: Provisioner<A>,
    deprovisioner: Deprovisioner<A>,
    patcher: SpecPatcher,
    database: cfg::Database,
    options: cfg::Flow,
}

impl<A> Flow<A>
where
    A: RdsApi,
{
    pub fn new(api: Arc<A>, poller: Poller, config: &Configuration) -> Self {
        Self {
            provisioner: Provisioner::new(api.clone(), poller.to_owned()),
            deprovisioner: Deprovisioner::new(api, poller),
            patcher: SpecPatcher::from(config.flow.container_policy),
            database: config.database.to_owned(),
            options: config.flow.to_owned(),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, specs)))]
    /// provisions a database named after the pod specifications and returns
    /// them patched to use it
    pub async fn create(
        &self,
        specs: &[PodSpec],
        record: ResourceRecord,
    ) -> Result<Created, Error> {
        let result = self.create_inner(specs, record).await;

        #[cfg(feature = "metrics")]
        observe("create", &result);
        result
    }

    async fn create_inner(
        &self,
        specs: &[PodSpec],
        record: ResourceRecord,
    ) -> Result<Created, Error> {
        // ---------------------------------------------------------------------
        // Step 1: resolve the database name, nothing is created for unusable
        // pod specifications

        let database_name = patcher::database_name(specs)?;
        let req = ProvisionRequest::new(&record, &database_name, &self.database);

        // ---------------------------------------------------------------------
        // Step 2: provision the cluster and its instance

        let endpoint = match self.provisioner.create(&req).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                return Err(self
                    .rollback(Error::Provision {
                        record,
                        source: err,
                    })
                    .await);
            }
        };

        // ---------------------------------------------------------------------
        // Step 3: check connectivity

        if self.options.check_connectivity {
            if let Err(err) = postgres::check(
                &endpoint,
                &database_name,
                &self.database.user,
                &self.database.password,
                postgres::CONNECT_TIMEOUT,
            )
            .await
            {
                return Err(self
                    .rollback(Error::Connectivity {
                        record,
                        source: err,
                    })
                    .await);
            }
        }

        // ---------------------------------------------------------------------
        // Step 4: patch pod specifications

        let pod_specs =
            self.patcher
                .patch(specs, &endpoint, &self.database.user, &self.database.password)?;

        info!(
            record = record.to_string(),
            endpoint = endpoint.to_string(),
            pod_specs = pod_specs.len(),
            "Pod specifications are patched with database connection details"
        );
        Ok(Created {
            pod_specs,
            record,
            endpoint,
        })
    }

    /// deletes resources named by the error when enabled. A cancelled flow
    /// is never rolled back as the deprovisioner shares its token.
    async fn rollback(&self, err: Error) -> Error {
        let cancelled = matches!(
            err,
            Error::Provision {
                source: ProvisionError::Cancelled { .. },
                ..
            }
        );

        if !self.options.rollback_on_failure || cancelled {
            return err;
        }

        let record = match err.record() {
            Some(record) => record.to_owned(),
            None => return err,
        };

        warn!(
            record = record.to_string(),
            error = err.to_string(),
            "Flow failed after cluster creation, deleting created resources"
        );

        match self.deprovisioner.destroy(&record).await {
            Ok(()) => err,
            Err(rollback) => {
                error!(
                    record = record.to_string(),
                    error = rollback.to_string(),
                    "Failed to delete created resources"
                );

                Error::Rollback {
                    source: Box::new(err),
                    rollback,
                }
            }
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    /// deletes the instance and the cluster named by the record
    pub async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        let result = self.deprovisioner.destroy(record).await.map_err(Error::from);

        #[cfg(feature = "metrics")]
        observe("delete", &result);
        result
    }
}
