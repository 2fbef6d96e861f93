//! # Deprovisioner module
//!
//! This module deletes the instance then the cluster named by a
//! [`ResourceRecord`]. Resources which do not exist anymore are considered
//! deleted, so the whole operation could be replayed safely.

use std::sync::Arc;

use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::svc::provisioner::STATUS_CHECK;
use crate::svc::{
    poll::{self, DescribeError, Observation, Poller},
    rds::{self, Deletion, Kind, RdsApi, Status},
    record::ResourceRecord,
};

// -----------------------------------------------------------------------------
// DeprovisionError enum

#[derive(thiserror::Error, Debug)]
pub enum DeprovisionError {
    #[error("{kind} '{id}' is in unexpected status '{status}' while being deleted")]
    UnexpectedStatus {
        kind: Kind,
        id: String,
        status: Status,
    },
    #[error("failed to request deletion, {0}")]
    Delete(rds::Error),
    #[error("{0}")]
    Describe(DescribeError),
    #[error("{0}")]
    Timeout(poll::Error),
    #[error("{kind} '{id}' deprovisioning has been cancelled")]
    Cancelled { kind: Kind, id: String },
}

impl From<poll::Error> for DeprovisionError {
    fn from(err: poll::Error) -> Self {
        match err {
            poll::Error::Describe(err) => Self::Describe(err),
            poll::Error::Rejected { kind, id, status } => {
                Self::UnexpectedStatus { kind, id, status }
            }
            poll::Error::Cancelled { kind, id } => Self::Cancelled { kind, id },
            err @ poll::Error::Timeout { .. } => Self::Timeout(err),
        }
    }
}

// -----------------------------------------------------------------------------
// Deprovisioner structure

pub struct Deprovisioner<A> {
    api: Arc<A>,
    poller: Poller,
}

impl<A> Deprovisioner<A>
where
    A: RdsApi,
{
    pub fn new(api: Arc<A>, poller: Poller) -> Self {
        Self { api, poller }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    /// deletes the instance, waits for its removal, then does the same for
    /// the cluster. The cluster is left untouched if the instance deletion
    /// goes wrong.
    pub async fn destroy(&self, record: &ResourceRecord) -> Result<(), DeprovisionError> {
        self.destroy_instance(&record.instance_id).await?;
        self.destroy_cluster(&record.cluster_id).await?;

        info!(
            cluster = &record.cluster_id,
            instance = &record.instance_id,
            "Database cluster and instance are deleted"
        );
        Ok(())
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), DeprovisionError> {
        let api = &self.api;
        let mut describe = move || async move { api.describe_instance(id).await };

        // ---------------------------------------------------------------------
        // Step 1: skip absent instance

        let instance = self.poller.describe(Kind::Instance, id, &mut describe).await?;
        match instance.map(|instance| instance.status) {
            None => {
                info!(instance = id, "Database instance does not exist, skip deletion");
                return Ok(());
            }
            Some(Status::Deleting) => {
                info!(
                    instance = id,
                    "Database instance is already being deleted, wait for its removal"
                );
            }
            Some(_) => {
                // -------------------------------------------------------------
                // Step 2: request deletion

                info!(instance = id, "Delete database instance");
                let deletion = api.delete_instance(id).await.map_err(DeprovisionError::Delete)?;
                if Deletion::NotFound == deletion {
                    warn!(instance = id, "Database instance has been deleted concurrently");
                    return Ok(());
                }
            }
        }

        // ---------------------------------------------------------------------
        // Step 3: wait for removal

        self.poller
            .wait(Kind::Instance, id, move || async move {
                #[cfg(feature = "metrics")]
                STATUS_CHECK.with_label_values(&["instance", "delete"]).inc();

                let instance = api.describe_instance(id).await?;
                debug!(
                    instance = id,
                    status = ?instance.as_ref().map(|i| i.status.to_string()),
                    "Read database instance status"
                );

                Ok::<_, rds::Error>(match instance.map(|instance| instance.status) {
                    None => Observation::Done(()),
                    Some(Status::Deleting) => Observation::Pending(Some(Status::Deleting)),
                    Some(status) => Observation::Rejected(status),
                })
            })
            .await?;

        info!(instance = id, "Database instance is deleted");
        Ok(())
    }

    async fn destroy_cluster(&self, id: &str) -> Result<(), DeprovisionError> {
        let api = &self.api;
        let mut describe = move || async move { api.describe_cluster(id).await };

        // ---------------------------------------------------------------------
        // Step 1: skip absent cluster

        let cluster = self.poller.describe(Kind::Cluster, id, &mut describe).await?;
        match cluster.map(|cluster| cluster.status) {
            None => {
                info!(cluster = id, "Database cluster does not exist, skip deletion");
                return Ok(());
            }
            Some(Status::Deleting) => {
                info!(
                    cluster = id,
                    "Database cluster is already being deleted, wait for its removal"
                );
            }
            Some(_) => {
                // -------------------------------------------------------------
                // Step 2: request deletion

                info!(cluster = id, "Delete database cluster");
                let deletion = api.delete_cluster(id).await.map_err(DeprovisionError::Delete)?;
                if Deletion::NotFound == deletion {
                    warn!(cluster = id, "Database cluster has been deleted concurrently");
                    return Ok(());
                }
            }
        }

        // ---------------------------------------------------------------------
        // Step 3: wait for removal

        self.poller
            .wait(Kind::Cluster, id, move || async move {
                #[cfg(feature = "metrics")]
                STATUS_CHECK.with_label_values(&["cluster", "delete"]).inc();

                let cluster = api.describe_cluster(id).await?;
                debug!(
                    cluster = id,
                    status = ?cluster.as_ref().map(|c| c.status.to_string()),
                    "Read database cluster status"
                );

                Ok::<_, rds::Error>(match cluster.map(|cluster| cluster.status) {
                    None => Observation::Done(()),
                    Some(Status::Deleting) => Observation::Pending(Some(Status::Deleting)),
                    Some(status) => Observation::Rejected(status),
                })
            })
            .await?;

        info!(cluster = id, "Database cluster is deleted");
        Ok(())
    }
}
