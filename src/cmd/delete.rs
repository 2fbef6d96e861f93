//! # Delete module
//!
//! This module provides the command deleting the database named by a
//! resource record

use std::{io, path::PathBuf};

use async_trait::async_trait;
use clap::ArgGroup;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::info;

use crate::{
    cmd::{Context, Executor},
    svc::{
        flow,
        k8s::{
            client,
            resource::{self, DEFAULT_NAMESPACE},
        },
        record::{self, ResourceRecord},
    },
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read record from '{0}', {1}")]
    Read(String, io::Error),
    #[error("{0}")]
    Record(record::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("{0}")]
    Resource(resource::Error),
    #[error("failed to find config map '{1}' in namespace '{0}'")]
    RecordNotFound(String, String),
    #[error("{0}")]
    Flow(flow::Error),
    #[error("a record file, a record config map or both identifiers are required")]
    MissingSource,
}

impl From<record::Error> for Error {
    fn from(err: record::Error) -> Self {
        Self::Record(err)
    }
}

impl From<client::Error> for Error {
    fn from(err: client::Error) -> Self {
        Self::Client(err)
    }
}

impl From<resource::Error> for Error {
    fn from(err: resource::Error) -> Self {
        Self::Resource(err)
    }
}

impl From<flow::Error> for Error {
    fn from(err: flow::Error) -> Self {
        Self::Flow(err)
    }
}

// -----------------------------------------------------------------------------
// Delete structure

#[derive(clap::Args, Clone, Debug)]
#[clap(group(ArgGroup::new("source").required(true).args(&["file", "record", "cluster_id"])))]
pub struct Delete {
    /// Yaml file holding the record, either a config map or a bare mapping
    #[clap(short = 'f', long = "file")]
    pub file: Option<PathBuf>,
    /// Name of the config map holding the record in the kubernetes cluster
    #[clap(long = "record")]
    pub record: Option<String>,
    /// Namespace of the record config map
    #[clap(short = 'n', long = "namespace", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// Identifier of the cluster to delete
    #[clap(long = "cluster-id", requires = "instance_id")]
    pub cluster_id: Option<String>,
    /// Identifier of the instance to delete
    #[clap(long = "instance-id")]
    pub instance_id: Option<String>,
    /// Keep the record config map once the database is deleted
    #[clap(long = "keep-record", requires = "record")]
    pub keep_record: bool,
}

#[async_trait]
impl Executor for Delete {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(ctx)))]
    async fn execute(&self, ctx: &Context) -> Result<(), Self::Error> {
        // ---------------------------------------------------------------------
        // Step 1: resolve the record

        let record = match (&self.file, &self.record, &self.cluster_id, &self.instance_id) {
            (Some(path), _, _, _) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| Error::Read(path.display().to_string(), err))?;

                ResourceRecord::from_yaml(&content)?
            }
            (None, Some(name), _, _) => self.from_cluster(ctx, name).await?,
            (None, None, Some(cluster), Some(instance)) => ResourceRecord::new(cluster, instance),
            _ => return Err(Error::MissingSource),
        };

        // ---------------------------------------------------------------------
        // Step 2: delete instance then cluster

        info!(cluster = &record.cluster_id, instance = &record.instance_id, "Delete database");
        ctx.flow().await.delete(&record).await?;

        // ---------------------------------------------------------------------
        // Step 3: drop the record

        if let (Some(name), false) = (&self.record, self.keep_record) {
            let kube = client::try_new(ctx.kubeconfig.to_owned()).await?;

            resource::delete::<ConfigMap>(kube, &self.namespace, name).await?;
            info!(name = name, namespace = &self.namespace, "Record config map is deleted");
        }

        Ok(())
    }
}

impl Delete {
    async fn from_cluster(&self, ctx: &Context, name: &str) -> Result<ResourceRecord, Error> {
        let kube = client::try_new(ctx.kubeconfig.to_owned()).await?;
        let configmap = resource::get::<ConfigMap>(kube, &self.namespace, name)
            .await?
            .ok_or_else(|| Error::RecordNotFound(self.namespace.to_owned(), name.to_owned()))?;

        Ok(ResourceRecord::try_from(&configmap)?)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::cmd::{Args, Command};

    #[test]
    fn parse_record_sources() {
        let args = Args::try_parse_from([
            "aurora-provisioner",
            "delete",
            "--record",
            "orders-record",
            "-n",
            "shop",
        ])
        .expect("arguments to be parsed");

        match args.command {
            Some(Command::Delete(delete)) => {
                assert_eq!(delete.record.as_deref(), Some("orders-record"));
                assert_eq!(delete.namespace, "shop");
                assert!(!delete.keep_record);
            }
            other => panic!("expected delete command, got {other:?}"),
        }
    }

    #[test]
    fn cluster_identifier_requires_instance_identifier() {
        assert!(
            Args::try_parse_from(["aurora-provisioner", "delete", "--cluster-id", "c1"]).is_err()
        );
        assert!(Args::try_parse_from([
            "aurora-provisioner",
            "delete",
            "--cluster-id",
            "c1",
            "--instance-id",
            "i1"
        ])
        .is_ok());
    }
}
