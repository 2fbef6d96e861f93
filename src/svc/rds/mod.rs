//! # Rds module
//!
//! This module provide the seam between the provisioning flows and the cloud
//! database management api. Clusters and instances are addressed by the
//! caller supplied identifiers.

use std::{
    convert::Infallible,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use async_trait::async_trait;

use crate::svc::provisioner::{Endpoint, ProvisionRequest};

pub mod client;
#[cfg(test)]
pub mod simulated;

// -----------------------------------------------------------------------------
// Types

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create cluster '{0}', {1}")]
    CreateCluster(String, BoxError),
    #[error("failed to describe cluster '{0}', {1}")]
    DescribeCluster(String, BoxError),
    #[error("failed to delete cluster '{0}', {1}")]
    DeleteCluster(String, BoxError),
    #[error("failed to create instance '{0}', {1}")]
    CreateInstance(String, BoxError),
    #[error("failed to describe instance '{0}', {1}")]
    DescribeInstance(String, BoxError),
    #[error("failed to delete instance '{0}', {1}")]
    DeleteInstance(String, BoxError),
}

// -----------------------------------------------------------------------------
// Kind enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Kind {
    Cluster,
    Instance,
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Instance => write!(f, "instance"),
        }
    }
}

// -----------------------------------------------------------------------------
// Status enum

/// lifecycle status reported by the api for both clusters and instances
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Status {
    Creating,
    Available,
    BackingUp,
    Modifying,
    Deleting,
    Failed,
    IncompatibleRestore,
    IncompatibleNetwork,
    IncompatibleParameters,
    StorageFull,
    InaccessibleEncryptionCredentials,
    Other(String),
}

impl FromStr for Status {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "backing-up" => Self::BackingUp,
            "modifying" => Self::Modifying,
            "deleting" => Self::Deleting,
            "failed" => Self::Failed,
            "incompatible-restore" => Self::IncompatibleRestore,
            "incompatible-network" => Self::IncompatibleNetwork,
            "incompatible-parameters" => Self::IncompatibleParameters,
            "storage-full" => Self::StorageFull,
            "inaccessible-encryption-credentials" => Self::InaccessibleEncryptionCredentials,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match Self::from_str(s) {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Available => write!(f, "available"),
            Self::BackingUp => write!(f, "backing-up"),
            Self::Modifying => write!(f, "modifying"),
            Self::Deleting => write!(f, "deleting"),
            Self::Failed => write!(f, "failed"),
            Self::IncompatibleRestore => write!(f, "incompatible-restore"),
            Self::IncompatibleNetwork => write!(f, "incompatible-network"),
            Self::IncompatibleParameters => write!(f, "incompatible-parameters"),
            Self::StorageFull => write!(f, "storage-full"),
            Self::InaccessibleEncryptionCredentials => {
                write!(f, "inaccessible-encryption-credentials")
            }
            Self::Other(status) => write!(f, "{status}"),
        }
    }
}

impl Status {
    /// returns if a cluster in this status will never become available
    pub fn is_cluster_failure(&self) -> bool {
        matches!(
            self,
            Self::Deleting | Self::Failed | Self::IncompatibleRestore | Self::IncompatibleNetwork
        )
    }

    /// returns if an instance in this status will never become available
    pub fn is_instance_failure(&self) -> bool {
        self.is_cluster_failure()
            || matches!(
                self,
                Self::IncompatibleParameters
                    | Self::StorageFull
                    | Self::InaccessibleEncryptionCredentials
            )
    }
}

// -----------------------------------------------------------------------------
// Cluster and Instance structures

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Cluster {
    pub id: String,
    pub status: Status,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Instance {
    pub id: String,
    pub status: Status,
    pub endpoint: Option<Endpoint>,
}

// -----------------------------------------------------------------------------
// Creation and Deletion enums

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Creation {
    Created,
    /// a resource with the same identifier exists, this happens when resuming
    /// an interrupted flow
    AlreadyExists,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Deletion {
    Requested,
    NotFound,
}

// -----------------------------------------------------------------------------
// RdsApi trait

/// the subset of the cloud database management api needed to provision and
/// deprovision a cluster and its instance. A `None` from a describe call
/// means the resource does not exist.
#[async_trait]
pub trait RdsApi: Send + Sync {
    async fn create_cluster(&self, req: &ProvisionRequest) -> Result<Creation, Error>;

    async fn describe_cluster(&self, id: &str) -> Result<Option<Cluster>, Error>;

    async fn delete_cluster(&self, id: &str) -> Result<Deletion, Error>;

    async fn create_instance(&self, req: &ProvisionRequest) -> Result<Creation, Error>;

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>, Error>;

    async fn delete_instance(&self, id: &str) -> Result<Deletion, Error>;
}
