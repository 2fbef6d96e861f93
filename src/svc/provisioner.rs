//! # Provisioner module
//!
//! This module creates an aurora cluster and a publicly reachable instance
//! inside it, then waits for the instance to expose its endpoint.
//!
//! Creating the cluster and the instance is a two-phase, non-atomic
//! operation: a failure after the cluster creation leaves it behind. The
//! [`ResourceRecord`] naming both resources is the handle to clean up.
//!
//! [`ResourceRecord`]: crate::svc::record::ResourceRecord

use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::svc::{
    cfg,
    patcher::DEFAULT_DATABASE_NAME,
    poll::{self, DescribeError, Observation, Poller},
    rds::{self, Creation, Kind, RdsApi, Status},
    record::ResourceRecord,
};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
pub(crate) static STATUS_CHECK: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "aurora_provisioner_status_check",
            "number of status checks issued while waiting for a transition"
        ),
        &["kind", "transition"]
    )
    .expect("metrics 'aurora_provisioner_status_check' to not be already registered")
});

// -----------------------------------------------------------------------------
// Endpoint structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug)]
pub struct Endpoint {
    #[serde(rename = "host")]
    pub host: String,
    #[serde(rename = "port")]
    pub port: u16,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Endpoint {
    /// returns if the endpoint could be used to connect, an endpoint is
    /// either complete or not returned at all
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

// -----------------------------------------------------------------------------
// ProvisionRequest structure

#[derive(PartialEq, Eq, Clone)]
pub struct ProvisionRequest {
    pub cluster_id: String,
    pub instance_id: String,
    pub database_name: String,
    pub admin_user: String,
    pub admin_password: String,
    pub network: cfg::Network,
    pub engine: String,
    pub instance_class: String,
    pub availability_zone: Option<String>,
}

impl Debug for ProvisionRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("cluster_id", &self.cluster_id)
            .field("instance_id", &self.instance_id)
            .field("database_name", &self.database_name)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("network", &self.network)
            .field("engine", &self.engine)
            .field("instance_class", &self.instance_class)
            .field("availability_zone", &self.availability_zone)
            .finish()
    }
}

impl ProvisionRequest {
    /// returns a request for the given identifiers and database name using
    /// credentials, network and sizing from the configuration
    pub fn new(record: &ResourceRecord, database_name: &str, database: &cfg::Database) -> Self {
        Self {
            cluster_id: record.cluster_id.to_owned(),
            instance_id: record.instance_id.to_owned(),
            database_name: database_name.to_owned(),
            admin_user: database.user.to_owned(),
            admin_password: database.password.to_owned(),
            network: database.network.to_owned(),
            engine: database.engine.to_owned(),
            instance_class: database.instance_class.to_owned(),
            availability_zone: database.availability_zone.to_owned(),
        }
    }

    pub fn record(&self) -> ResourceRecord {
        ResourceRecord::new(&self.cluster_id, &self.instance_id)
    }

    /// returns the database to create along with the cluster, `None` when
    /// workloads use the default database which always exists
    pub fn initial_database(&self) -> Option<String> {
        (DEFAULT_DATABASE_NAME != self.database_name).then(|| self.database_name.to_owned())
    }
}

// -----------------------------------------------------------------------------
// ProvisionError enum

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("failed to request cluster creation, {0}")]
    CreateCluster(rds::Error),
    #[error("failed to request instance creation, {0}")]
    CreateInstance(rds::Error),
    #[error("{kind} '{id}' reached terminal status '{status}'")]
    TerminalStatus {
        kind: Kind,
        id: String,
        status: Status,
    },
    #[error("{0}")]
    Timeout(poll::Error),
    #[error("{0}")]
    Describe(DescribeError),
    #[error("instance '{0}' is available but does not expose a complete endpoint")]
    MissingEndpoint(String),
    #[error("{kind} '{id}' provisioning has been cancelled")]
    Cancelled { kind: Kind, id: String },
}

impl From<poll::Error> for ProvisionError {
    fn from(err: poll::Error) -> Self {
        match err {
            poll::Error::Describe(err) => Self::Describe(err),
            poll::Error::Rejected { kind, id, status } => Self::TerminalStatus { kind, id, status },
            poll::Error::Cancelled { kind, id } => Self::Cancelled { kind, id },
            err @ poll::Error::Timeout { .. } => Self::Timeout(err),
        }
    }
}

// -----------------------------------------------------------------------------
// Provisioner structure

pub struct Provisioner<A> {
    api: Arc<A>,
    poller: Poller,
}

impl<A> Provisioner<A>
where
    A: RdsApi,
{
    pub fn new(api: Arc<A>, poller: Poller) -> Self {
        Self { api, poller }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    /// creates the cluster then its instance and returns the endpoint of the
    /// instance once available
    pub async fn create(&self, req: &ProvisionRequest) -> Result<Endpoint, ProvisionError> {
        // ---------------------------------------------------------------------
        // Step 1: create the cluster

        info!(cluster = &req.cluster_id, engine = &req.engine, "Create database cluster");
        let creation = self
            .api
            .create_cluster(req)
            .await
            .map_err(ProvisionError::CreateCluster)?;

        if Creation::AlreadyExists == creation {
            info!(
                cluster = &req.cluster_id,
                "Database cluster already exists, resume provisioning"
            );
        }

        // ---------------------------------------------------------------------
        // Step 2: wait for the cluster to be available

        self.wait_for_cluster(&req.cluster_id).await?;
        info!(cluster = &req.cluster_id, "Database cluster is available");

        // ---------------------------------------------------------------------
        // Step 3: create the instance

        info!(
            cluster = &req.cluster_id,
            instance = &req.instance_id,
            class = &req.instance_class,
            "Create publicly accessible database instance"
        );
        let creation = self
            .api
            .create_instance(req)
            .await
            .map_err(ProvisionError::CreateInstance)?;

        if Creation::AlreadyExists == creation {
            info!(
                instance = &req.instance_id,
                "Database instance already exists, resume provisioning"
            );
        }

        // ---------------------------------------------------------------------
        // Step 4: wait for the instance and its endpoint

        let endpoint = self
            .wait_for_instance(&req.instance_id)
            .await?
            .filter(Endpoint::is_complete)
            .ok_or_else(|| ProvisionError::MissingEndpoint(req.instance_id.to_owned()))?;

        info!(
            cluster = &req.cluster_id,
            instance = &req.instance_id,
            endpoint = endpoint.to_string(),
            "Database instance is available"
        );
        Ok(endpoint)
    }

    async fn wait_for_cluster(&self, id: &str) -> Result<(), ProvisionError> {
        let api = &self.api;

        self.poller
            .wait(Kind::Cluster, id, move || async move {
                #[cfg(feature = "metrics")]
                STATUS_CHECK.with_label_values(&["cluster", "create"]).inc();

                let cluster = api.describe_cluster(id).await?;
                debug!(
                    cluster = id,
                    status = ?cluster.as_ref().map(|c| c.status.to_string()),
                    "Read database cluster status"
                );

                Ok::<_, rds::Error>(match cluster.map(|cluster| cluster.status) {
                    Some(Status::Available) => Observation::Done(()),
                    Some(status) if status.is_cluster_failure() => Observation::Rejected(status),
                    status => Observation::Pending(status),
                })
            })
            .await
            .map_err(ProvisionError::from)
    }

    async fn wait_for_instance(&self, id: &str) -> Result<Option<Endpoint>, ProvisionError> {
        let api = &self.api;

        self.poller
            .wait(Kind::Instance, id, move || async move {
                #[cfg(feature = "metrics")]
                STATUS_CHECK.with_label_values(&["instance", "create"]).inc();

                let instance = api.describe_instance(id).await?;
                debug!(
                    instance = id,
                    status = ?instance.as_ref().map(|i| i.status.to_string()),
                    "Read database instance status"
                );

                Ok::<_, rds::Error>(match instance {
                    Some(instance) if Status::Available == instance.status => {
                        Observation::Done(instance.endpoint)
                    }
                    Some(instance) if instance.status.is_instance_failure() => {
                        Observation::Rejected(instance.status)
                    }
                    instance => Observation::Pending(instance.map(|instance| instance.status)),
                })
            })
            .await
            .map_err(ProvisionError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::svc::rds::simulated::{poller, request, Simulated};

    #[test]
    fn default_database_is_not_created() {
        assert_eq!(request("c1", "i1", DEFAULT_DATABASE_NAME).initial_database(), None);
        assert_eq!(
            request("c1", "i1", "orders").initial_database().as_deref(),
            Some("orders")
        );
    }

    #[tokio::test]
    async fn create_waits_for_cluster_then_instance() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Creating, Status::Available])
                .instance_creation(&[Status::Creating, Status::Creating, Status::Available]),
        );

        let provisioner = Provisioner::new(api.clone(), poller(Duration::from_secs(5)));
        let endpoint = provisioner
            .create(&request("c1", "i1", "orders"))
            .await
            .expect("provisioning to succeed");

        assert_eq!(
            endpoint,
            Endpoint {
                host: "c1.example.com".into(),
                port: 5432
            }
        );

        let calls = api.calls();
        assert_eq!(calls.status_checks(), 5);
        assert_eq!(calls.describe_cluster, 2);
        assert_eq!(calls.describe_instance, 3);
        assert_eq!(calls.create_cluster, 1);
        assert_eq!(calls.create_instance, 1);
    }

    #[tokio::test]
    async fn cluster_failure_aborts_before_instance_creation() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Creating, Status::IncompatibleNetwork]),
        );

        let provisioner = Provisioner::new(api.clone(), poller(Duration::from_secs(5)));
        let result = provisioner.create(&request("c1", "i1", "orders")).await;

        match result {
            Err(ProvisionError::TerminalStatus { kind, id, status }) => {
                assert_eq!(kind, Kind::Cluster);
                assert_eq!(id, "c1");
                assert_eq!(status, Status::IncompatibleNetwork);
            }
            other => panic!("expected a terminal status, got {other:?}"),
        }

        assert_eq!(api.calls().create_instance, 0);
    }

    #[tokio::test]
    async fn instance_failure_is_reported() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Available])
                .instance_creation(&[Status::Creating, Status::StorageFull]),
        );

        let provisioner = Provisioner::new(api, poller(Duration::from_secs(5)));
        let result = provisioner.create(&request("c1", "i1", "orders")).await;

        assert!(matches!(
            result,
            Err(ProvisionError::TerminalStatus {
                kind: Kind::Instance,
                status: Status::StorageFull,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn polling_is_bounded_by_the_timeout() {
        let api = Arc::new(Simulated::default().cluster_creation(&[Status::Creating]));

        let provisioner = Provisioner::new(api, poller(Duration::from_millis(20)));
        let result = provisioner.create(&request("c1", "i1", "orders")).await;

        assert!(matches!(result, Err(ProvisionError::Timeout(_))));
    }

    #[tokio::test]
    async fn describe_error_aborts_the_flow() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Creating, Status::Available])
                .describe_failures(1),
        );

        let provisioner = Provisioner::new(api.clone(), poller(Duration::from_secs(5)));
        let result = provisioner.create(&request("c1", "i1", "orders")).await;

        assert!(matches!(result, Err(ProvisionError::Describe(_))));
        assert_eq!(api.calls().create_instance, 0);
    }

    #[tokio::test]
    async fn available_instance_without_endpoint_is_an_error() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Available])
                .instance_creation(&[Status::Available])
                .without_endpoint(),
        );

        let provisioner = Provisioner::new(api, poller(Duration::from_secs(5)));
        let result = provisioner.create(&request("c1", "i1", "orders")).await;

        assert!(matches!(result, Err(ProvisionError::MissingEndpoint(id)) if id == "i1"));
    }

    #[tokio::test]
    async fn existing_resources_are_resumed() {
        let api = Arc::new(
            Simulated::default()
                .cluster_creation(&[Status::Available])
                .instance_creation(&[Status::Available]),
        );

        let provisioner = Provisioner::new(api.clone(), poller(Duration::from_secs(5)));
        let req = request("c1", "i1", "orders");

        let first = provisioner.create(&req).await.expect("provisioning to succeed");
        let second = provisioner.create(&req).await.expect("resuming to succeed");

        assert_eq!(first, second);
        assert_eq!(api.calls().create_cluster, 2);
    }

    #[test]
    fn password_is_redacted_from_request() {
        let output = format!("{:?}", request("c1", "i1", "orders"));

        assert!(!output.contains("correct-horse-battery"));
    }
}
