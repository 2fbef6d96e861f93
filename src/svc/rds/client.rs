//! # Client module
//!
//! This module provide the aws rds implementation of [`RdsApi`]

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_rds::error::DisplayErrorContext;
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{debug, trace};

use crate::svc::{
    cfg,
    provisioner::{Endpoint, ProvisionRequest},
    rds::{BoxError, Cluster, Creation, Deletion, Error, Instance, RdsApi, Status},
};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RDS_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("aurora_provisioner_rds_request", "number of requests sent to rds"),
        &["operation", "outcome"]
    )
    .expect("metrics 'aurora_provisioner_rds_request' to not be already registered")
});

#[cfg(feature = "metrics")]
fn observe<T, E>(operation: &str, result: &Result<T, E>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };

    RDS_REQUEST.with_label_values(&[operation, outcome]).inc();
}

#[cfg(not(feature = "metrics"))]
fn observe<T, E>(_operation: &str, _result: &Result<T, E>) {}

// -----------------------------------------------------------------------------
// Helpers

fn context<E>(err: E) -> BoxError
where
    E: std::error::Error,
{
    DisplayErrorContext(err).to_string().into()
}

// -----------------------------------------------------------------------------
// Client structure

#[derive(Clone, Debug)]
pub struct Client {
    inner: aws_sdk_rds::Client,
}

impl From<aws_sdk_rds::Client> for Client {
    fn from(inner: aws_sdk_rds::Client) -> Self {
        Self { inner }
    }
}

#[cfg_attr(feature = "trace", tracing::instrument)]
/// returns a new rds client, credentials and region are resolved from the
/// environment unless overridden by the configuration
pub async fn new(config: &cfg::Aws) -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.to_owned()));
    }

    if let Some(endpoint) = &config.endpoint {
        debug!(endpoint = endpoint, "Override rds endpoint");
        loader = loader.endpoint_url(endpoint);
    }

    let sdk = loader.load().await;
    Client::from(aws_sdk_rds::Client::new(&sdk))
}

#[async_trait]
impl RdsApi for Client {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn create_cluster(&self, req: &ProvisionRequest) -> Result<Creation, Error> {
        trace!(cluster = &req.cluster_id, "Execute request to create db cluster");
        let result = self
            .inner
            .create_db_cluster()
            .db_cluster_identifier(&req.cluster_id)
            .engine(&req.engine)
            .set_database_name(req.initial_database())
            .master_username(&req.admin_user)
            .master_user_password(&req.admin_password)
            .db_subnet_group_name(&req.network.subnet_group)
            .set_vpc_security_group_ids(Some(req.network.security_groups.to_owned()))
            .send()
            .await;

        observe("create_db_cluster", &result);
        match result {
            Ok(_) => Ok(Creation::Created),
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_cluster_already_exists_fault())
                    .unwrap_or(false) =>
            {
                Ok(Creation::AlreadyExists)
            }
            Err(err) => Err(Error::CreateCluster(req.cluster_id.to_owned(), context(err))),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn describe_cluster(&self, id: &str) -> Result<Option<Cluster>, Error> {
        trace!(cluster = id, "Execute request to describe db cluster");
        let result = self
            .inner
            .describe_db_clusters()
            .db_cluster_identifier(id)
            .send()
            .await;

        observe("describe_db_clusters", &result);
        let output = match result {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_cluster_not_found_fault())
                    .unwrap_or(false) =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(Error::DescribeCluster(id.to_owned(), context(err)));
            }
        };

        Ok(output.db_clusters().first().map(|cluster| Cluster {
            id: id.to_owned(),
            status: Status::from(cluster.status().unwrap_or_default()),
        }))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_cluster(&self, id: &str) -> Result<Deletion, Error> {
        trace!(cluster = id, "Execute request to delete db cluster");
        let result = self
            .inner
            .delete_db_cluster()
            .db_cluster_identifier(id)
            .skip_final_snapshot(true)
            .send()
            .await;

        observe("delete_db_cluster", &result);
        match result {
            Ok(_) => Ok(Deletion::Requested),
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_cluster_not_found_fault())
                    .unwrap_or(false) =>
            {
                Ok(Deletion::NotFound)
            }
            Err(err) => Err(Error::DeleteCluster(id.to_owned(), context(err))),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn create_instance(&self, req: &ProvisionRequest) -> Result<Creation, Error> {
        trace!(
            cluster = &req.cluster_id,
            instance = &req.instance_id,
            "Execute request to create db instance"
        );
        let result = self
            .inner
            .create_db_instance()
            .db_instance_identifier(&req.instance_id)
            .db_cluster_identifier(&req.cluster_id)
            .db_instance_class(&req.instance_class)
            .engine(&req.engine)
            .set_availability_zone(req.availability_zone.to_owned())
            .publicly_accessible(true)
            .send()
            .await;

        observe("create_db_instance", &result);
        match result {
            Ok(_) => Ok(Creation::Created),
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_instance_already_exists_fault())
                    .unwrap_or(false) =>
            {
                Ok(Creation::AlreadyExists)
            }
            Err(err) => Err(Error::CreateInstance(
                req.instance_id.to_owned(),
                context(err),
            )),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>, Error> {
        trace!(instance = id, "Execute request to describe db instance");
        let result = self
            .inner
            .describe_db_instances()
            .db_instance_identifier(id)
            .send()
            .await;

        observe("describe_db_instances", &result);
        let output = match result {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_instance_not_found_fault())
                    .unwrap_or(false) =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(Error::DescribeInstance(id.to_owned(), context(err)));
            }
        };

        Ok(output.db_instances().first().map(|instance| Instance {
            id: id.to_owned(),
            status: Status::from(instance.db_instance_status().unwrap_or_default()),
            endpoint: instance.endpoint().and_then(|endpoint| {
                Some(Endpoint {
                    host: endpoint.address()?.to_owned(),
                    port: u16::try_from(endpoint.port()?).ok()?,
                })
            }),
        }))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_instance(&self, id: &str) -> Result<Deletion, Error> {
        trace!(instance = id, "Execute request to delete db instance");
        let result = self
            .inner
            .delete_db_instance()
            .db_instance_identifier(id)
            .skip_final_snapshot(true)
            .send()
            .await;

        observe("delete_db_instance", &result);
        match result {
            Ok(_) => Ok(Deletion::Requested),
            Err(err)
                if err
                    .as_service_error()
                    .map(|err| err.is_db_instance_not_found_fault())
                    .unwrap_or(false) =>
            {
                Ok(Deletion::NotFound)
            }
            Err(err) => Err(Error::DeleteInstance(id.to_owned(), context(err))),
        }
    }
}
