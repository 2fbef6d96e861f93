//! # Simulated module
//!
//! In-memory [`RdsApi`] implementation scripting status transitions and
//! counting calls.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::svc::{
    cfg::{self, Configuration},
    patcher::ContainerPolicy,
    poll::{Backoff, Poller},
    provisioner::{Endpoint, ProvisionRequest},
    rds::{Cluster, Creation, Deletion, Error, Instance, Kind, RdsApi, Status},
};

// -----------------------------------------------------------------------------
// Helpers

pub fn poller(timeout: Duration) -> Poller {
    Poller {
        backoff: Backoff::fixed(Duration::from_millis(1)),
        timeout,
        describe_retries: 0,
        cancel: CancellationToken::new(),
    }
}

pub fn configuration(rollback_on_failure: bool) -> Configuration {
    Configuration {
        aws: cfg::Aws::default(),
        database: cfg::Database {
            user: "orders".into(),
            password: "correct-horse-battery".into(),
            engine: cfg::DEFAULT_ENGINE.into(),
            instance_class: cfg::DEFAULT_INSTANCE_CLASS.into(),
            availability_zone: None,
            prefix: cfg::DEFAULT_PREFIX.into(),
            network: cfg::Network {
                subnet_group: "public-subnets".into(),
                security_groups: vec!["sg-0a71103300fdaaca1".into()],
            },
        },
        polling: cfg::Polling {
            initial_interval: 1,
            max_interval: 1,
            multiplier: 1.0,
            jitter: 0.0,
            timeout: 5,
            describe_retries: 0,
        },
        flow: cfg::Flow {
            container_policy: ContainerPolicy::Preserve,
            check_connectivity: false,
            rollback_on_failure,
        },
    }
}

pub fn request(cluster: &str, instance: &str, database: &str) -> ProvisionRequest {
    ProvisionRequest {
        cluster_id: cluster.into(),
        instance_id: instance.into(),
        database_name: database.into(),
        admin_user: "orders".into(),
        admin_password: "correct-horse-battery".into(),
        network: cfg::Network {
            subnet_group: "public-subnets".into(),
            security_groups: vec!["sg-0a71103300fdaaca1".into()],
        },
        engine: cfg::DEFAULT_ENGINE.into(),
        instance_class: cfg::DEFAULT_INSTANCE_CLASS.into(),
        availability_zone: None,
    }
}

// -----------------------------------------------------------------------------
// Calls structure

#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Calls {
    pub create_cluster: usize,
    pub describe_cluster: usize,
    pub delete_cluster: usize,
    pub create_instance: usize,
    pub describe_instance: usize,
    pub delete_instance: usize,
}

impl Calls {
    pub fn status_checks(&self) -> usize {
        self.describe_cluster + self.describe_instance
    }
}

// -----------------------------------------------------------------------------
// Resource structure

#[derive(Clone, Debug)]
struct Resource {
    cluster: String,
    script: VecDeque<Status>,
    deleting: bool,
}

impl Resource {
    fn new(cluster: &str, script: &[Status]) -> Self {
        Self {
            cluster: cluster.to_owned(),
            script: script.iter().cloned().collect(),
            deleting: false,
        }
    }

    fn deleting(cluster: &str, script: &[Status]) -> Self {
        Self {
            deleting: true,
            ..Self::new(cluster, script)
        }
    }

    /// returns the next observed status, `None` once a deletion completed.
    /// While creating, the last status of the script repeats forever.
    fn observe(&mut self) -> Option<Status> {
        if self.deleting {
            return self.script.pop_front();
        }

        if self.script.len() > 1 {
            return self.script.pop_front();
        }

        self.script.front().cloned()
    }
}

// -----------------------------------------------------------------------------
// State structure

#[derive(Debug)]
struct State {
    clusters: BTreeMap<String, Resource>,
    instances: BTreeMap<String, Resource>,
    cluster_creation: Vec<Status>,
    instance_creation: Vec<Status>,
    cluster_deletion: Vec<Status>,
    instance_deletion: Vec<Status>,
    describe_failures: usize,
    endpoint: bool,
    address: Option<Endpoint>,
    deletions: Vec<Kind>,
    calls: Calls,
}

impl Default for State {
    fn default() -> Self {
        Self {
            clusters: BTreeMap::new(),
            instances: BTreeMap::new(),
            cluster_creation: vec![Status::Creating, Status::Available],
            instance_creation: vec![Status::Creating, Status::Available],
            cluster_deletion: vec![Status::Deleting],
            instance_deletion: vec![Status::Deleting],
            describe_failures: 0,
            endpoint: true,
            address: None,
            deletions: vec![],
            calls: Calls::default(),
        }
    }
}

impl State {
    fn fail_describe(&mut self) -> bool {
        if self.describe_failures > 0 {
            self.describe_failures -= 1;
            return true;
        }

        false
    }
}

// -----------------------------------------------------------------------------
// Simulated structure

#[derive(Debug, Default)]
pub struct Simulated {
    state: Mutex<State>,
}

impl Simulated {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("simulated state to not be poisoned");

        f(&mut state)
    }

    fn configure(self, f: impl FnOnce(&mut State)) -> Self {
        self.with(f);
        self
    }

    pub fn cluster_creation(self, statuses: &[Status]) -> Self {
        self.configure(|state| state.cluster_creation = statuses.to_vec())
    }

    pub fn instance_creation(self, statuses: &[Status]) -> Self {
        self.configure(|state| state.instance_creation = statuses.to_vec())
    }

    pub fn cluster_deletion(self, statuses: &[Status]) -> Self {
        self.configure(|state| state.cluster_deletion = statuses.to_vec())
    }

    pub fn instance_deletion(self, statuses: &[Status]) -> Self {
        self.configure(|state| state.instance_deletion = statuses.to_vec())
    }

    /// the next `count` describe calls fail
    pub fn describe_failures(self, count: usize) -> Self {
        self.configure(|state| state.describe_failures = count)
    }

    pub fn without_endpoint(self) -> Self {
        self.configure(|state| state.endpoint = false)
    }

    /// available instances report the given address instead of a host named
    /// after their cluster
    pub fn listening_on(self, host: &str, port: u16) -> Self {
        self.configure(|state| {
            state.address = Some(Endpoint {
                host: host.to_owned(),
                port,
            })
        })
    }

    pub fn existing_cluster(self, id: &str, status: Status) -> Self {
        self.configure(|state| {
            state
                .clusters
                .insert(id.to_owned(), Resource::new(id, &[status]));
        })
    }

    pub fn existing_instance(self, id: &str, cluster: &str, status: Status) -> Self {
        self.configure(|state| {
            state
                .instances
                .insert(id.to_owned(), Resource::new(cluster, &[status]));
        })
    }

    /// the cluster is already being deleted, it disappears once the given
    /// statuses have been observed
    pub fn deleting_cluster(self, id: &str, statuses: &[Status]) -> Self {
        self.configure(|state| {
            state
                .clusters
                .insert(id.to_owned(), Resource::deleting(id, statuses));
        })
    }

    pub fn deleting_instance(self, id: &str, cluster: &str, statuses: &[Status]) -> Self {
        self.configure(|state| {
            state
                .instances
                .insert(id.to_owned(), Resource::deleting(cluster, statuses));
        })
    }

    pub fn calls(&self) -> Calls {
        self.with(|state| state.calls.to_owned())
    }

    pub fn deletion_order(&self) -> Vec<Kind> {
        self.with(|state| state.deletions.to_owned())
    }

    pub fn cluster_exists(&self, id: &str) -> bool {
        self.with(|state| state.clusters.contains_key(id))
    }

    pub fn instance_exists(&self, id: &str) -> bool {
        self.with(|state| state.instances.contains_key(id))
    }
}

fn failure(id: &str) -> crate::svc::rds::BoxError {
    format!("simulated failure while reading '{id}'").into()
}

#[async_trait]
impl RdsApi for Simulated {
    async fn create_cluster(&self, req: &ProvisionRequest) -> Result<Creation, Error> {
        self.with(|state| {
            state.calls.create_cluster += 1;
            if state.clusters.contains_key(&req.cluster_id) {
                return Ok(Creation::AlreadyExists);
            }

            let resource = Resource::new(&req.cluster_id, &state.cluster_creation);
            state.clusters.insert(req.cluster_id.to_owned(), resource);
            Ok(Creation::Created)
        })
    }

    async fn describe_cluster(&self, id: &str) -> Result<Option<Cluster>, Error> {
        self.with(|state| {
            state.calls.describe_cluster += 1;
            if state.fail_describe() {
                return Err(Error::DescribeCluster(id.to_owned(), failure(id)));
            }

            let status = match state.clusters.get_mut(id) {
                None => return Ok(None),
                Some(resource) => resource.observe(),
            };

            match status {
                Some(status) => Ok(Some(Cluster {
                    id: id.to_owned(),
                    status,
                })),
                None => {
                    state.clusters.remove(id);
                    Ok(None)
                }
            }
        })
    }

    async fn delete_cluster(&self, id: &str) -> Result<Deletion, Error> {
        self.with(|state| {
            state.calls.delete_cluster += 1;
            let script = state.cluster_deletion.to_owned();
            match state.clusters.get_mut(id) {
                None => Ok(Deletion::NotFound),
                Some(resource) => {
                    resource.script = script.into_iter().collect();
                    resource.deleting = true;
                    state.deletions.push(Kind::Cluster);
                    Ok(Deletion::Requested)
                }
            }
        })
    }

    async fn create_instance(&self, req: &ProvisionRequest) -> Result<Creation, Error> {
        self.with(|state| {
            state.calls.create_instance += 1;
            if state.instances.contains_key(&req.instance_id) {
                return Ok(Creation::AlreadyExists);
            }

            let resource = Resource::new(&req.cluster_id, &state.instance_creation);
            state.instances.insert(req.instance_id.to_owned(), resource);
            Ok(Creation::Created)
        })
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>, Error> {
        self.with(|state| {
            state.calls.describe_instance += 1;
            if state.fail_describe() {
                return Err(Error::DescribeInstance(id.to_owned(), failure(id)));
            }

            let endpoint = state.endpoint;
            let address = state.address.to_owned();
            let (cluster, status) = match state.instances.get_mut(id) {
                None => return Ok(None),
                Some(resource) => (resource.cluster.to_owned(), resource.observe()),
            };

            match status {
                Some(status) => Ok(Some(Instance {
                    id: id.to_owned(),
                    endpoint: (endpoint && Status::Available == status).then(|| {
                        address.unwrap_or_else(|| Endpoint {
                            host: format!("{cluster}.example.com"),
                            port: 5432,
                        })
                    }),
                    status,
                })),
                None => {
                    state.instances.remove(id);
                    Ok(None)
                }
            }
        })
    }

    async fn delete_instance(&self, id: &str) -> Result<Deletion, Error> {
        self.with(|state| {
            state.calls.delete_instance += 1;
            let script = state.instance_deletion.to_owned();
            match state.instances.get_mut(id) {
                None => Ok(Deletion::NotFound),
                Some(resource) => {
                    resource.script = script.into_iter().collect();
                    resource.deleting = true;
                    state.deletions.push(Kind::Instance);
                    Ok(Deletion::Requested)
                }
            }
        })
    }
}
