//! # Create module
//!
//! This module provides the command provisioning a database and patching
//! workloads with its connection details

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use clap::ArgGroup;
use futures::future::try_join_all;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::PodSpec};
use tokio::{
    fs::OpenOptions,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{error, info};

use crate::{
    cmd::{Context, Executor},
    svc::{
        flow::{self, Created, Flow},
        k8s::{
            client,
            resource::{self, DEFAULT_NAMESPACE},
            workload::{self, Workload},
        },
        patcher::{self, ContainerPolicy},
        rds::RdsApi,
        record::ResourceRecord,
    },
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read workloads from '{0}', {1}")]
    Read(String, io::Error),
    #[error("failed to write to '{0}', {1}")]
    Write(String, io::Error),
    #[error("{0}")]
    Workload(workload::Error),
    #[error("{0}")]
    Patch(patcher::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("{0}")]
    Resource(resource::Error),
    #[error("failed to find deployment '{1}' in namespace '{0}'")]
    DeploymentNotFound(String, String),
    #[error("failed to compute patch of deployment '{0}', {1}")]
    Diff(String, serde_json::Error),
    #[error("{0}")]
    Flow(flow::Error),
}

impl From<workload::Error> for Error {
    fn from(err: workload::Error) -> Self {
        Self::Workload(err)
    }
}

impl From<patcher::Error> for Error {
    fn from(err: patcher::Error) -> Self {
        Self::Patch(err)
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
// Create structure

#[derive(clap::Args, Clone, Debug)]
#[clap(group(ArgGroup::new("source").required(true).args(&["file", "deployments"])))]
pub struct Create {
    /// Yaml file holding deployments or pod specifications, '-' reads the
    /// standard input
    #[clap(short = 'f', long = "file")]
    pub file: Option<PathBuf>,
    /// Deployment to patch in place in the kubernetes cluster
    #[clap(short = 'd', long = "deployment")]
    pub deployments: Vec<String>,
    /// Namespace of deployments and of the record config map
    #[clap(short = 'n', long = "namespace", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// Identifier of the cluster, generated from the configured prefix if
    /// omitted
    #[clap(long = "cluster-id")]
    pub cluster_id: Option<String>,
    /// Identifier of the instance, derived from the cluster identifier if
    /// omitted
    #[clap(long = "instance-id", requires = "cluster_id")]
    pub instance_id: Option<String>,
    /// Name of the config map holding the record
    #[clap(long = "record")]
    pub record: Option<String>,
    /// Write the record then the patched documents to this file instead of
    /// the standard output
    #[clap(short = 'o', long = "output", requires = "file")]
    pub output: Option<PathBuf>,
    /// Override the configured policy applied to containers following the
    /// first one, either 'preserve' or 'first-only'
    #[clap(long = "container-policy")]
    pub container_policy: Option<ContainerPolicy>,
}

#[async_trait]
impl Executor for Create {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(ctx)))]
    async fn execute(&self, ctx: &Context) -> Result<(), Self::Error> {
        let record = self.resource_record(&ctx.config.database.prefix);
        let ctx = self.context(ctx);
        let flow = ctx.flow().await;

        match &self.file {
            Some(path) => self.from_file(&flow, path, record).await,
            None => self.in_cluster(&ctx, &flow, record).await,
        }
    }
}

impl Create {
    fn resource_record(&self, prefix: &str) -> ResourceRecord {
        match (&self.cluster_id, &self.instance_id) {
            (Some(cluster), Some(instance)) => ResourceRecord::new(cluster, instance),
            (Some(cluster), None) => ResourceRecord::new(cluster, &format!("{cluster}-instance-1")),
            _ => ResourceRecord::generate(prefix),
        }
    }

    /// returns the context with command line overrides applied
    fn context(&self, ctx: &Context) -> Context {
        let mut config = ctx.config.as_ref().to_owned();
        if let Some(policy) = self.container_policy {
            config.flow.container_policy = policy;
        }

        Context {
            config: Arc::new(config),
            ..ctx.to_owned()
        }
    }

    /// returns pod specifications of workloads, failing before anything is
    /// persisted or created if none of them could be patched
    fn pod_specs(workloads: &[Workload]) -> Result<Vec<PodSpec>, Error> {
        let specs = workloads
            .iter()
            .map(|workload| workload.pod_spec().map(PodSpec::to_owned))
            .collect::<Result<Vec<_>, _>>()?;

        patcher::database_name(&specs)?;
        Ok(specs)
    }

    async fn provision<A>(
        &self,
        flow: &Flow<A>,
        specs: &[PodSpec],
        record: ResourceRecord,
    ) -> Result<Created, Error>
    where
        A: RdsApi,
    {
        info!(
            record = record.to_string(),
            workloads = specs.len(),
            "Provision database for workloads"
        );

        match flow.create(specs, record).await {
            Ok(created) => Ok(created),
            Err(err) => {
                if let Some(record) = err.record() {
                    error!(
                        cluster = &record.cluster_id,
                        instance = &record.instance_id,
                        "Resources may remain in the cloud provider, use the 'delete' command with the record to remove them"
                    );
                }

                Err(Error::Flow(err))
            }
        }
    }

    /// writes the given content to the output, a file is truncated unless
    /// `append` is set
    async fn write(&self, content: &str, append: bool) -> Result<(), Error> {
        match &self.output {
            None => {
                let mut stdout = tokio::io::stdout();
                stdout
                    .write_all(content.as_bytes())
                    .await
                    .map_err(|err| Error::Write("-".into(), err))?;

                stdout
                    .flush()
                    .await
                    .map_err(|err| Error::Write("-".into(), err))
            }
            Some(path) => {
                let target = path.display().to_string();
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(path)
                    .await
                    .map_err(|err| Error::Write(target.to_owned(), err))?;

                file.write_all(content.as_bytes())
                    .await
                    .map_err(|err| Error::Write(target.to_owned(), err))?;

                file.flush().await.map_err(|err| Error::Write(target, err))
            }
        }
    }

    async fn from_file<A>(
        &self,
        flow: &Flow<A>,
        path: &Path,
        record: ResourceRecord,
    ) -> Result<(), Error>
    where
        A: RdsApi,
    {
        // ---------------------------------------------------------------------
        // Step 1: read workloads

        let source = path.display().to_string();
        let mut content = String::new();
        if "-" == source {
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .map_err(|err| Error::Read(source.to_owned(), err))?;
        } else {
            content = tokio::fs::read_to_string(path)
                .await
                .map_err(|err| Error::Read(source.to_owned(), err))?;
        }

        let workloads = workload::parse(&content)?;
        let specs = Self::pod_specs(&workloads)?;

        // ---------------------------------------------------------------------
        // Step 2: write the record before anything is created

        let configmap =
            record.to_configmap(self.record.to_owned(), Some(self.namespace.to_owned()));
        self.write(&workload::to_yaml(&[configmap])?, false).await?;
        info!(
            cluster = &record.cluster_id,
            instance = &record.instance_id,
            "Record is written, keep it to delete the database later"
        );

        // ---------------------------------------------------------------------
        // Step 3: provision and patch

        let created = self.provision(flow, &specs, record).await?;
        let patched: Vec<_> = workloads
            .into_iter()
            .zip(created.pod_specs)
            .map(|(workload, spec)| workload.with_pod_spec(spec))
            .collect();

        // ---------------------------------------------------------------------
        // Step 4: write patched workloads after the record

        self.write(&workload::to_yaml(&patched)?, true).await?;
        info!(
            cluster = &created.record.cluster_id,
            instance = &created.record.instance_id,
            endpoint = created.endpoint.to_string(),
            "Workloads are patched"
        );

        Ok(())
    }

    async fn in_cluster<A>(
        &self,
        ctx: &Context,
        flow: &Flow<A>,
        record: ResourceRecord,
    ) -> Result<(), Error>
    where
        A: RdsApi,
    {
        // ---------------------------------------------------------------------
        // Step 1: retrieve deployments

        let kube = client::try_new(ctx.kubeconfig.to_owned()).await?;
        let deployments = try_join_all(self.deployments.iter().map(|name| {
            let kube = kube.to_owned();

            async move {
                resource::get::<Deployment>(kube, &self.namespace, name)
                    .await?
                    .ok_or_else(|| {
                        Error::DeploymentNotFound(self.namespace.to_owned(), name.to_owned())
                    })
            }
        }))
        .await?;

        let workloads: Vec<_> = deployments.iter().cloned().map(Workload::from).collect();
        let specs = Self::pod_specs(&workloads)?;

        // ---------------------------------------------------------------------
        // Step 2: persist the record before anything is created

        let configmap =
            record.to_configmap(self.record.to_owned(), Some(self.namespace.to_owned()));
        let configmap = resource::upsert_configmap(kube.to_owned(), &configmap).await?;
        info!(
            name = configmap.metadata.name.as_deref().unwrap_or_default(),
            namespace = &self.namespace,
            "Record is persisted in config map"
        );

        // ---------------------------------------------------------------------
        // Step 3: provision

        let created = self.provision(flow, &specs, record).await?;

        // ---------------------------------------------------------------------
        // Step 4: patch deployments

        for (deployment, spec) in deployments.iter().zip(created.pod_specs) {
            let mut modified = deployment.to_owned();
            if let Some(deployment_spec) = modified.spec.as_mut() {
                deployment_spec.template.spec = Some(spec);
            }

            let name = deployment.metadata.name.to_owned().unwrap_or_default();
            let patch = resource::diff(deployment, &modified)
                .map_err(|err| Error::Diff(name.to_owned(), err))?;

            resource::patch(kube.to_owned(), &modified, patch).await?;
            info!(
                name = &name,
                namespace = &self.namespace,
                "Deployment is patched with database connection details"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::*;
    use crate::{
        cmd::{Args, Command},
        svc::rds::{
            simulated::{configuration, poller, Simulated},
            Status,
        },
    };

    const POD_SPEC: &str = r#"
containers:
  - name: api
    image: registry.example.com/orders-api:1.4.2
    env:
      - name: DB_NAME
        value: orders
"#;

    fn parse(args: &[&str]) -> Create {
        match Args::try_parse_from(args.iter().copied()).expect("arguments to be parsed").command {
            Some(Command::Create(create)) => create,
            other => panic!("expected create command, got {other:?}"),
        }
    }

    #[test]
    fn instance_identifier_is_derived_from_cluster() {
        let create = parse(&[
            "aurora-provisioner",
            "create",
            "-f",
            "app.yaml",
            "--cluster-id",
            "orders",
        ]);

        assert_eq!(
            create.resource_record("ignored"),
            ResourceRecord::new("orders", "orders-instance-1")
        );
    }

    #[test]
    fn identifiers_are_generated_from_prefix() {
        let create = parse(&[
            "aurora-provisioner",
            "create",
            "-d",
            "orders-api",
            "-d",
            "orders-worker",
        ]);
        let record = create.resource_record("shop");

        assert_eq!(create.deployments, vec!["orders-api", "orders-worker"]);
        assert_eq!(create.namespace, DEFAULT_NAMESPACE);
        assert!(record.cluster_id.starts_with("shop-"));
        assert!(record.instance_id.starts_with(&record.cluster_id));
    }

    #[test]
    fn a_source_is_required() {
        assert!(Args::try_parse_from(["aurora-provisioner", "create"]).is_err());
        assert!(Args::try_parse_from([
            "aurora-provisioner",
            "create",
            "-f",
            "app.yaml",
            "-d",
            "orders-api"
        ])
        .is_err());
    }

    #[test]
    fn container_policy_is_overridden() {
        let create = parse(&[
            "aurora-provisioner",
            "create",
            "-f",
            "app.yaml",
            "--container-policy",
            "first-only",
        ]);

        assert_eq!(create.container_policy, Some(ContainerPolicy::FirstOnly));
        assert!(Args::try_parse_from([
            "aurora-provisioner",
            "create",
            "-f",
            "app.yaml",
            "--container-policy",
            "all"
        ])
        .is_err());
    }

    #[tokio::test]
    async fn record_is_written_before_provisioning_fails() {
        let dir = tempfile::tempdir().expect("temporary directory to be created");
        let input = dir.path().join("workloads.yaml");
        let output = dir.path().join("patched.yaml");
        tokio::fs::write(&input, POD_SPEC)
            .await
            .expect("workloads to be written");

        let (input_arg, output_arg) = (input.display().to_string(), output.display().to_string());
        let create = parse(&[
            "aurora-provisioner",
            "create",
            "-f",
            &input_arg,
            "-o",
            &output_arg,
            "--cluster-id",
            "orders",
        ]);

        let api = Arc::new(
            Simulated::default().instance_creation(&[Status::Creating, Status::Failed]),
        );
        let flow = Flow::new(api.clone(), poller(Duration::from_secs(5)), &configuration(false));

        let result = create
            .from_file(&flow, &input, create.resource_record("ignored"))
            .await;
        assert!(matches!(result, Err(Error::Flow(_))));
        assert!(api.cluster_exists("orders"));

        let content = tokio::fs::read_to_string(&output)
            .await
            .expect("output to be read");

        assert_eq!(
            ResourceRecord::from_yaml(&content),
            Ok(ResourceRecord::new("orders", "orders-instance-1"))
        );
    }

    #[tokio::test]
    async fn patched_workloads_follow_the_record() {
        let dir = tempfile::tempdir().expect("temporary directory to be created");
        let input = dir.path().join("workloads.yaml");
        let output = dir.path().join("patched.yaml");
        tokio::fs::write(&input, POD_SPEC)
            .await
            .expect("workloads to be written");

        let (input_arg, output_arg) = (input.display().to_string(), output.display().to_string());
        let create = parse(&["aurora-provisioner", "create", "-f", &input_arg, "-o", &output_arg]);

        let api = Arc::new(Simulated::default());
        let flow = Flow::new(api.clone(), poller(Duration::from_secs(5)), &configuration(false));

        create
            .from_file(&flow, &input, ResourceRecord::new("c1", "i1"))
            .await
            .expect("workloads to be patched");

        let content = tokio::fs::read_to_string(&output)
            .await
            .expect("output to be read");

        let record = content.find("kind: ConfigMap").expect("record to be written");
        let patched = content.find("c1.example.com").expect("workload to be patched");
        assert!(record < patched);
    }

    #[tokio::test]
    async fn nothing_is_written_for_workloads_without_container() {
        let dir = tempfile::tempdir().expect("temporary directory to be created");
        let input = dir.path().join("workloads.yaml");
        let output = dir.path().join("patched.yaml");
        tokio::fs::write(&input, "containers: []\n")
            .await
            .expect("workloads to be written");

        let (input_arg, output_arg) = (input.display().to_string(), output.display().to_string());
        let create = parse(&["aurora-provisioner", "create", "-f", &input_arg, "-o", &output_arg]);

        let api = Arc::new(Simulated::default());
        let flow = Flow::new(api.clone(), poller(Duration::from_secs(5)), &configuration(false));

        let result = create
            .from_file(&flow, &input, ResourceRecord::new("c1", "i1"))
            .await;

        assert!(matches!(result, Err(Error::Patch(patcher::Error::NoContainer(1)))));
        assert!(!output.exists());
        assert_eq!(api.calls().create_cluster, 0);
    }
}
