//! # Workload module
//!
//! This module reads workloads from yaml documents. A document is either a
//! `apps/v1` deployment or a bare pod specification.

use k8s_openapi::api::{apps::v1::Deployment, core::v1::PodSpec};
use serde::Deserialize;
use serde_yaml::Value;

// -----------------------------------------------------------------------------
// Constants

pub const DEPLOYMENT_KIND: &str = "Deployment";

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse yaml document #{0}, {1}")]
    Parse(usize, serde_yaml::Error),
    #[error("document #{0} has kind '{1}', only '{DEPLOYMENT_KIND}' or bare pod specifications are supported")]
    UnsupportedKind(usize, String),
    #[error("deployment '{0}' has no pod template specification")]
    MissingPodSpec(String),
    #[error("failed to serialize workloads, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// Workload enum

#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    Deployment(Box<Deployment>),
    PodSpec(Box<PodSpec>),
}

impl From<Deployment> for Workload {
    fn from(deployment: Deployment) -> Self {
        Self::Deployment(Box::new(deployment))
    }
}

impl From<PodSpec> for Workload {
    fn from(spec: PodSpec) -> Self {
        Self::PodSpec(Box::new(spec))
    }
}

impl Workload {
    /// returns the pod specification carried by the workload
    pub fn pod_spec(&self) -> Result<&PodSpec, Error> {
        match self {
            Self::PodSpec(spec) => Ok(spec),
            Self::Deployment(deployment) => deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.spec.as_ref())
                .ok_or_else(|| {
                    Error::MissingPodSpec(deployment.metadata.name.to_owned().unwrap_or_default())
                }),
        }
    }

    /// returns the workload with its pod specification replaced
    pub fn with_pod_spec(self, pod_spec: PodSpec) -> Self {
        match self {
            Self::PodSpec(_) => Self::from(pod_spec),
            Self::Deployment(mut deployment) => {
                if let Some(spec) = deployment.spec.as_mut() {
                    spec.template.spec = Some(pod_spec);
                }

                Self::Deployment(deployment)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the workloads of the given multi-document yaml, empty documents
/// are ignored
pub fn parse(content: &str) -> Result<Vec<Workload>, Error> {
    let mut workloads = vec![];

    for (idx, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = Value::deserialize(document).map_err(|err| Error::Parse(idx, err))?;
        if value.is_null() {
            continue;
        }

        let kind = value.get("kind").and_then(Value::as_str).map(str::to_owned);
        let workload = match kind.as_deref() {
            Some(DEPLOYMENT_KIND) => Workload::from(
                serde_yaml::from_value::<Deployment>(value).map_err(|err| Error::Parse(idx, err))?,
            ),
            Some(kind) => return Err(Error::UnsupportedKind(idx, kind.to_owned())),
            None => Workload::from(
                serde_yaml::from_value::<PodSpec>(value).map_err(|err| Error::Parse(idx, err))?,
            ),
        };

        workloads.push(workload);
    }

    Ok(workloads)
}

/// returns the given documents as a multi-document yaml
pub fn to_yaml<T>(documents: &[T]) -> Result<String, Error>
where
    T: serde::Serialize,
{
    let mut output = String::new();
    for document in documents {
        output.push_str("---\n");
        output.push_str(&serde_yaml::to_string(document).map_err(Error::Serialize)?);
    }

    Ok(output)
}

impl serde::Serialize for Workload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Deployment(deployment) => deployment.serialize(serializer),
            Self::PodSpec(spec) => spec.serialize(serializer),
        }
    }
}
