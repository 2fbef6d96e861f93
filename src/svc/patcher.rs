//! # Patcher module
//!
//! This module rewrites the environment of workload pod specifications to
//! point them to a provisioned database.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use k8s_openapi::api::core::v1::{EnvVar, PodSpec};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::svc::provisioner::Endpoint;

// -----------------------------------------------------------------------------
// Constants

pub const DB_HOSTNAME: &str = "DB_HOSTNAME";
pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_NAME: &str = "DB_NAME";
pub const DEFAULT_DATABASE_NAME: &str = "postgres";

/// environment variables owned by the patcher, any previous value is dropped
pub const MANAGED_VARIABLES: [&str; 3] = [DB_HOSTNAME, DB_USER, DB_PASSWORD];

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("none of the {0} given pod specification(s) has a container to patch")]
    NoContainer(usize),
    #[error("failed to parse container policy '{0}', available options are 'preserve' or 'first-only'")]
    ParsePolicy(String),
}

// -----------------------------------------------------------------------------
// ContainerPolicy enum

/// what happens to the containers following the first one
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug, Default)]
pub enum ContainerPolicy {
    /// other containers are kept unmodified
    #[default]
    #[serde(rename = "preserve")]
    Preserve,
    /// the container list is replaced by the patched first container
    #[serde(rename = "first-only")]
    FirstOnly,
}

impl FromStr for ContainerPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preserve" => Ok(Self::Preserve),
            "first-only" => Ok(Self::FirstOnly),
            _ => Err(Error::ParsePolicy(s.to_string())),
        }
    }
}

impl Display for ContainerPolicy {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Preserve => write!(f, "preserve"),
            Self::FirstOnly => write!(f, "first-only"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// returns the database name wanted by the workloads, read from the `DB_NAME`
/// variable of the first container of the first pod specification having
/// one, or [`DEFAULT_DATABASE_NAME`]
pub fn database_name(specs: &[PodSpec]) -> Result<String, Error> {
    let container = specs
        .iter()
        .find_map(|spec| spec.containers.first())
        .ok_or(Error::NoContainer(specs.len()))?;

    let name = container
        .env
        .iter()
        .flatten()
        .find(|var| DB_NAME == var.name)
        .and_then(|var| var.value.to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string());

    debug!(container = &container.name, database = &name, "Resolve database name");
    Ok(name)
}

// -----------------------------------------------------------------------------
// SpecPatcher structure

#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct SpecPatcher {
    pub policy: ContainerPolicy,
}

impl From<ContainerPolicy> for SpecPatcher {
    fn from(policy: ContainerPolicy) -> Self {
        Self { policy }
    }
}

impl SpecPatcher {
    /// returns the given pod specifications where the first container's
    /// environment points to the endpoint. Order and count are preserved,
    /// pod specifications without container are returned untouched.
    pub fn patch(
        &self,
        specs: &[PodSpec],
        endpoint: &Endpoint,
        user: &str,
        password: &str,
    ) -> Result<Vec<PodSpec>, Error> {
        if specs.iter().all(|spec| spec.containers.is_empty()) {
            return Err(Error::NoContainer(specs.len()));
        }

        Ok(specs
            .iter()
            .map(|spec| self.patch_one(spec, endpoint, user, password))
            .collect())
    }

    fn patch_one(
        &self,
        spec: &PodSpec,
        endpoint: &Endpoint,
        user: &str,
        password: &str,
    ) -> PodSpec {
        let mut modified = spec.to_owned();
        let container = match modified.containers.first_mut() {
            Some(container) => container,
            None => return modified,
        };

        let mut env: Vec<EnvVar> = container
            .env
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|var| !MANAGED_VARIABLES.contains(&var.name.as_str()))
            .collect();

        env.push(var(DB_HOSTNAME, &endpoint.host));
        env.push(var(DB_USER, user));
        env.push(var(DB_PASSWORD, password));
        container.env = Some(env);

        debug!(
            container = &container.name,
            policy = self.policy.to_string(),
            "Patch database environment of container"
        );
        if ContainerPolicy::FirstOnly == self.policy {
            modified.containers.truncate(1);
        }

        modified
    }
}
