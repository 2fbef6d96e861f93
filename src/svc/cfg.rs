//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::svc::patcher::ContainerPolicy;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_ENGINE: &str = "aurora-postgresql";
pub const DEFAULT_INSTANCE_CLASS: &str = "db.r6g.large";
pub const DEFAULT_PREFIX: &str = "aurora-provisioner";

// -----------------------------------------------------------------------------
// Aws structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Aws {
    #[serde(rename = "region", default)]
    pub region: Option<String>,
    /// overrides the rds endpoint, mostly useful against local emulators
    #[serde(rename = "endpoint", default)]
    pub endpoint: Option<String>,
}

// -----------------------------------------------------------------------------
// Network structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Network {
    #[serde(rename = "subnet_group")]
    pub subnet_group: String,
    #[serde(rename = "security_groups", default)]
    pub security_groups: Vec<String>,
}

// -----------------------------------------------------------------------------
// Database structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Database {
    #[serde(rename = "user")]
    pub user: String,
    #[serde(rename = "password")]
    pub password: String,
    #[serde(rename = "engine")]
    pub engine: String,
    #[serde(rename = "instance_class")]
    pub instance_class: String,
    #[serde(rename = "availability_zone", default)]
    pub availability_zone: Option<String>,
    /// prefix of generated cluster and instance identifiers
    #[serde(rename = "prefix")]
    pub prefix: String,
    #[serde(rename = "network")]
    pub network: Network,
}

// The master password must never reach the logs.
impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("engine", &self.engine)
            .field("instance_class", &self.instance_class)
            .field("availability_zone", &self.availability_zone)
            .field("prefix", &self.prefix)
            .field("network", &self.network)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Polling structure

/// durations are expressed in seconds
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Polling {
    #[serde(rename = "initial_interval")]
    pub initial_interval: u64,
    #[serde(rename = "max_interval")]
    pub max_interval: u64,
    #[serde(rename = "multiplier")]
    pub multiplier: f64,
    #[serde(rename = "jitter")]
    pub jitter: f64,
    #[serde(rename = "timeout")]
    pub timeout: u64,
    #[serde(rename = "describe_retries")]
    pub describe_retries: u32,
}

impl Polling {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

// -----------------------------------------------------------------------------
// Flow structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Flow {
    #[serde(rename = "container_policy")]
    pub container_policy: ContainerPolicy,
    #[serde(rename = "check_connectivity")]
    pub check_connectivity: bool,
    #[serde(rename = "rollback_on_failure")]
    pub rollback_on_failure: bool,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
    #[error("invalid configuration, {0}")]
    Validate(String),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "aws", default)]
    pub aws: Aws,
    #[serde(rename = "database")]
    pub database: Database,
    #[serde(rename = "polling")]
    pub polling: Polling,
    #[serde(rename = "flow")]
    pub flow: Flow,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        let builder = defaults()?
            .add_source(File::from(path.to_owned()).required(true))
            .add_source(environment());

        let config = builder
            .build()
            .map_err(|err| Error::File(path, err))?;

        Self::cast(config)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults()?;

        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(format!(
                "{}/.config/{}/config",
                home,
                env!("CARGO_PKG_NAME")
            )));
        }

        paths.push(PathBuf::from("config"));
        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(environment())
            .build()
            .map_err(Error::Build)?;

        Self::cast(config)
    }

    fn cast(config: Config) -> Result<Self, Error> {
        let configuration: Self = config.try_deserialize().map_err(Error::Cast)?;

        configuration.validate()?;
        Ok(configuration)
    }

    /// returns an error if the configuration could not lead to a working flow
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.user.is_empty() {
            return Err(Error::Validate("'database.user' must not be empty".into()));
        }

        if self.database.password.len() < 8 {
            return Err(Error::Validate(
                "'database.password' must be at least 8 characters long".into(),
            ));
        }

        if self.database.network.subnet_group.is_empty() {
            return Err(Error::Validate(
                "'database.network.subnet_group' must not be empty".into(),
            ));
        }

        if self.polling.multiplier < 1.0 {
            return Err(Error::Validate(
                "'polling.multiplier' must be greater or equal to 1".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.polling.jitter) {
            return Err(Error::Validate(
                "'polling.jitter' must be within [0, 1)".into(),
            ));
        }

        if self.polling.initial_interval > self.polling.max_interval {
            return Err(Error::Validate(
                "'polling.initial_interval' must not exceed 'polling.max_interval'".into(),
            ));
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("database.network.security_groups")
        .try_parsing(true)
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let defaults: [(&str, config::Value); 13] = [
        ("database.engine", DEFAULT_ENGINE.into()),
        ("database.instance_class", DEFAULT_INSTANCE_CLASS.into()),
        ("database.prefix", DEFAULT_PREFIX.into()),
        ("database.network.security_groups", Vec::<String>::new().into()),
        ("polling.initial_interval", 10i64.into()),
        ("polling.max_interval", 60i64.into()),
        ("polling.multiplier", 2.0f64.into()),
        ("polling.jitter", 0.2f64.into()),
        ("polling.timeout", 1800i64.into()),
        ("polling.describe_retries", 3i64.into()),
        ("flow.container_policy", ContainerPolicy::Preserve.to_string().into()),
        ("flow.check_connectivity", false.into()),
        ("flow.rollback_on_failure", false.into()),
    ];

    let mut builder = Config::builder();
    for (key, value) in defaults {
        builder = builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.into(), err))?;
    }

    Ok(builder)
}
