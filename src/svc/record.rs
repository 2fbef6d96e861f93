//! # Record module
//!
//! This module provide the resource record, the durable marker naming the
//! cluster and the instance created by a provisioning flow. It is persisted
//! as the data of a kubernetes config map and is the only input needed to
//! delete what has been created.

use std::{
    collections::BTreeMap,
    convert::TryFrom,
    fmt::{self, Display, Formatter},
};

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DB_CLUSTER_NAME: &str = "DB_CLUSTER_NAME";
pub const DB_INSTANCE_NAME: &str = "DB_INSTANCE_NAME";
pub const CREATED_AT_ANNOTATION: &str = "aurora-provisioner/created-at";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("config map '{0}' has no data")]
    MissingData(String),
    #[error("failed to find key '{0}' in record '{1}'")]
    MissingKey(&'static str, String),
    #[error("key '{0}' of record '{1}' is empty")]
    EmptyKey(&'static str, String),
    #[error("failed to parse record, {0}")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// ResourceRecord structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug)]
pub struct ResourceRecord {
    #[serde(rename = "DB_CLUSTER_NAME")]
    pub cluster_id: String,
    #[serde(rename = "DB_INSTANCE_NAME")]
    pub instance_id: String,
}

impl Display for ResourceRecord {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.instance_id)
    }
}

impl ResourceRecord {
    pub fn new(cluster_id: &str, instance_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_owned(),
            instance_id: instance_id.to_owned(),
        }
    }

    /// returns a record with fresh identifiers derived from the given prefix.
    /// Identifiers only contain lowercase alphanumeric characters and
    /// hyphens as required by the api.
    pub fn generate(prefix: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();

        Self {
            cluster_id: format!("{prefix}-{suffix}"),
            instance_id: format!("{prefix}-{suffix}-instance-1"),
        }
    }

    /// returns the default name of the config map holding this record
    pub fn name(&self) -> String {
        format!("{}-record", self.cluster_id)
    }

    /// returns the key-value document of the record
    pub fn data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (DB_CLUSTER_NAME.to_string(), self.cluster_id.to_owned()),
            (DB_INSTANCE_NAME.to_string(), self.instance_id.to_owned()),
        ])
    }

    /// returns the record held by the given yaml document, either a config
    /// map or a bare mapping of the record keys
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|err| Error::Parse(err.to_string()))?;

        if Some("ConfigMap") == value.get("kind").and_then(serde_yaml::Value::as_str) {
            let configmap: ConfigMap =
                serde_yaml::from_value(value).map_err(|err| Error::Parse(err.to_string()))?;

            return Self::try_from(&configmap);
        }

        let data: BTreeMap<String, String> =
            serde_yaml::from_value(value).map_err(|err| Error::Parse(err.to_string()))?;

        Self::from_data("<document>", &data)
    }

    /// returns the record held by the given key-value document, identifiers
    /// are trimmed and must not be empty
    fn from_data(name: &str, data: &BTreeMap<String, String>) -> Result<Self, Error> {
        let get = |key: &'static str| -> Result<String, Error> {
            match data.get(key) {
                None => Err(Error::MissingKey(key, name.to_owned())),
                Some(value) if value.trim().is_empty() => {
                    Err(Error::EmptyKey(key, name.to_owned()))
                }
                Some(value) => Ok(value.trim().to_owned()),
            }
        };

        Ok(Self {
            cluster_id: get(DB_CLUSTER_NAME)?,
            instance_id: get(DB_INSTANCE_NAME)?,
        })
    }

    /// returns a config map holding the record
    pub fn to_configmap(&self, name: Option<String>, namespace: Option<String>) -> ConfigMap {
        let metadata = ObjectMeta {
            name: Some(name.unwrap_or_else(|| self.name())),
            namespace,
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                env!("CARGO_PKG_NAME").to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                CREATED_AT_ANNOTATION.to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            )])),
            ..Default::default()
        };

        ConfigMap {
            metadata,
            data: Some(self.data()),
            ..Default::default()
        }
    }
}

impl TryFrom<&ConfigMap> for ResourceRecord {
    type Error = Error;

    fn try_from(configmap: &ConfigMap) -> Result<Self, Self::Error> {
        let name = configmap
            .metadata
            .name
            .to_owned()
            .unwrap_or_else(|| "<none>".to_string());

        let data = configmap
            .data
            .as_ref()
            .ok_or_else(|| Error::MissingData(name.to_owned()))?;

        Self::from_data(&name, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configmap_holds_both_identifiers() {
        let record = ResourceRecord::new("c1", "i1");
        let configmap = record.to_configmap(None, Some("default".into()));

        assert_eq!(configmap.metadata.name.as_deref(), Some("c1-record"));
        assert_eq!(configmap.metadata.namespace.as_deref(), Some("default"));

        let data = configmap.data.as_ref().expect("config map to have data");
        assert_eq!(data.get(DB_CLUSTER_NAME).map(String::as_str), Some("c1"));
        assert_eq!(data.get(DB_INSTANCE_NAME).map(String::as_str), Some("i1"));

        assert_eq!(ResourceRecord::try_from(&configmap), Ok(record));
    }

    #[test]
    fn missing_instance_name_is_an_error() {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some("legacy".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                DB_CLUSTER_NAME.to_string(),
                "kontrol-plane-db-cluster".to_string(),
            )])),
            ..Default::default()
        };

        assert_eq!(
            ResourceRecord::try_from(&configmap),
            Err(Error::MissingKey(DB_INSTANCE_NAME, "legacy".into()))
        );
    }

    #[test]
    fn serialized_record_uses_configmap_keys() {
        let value = serde_json::to_value(ResourceRecord::new("c1", "i1"))
            .expect("record to be serialized");

        assert_eq!(
            value,
            serde_json::json!({"DB_CLUSTER_NAME": "c1", "DB_INSTANCE_NAME": "i1"})
        );
    }

    #[test]
    fn parse_record_from_configmap_or_mapping() {
        let configmap = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: orders-record
  namespace: shop
data:
  DB_CLUSTER_NAME: orders-x7k2m9qa
  DB_INSTANCE_NAME: orders-x7k2m9qa-instance-1
"#;

        let mapping = "DB_CLUSTER_NAME: c1\nDB_INSTANCE_NAME: i1\n";

        assert_eq!(
            ResourceRecord::from_yaml(configmap),
            Ok(ResourceRecord::new("orders-x7k2m9qa", "orders-x7k2m9qa-instance-1"))
        );
        assert_eq!(ResourceRecord::from_yaml(mapping), Ok(ResourceRecord::new("c1", "i1")));
        assert_eq!(
            ResourceRecord::from_yaml("DB_CLUSTER_NAME: c1\n"),
            Err(Error::MissingKey(DB_INSTANCE_NAME, "<document>".into()))
        );
        assert!(matches!(
            ResourceRecord::from_yaml("- c1\n- i1\n"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn empty_identifier_is_rejected_from_any_source() {
        let mapping = "DB_CLUSTER_NAME: ''\nDB_INSTANCE_NAME: i1\n";
        let configmap = ResourceRecord::new("  ", "i1").to_configmap(Some("blank".into()), None);

        assert_eq!(
            ResourceRecord::from_yaml(mapping),
            Err(Error::EmptyKey(DB_CLUSTER_NAME, "<document>".into()))
        );
        assert_eq!(
            ResourceRecord::try_from(&configmap),
            Err(Error::EmptyKey(DB_CLUSTER_NAME, "blank".into()))
        );
    }

    #[test]
    fn generated_identifiers_are_unique_and_valid() {
        let first = ResourceRecord::generate("orders");
        let second = ResourceRecord::generate("orders");

        assert_ne!(first, second);
        assert!(first.cluster_id.starts_with("orders-"));
        assert!(first
            .instance_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
