//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::{api::core::v1::ConfigMap, NamespaceResourceScope};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_NAMESPACE: &str = "default";

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to compute patch of resource '{0}/{1}', {2}")]
    Diff(String, String, serde_json::Error),
    #[error("failed to retrieve resource '{0}/{1}', {2}")]
    Get(String, String, kube::Error),
    #[error("failed to create resource '{0}/{1}', {2}")]
    Create(String, String, kube::Error),
    #[error("failed to patch resource '{0}/{1}', {2}")]
    Patch(String, String, kube::Error),
    #[error("failed to delete resource '{0}/{1}', {2}")]
    Delete(String, String, kube::Error),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the namespace and name of the kubernetes resource, the namespace
/// defaults to [`DEFAULT_NAMESPACE`]
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        obj.name_any(),
    )
}

/// returns difference between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if 404 == response.code)
}

/// returns the resource with the given name, `None` if it does not exist
pub async fn get<T>(client: Client, namespace: &str, name: &str) -> Result<Option<T>, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    debug!(name = name, namespace = namespace, "Execute get request on resource");
    Api::<T>::namespaced(client, namespace)
        .get_opt(name)
        .await
        .map_err(|err| Error::Get(namespace.to_owned(), name.to_owned(), err))
}

/// make a patch request on the given resource using the given patch
pub async fn patch<T>(client: Client, obj: &T, patch: json_patch::Patch) -> Result<T, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if patch.0.is_empty() {
        debug!(
            name = &name,
            namespace = &namespace,
            "Skip patch request on resource, no operation to apply"
        );
        return Ok(obj.to_owned());
    }

    debug!(
        name = &name,
        namespace = &namespace,
        operations = patch.0.len(),
        "Execute patch request on resource"
    );
    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
        .map_err(|err| Error::Patch(namespace, name, err))
}

/// deletes the given resource, a resource which does not exist is
/// considered deleted
pub async fn delete<T>(client: Client, namespace: &str, name: &str) -> Result<(), Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    debug!(name = name, namespace = namespace, "Execute delete request on resource");
    match Api::<T>::namespaced(client, namespace)
        .delete(name, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => {
            debug!(
                name = name,
                namespace = namespace,
                "Resource does not exist, nothing to delete"
            );
            Ok(())
        }
        Err(err) => Err(Error::Delete(namespace.to_owned(), name.to_owned(), err)),
    }
}

/// creates the config map or patches the existing one with the data, labels
/// and annotations of the given one
pub async fn upsert_configmap(client: Client, configmap: &ConfigMap) -> Result<ConfigMap, Error> {
    let (namespace, name) = namespaced_name(configmap);

    let existing = match get::<ConfigMap>(client.to_owned(), &namespace, &name).await? {
        Some(existing) => existing,
        None => {
            debug!(name = &name, namespace = &namespace, "Execute create request on config map");
            return Api::namespaced(client, &namespace)
                .create(&PostParams::default(), configmap)
                .await
                .map_err(|err| Error::Create(namespace, name, err));
        }
    };

    let mut modified = existing.to_owned();
    modified.data = configmap.data.to_owned();
    modified
        .labels_mut()
        .extend(configmap.labels().to_owned());
    modified
        .annotations_mut()
        .extend(configmap.annotations().to_owned());

    let operations = diff(&existing, &modified)
        .map_err(|err| Error::Diff(namespace.to_owned(), name.to_owned(), err))?;

    patch(client, &modified, operations).await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn namespace_defaults() {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some("c1-record".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            namespaced_name(&configmap),
            (DEFAULT_NAMESPACE.to_string(), "c1-record".to_string())
        );
    }

    #[test]
    fn diff_only_contains_changes() {
        let origin = ConfigMap {
            data: Some(BTreeMap::from([("DB_CLUSTER_NAME".to_string(), "c1".to_string())])),
            ..Default::default()
        };

        let mut modified = origin.to_owned();
        modified.data = Some(BTreeMap::from([("DB_CLUSTER_NAME".to_string(), "c2".to_string())]));

        let patch = diff(&origin, &modified).expect("diff to be computed");
        assert_eq!(patch.0.len(), 1);
        assert!(diff(&origin, &origin).expect("diff to be computed").0.is_empty());
    }
}
