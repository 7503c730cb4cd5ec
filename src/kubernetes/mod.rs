//! Kubernetes storage layer.
//!
//! Wraps the cluster API with typed errors and the small set of operations
//! the controller needs: creating and deleting lab objects, watching pods,
//! and inspecting nodes.

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::ControllerError;

pub mod builder;
pub mod node;
pub mod storage;

/// Create a namespaced object, mapping failures to a typed error naming the
/// object.
pub async fn kube_create<K>(
    client: &kube::Client,
    namespace: &str,
    resource: &K,
    user: Option<&str>,
) -> Result<(), ControllerError>
where
    K: Clone + DeserializeOwned + Debug + Serialize,
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = resource.name_any();
    debug!("Creating {kind} {namespace}/{name}");
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), resource)
        .await
        .map_err(|e| ControllerError::from_kube(e, "creating object", user, &kind, Some(namespace), &name))?;
    Ok(())
}

/// Read a namespaced object, mapping a 404 to a missing-object error.
pub async fn kube_read<K>(
    client: &kube::Client,
    namespace: &str,
    name: &str,
    user: Option<&str>,
) -> Result<K, ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(resource) => Ok(resource),
        Err(kube::Error::Api(response)) if response.code == 404 => Err(ControllerError::MissingObject {
            message: format!("{kind} {namespace}/{name} not found"),
            user: user.map(|u| u.to_string()),
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }),
        Err(error) => Err(ControllerError::from_kube(
            error,
            "reading object",
            user,
            &kind,
            Some(namespace),
            name,
        )),
    }
}

/// Read a namespaced object if it exists.
pub async fn kube_read_optional<K>(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await {
        Ok(resource) => Ok(resource),
        Err(error) => Err(ControllerError::from_kube(
            error,
            "reading object",
            None,
            &kind,
            Some(namespace),
            name,
        )),
    }
}

/// Delete a namespaced object, treating a 404 as success.
pub async fn kube_delete<K>(
    client: &kube::Client,
    namespace: &str,
    name: &str,
    user: Option<&str>,
) -> Result<(), ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    debug!("Deleting {kind} {namespace}/{name}");
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(ControllerError::from_kube(
            error,
            "deleting object",
            user,
            &kind,
            Some(namespace),
            name,
        )),
    }
}
