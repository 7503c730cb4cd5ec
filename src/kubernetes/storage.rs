//! Storage adapter for lab and prepull objects.
//!
//! All methods translate Kubernetes API failures into typed errors naming
//! the object involved, so the lab manager can surface them as progress
//! events and Slack alerts without knowing kube internals.

use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Event as CoreEvent, Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::runtime::watcher;

use crate::errors::ControllerError;
use crate::kubernetes::builder::LabObjects;
use crate::kubernetes::{kube_create, kube_delete, kube_read, kube_read_optional};
use crate::models::kubernetes::PodPhase;

/// A change to a watched pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodChange {
    Phase(PodPhase),
    Deleted,
}

/// Wraps the Kubernetes API for lab object management.
#[derive(Clone)]
pub struct LabStorage {
    client: kube::Client,
}

impl LabStorage {
    pub fn new(client: kube::Client) -> Self {
        LabStorage { client }
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub async fn create_namespace(
        &self,
        namespace: &Namespace,
        user: Option<&str>,
    ) -> Result<(), ControllerError> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await.map_err(|e| {
            ControllerError::from_kube(e, "creating namespace", user, "Namespace", None, &name)
        })?;
        Ok(())
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(name).await {
            Ok(namespace) => Ok(namespace),
            Err(error) => Err(ControllerError::from_kube(
                error,
                "reading namespace",
                None,
                "Namespace",
                None,
                name,
            )),
        }
    }

    /// List lab namespaces matching the configured prefix.
    pub async fn list_namespaces(&self, prefix: &str) -> Result<Vec<Namespace>, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await.map_err(|e| {
            ControllerError::from_kube(e, "listing namespaces", None, "Namespace", None, "")
        })?;
        let wanted = format!("{prefix}-");
        Ok(namespaces
            .items
            .into_iter()
            .filter(|namespace| {
                namespace
                    .metadata
                    .name
                    .as_ref()
                    .is_some_and(|name| name.starts_with(&wanted))
            })
            .collect())
    }

    /// Delete a namespace and wait for it to disappear.
    ///
    /// Returns false if the namespace did not exist. Deleting a namespace
    /// deletes every lab object inside it.
    pub async fn delete_namespace(
        &self,
        name: &str,
        user: Option<&str>,
        timeout: Duration,
    ) -> Result<bool, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let started_at = Utc::now();
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => (),
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(false),
            Err(error) => {
                return Err(ControllerError::from_kube(
                    error,
                    "deleting namespace",
                    user,
                    "Namespace",
                    None,
                    name,
                ));
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get_namespace(name).await?.is_none() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControllerError::Timeout {
                    operation: format!("Deletion of namespace {name}"),
                    user: user.map(|u| u.to_string()),
                    started_at,
                    failed_at: Utc::now(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Read a source secret from the controller namespace.
    pub async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
        user: Option<&str>,
    ) -> Result<Secret, ControllerError> {
        kube_read::<Secret>(&self.client, namespace, name, user).await
    }

    /// Create the supporting objects for a lab: quota, network policy,
    /// service, secrets, and config maps. The namespace and pod are created
    /// separately so progress events can bracket them.
    pub async fn create_supporting_objects(
        &self,
        objects: &LabObjects,
        user: Option<&str>,
    ) -> Result<(), ControllerError> {
        let namespace = objects
            .namespace
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        for secret in &objects.secrets {
            kube_create(&self.client, &namespace, secret, user).await?;
        }
        for config_map in &objects.config_maps {
            kube_create::<ConfigMap>(&self.client, &namespace, config_map, user).await?;
        }
        if let Some(quota) = &objects.quota {
            kube_create(&self.client, &namespace, quota, user).await?;
        }
        kube_create::<NetworkPolicy>(&self.client, &namespace, &objects.network_policy, user).await?;
        kube_create::<Service>(&self.client, &namespace, &objects.service, user).await?;
        Ok(())
    }

    pub async fn create_pod(&self, pod: &Pod, user: Option<&str>) -> Result<(), ControllerError> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        kube_create(&self.client, &namespace, pod, user).await
    }

    pub async fn read_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ControllerError> {
        kube_read_optional::<Pod>(&self.client, namespace, name).await
    }

    pub async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        user: Option<&str>,
    ) -> Result<(), ControllerError> {
        kube_delete::<Pod>(&self.client, namespace, name, user).await
    }

    pub async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let pods = api.list(&params).await.map_err(|e| {
            ControllerError::from_kube(e, "listing pods", None, "Pod", Some(namespace), "")
        })?;
        Ok(pods.items)
    }

    /// Watch one pod for phase changes and deletion.
    ///
    /// This is a watch-with-resync: the watcher lists on (re)start, so
    /// missed events are recovered by observing current state.
    pub fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Stream<Item = Result<PodChange, ControllerError>> + Send + use<> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let namespace = namespace.to_string();
        let name = name.to_string();
        watcher(api, config)
            .map(move |event| match event {
                Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                    Ok(Some(PodChange::Phase(PodPhase::from_pod(&pod))))
                }
                Ok(watcher::Event::Delete(_)) => Ok(Some(PodChange::Deleted)),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => Ok(None),
                Err(error) => Err(ControllerError::Kubernetes {
                    message: "Error watching pod".to_string(),
                    user: None,
                    kind: "Pod".to_string(),
                    namespace: Some(namespace.clone()),
                    name: name.clone(),
                    status: None,
                    body: Some(error.to_string()),
                }),
            })
            .filter_map(|item| async move { item.transpose() })
    }

    /// Watch the Kubernetes events pertaining to one pod, yielding their
    /// messages.
    pub fn watch_pod_events(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> impl Stream<Item = String> + Send + use<> {
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), namespace);
        let fields = format!("involvedObject.kind=Pod,involvedObject.name={pod_name}");
        let config = watcher::Config::default().fields(&fields);
        watcher(api, config).filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(event)) | Ok(watcher::Event::InitApply(event)) => event.message,
                Ok(_) => None,
                Err(error) => {
                    debug!("Error watching pod events: {error}");
                    None
                }
            }
        })
    }

    /// Wait for a pod to reach a terminal phase, with a deadline.
    pub async fn wait_pod_terminal(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<PodPhase, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let started_at = Utc::now();
        let terminal = |obj: Option<&Pod>| {
            obj.is_some_and(|pod| {
                matches!(PodPhase::from_pod(pod), PodPhase::Succeeded | PodPhase::Failed)
            })
        };
        let result = tokio::time::timeout(timeout, await_condition(api.clone(), name, terminal)).await;
        match result {
            Ok(Ok(pod)) => Ok(pod.as_ref().map(PodPhase::from_pod).unwrap_or(PodPhase::Unknown)),
            Ok(Err(error)) => Err(ControllerError::Kubernetes {
                message: "Error watching pod".to_string(),
                user: None,
                kind: "Pod".to_string(),
                namespace: Some(namespace.to_string()),
                name: name.to_string(),
                status: None,
                body: Some(error.to_string()),
            }),
            Err(_) => Err(ControllerError::Timeout {
                operation: format!("Prepull pod {namespace}/{name}"),
                user: None,
                started_at,
                failed_at: Utc::now(),
            }),
        }
    }

    /// Read the resource quota actually applied to a lab namespace, if any.
    pub async fn read_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(f64, i64)>, ControllerError> {
        let quota = kube_read_optional::<k8s_openapi::api::core::v1::ResourceQuota>(
            &self.client,
            namespace,
            name,
        )
        .await?;
        let Some(hard) = quota.and_then(|quota| quota.spec).and_then(|spec| spec.hard) else {
            return Ok(None);
        };
        let cpu = hard.get("limits.cpu").and_then(parse_cpu_quantity);
        let memory = hard.get("limits.memory").and_then(parse_memory_quantity);
        match (cpu, memory) {
            (Some(cpu), Some(memory)) => Ok(Some((cpu, memory))),
            _ => Ok(None),
        }
    }
}

fn parse_cpu_quantity(quantity: &Quantity) -> Option<f64> {
    crate::unit_conversion::cpu_to_cores(&quantity.0).ok()
}

fn parse_memory_quantity(quantity: &Quantity) -> Option<i64> {
    crate::unit_conversion::memory_to_bytes(&quantity.0).ok()
}
