//! The lab lifecycle manager.
//!
//! One state machine per user drives creation, monitoring, and deletion of
//! the lab pod and its supporting objects. Operations for a single user are
//! serialized by a per-user async lock; spawns run as background tasks that
//! publish progress to the user's event log and can be cancelled by a
//! concurrent delete. A periodic reconciler brings in-memory state back
//! into agreement with Kubernetes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::ControllerError;
use crate::events::{EventLog, SpawnEvent};
use crate::kubernetes::builder::LabBuilder;
use crate::kubernetes::storage::{LabStorage, PodChange};
use crate::models::gafaelfawr::GafaelfawrUser;
use crate::models::image::RSPImage;
use crate::models::kubernetes::PodPhase;
use crate::models::lab::{
    LabRequestOptions, LabResources, LabSpecification, LabState, LabStatus, ResourceQuantity, UserInfo,
};
use crate::services::image_service::ImageService;
use crate::services::slack::SlackWebhookClient;

const PROGRESS_ORPHAN: u8 = 1;
const PROGRESS_INITIATED: u8 = 2;
const PROGRESS_NAMESPACE: u8 = 10;
const PROGRESS_OBJECTS: u8 = 25;
const PROGRESS_POD_REQUESTED: u8 = 45;
const PROGRESS_POD_RUNNING: u8 = 75;

/// Annotation holding the serialized request options on the lab pod.
const OPTIONS_ANNOTATION: &str = "nublado.lsst.io/user-options";

/// Annotation holding the serialized user identity on the lab pod.
const USER_ANNOTATION: &str = "nublado.lsst.io/user-info";

#[derive(Default)]
struct UserLabInner {
    state: Option<LabState>,
    events: Option<Arc<EventLog>>,
    created_at: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Per-user record: the async lock serializing operations, plus the state
/// mutated under a plain mutex by the spawner and monitor tasks.
#[derive(Default)]
struct UserLab {
    lock: AsyncMutex<()>,
    inner: StdMutex<UserLabInner>,
}

pub struct LabManager {
    config: Arc<Config>,
    storage: LabStorage,
    builder: Arc<LabBuilder>,
    image_service: Arc<ImageService>,
    slack: SlackWebhookClient,
    labs: StdMutex<HashMap<String, Arc<UserLab>>>,
}

impl LabManager {
    pub fn new(
        config: Arc<Config>,
        storage: LabStorage,
        builder: Arc<LabBuilder>,
        image_service: Arc<ImageService>,
        slack: SlackWebhookClient,
    ) -> Self {
        LabManager {
            config,
            storage,
            builder,
            image_service,
            slack,
            labs: StdMutex::new(HashMap::new()),
        }
    }

    fn lab_entry(&self, username: &str) -> Arc<UserLab> {
        let mut labs = self.labs.lock().expect("lab map lock poisoned");
        labs.entry(username.to_string()).or_default().clone()
    }

    fn existing_entry(&self, username: &str) -> Option<Arc<UserLab>> {
        self.labs.lock().expect("lab map lock poisoned").get(username).cloned()
    }

    /// Usernames with current lab state, sorted.
    pub fn list_users(&self) -> Vec<String> {
        let labs = self.labs.lock().expect("lab map lock poisoned");
        let mut users: Vec<String> = labs
            .iter()
            .filter(|(_, lab)| lab.inner.lock().expect("lab lock poisoned").state.is_some())
            .map(|(username, _)| username.clone())
            .collect();
        users.sort();
        users
    }

    /// Current state for a user's lab, if any.
    pub fn get_state(&self, username: &str) -> Option<LabState> {
        let lab = self.existing_entry(username)?;
        let inner = lab.inner.lock().expect("lab lock poisoned");
        inner.state.clone()
    }

    /// A fresh subscriber onto the user's event log.
    pub fn events_for(
        &self,
        username: &str,
    ) -> Result<impl Stream<Item = SpawnEvent> + Send + 'static + use<>, ControllerError> {
        let unknown = || ControllerError::UnknownUser {
            user: username.to_string(),
        };
        let lab = self.existing_entry(username).ok_or_else(unknown)?;
        let inner = lab.inner.lock().expect("lab lock poisoned");
        if inner.state.is_none() {
            return Err(unknown());
        }
        let events = inner.events.clone().ok_or_else(unknown)?;
        Ok(events.subscribe())
    }

    /// Begin creating a lab for a user.
    ///
    /// Validation and image resolution happen inline so that input errors
    /// surface in the HTTP response; the Kubernetes work happens in a
    /// background task that reports progress via the event log. Fails fast
    /// with a conflict if the user already has a live lab; residue from a
    /// failed or terminated lab is quietly removed first.
    pub async fn create(
        self: &Arc<Self>,
        user: GafaelfawrUser,
        spec: LabSpecification,
    ) -> Result<(), ControllerError> {
        let options = spec.options.normalize()?;
        let size_definition =
            self.config.lab.size_definition(options.size).ok_or(ControllerError::InvalidLabSize {
                size: options.size.to_string(),
            })?;
        let resources = size_definition.to_resources()?;
        if let Some(quota) = user.notebook_quota() {
            if !quota.spawn
                || resources.limits.cpu > quota.cpu
                || resources.limits.memory > quota.memory_bytes()
            {
                return Err(ControllerError::InsufficientQuota);
            }
        }
        let image = self.resolve_image(&options).await?;
        let username = user.username().to_string();

        let lab = self.lab_entry(&username);
        let _guard = lab.lock.lock().await;

        let (residue, old_cancel, old_task) = {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            match &inner.state {
                Some(state) if state.status.is_active() => {
                    return Err(ControllerError::LabExists { user: username });
                }
                Some(_) => (true, inner.cancel.take(), inner.task.take()),
                None => (false, inner.cancel.take(), inner.task.take()),
            }
        };
        if let Some(cancel) = old_cancel {
            cancel.cancel();
        }
        if let Some(task) = old_task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }

        let events = EventLog::new();
        let cancel = CancellationToken::new();
        let state = LabState {
            user: UserInfo::from_gafaelfawr(&user),
            options: options.clone(),
            env: spec.env.clone(),
            status: LabStatus::Pending,
            internal_url: self.builder.internal_url(&username),
            resources,
            quota: self.builder.quota_for_user(&user),
        };
        {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            inner.state = Some(state);
            inner.events = Some(events.clone());
            inner.created_at = Some(Utc::now());
            inner.cancel = Some(cancel.clone());
        }

        let manager = self.clone();
        let lab_for_task = lab.clone();
        let task = tokio::spawn(async move {
            let username = user.username().to_string();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ControllerError::Cancelled { user: username.clone() }),
                result = manager.spawn_lab(
                    &lab_for_task,
                    &user,
                    &options,
                    &spec.env,
                    &image,
                    &resources,
                    residue,
                    &events,
                ) => result,
            };
            manager.finish_spawn(&lab_for_task, &username, &events, result).await;
        });
        {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            inner.task = Some(task);
        }
        Ok(())
    }

    /// Resolve the requested image to a concrete, digest-pinned image.
    async fn resolve_image(&self, options: &LabRequestOptions) -> Result<RSPImage, ControllerError> {
        let reference_and_loc = if let Some(reference) = &options.image_list {
            Some((reference, "image_list"))
        } else {
            options.image_dropdown.as_ref().map(|reference| (reference, "image_dropdown"))
        };
        if let Some((reference, loc)) = reference_and_loc {
            let parsed = crate::models::docker::DockerReference::parse(reference).map_err(
                |error| match error {
                    ControllerError::InvalidDockerReference { reference, .. } => {
                        ControllerError::InvalidDockerReference {
                            reference,
                            loc: Some(loc),
                        }
                    }
                    other => other,
                },
            )?;
            return self.image_service.image_for_reference(&parsed, Some(loc)).await;
        }
        if let Some(class) = options.image_class {
            return self.image_service.image_for_class(class);
        }
        if let Some(tag) = &options.image_tag {
            return self.image_service.image_for_tag_name(tag).await;
        }
        Err(ControllerError::InvalidOptions {
            msg: "No image to spawn specified".to_string(),
            loc: Some("image_list"),
        })
    }

    /// The spawn task body: build and create all Kubernetes objects, then
    /// monitor the pod to a terminal state.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_lab(
        &self,
        lab: &Arc<UserLab>,
        user: &GafaelfawrUser,
        options: &LabRequestOptions,
        env: &BTreeMap<String, String>,
        image: &RSPImage,
        resources: &LabResources,
        residue: bool,
        events: &Arc<EventLog>,
    ) -> Result<(), ControllerError> {
        let username = user.username();
        let namespace = self.builder.namespace_name(username);

        if residue {
            events.publish(SpawnEvent::info("Deleting existing orphaned lab", PROGRESS_ORPHAN));
            self.storage
                .delete_namespace(&namespace, Some(username), self.config.lab.delete_timeout)
                .await?;
        }
        events.publish(SpawnEvent::info("Lab creation initiated", PROGRESS_INITIATED));

        let secret_data = self.read_source_secrets(username).await?;
        let pull_secret_data = match &self.config.lab.pull_secret {
            Some(name) => Some(
                self.storage
                    .read_secret(&self.config.lab.controller_namespace, name, Some(username))
                    .await?
                    .data
                    .unwrap_or_default(),
            ),
            None => None,
        };
        let objects =
            self.builder.build_lab(user, options, env, image, resources, secret_data, pull_secret_data);

        self.storage.create_namespace(&objects.namespace, Some(username)).await?;
        events.publish(SpawnEvent::info("Created user namespace", PROGRESS_NAMESPACE));

        self.storage.create_supporting_objects(&objects, Some(username)).await?;
        events.publish(SpawnEvent::info("Created user lab objects", PROGRESS_OBJECTS));

        self.storage.create_pod(&objects.pod, Some(username)).await?;
        events.publish(SpawnEvent::info("Pod requested", PROGRESS_POD_REQUESTED));

        self.monitor_spawn(lab, username, &namespace, events).await
    }

    /// Read the configured source secrets from the controller namespace.
    async fn read_source_secrets(
        &self,
        username: &str,
    ) -> Result<BTreeMap<String, ByteString>, ControllerError> {
        let mut cache: HashMap<String, BTreeMap<String, ByteString>> = HashMap::new();
        let mut data = BTreeMap::new();
        for secret in &self.config.lab.secrets {
            if !cache.contains_key(&secret.secret_name) {
                let source = self
                    .storage
                    .read_secret(
                        &self.config.lab.controller_namespace,
                        &secret.secret_name,
                        Some(username),
                    )
                    .await?;
                cache.insert(secret.secret_name.clone(), source.data.unwrap_or_default());
            }
            let source = &cache[&secret.secret_name];
            let value = source.get(&secret.secret_key).ok_or_else(|| ControllerError::MissingObject {
                message: format!(
                    "No key {} in secret {}/{}",
                    secret.secret_key, self.config.lab.controller_namespace, secret.secret_name
                ),
                user: Some(username.to_string()),
                kind: "Secret".to_string(),
                namespace: Some(self.config.lab.controller_namespace.clone()),
                name: secret.secret_name.clone(),
            })?;
            data.insert(secret.secret_key.clone(), value.clone());
        }
        Ok(data)
    }

    /// Watch the lab pod until it reaches a terminal condition, relaying
    /// Kubernetes events as progress.
    async fn monitor_spawn(
        &self,
        lab: &Arc<UserLab>,
        username: &str,
        namespace: &str,
        events: &Arc<EventLog>,
    ) -> Result<(), ControllerError> {
        let pod_name = LabBuilder::object_name(username);
        let pod_watch = self.storage.watch_pod(namespace, &pod_name);
        let event_watch = self.storage.watch_pod_events(namespace, &pod_name);
        tokio::pin!(pod_watch);
        tokio::pin!(event_watch);

        let started_at = Utc::now();
        let deadline = tokio::time::sleep(self.config.lab.spawn_timeout);
        tokio::pin!(deadline);
        let mut progress = PROGRESS_POD_REQUESTED;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ControllerError::Timeout {
                        operation: "Lab spawn".to_string(),
                        user: Some(username.to_string()),
                        started_at,
                        failed_at: Utc::now(),
                    });
                }
                Some(change) = pod_watch.next() => match change? {
                    PodChange::Phase(PodPhase::Running) => {
                        events.publish(SpawnEvent::info(
                            format!("Pod successfully spawned for {username}"),
                            PROGRESS_POD_RUNNING,
                        ));
                        self.set_status(lab, LabStatus::Running);
                        events.publish(SpawnEvent::complete("Lab Kubernetes pod started"));
                        return Ok(());
                    }
                    PodChange::Phase(PodPhase::Succeeded) => {
                        self.set_status(lab, LabStatus::Terminated);
                        events.publish(SpawnEvent::complete("Lab Kubernetes pod exited"));
                        return Ok(());
                    }
                    PodChange::Phase(PodPhase::Failed) => {
                        return Err(ControllerError::Kubernetes {
                            message: "Error spawning pod".to_string(),
                            user: Some(username.to_string()),
                            kind: "Pod".to_string(),
                            namespace: Some(namespace.to_string()),
                            name: pod_name.clone(),
                            status: None,
                            body: Some("Pod entered Failed phase".to_string()),
                        });
                    }
                    PodChange::Phase(PodPhase::Pending) | PodChange::Phase(PodPhase::Unknown) => (),
                    PodChange::Deleted => {
                        return Err(ControllerError::MissingObject {
                            message: format!("Pod {namespace}/{pod_name} deleted while spawning"),
                            user: Some(username.to_string()),
                            kind: "Pod".to_string(),
                            namespace: Some(namespace.to_string()),
                            name: pod_name.clone(),
                        });
                    }
                },
                Some(message) = event_watch.next() => {
                    progress += (PROGRESS_POD_RUNNING - progress) / 3;
                    events.publish(SpawnEvent::info(message, progress));
                }
            }
        }
    }

    /// Handle the outcome of a spawn or monitor task.
    async fn finish_spawn(
        &self,
        lab: &Arc<UserLab>,
        username: &str,
        events: &Arc<EventLog>,
        result: Result<(), ControllerError>,
    ) {
        match result {
            Ok(()) => (),
            Err(ControllerError::Cancelled { .. }) => {
                // A concurrent delete cancelled the spawn and will clean up
                // the namespace itself; just end the stream.
                events.publish(SpawnEvent::failed("Lab spawn cancelled"));
            }
            Err(error) => {
                error!("Lab spawn for {username} failed: {error}");
                events.publish(SpawnEvent::error(error.to_string()));
                events.publish(SpawnEvent::failed("Lab spawn failed"));
                self.set_status(lab, LabStatus::Failed);
                self.slack.post_error(&error);
                let namespace = self.builder.namespace_name(username);
                if let Err(error) = self
                    .storage
                    .delete_namespace(&namespace, Some(username), self.config.lab.delete_timeout)
                    .await
                {
                    error!("Error deleting namespace {namespace}: {error}");
                }
            }
        }
    }

    fn set_status(&self, lab: &Arc<UserLab>, status: LabStatus) {
        let mut inner = lab.inner.lock().expect("lab lock poisoned");
        if let Some(state) = &mut inner.state {
            state.status = status;
        }
    }

    /// Delete a user's lab.
    ///
    /// Idempotent under concurrency: every concurrent delete sees either
    /// success or absence, exactly one does the cleanup work, and no alerts
    /// are emitted for the losers.
    pub async fn delete(&self, username: &str) -> Result<(), ControllerError> {
        let unknown = || ControllerError::UnknownUser {
            user: username.to_string(),
        };
        let lab = self.existing_entry(username).ok_or_else(unknown)?;

        // Cancel any in-flight spawn before waiting for the lock so the
        // spawner releases promptly.
        let (cancel, task) = {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            if inner.state.is_none() {
                return Err(unknown());
            }
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }

        let _guard = lab.lock.lock().await;
        {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            match &mut inner.state {
                None => return Err(unknown()),
                Some(state) => state.status = LabStatus::Terminating,
            }
        }

        let namespace = self.builder.namespace_name(username);
        self.storage
            .delete_namespace(&namespace, Some(username), self.config.lab.delete_timeout)
            .await?;

        let mut inner = lab.inner.lock().expect("lab lock poisoned");
        inner.state = None;
        inner.created_at = None;
        if let Some(events) = inner.events.take() {
            if !events.is_closed() {
                events.publish(SpawnEvent::failed("Lab deleted"));
            }
        }
        Ok(())
    }

    /// Reconcile in-memory state against Kubernetes.
    ///
    /// Walks the lab namespaces, synthesizing state for labs the controller
    /// doesn't know about, reaping exited labs, and dropping state whose
    /// backing objects are gone. Namespaces younger than the spawn grace
    /// period are left alone so a half-built lab is not torn down.
    pub async fn reconcile(self: &Arc<Self>) -> Result<(), ControllerError> {
        let prefix = &self.config.lab.namespace_prefix;
        let namespaces = self.storage.list_namespaces(prefix).await?;
        let mut seen = HashSet::new();

        for namespace in namespaces {
            let Some(ns_name) = namespace.metadata.name.clone() else {
                continue;
            };
            let Some(username) = ns_name.strip_prefix(&format!("{prefix}-")).map(String::from) else {
                continue;
            };
            seen.insert(username.clone());

            let pod_name = LabBuilder::object_name(&username);
            let pod = self.storage.read_pod(&ns_name, &pod_name).await?;
            let lab = self.lab_entry(&username);
            let (status, created_at) = {
                let inner = lab.inner.lock().expect("lab lock poisoned");
                (inner.state.as_ref().map(|state| state.status), inner.created_at)
            };

            let within_grace = |time: Option<DateTime<Utc>>| {
                time.is_some_and(|time| {
                    Utc::now() - time
                        < chrono::Duration::from_std(self.config.lab.spawn_grace_period)
                            .unwrap_or_default()
                })
            };

            match (pod, status) {
                (None, None) => {
                    // A namespace with no pod and no state record: either a
                    // lab mid-spawn (leave it alone) or debris.
                    let namespace_age = namespace.metadata.creation_timestamp.map(|t| t.0);
                    if !within_grace(namespace_age) {
                        info!("Reaping empty lab namespace {ns_name}");
                        self.delete_reconciled(&lab, &username, &ns_name).await;
                    }
                }
                (None, Some(_)) => {
                    if !within_grace(created_at) {
                        info!("Lab pod for {username} is gone, dropping state");
                        self.delete_reconciled(&lab, &username, &ns_name).await;
                    }
                }
                (Some(pod), state) => {
                    let phase = PodPhase::from_pod(&pod);
                    match (phase, state) {
                        (PodPhase::Succeeded | PodPhase::Failed, None) => {
                            info!("Reaping exited lab for {username}");
                            self.delete_reconciled(&lab, &username, &ns_name).await;
                        }
                        (_, Some(LabStatus::Terminated)) => {
                            info!("Reaping terminated lab for {username}");
                            self.delete_reconciled(&lab, &username, &ns_name).await;
                        }
                        (PodPhase::Running | PodPhase::Pending, None) => {
                            self.adopt_lab(&lab, &username, &ns_name, &pod, phase).await;
                        }
                        _ => (),
                    }
                }
            }
        }

        // Drop state for users whose namespaces no longer exist.
        let labs: Vec<(String, Arc<UserLab>)> = {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            labs.iter().map(|(username, lab)| (username.clone(), lab.clone())).collect()
        };
        for (username, lab) in labs {
            if seen.contains(&username) {
                continue;
            }
            let stale = {
                let inner = lab.inner.lock().expect("lab lock poisoned");
                inner.state.is_some()
                    && inner.created_at.is_some_and(|created| {
                        Utc::now() - created
                            > chrono::Duration::from_std(self.config.lab.spawn_grace_period)
                                .unwrap_or_default()
                    })
            };
            if stale {
                info!("Namespace for {username} is gone, dropping state");
                let mut inner = lab.inner.lock().expect("lab lock poisoned");
                inner.state = None;
                inner.created_at = None;
                if let Some(cancel) = inner.cancel.take() {
                    cancel.cancel();
                }
            }
        }
        Ok(())
    }

    /// Drop state for a user and delete their namespace during reconcile.
    async fn delete_reconciled(&self, lab: &Arc<UserLab>, username: &str, namespace: &str) {
        {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            inner.state = None;
            inner.created_at = None;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
        }
        if let Err(error) = self
            .storage
            .delete_namespace(namespace, Some(username), self.config.lab.delete_timeout)
            .await
        {
            error!("Error deleting namespace {namespace}: {error}");
            self.slack.post_error(&error);
        }
    }

    /// Synthesize state for a lab found in Kubernetes with no state record.
    async fn adopt_lab(
        self: &Arc<Self>,
        lab: &Arc<UserLab>,
        username: &str,
        namespace: &str,
        pod: &Pod,
        phase: PodPhase,
    ) {
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let options: Option<LabRequestOptions> = annotations
            .get(OPTIONS_ANNOTATION)
            .and_then(|raw| serde_json::from_str(raw).ok());
        let user: Option<UserInfo> =
            annotations.get(USER_ANNOTATION).and_then(|raw| serde_json::from_str(raw).ok());
        let (Some(options), Some(user)) = (options, user) else {
            warn!("Lab pod for {username} has no state annotations, skipping");
            return;
        };
        let Some(resources) = self
            .config
            .lab
            .size_definition(options.size)
            .and_then(|definition| definition.to_resources().ok())
        else {
            warn!("Lab for {username} has unknown size {}, skipping", options.size);
            return;
        };

        let env = self
            .read_lab_env(namespace, username)
            .await
            .unwrap_or_default();
        let quota = self
            .storage
            .read_quota(namespace, &LabBuilder::object_name(username))
            .await
            .ok()
            .flatten()
            .map(|(cpu, memory)| ResourceQuantity { cpu, memory });

        let status = LabStatus::from_phase(phase);
        let state = LabState {
            user,
            options,
            env,
            status,
            internal_url: self.builder.internal_url(username),
            resources,
            quota,
        };

        info!("Adopted lab for {username} in status {status:?}");
        let events = EventLog::new();
        if status == LabStatus::Running {
            events.publish(SpawnEvent::complete("Lab Kubernetes pod started"));
        }
        let cancel = CancellationToken::new();
        {
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            inner.state = Some(state);
            inner.events = Some(events.clone());
            inner.created_at = Some(Utc::now());
            inner.cancel = Some(cancel.clone());
        }

        // A pending lab still needs a monitor to drive it to running.
        if status == LabStatus::Pending {
            let manager = self.clone();
            let lab_for_task = lab.clone();
            let username = username.to_string();
            let namespace = namespace.to_string();
            let task = tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(ControllerError::Cancelled { user: username.clone() }),
                    result = manager.monitor_spawn(&lab_for_task, &username, &namespace, &events) => result,
                };
                manager.finish_spawn(&lab_for_task, &username, &events, result).await;
            });
            let mut inner = lab.inner.lock().expect("lab lock poisoned");
            inner.task = Some(task);
        }
    }

    /// Read the lab's environment ConfigMap back into an env map.
    async fn read_lab_env(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<BTreeMap<String, String>, ControllerError> {
        let name = format!("{}-env", LabBuilder::object_name(username));
        let config_map = crate::kubernetes::kube_read_optional::<
            k8s_openapi::api::core::v1::ConfigMap,
        >(self.storage.client(), namespace, &name)
        .await?;
        Ok(config_map.and_then(|cm| cm.data).unwrap_or_default())
    }

    /// Run reconciliation periodically until cancelled.
    ///
    /// The initial reconciliation runs in the foreground during startup, so
    /// this loop sleeps first.
    pub async fn reconciler(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.lab.reconcile_interval) => (),
            }
            if let Err(error) = self.reconcile().await {
                error!("Error reconciling lab state: {error}");
                self.slack.post_error(&error);
            }
        }
    }
}
