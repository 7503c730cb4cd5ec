//! Process-wide context: the services and clients built at startup.
//!
//! All process-wide state lives here and is passed into request handlers
//! explicitly; there are no module-level globals.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ImageSourceConfig};
use crate::errors::ControllerError;
use crate::kubernetes::builder::LabBuilder;
use crate::kubernetes::node::NodeStorage;
use crate::kubernetes::storage::LabStorage;
use crate::registry::ImageSource;
use crate::registry::docker::DockerImageSource;
use crate::registry::google_artifact_registry::GARImageSource;
use crate::services::form::FormService;
use crate::services::gafaelfawr::GafaelfawrClient;
use crate::services::image_service::ImageService;
use crate::services::lab_manager::LabManager;
use crate::services::prepuller::Prepuller;
use crate::services::slack::SlackWebhookClient;

pub struct ProcessContext {
    pub config: Arc<Config>,
    pub gafaelfawr: GafaelfawrClient,
    pub image_service: Arc<ImageService>,
    pub lab_manager: Arc<LabManager>,
    pub prepuller: Arc<Prepuller>,
    pub form: FormService,
    pub slack: SlackWebhookClient,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessContext {
    /// Build all services from configuration and a Kubernetes client.
    pub async fn new(config: Arc<Config>) -> Result<Self, ControllerError> {
        let http = reqwest::Client::new();
        let kube_client = kube::Client::try_default().await.map_err(|e| {
            ControllerError::Kubernetes {
                message: "Error creating Kubernetes client".to_string(),
                user: None,
                kind: "Client".to_string(),
                namespace: None,
                name: String::new(),
                status: None,
                body: Some(e.to_string()),
            }
        })?;
        Self::with_kube_client(config, http, kube_client).await
    }

    /// Build services against an explicit Kubernetes client.
    pub async fn with_kube_client(
        config: Arc<Config>,
        http: reqwest::Client,
        kube_client: kube::Client,
    ) -> Result<Self, ControllerError> {
        let source: Arc<dyn ImageSource> = match &config.images.source {
            ImageSourceConfig::Docker(docker) => Arc::new(DockerImageSource::new(
                http.clone(),
                docker.clone(),
                config.images.clone(),
            )?),
            ImageSourceConfig::Google(gar) => {
                Arc::new(GARImageSource::new(gar.clone(), config.images.clone()).await?)
            }
        };

        let storage = LabStorage::new(kube_client.clone());
        let node_storage = NodeStorage::new(kube_client);
        let builder = Arc::new(LabBuilder::new(config.clone()));
        let slack = SlackWebhookClient::new(http.clone(), config.slack_webhook.clone());
        let gafaelfawr = GafaelfawrClient::new(http, &config.gafaelfawr);
        let image_service = Arc::new(ImageService::new(config.clone(), source, node_storage));
        let lab_manager = Arc::new(LabManager::new(
            config.clone(),
            storage.clone(),
            builder.clone(),
            image_service.clone(),
            slack.clone(),
        ));
        let prepuller = Arc::new(Prepuller::new(
            config.clone(),
            image_service.clone(),
            storage,
            builder,
            slack.clone(),
        ));
        let form = FormService::new(config.clone())?;

        Ok(ProcessContext {
            config,
            gafaelfawr,
            image_service,
            lab_manager,
            prepuller,
            form,
            slack,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the background services.
    ///
    /// The initial image refresh and reconciliation run in the foreground so
    /// the controller starts with a complete view of cluster state; the
    /// periodic loops and the prepuller then continue in the background.
    pub async fn start_background_services(&self) -> Result<(), ControllerError> {
        self.image_service.refresh().await?;
        self.lab_manager.reconcile().await?;

        let mut background = self.background.lock().expect("background task lock poisoned");
        background.push(tokio::spawn(
            self.image_service.clone().refresher(self.shutdown.clone()),
        ));
        background.push(tokio::spawn(
            self.lab_manager.clone().reconciler(self.shutdown.clone()),
        ));
        background.push(tokio::spawn(self.prepuller.clone().run(self.shutdown.clone())));
        Ok(())
    }

    /// Stop the background services and wait for them to exit.
    pub async fn stop_background_services(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().expect("background task lock poisoned");
            background.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}
