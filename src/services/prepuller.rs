//! Prepulls images to nodes by running short-lived pods.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::{PREPULL_INTERVAL, PREPULL_TIMEOUT};
use crate::errors::ControllerError;
use crate::kubernetes::builder::LabBuilder;
use crate::kubernetes::storage::LabStorage;
use crate::models::image::RSPImage;
use crate::models::kubernetes::PodPhase;
use crate::services::image_service::ImageService;
use crate::services::slack::SlackWebhookClient;

pub struct Prepuller {
    config: Arc<Config>,
    image_service: Arc<ImageService>,
    storage: LabStorage,
    builder: Arc<LabBuilder>,
    slack: SlackWebhookClient,
}

impl Prepuller {
    pub fn new(
        config: Arc<Config>,
        image_service: Arc<ImageService>,
        storage: LabStorage,
        builder: Arc<LabBuilder>,
        slack: SlackWebhookClient,
    ) -> Self {
        Prepuller {
            config,
            image_service,
            storage,
            builder,
            slack,
        }
    }

    /// Run the prepull loop until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if let Err(error) = self.prepull_missing(&shutdown).await {
                error!("Error prepulling images: {error}");
                self.slack.post_error(&error);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(PREPULL_INTERVAL) => (),
            }
        }
    }

    /// Prepull every missing image to every eligible node, one image at a
    /// time with bounded parallelism across nodes.
    pub async fn prepull_missing(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        for (image, nodes) in self.image_service.missing_images() {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            // Nodes may have vanished since the plan was computed; skip any
            // that are no longer eligible rather than treating them as
            // failures.
            let eligible = self.image_service.eligible_nodes();
            let nodes: Vec<String> = nodes.into_iter().filter(|node| eligible.contains(node)).collect();
            if nodes.is_empty() {
                continue;
            }
            info!("Prepulling {} to {} nodes", image.tag, nodes.len());

            let results = futures::stream::iter(nodes.into_iter().map(|node| {
                let image = image.clone();
                async move {
                    let result = self.prepull_to_node(&image, &node).await;
                    (node, result)
                }
            }))
            .buffer_unordered(self.config.prepuller.concurrency)
            .collect::<Vec<_>>()
            .await;

            for (node, result) in results {
                match result {
                    Ok(true) => self.image_service.mark_prepulled(&image.digest, &node),
                    Ok(false) => (),
                    Err(error) => {
                        error!("Error prepulling {} to {node}: {error}", image.tag);
                        self.slack.post_error(&error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pull one image to one node by running a pod that exits immediately.
    ///
    /// Returns true when the pull succeeded. A vanished node is reported as
    /// false, not as an error.
    async fn prepull_to_node(&self, image: &RSPImage, node: &str) -> Result<bool, ControllerError> {
        let namespace = &self.config.lab.controller_namespace;
        let pod = self.builder.build_prepull_pod(image, node);
        let name = pod.metadata.name.clone().unwrap_or_default();

        // A leftover pod with the same name means a previous attempt never
        // finished; remove it and start over.
        self.storage.delete_pod(namespace, &name, None).await?;
        self.storage.create_pod(&pod, None).await?;

        let phase = match self.storage.wait_pod_terminal(namespace, &name, PREPULL_TIMEOUT).await {
            Ok(phase) => phase,
            Err(error @ ControllerError::Timeout { .. }) => {
                self.storage.delete_pod(namespace, &name, None).await?;
                if self.image_service.eligible_nodes().contains(node) {
                    return Err(error);
                }
                info!("Node {node} disappeared during prepull of {}", image.tag);
                return Ok(false);
            }
            Err(error) => return Err(error),
        };

        self.storage.delete_pod(namespace, &name, None).await?;
        match phase {
            PodPhase::Succeeded => Ok(true),
            phase => {
                warn!("Prepull pod {name} ended in phase {phase}");
                Ok(false)
            }
        }
    }
}
