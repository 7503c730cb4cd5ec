//! The image service: authoritative view of available lab images.
//!
//! Maintains the in-memory image collection for the configured source,
//! refreshed on a timer. Readers get a cheap `Arc` snapshot; only the
//! refresher (and the prepuller's optimistic node marking) replaces it.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::ControllerError;
use crate::kubernetes::node::NodeStorage;
use crate::models::docker::DockerReference;
use crate::models::image::{RSPImage, RSPImageCollection};
use crate::models::lab::ImageClass;
use crate::models::menu::{MenuImage, MenuImages};
use crate::models::node::NodeData;
use crate::models::prepuller::{
    Node, NodeImage, PrepulledImage, PrepullerImageStatus, PrepullerOptions, PrepullerStatus,
    SpawnerImages,
};
use crate::models::tag::{RSPImageTag, RSPImageType};
use crate::registry::ImageSource;

#[derive(Default)]
struct ImageState {
    collection: Arc<RSPImageCollection>,
    nodes: Vec<NodeData>,
}

pub struct ImageService {
    config: Arc<Config>,
    source: Arc<dyn ImageSource>,
    node_storage: NodeStorage,
    state: RwLock<ImageState>,
}

impl ImageService {
    pub fn new(config: Arc<Config>, source: Arc<dyn ImageSource>, node_storage: NodeStorage) -> Self {
        ImageService {
            config,
            source,
            node_storage,
            state: RwLock::new(ImageState::default()),
        }
    }

    /// Refresh the image collection from the remote source and the node
    /// inventory, then atomically publish the new view.
    pub async fn refresh(&self) -> Result<(), ControllerError> {
        let mut collection = self.source.list_images().await?;
        let prefix = format!(
            "{}/{}",
            self.config.images.source.registry(),
            self.config.images.source.repository()
        );
        let inventory = self
            .node_storage
            .list_inventory(
                &self.config.prepuller.node_selector,
                &self.config.prepuller.tolerations,
                &prefix,
            )
            .await?;

        for node in &inventory {
            for image in &node.images {
                collection.mark_image_seen_on_node(&image.digest, &node.name, image.size);
            }
        }

        let collection = Arc::new(collection);
        let nodes = inventory
            .into_iter()
            .map(|node| {
                let cached = collection
                    .all_images(false, false)
                    .into_iter()
                    .filter(|image| image.nodes.contains(&node.name))
                    .cloned()
                    .collect::<Vec<_>>();
                NodeData {
                    name: node.name,
                    images: RSPImageCollection::new(cached, None),
                    eligible: node.eligible,
                    comment: node.comment,
                }
            })
            .collect();

        let mut state = self.state.write().expect("image state lock poisoned");
        state.collection = collection;
        state.nodes = nodes;
        info!("Refreshed image collection ({} images)", state.collection.len());
        Ok(())
    }

    /// Run refreshes on the configured interval until cancelled.
    pub async fn refresher(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.images.refresh_interval) => (),
            }
            if let Err(error) = self.refresh().await {
                error!("Error refreshing images: {error}");
            }
        }
    }

    /// Snapshot of the current collection.
    pub fn collection(&self) -> Arc<RSPImageCollection> {
        self.state.read().expect("image state lock poisoned").collection.clone()
    }

    /// Replace the published state directly, bypassing the remote source.
    #[cfg(test)]
    pub(crate) fn seed_for_test(&self, images: Vec<RSPImage>, nodes: Vec<NodeData>) {
        let mut state = self.state.write().expect("image state lock poisoned");
        state.collection = Arc::new(RSPImageCollection::new(images, None));
        state.nodes = nodes;
    }

    /// Snapshot of the current node data.
    pub fn nodes(&self) -> Vec<NodeData> {
        self.state.read().expect("image state lock poisoned").nodes.clone()
    }

    /// Names of nodes eligible for prepulling.
    pub fn eligible_nodes(&self) -> BTreeSet<String> {
        self.state
            .read()
            .expect("image state lock poisoned")
            .nodes
            .iter()
            .filter(|node| node.eligible)
            .map(|node| node.name.clone())
            .collect()
    }

    /// The set of images that should be prepulled: the newest configured
    /// releases, weeklies, and dailies, the recommended tag, and any pins,
    /// one image per digest with concrete images preferred.
    pub fn prepull_images(&self) -> Vec<RSPImage> {
        let collection = self.collection();
        let mut include: HashSet<String> = self.config.images.pin.iter().cloned().collect();
        include.insert(self.config.images.recommended_tag.clone());
        let subset = collection.subset(
            self.config.images.num_releases,
            self.config.images.num_weeklies,
            self.config.images.num_dailies,
            &include,
        );

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for image in subset.all_images(false, false) {
            let concrete = subset.image_for_digest(&image.digest).unwrap_or(image);
            if seen.insert(concrete.digest.clone()) {
                images.push(concrete.clone());
            }
        }
        images
    }

    /// Images from the prepull set that are missing from at least one
    /// eligible node, with the nodes they are missing from.
    pub fn missing_images(&self) -> Vec<(RSPImage, Vec<String>)> {
        let eligible = self.eligible_nodes();
        self.prepull_images()
            .into_iter()
            .filter_map(|image| {
                let missing: Vec<String> =
                    eligible.iter().filter(|node| !image.nodes.contains(*node)).cloned().collect();
                if missing.is_empty() { None } else { Some((image, missing)) }
            })
            .collect()
    }

    /// Optimistically record that an image has been pulled to a node.
    ///
    /// The next refresh reconciles this against the node status.
    pub fn mark_prepulled(&self, digest: &str, node: &str) {
        let mut state = self.state.write().expect("image state lock poisoned");
        let mut collection = (*state.collection).clone();
        collection.mark_image_seen_on_node(digest, node, None);
        state.collection = Arc::new(collection);
    }

    /// The menu and dropdown shown on the spawner form.
    pub fn menu_images(&self) -> MenuImages {
        let collection = self.collection();
        let prepull: HashSet<String> =
            self.prepull_images().iter().map(|image| image.digest.clone()).collect();
        let menu = collection
            .all_images(false, true)
            .into_iter()
            .filter(|image| prepull.contains(&image.digest))
            .map(|image| MenuImage {
                reference: image.reference(),
                name: image.display_name.clone(),
            })
            .collect();
        let dropdown = collection
            .all_images(true, false)
            .into_iter()
            .map(|image| MenuImage {
                reference: image.reference(),
                name: image.display_name.clone(),
            })
            .collect();
        MenuImages { menu, dropdown }
    }

    /// The spawnable images summary returned by the images route.
    pub fn images(&self) -> SpawnerImages {
        let collection = self.collection();
        let nodes = self.eligible_nodes();
        let for_tag = |tag: &str| {
            collection
                .image_for_tag_name(tag)
                .map(|image| PrepulledImage::from_rsp_image(image, &nodes))
        };
        let latest = |image_type: RSPImageType| {
            collection
                .latest(image_type)
                .map(|image| PrepulledImage::from_rsp_image(image, &nodes))
        };
        SpawnerImages {
            recommended: for_tag(&self.config.images.recommended_tag),
            latest_weekly: latest(RSPImageType::Weekly),
            latest_daily: latest(RSPImageType::Daily),
            latest_release: latest(RSPImageType::Release),
            all: collection
                .all_images(false, false)
                .into_iter()
                .map(|image| PrepulledImage::from_rsp_image(image, &nodes))
                .collect(),
        }
    }

    /// Full prepuller status for the status route.
    pub fn prepull_status(&self) -> PrepullerStatus {
        let eligible = self.eligible_nodes();
        let mut prepulled = Vec::new();
        let mut pending = Vec::new();
        for image in self.prepull_images() {
            let mut node_image = NodeImage::from_rsp_image(&image);
            if image.is_prepulled(&eligible) {
                prepulled.push(node_image);
            } else {
                node_image.missing =
                    eligible.iter().filter(|node| !image.nodes.contains(*node)).cloned().collect();
                pending.push(node_image);
            }
        }
        PrepullerStatus {
            config: PrepullerOptions::from_config(&self.config),
            images: PrepullerImageStatus { prepulled, pending },
            nodes: self.nodes().iter().map(Node::from_node_data).collect(),
        }
    }

    /// Resolve a Docker reference from a spawn request to a concrete image.
    pub async fn image_for_reference(
        &self,
        reference: &DockerReference,
        loc: Option<&'static str>,
    ) -> Result<RSPImage, ControllerError> {
        let tag = reference.tag.as_deref().ok_or_else(|| ControllerError::DockerReferenceNoTag {
            reference: reference.to_string(),
            loc,
        })?;
        if let Some(image) = self.collection().image_for_tag_name(tag) {
            return Ok(image.clone());
        }

        // The image may exist but be outside the cached collection; fall
        // through to a live digest lookup when the source supports one.
        if let Some(digest) = &reference.digest {
            return Ok(RSPImage::from_tag(
                &reference.registry,
                &reference.repository,
                RSPImageTag::from_str(tag),
                digest,
            ));
        }
        match self.source.digest_for_tag(tag).await {
            Ok(Some(digest)) => Ok(RSPImage::from_tag(
                &reference.registry,
                &reference.repository,
                RSPImageTag::from_str(tag),
                &digest,
            )),
            _ => Err(ControllerError::UnknownImage { tag: tag.to_string() }),
        }
    }

    /// Resolve a bare tag name to a concrete image.
    pub async fn image_for_tag_name(&self, tag: &str) -> Result<RSPImage, ControllerError> {
        if let Some(image) = self.collection().image_for_tag_name(tag) {
            return Ok(image.clone());
        }
        match self.source.digest_for_tag(tag).await {
            Ok(Some(digest)) => Ok(RSPImage::from_tag(
                &self.config.images.source.registry(),
                &self.config.images.source.repository(),
                RSPImageTag::from_str(tag),
                &digest,
            )),
            _ => Err(ControllerError::UnknownImage { tag: tag.to_string() }),
        }
    }

    /// Resolve an image class to a concrete image.
    pub fn image_for_class(&self, class: ImageClass) -> Result<RSPImage, ControllerError> {
        let collection = self.collection();
        let image = match class {
            ImageClass::Recommended => collection.image_for_tag_name(&self.config.images.recommended_tag),
            ImageClass::LatestWeekly => collection.latest(RSPImageType::Weekly),
            ImageClass::LatestDaily => collection.latest(RSPImageType::Daily),
            ImageClass::LatestRelease => collection.latest(RSPImageType::Release),
        };
        image.cloned().ok_or_else(|| ControllerError::UnknownImage {
            tag: match class {
                ImageClass::Recommended => self.config.images.recommended_tag.clone(),
                ImageClass::LatestWeekly => "latest-weekly".to_string(),
                ImageClass::LatestDaily => "latest-daily".to_string(),
                ImageClass::LatestRelease => "latest-release".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::models::tag::RSPImageTag;

    struct StaticSource {
        images: Vec<RSPImage>,
    }

    #[async_trait]
    impl ImageSource for StaticSource {
        async fn list_images(&self) -> Result<RSPImageCollection, ControllerError> {
            Ok(RSPImageCollection::new(self.images.clone(), None))
        }

        async fn digest_for_tag(&self, _tag: &str) -> Result<Option<String>, ControllerError> {
            Ok(None)
        }
    }

    fn make_image(tag: &str, digest: &str) -> RSPImage {
        RSPImage::from_tag(
            "lighthouse.ceres",
            "library/sketchbook",
            if tag == "recommended" {
                RSPImageTag::alias(tag)
            } else {
                RSPImageTag::from_str(tag)
            },
            digest,
        )
    }

    fn test_service(images: Vec<RSPImage>) -> ImageService {
        let yaml = "
lab:
  sizes:
    - size: medium
      cpu: 2.0
      memory: 4Gi
images:
  source:
    type: docker
    registry: lighthouse.ceres
    repository: library/sketchbook
  numReleases: 1
  numWeeklies: 2
  numDailies: 1
gafaelfawr:
  baseUrl: https://lighthouse.ceres
";
        let config: Arc<Config> = Arc::new(serde_yaml::from_str(yaml).unwrap());
        let service = ImageService::new(
            config,
            Arc::new(StaticSource { images: images.clone() }),
            NodeStorage::new(kube::Client::try_from(kube::Config::new("http://localhost".parse().unwrap())).unwrap()),
        );
        // Seed state directly rather than running a refresh, since tests
        // have no cluster to list nodes from.
        {
            let mut state = service.state.write().unwrap();
            state.collection = Arc::new(RSPImageCollection::new(images, None));
            state.nodes = vec![
                NodeData {
                    name: "node1".to_string(),
                    images: RSPImageCollection::default(),
                    eligible: true,
                    comment: None,
                },
                NodeData {
                    name: "node2".to_string(),
                    images: RSPImageCollection::default(),
                    eligible: true,
                    comment: None,
                },
            ];
        }
        service
    }

    fn test_images() -> Vec<RSPImage> {
        vec![
            make_image("recommended", "sha256:46"),
            make_image("w_2077_46", "sha256:46"),
            make_image("w_2077_45", "sha256:45"),
            make_image("w_2077_44", "sha256:44"),
            make_image("d_2077_10_23", "sha256:1023"),
            make_image("d_2077_10_22", "sha256:1022"),
        ]
    }

    #[tokio::test]
    async fn test_prepull_selection() {
        let service = test_service(test_images());
        let tags: Vec<_> = service.prepull_images().iter().map(|image| image.tag.clone()).collect();
        // One digest per image, concrete tags preferred over the alias.
        assert_eq!(tags, vec!["w_2077_46", "w_2077_45", "d_2077_10_23"]);
    }

    #[tokio::test]
    async fn test_missing_images_and_marking() {
        let service = test_service(test_images());
        let missing = service.missing_images();
        assert_eq!(missing.len(), 3);
        assert_eq!(missing[0].1, vec!["node1", "node2"]);

        service.mark_prepulled("sha256:46", "node1");
        service.mark_prepulled("sha256:46", "node2");
        let missing = service.missing_images();
        assert_eq!(missing.len(), 2);

        // The alias sharing the digest was updated too.
        let collection = service.collection();
        let recommended = collection.image_for_tag_name("recommended").unwrap();
        assert_eq!(recommended.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_menu_images() {
        let service = test_service(test_images());
        let menu = service.menu_images();
        let menu_names: Vec<_> = menu.menu.iter().map(|image| image.name.clone()).collect();
        // The recommended alias heads the menu; its concrete image is
        // hidden as aliased.
        assert_eq!(
            menu_names,
            vec![
                "Recommended (Weekly 2077_46)",
                "Weekly 2077_45",
                "Daily 2077_10_23",
            ]
        );
        // The dropdown holds everything, with resolved aliases hidden.
        assert_eq!(menu.dropdown.len(), 5);
    }

    #[tokio::test]
    async fn test_images_summary() {
        let service = test_service(test_images());
        let images = service.images();
        assert_eq!(images.recommended.unwrap().image.tag, "recommended");
        assert_eq!(images.latest_weekly.unwrap().image.tag, "w_2077_46");
        assert_eq!(images.latest_daily.unwrap().image.tag, "d_2077_10_23");
        assert!(images.latest_release.is_none());
        assert_eq!(images.all.len(), 6);
    }

    #[tokio::test]
    async fn test_image_resolution() {
        let service = test_service(test_images());
        let reference =
            DockerReference::parse("lighthouse.ceres/library/sketchbook:w_2077_45").unwrap();
        let image = service.image_for_reference(&reference, None).await.unwrap();
        assert_eq!(image.digest, "sha256:45");

        let reference = DockerReference::parse("lighthouse.ceres/library/sketchbook").unwrap();
        let error = service.image_for_reference(&reference, Some("image_list")).await.unwrap_err();
        assert!(matches!(error, ControllerError::DockerReferenceNoTag { .. }));

        let error = service.image_for_tag_name("nonexistent").await.unwrap_err();
        assert!(matches!(error, ControllerError::UnknownImage { .. }));

        let image = service.image_for_class(ImageClass::Recommended).unwrap();
        assert_eq!(image.tag, "recommended");
        let error = service.image_for_class(ImageClass::LatestRelease).unwrap_err();
        assert!(matches!(error, ControllerError::UnknownImage { .. }));
    }

    #[tokio::test]
    async fn test_prepull_status() {
        let service = test_service(test_images());
        service.mark_prepulled("sha256:46", "node1");
        service.mark_prepulled("sha256:46", "node2");
        let status = service.prepull_status();
        assert_eq!(status.images.prepulled.len(), 1);
        assert_eq!(status.images.pending.len(), 2);
        assert_eq!(status.images.pending[0].missing, vec!["node1", "node2"]);
        assert_eq!(status.nodes.len(), 2);
        assert_eq!(status.config.num_weeklies, 2);
    }
}
