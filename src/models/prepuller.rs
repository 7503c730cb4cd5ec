//! Wire models for the images and prepuller status routes.

use std::collections::BTreeSet;

use serde_derive::Serialize;

use crate::config::{Config, ImageSourceConfig};
use crate::models::image::RSPImage;
use crate::models::node::NodeData;

/// A single Docker image that is available or prepulled.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    /// Reference of the image, which includes the registry host name, the
    /// image name within that registry, and the tag.
    pub reference: String,

    /// Tag portion of the image reference.
    pub tag: String,

    /// Tag of the image formatted for humans.
    pub name: String,

    /// Full digest of the image, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Used to display available images.
#[derive(Debug, Clone, Serialize)]
pub struct PrepulledImage {
    #[serde(flatten)]
    pub image: Image,

    /// Other tags that reference the same image.
    pub aliases: Vec<String>,

    /// Whether the image has been prepulled to all eligible nodes.
    pub prepulled: bool,
}

impl PrepulledImage {
    pub fn from_rsp_image(image: &RSPImage, nodes: &BTreeSet<String>) -> Self {
        let mut aliases: Vec<String> = image.aliases.iter().cloned().collect();
        if let Some(target) = &image.alias_target {
            aliases.push(target.clone());
        }
        aliases.sort();
        PrepulledImage {
            image: Image {
                reference: image.reference(),
                tag: image.tag.clone(),
                name: image.display_name.clone(),
                digest: Some(image.digest.clone()),
            },
            aliases,
            prepulled: image.is_prepulled(nodes),
        }
    }
}

/// An available image present on at least some Kubernetes nodes.
#[derive(Debug, Clone, Serialize)]
pub struct NodeImage {
    #[serde(flatten)]
    pub image: Image,

    /// Size of the image in bytes, if reported by the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    /// Nodes on which this image is cached.
    pub nodes: Vec<String>,

    /// Nodes on which the image should be cached but isn't.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl NodeImage {
    pub fn from_rsp_image(image: &RSPImage) -> Self {
        NodeImage {
            image: Image {
                reference: image.reference(),
                tag: image.tag.clone(),
                name: image.display_name.clone(),
                digest: Some(image.digest.clone()),
            },
            size: image.size,
            nodes: image.nodes.iter().cloned().collect(),
            missing: Vec::new(),
        }
    }
}

/// Status of the images being prepulled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepullerImageStatus {
    /// Successfully cached images.
    pub prepulled: Vec<NodeImage>,

    /// Images that are missing on at least one eligible node.
    pub pending: Vec<NodeImage>,
}

/// Information about available images on a single Kubernetes node.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    /// Hostname of the Kubernetes node.
    pub name: String,

    /// Whether images should be prepulled to this node.
    pub eligible: bool,

    /// If this node is not eligible for prepulling, the reason why.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// References of images cached on this node.
    pub cached: Vec<String>,
}

impl Node {
    pub fn from_node_data(node: &NodeData) -> Self {
        Node {
            name: node.name.clone(),
            eligible: node.eligible,
            comment: node.comment.clone(),
            cached: node
                .images
                .all_images(false, false)
                .iter()
                .map(|image| image.reference())
                .collect(),
        }
    }
}

/// Images known to the controller and available for spawning, returned by
/// the images route.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnerImages {
    pub recommended: Option<PrepulledImage>,

    pub latest_weekly: Option<PrepulledImage>,

    pub latest_daily: Option<PrepulledImage>,

    pub latest_release: Option<PrepulledImage>,

    pub all: Vec<PrepulledImage>,
}

/// Echo of the prepuller configuration in the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PrepullerOptions {
    pub source: PrepullerSource,
    pub recommended_tag: String,
    pub num_releases: usize,
    pub num_weeklies: usize,
    pub num_dailies: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<i32>,
    pub pin: Vec<String>,
    pub alias_tags: Vec<String>,
}

/// Source description in the prepuller status, with credentials omitted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PrepullerSource {
    #[serde(rename = "docker")]
    Docker { registry: String, repository: String },

    #[serde(rename = "google")]
    Google {
        location: String,
        project_id: String,
        repository: String,
        image: String,
    },
}

impl PrepullerOptions {
    pub fn from_config(config: &Config) -> Self {
        let source = match &config.images.source {
            ImageSourceConfig::Docker(docker) => PrepullerSource::Docker {
                registry: docker.registry.clone(),
                repository: docker.repository.clone(),
            },
            ImageSourceConfig::Google(gar) => PrepullerSource::Google {
                location: gar.location.clone(),
                project_id: gar.project_id.clone(),
                repository: gar.repository.clone(),
                image: gar.image.clone(),
            },
        };
        PrepullerOptions {
            source,
            recommended_tag: config.images.recommended_tag.clone(),
            num_releases: config.images.num_releases,
            num_weeklies: config.images.num_weeklies,
            num_dailies: config.images.num_dailies,
            cycle: config.images.cycle,
            pin: config.images.pin.clone(),
            alias_tags: config.images.alias_tags.clone(),
        }
    }
}

/// Status of the image prepuller, returned by the prepulls route.
#[derive(Debug, Clone, Serialize)]
pub struct PrepullerStatus {
    pub config: PrepullerOptions,
    pub images: PrepullerImageStatus,
    pub nodes: Vec<Node>,
}
