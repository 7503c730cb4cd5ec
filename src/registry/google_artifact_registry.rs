//! Client for Google Artifact Registry.
//!
//! This client doesn't handle authentication beyond the Google default
//! credentials and should be run using workload identity.

use async_trait::async_trait;
use chrono::Utc;
use google_cloud_artifact_registry::client::{Client, ClientConfig};
use google_cloud_googleapis::devtools::artifact_registry::v1::ListDockerImagesRequest;
use tokio::sync::Mutex;

use crate::config::{GARSourceConfig, ImageConfig};
use crate::constants::{GAR_RETRY_DELAY, GAR_RETRY_LIMIT};
use crate::errors::ControllerError;
use crate::models::arch::filter_arch_images;
use crate::models::image::{RSPImage, RSPImageCollection};
use crate::models::policy::filter_images;
use crate::models::tag::RSPImageTag;
use crate::registry::ImageSource;

pub struct GARImageSource {
    client: Mutex<Client>,
    source: GARSourceConfig,
    images: ImageConfig,
}

impl GARImageSource {
    /// Create a client using the Google default credentials.
    pub async fn new(source: GARSourceConfig, images: ImageConfig) -> Result<Self, ControllerError> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| ControllerError::ArtifactRegistry { message: e.to_string() })?;
        let client = Client::new(config)
            .await
            .map_err(|e| ControllerError::ArtifactRegistry { message: e.to_string() })?;
        Ok(GARImageSource {
            client: Mutex::new(client),
            source,
            images,
        })
    }

    /// Fetch the full list of images from Google, one page at a time.
    ///
    /// Broken out into a separate method so that it can be retried.
    async fn fetch_image_list(&self) -> Result<Vec<RSPImage>, ControllerError> {
        let mut images = Vec::new();
        let mut page_token = String::new();
        loop {
            let request = ListDockerImagesRequest {
                parent: self.source.parent(),
                page_token: page_token.clone(),
                page_size: 100,
                ..Default::default()
            };
            let response = self
                .client
                .lock()
                .await
                .list_docker_images(request, None)
                .await
                .map_err(|e| ControllerError::ArtifactRegistry { message: e.to_string() })?;

            // The last component of the URI is the image name and digest
            // separated by @. Ignore entries for non-matching images since
            // there may be multiple images in the same repository.
            for gar_image in response.docker_images {
                let Some((image_name, digest)) =
                    gar_image.uri.rsplit('/').next().and_then(|last| last.split_once('@'))
                else {
                    continue;
                };
                if image_name != self.source.image {
                    continue;
                }
                for tag in &gar_image.tags {
                    let mut image = RSPImage::from_tag(
                        &self.source.registry(),
                        &self.source.path(),
                        self.parse_tag(tag),
                        digest,
                    );
                    image.size = Some(gar_image.image_size_bytes);
                    images.push(image);
                }
            }

            page_token = response.next_page_token;
            if page_token.is_empty() {
                break;
            }
        }
        Ok(images)
    }

    fn parse_tag(&self, tag: &str) -> RSPImageTag {
        if tag == self.images.recommended_tag || self.images.alias_tags.iter().any(|alias| alias == tag) {
            RSPImageTag::alias(tag)
        } else {
            RSPImageTag::from_str(tag)
        }
    }
}

#[async_trait]
impl ImageSource for GARImageSource {
    async fn list_images(&self) -> Result<RSPImageCollection, ControllerError> {
        // Requests to the Google API periodically fail in the middle of the
        // request with transient errors, so retry a bounded number of times
        // before propagating the failure.
        let mut images = None;
        for attempt in 0..GAR_RETRY_LIMIT {
            match self.fetch_image_list().await {
                Ok(fetched) => {
                    images = Some(fetched);
                    break;
                }
                Err(error) => {
                    warn!("Error listing images from GAR, retrying (attempt {attempt}): {error}");
                    tokio::time::sleep(GAR_RETRY_DELAY).await;
                }
            }
        }
        let mut images = match images {
            Some(images) => images,
            None => self.fetch_image_list().await?,
        };

        images = filter_arch_images(images);
        if let Some(policy) = &self.images.filter {
            images = filter_images(images, policy, Utc::now());
        }
        Ok(RSPImageCollection::new(images, self.images.cycle))
    }

    async fn digest_for_tag(&self, _tag: &str) -> Result<Option<String>, ControllerError> {
        // GAR returns every tag from the list call, so there is nothing
        // useful to look up on demand.
        Ok(None)
    }
}
