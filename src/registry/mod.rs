//! Image source adapters.
//!
//! An image source knows how to enumerate the remote images available for
//! spawning, returning a fully filtered collection, and optionally how to
//! resolve a single tag to a digest on demand.

use async_trait::async_trait;

use crate::errors::ControllerError;
use crate::models::image::RSPImageCollection;

pub mod docker;
pub mod google_artifact_registry;

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// List the remote images, with architecture-specific duplicates,
    /// excluded cycles, and policy-filtered tags already removed.
    async fn list_images(&self) -> Result<RSPImageCollection, ControllerError>;

    /// Resolve a tag that is not in the cached collection to a digest, if
    /// this source supports live lookups.
    async fn digest_for_tag(&self, tag: &str) -> Result<Option<String>, ControllerError>;
}
