//! Cached data about Kubernetes nodes.

use crate::models::image::RSPImageCollection;

/// Cached data about a Kubernetes node.
///
/// This data is used to answer prepuller questions and as source data for
/// the prepuller status API.
#[derive(Debug, Clone)]
pub struct NodeData {
    /// Name of the node.
    pub name: String,

    /// Images of interest present on that node.
    pub images: RSPImageCollection,

    /// Whether this node is eligible for prepulling.
    pub eligible: bool,

    /// Reason why images aren't prepulled to this node.
    pub comment: Option<String>,
}
