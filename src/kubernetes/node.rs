//! Node inspection for the prepuller.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};

use crate::errors::ControllerError;
use crate::models::kubernetes::Toleration;

/// Result of matching a node's taints against the configured tolerations.
#[derive(Debug, Clone)]
pub struct Tolerated {
    pub eligible: bool,
    pub comment: Option<String>,
}

/// One image cached on a node, as reported by the node status.
#[derive(Debug, Clone)]
pub struct NodeImageRecord {
    pub digest: String,
    pub size: Option<i64>,
    /// Tagged references for the image, without the digest reference.
    pub references: Vec<String>,
}

/// Everything the prepuller needs to know about one node.
#[derive(Debug, Clone)]
pub struct NodeInventory {
    pub name: String,
    pub eligible: bool,
    pub comment: Option<String>,
    pub images: Vec<NodeImageRecord>,
}

/// Reads node status from Kubernetes.
#[derive(Clone)]
pub struct NodeStorage {
    client: kube::Client,
}

impl NodeStorage {
    pub fn new(client: kube::Client) -> Self {
        NodeStorage { client }
    }

    /// List all nodes matching the selector and return their cached-image
    /// inventory along with prepull eligibility.
    ///
    /// Only images under `repository_prefix` (`registry/repository`) are
    /// recorded; nodes cache plenty of other images we don't care about.
    pub async fn list_inventory(
        &self,
        node_selector: &BTreeMap<String, String>,
        tolerations: &[Toleration],
        repository_prefix: &str,
    ) -> Result<Vec<NodeInventory>, ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = if node_selector.is_empty() {
            ListParams::default()
        } else {
            let selector = node_selector
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            ListParams::default().labels(&selector)
        };
        let nodes = api
            .list(&params)
            .await
            .map_err(|e| ControllerError::from_kube(e, "listing nodes", None, "Node", None, ""))?;
        Ok(nodes
            .items
            .iter()
            .map(|node| {
                let name = node.metadata.name.clone().unwrap_or_default();
                let tolerated = is_tolerated(node, tolerations);
                NodeInventory {
                    name,
                    eligible: tolerated.eligible,
                    comment: tolerated.comment,
                    images: images_for_node(node, repository_prefix),
                }
            })
            .collect())
    }
}

/// Whether a node's taints are all tolerated by the given tolerations.
///
/// `PreferNoSchedule` taints don't prevent scheduling and are ignored.
pub fn is_tolerated(node: &Node, tolerations: &[Toleration]) -> Tolerated {
    let taints = node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default();
    for taint in taints {
        if taint.effect == "PreferNoSchedule" {
            continue;
        }
        if !tolerations.iter().any(|toleration| toleration.tolerates(taint)) {
            let comment = match &taint.value {
                Some(value) => format!("Node is tainted ({}, {} = {value})", taint.effect, taint.key),
                None => format!("Node is tainted ({}, {})", taint.effect, taint.key),
            };
            return Tolerated {
                eligible: false,
                comment: Some(comment),
            };
        }
    }
    Tolerated {
        eligible: true,
        comment: None,
    }
}

/// Extract the images of interest from a node's status.
fn images_for_node(node: &Node, repository_prefix: &str) -> Vec<NodeImageRecord> {
    let container_images = node
        .status
        .as_ref()
        .and_then(|status| status.images.as_deref())
        .unwrap_or_default();
    let mut records = Vec::new();
    for image in container_images {
        let names = image.names.as_deref().unwrap_or_default();
        let mut digest = None;
        let mut references = Vec::new();
        for name in names {
            if let Some((path, image_digest)) = name.split_once('@') {
                if path.starts_with(repository_prefix) {
                    digest = Some(image_digest.to_string());
                }
            } else if name.starts_with(repository_prefix) {
                references.push(name.clone());
            }
        }
        if let Some(digest) = digest {
            records.push(NodeImageRecord {
                digest,
                size: image.size_bytes,
                references,
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ContainerImage, NodeSpec, NodeStatus, Taint};

    use super::*;
    use crate::models::kubernetes::{TaintEffect, TolerationOperator};

    fn node_with_taints(taints: Vec<Taint>) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints: Some(taints),
                ..NodeSpec::default()
            }),
            ..Node::default()
        }
    }

    fn taint(effect: &str, key: &str, value: Option<&str>) -> Taint {
        Taint {
            effect: effect.to_string(),
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            time_added: None,
        }
    }

    #[test]
    fn test_untainted_node_is_eligible() {
        assert!(is_tolerated(&Node::default(), &[]).eligible);
        assert!(is_tolerated(&node_with_taints(vec![]), &[]).eligible);

        // PreferNoSchedule taints are ignored.
        let node = node_with_taints(vec![taint("PreferNoSchedule", "foo", None)]);
        assert!(is_tolerated(&node, &[]).eligible);
    }

    #[test]
    fn test_tainted_node() {
        let node = node_with_taints(vec![taint("NoSchedule", "foo", None)]);
        let tolerated = is_tolerated(&node, &[]);
        assert!(!tolerated.eligible);
        assert_eq!(tolerated.comment.as_deref(), Some("Node is tainted (NoSchedule, foo)"));

        let exists = Toleration {
            operator: TolerationOperator::Exists,
            ..Toleration::default()
        };
        assert!(is_tolerated(&node, &[exists]).eligible);

        let wrong_key = Toleration {
            operator: TolerationOperator::Exists,
            key: Some("bar".to_string()),
            ..Toleration::default()
        };
        assert!(!is_tolerated(&node, &[wrong_key]).eligible);

        let wrong_effect = Toleration {
            operator: TolerationOperator::Exists,
            key: Some("foo".to_string()),
            effect: Some(TaintEffect::NoExecute),
            ..Toleration::default()
        };
        assert!(!is_tolerated(&node, &[wrong_effect]).eligible);
    }

    #[test]
    fn test_value_taints() {
        let node = node_with_taints(vec![taint("NoSchedule", "foo", Some("bar"))]);
        assert!(
            is_tolerated(
                &node,
                &[Toleration {
                    key: Some("foo".to_string()),
                    value: Some("bar".to_string()),
                    ..Toleration::default()
                }]
            )
            .eligible
        );
        let tolerated = is_tolerated(
            &node,
            &[Toleration {
                key: Some("bar".to_string()),
                value: Some("bar".to_string()),
                ..Toleration::default()
            }],
        );
        assert!(!tolerated.eligible);
        assert_eq!(tolerated.comment.as_deref(), Some("Node is tainted (NoSchedule, foo = bar)"));
    }

    #[test]
    fn test_multiple_taints_all_must_be_tolerated() {
        let node = node_with_taints(vec![
            taint("NoSchedule", "foo", Some("bar")),
            taint("NoExecute", "foo", Some("other")),
        ]);
        let tolerated = is_tolerated(
            &node,
            &[Toleration {
                key: Some("foo".to_string()),
                value: Some("bar".to_string()),
                ..Toleration::default()
            }],
        );
        assert!(!tolerated.eligible);
        assert_eq!(tolerated.comment.as_deref(), Some("Node is tainted (NoExecute, foo = other)"));

        assert!(
            is_tolerated(
                &node,
                &[
                    Toleration {
                        key: Some("foo".to_string()),
                        value: Some("bar".to_string()),
                        ..Toleration::default()
                    },
                    Toleration {
                        key: Some("foo".to_string()),
                        value: Some("other".to_string()),
                        ..Toleration::default()
                    },
                ]
            )
            .eligible
        );
    }

    #[test]
    fn test_images_for_node() {
        let node = Node {
            status: Some(NodeStatus {
                images: Some(vec![
                    ContainerImage {
                        names: Some(vec![
                            "lighthouse.ceres/library/sketchbook@sha256:1234".to_string(),
                            "lighthouse.ceres/library/sketchbook:d_2077_10_23".to_string(),
                            "lighthouse.ceres/library/sketchbook:recommended".to_string(),
                        ]),
                        size_bytes: Some(123_456),
                    },
                    // Images from other repositories are ignored.
                    ContainerImage {
                        names: Some(vec!["quay.io/other/image@sha256:9999".to_string()]),
                        size_bytes: None,
                    },
                ]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        };
        let records = images_for_node(&node, "lighthouse.ceres/library/sketchbook");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].digest, "sha256:1234");
        assert_eq!(records[0].size, Some(123_456));
        assert_eq!(records[0].references.len(), 2);
    }
}
