//! Domain types layered over the Kubernetes API.

use k8s_openapi::api::core::v1::{Pod, Taint};
use serde_derive::{Deserialize, Serialize};
use strum_macros::Display;

/// The phase of a Kubernetes pod, as reported in its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn from_pod(pod: &Pod) -> Self {
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Taint effects, mirroring the Kubernetes wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TaintEffect {
    NoExecute,
    NoSchedule,
    PreferNoSchedule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// A toleration the prepuller is configured with, matched against node
/// taints using the standard Kubernetes semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Toleration {
    #[serde(default)]
    pub effect: Option<TaintEffect>,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub operator: TolerationOperator,

    /// How long the toleration tolerates the taint.
    ///
    /// Only meaningful for `NoExecute` taints, and a bounded toleration of
    /// eviction does not make a node eligible for prepulling.
    #[serde(default)]
    pub toleration_seconds: Option<i64>,

    #[serde(default)]
    pub value: Option<String>,
}

impl Toleration {
    /// Whether this toleration tolerates the given taint.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect.to_string() != taint.effect {
                return false;
            }
        }
        if self.toleration_seconds.is_some() && taint.effect == "NoExecute" {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => match &self.key {
                Some(key) => *key == taint.key,
                None => true,
            },
            TolerationOperator::Equal => {
                self.key.as_deref() == Some(taint.key.as_str()) && self.value == taint.value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(effect: &str, key: &str, value: Option<&str>) -> Taint {
        Taint {
            effect: effect.to_string(),
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            time_added: None,
        }
    }

    #[test]
    fn test_exists_operator() {
        let toleration = Toleration {
            operator: TolerationOperator::Exists,
            ..Toleration::default()
        };
        assert!(toleration.tolerates(&taint("NoSchedule", "foo", None)));

        let keyed = Toleration {
            operator: TolerationOperator::Exists,
            key: Some("foo".to_string()),
            ..Toleration::default()
        };
        assert!(keyed.tolerates(&taint("NoSchedule", "foo", None)));
        assert!(!keyed.tolerates(&taint("NoSchedule", "bar", None)));
    }

    #[test]
    fn test_equal_operator() {
        let toleration = Toleration {
            key: Some("foo".to_string()),
            value: Some("bar".to_string()),
            ..Toleration::default()
        };
        assert!(toleration.tolerates(&taint("NoSchedule", "foo", Some("bar"))));
        assert!(!toleration.tolerates(&taint("NoSchedule", "foo", Some("barbar"))));
        assert!(!toleration.tolerates(&taint("NoSchedule", "bar", Some("bar"))));
    }

    #[test]
    fn test_effect_match() {
        let toleration = Toleration {
            operator: TolerationOperator::Exists,
            effect: Some(TaintEffect::NoSchedule),
            key: Some("foo".to_string()),
            ..Toleration::default()
        };
        assert!(toleration.tolerates(&taint("NoSchedule", "foo", None)));
        assert!(!toleration.tolerates(&taint("NoExecute", "foo", None)));
    }

    #[test]
    fn test_toleration_seconds() {
        // A bounded toleration covers non-NoExecute taints but never
        // NoExecute taints.
        let toleration = Toleration {
            key: Some("foo".to_string()),
            value: Some("bar".to_string()),
            toleration_seconds: Some(5),
            ..Toleration::default()
        };
        assert!(!toleration.tolerates(&taint("NoExecute", "foo", Some("bar"))));
        assert!(toleration.tolerates(&taint("NoSchedule", "foo", Some("bar"))));
    }
}
