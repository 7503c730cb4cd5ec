//! Models for lab spawning and lab state.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde_derive::{Deserialize, Serialize};

use crate::constants::DROPDOWN_SENTINEL_VALUE;
use crate::errors::ControllerError;
use crate::models::gafaelfawr::{GafaelfawrUser, UserGroup};
use crate::models::kubernetes::PodPhase;
use crate::unit_conversion::memory_to_bytes;

/// Named lab sizes, in increasing order of size.
///
/// These are the traditional d20 creature sizes, which provide a reasonably
/// rich palette of container sizes with a sense of progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabSize {
    Fine,
    Diminutive,
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
    Gargantuan,
    Colossal,
}

impl LabSize {
    /// Parse a size name case-insensitively.
    pub fn parse(size: &str) -> Option<Self> {
        match size.to_lowercase().as_str() {
            "fine" => Some(LabSize::Fine),
            "diminutive" => Some(LabSize::Diminutive),
            "tiny" => Some(LabSize::Tiny),
            "small" => Some(LabSize::Small),
            "medium" => Some(LabSize::Medium),
            "large" => Some(LabSize::Large),
            "huge" => Some(LabSize::Huge),
            "gargantuan" => Some(LabSize::Gargantuan),
            "colossal" => Some(LabSize::Colossal),
            _ => None,
        }
    }

    /// The capitalized form used in human-readable descriptions.
    pub fn title(&self) -> String {
        let name = self.to_string();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => name,
        }
    }
}

impl Display for LabSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabSize::Fine => "fine",
            LabSize::Diminutive => "diminutive",
            LabSize::Tiny => "tiny",
            LabSize::Small => "small",
            LabSize::Medium => "medium",
            LabSize::Large => "large",
            LabSize::Huge => "huge",
            LabSize::Gargantuan => "gargantuan",
            LabSize::Colossal => "colossal",
        };
        f.write_str(name)
    }
}

/// Status of a user's lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl LabStatus {
    pub fn from_phase(phase: PodPhase) -> Self {
        match phase {
            PodPhase::Pending => LabStatus::Pending,
            PodPhase::Running => LabStatus::Running,
            PodPhase::Succeeded => LabStatus::Terminated,
            PodPhase::Failed | PodPhase::Unknown => LabStatus::Failed,
        }
    }

    /// Whether a lab in this status is live, blocking a new spawn.
    pub fn is_active(&self) -> bool {
        matches!(self, LabStatus::Pending | LabStatus::Running | LabStatus::Terminating)
    }
}

/// A quantity of CPU and memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// CPU in cores.
    pub cpu: f64,

    /// Memory in bytes.
    pub memory: i64,
}

/// Resource requests and limits for a lab.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabResources {
    pub requests: ResourceQuantity,
    pub limits: ResourceQuantity,
}

/// One configured lab size: a name plus the resource limits it grants.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabSizeDefinition {
    pub size: LabSize,

    /// CPU limit in cores.
    pub cpu: f64,

    /// Memory limit as a Kubernetes quantity string.
    pub memory: String,
}

impl LabSizeDefinition {
    pub fn memory_bytes(&self) -> Result<i64, ControllerError> {
        memory_to_bytes(&self.memory).map_err(|error| ControllerError::InvalidConfig {
            path: "lab.sizes".to_string(),
            error,
        })
    }

    /// Resource requests and limits for this size.
    ///
    /// Requests are set to a quarter of the limits so that a node can be
    /// oversubscribed with mostly-idle labs.
    pub fn to_resources(&self) -> Result<LabResources, ControllerError> {
        let memory = self.memory_bytes()?;
        Ok(LabResources {
            requests: ResourceQuantity {
                cpu: self.cpu / 4.0,
                memory: memory / 4,
            },
            limits: ResourceQuantity {
                cpu: self.cpu,
                memory,
            },
        })
    }

    /// Human-readable description, like `Medium (2.0 CPU, 4Gi RAM)`.
    pub fn description(&self) -> String {
        let cpu = if self.cpu.fract() == 0.0 {
            format!("{:.1}", self.cpu)
        } else {
            format!("{}", self.cpu)
        };
        format!("{} ({cpu} CPU, {} RAM)", self.size.title(), self.memory)
    }
}

/// Classes of images that can be requested by name instead of reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageClass {
    Recommended,
    LatestWeekly,
    LatestDaily,
    LatestRelease,
}

impl ImageClass {
    fn parse(class: &str) -> Option<Self> {
        match class {
            "recommended" => Some(ImageClass::Recommended),
            "latest-weekly" => Some(ImageClass::LatestWeekly),
            "latest-daily" => Some(ImageClass::LatestDaily),
            "latest-release" => Some(ImageClass::LatestRelease),
            _ => None,
        }
    }
}

/// A raw form value as submitted by JupyterHub.
///
/// The spawn form submits multi-valued, stringly-typed fields, so every
/// option may arrive as a scalar or as a list of one element, and booleans
/// may arrive as the strings `true` and `false`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FormValue {
    Bool(bool),
    String(String),
    List(Vec<FormValue>),
}

impl FormValue {
    /// Reduce a form value to at most one string.
    fn into_scalar(self, loc: &'static str) -> Result<Option<String>, ControllerError> {
        match self {
            FormValue::String(value) => Ok(Some(value)),
            FormValue::List(mut values) => match values.len() {
                0 => Ok(None),
                1 => values.remove(0).into_scalar(loc),
                _ => Err(ControllerError::InvalidOptions {
                    msg: format!("Expected at most one value for {loc}"),
                    loc: Some(loc),
                }),
            },
            FormValue::Bool(_) => Err(ControllerError::InvalidOptions {
                msg: format!("Invalid value for {loc}"),
                loc: Some(loc),
            }),
        }
    }

    /// Reduce a form value to a boolean, accepting the strings `true` and
    /// `false` but rejecting any other coercion.
    fn into_bool(self, loc: &'static str) -> Result<Option<bool>, ControllerError> {
        match self {
            FormValue::Bool(value) => Ok(Some(value)),
            FormValue::String(value) => match value.as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ControllerError::InvalidOptions {
                    msg: format!("Invalid boolean value \"{value}\" for {loc}"),
                    loc: Some(loc),
                }),
            },
            FormValue::List(mut values) => match values.len() {
                0 => Ok(None),
                1 => values.remove(0).into_bool(loc),
                _ => Err(ControllerError::InvalidOptions {
                    msg: format!("Expected at most one value for {loc}"),
                    loc: Some(loc),
                }),
            },
        }
    }
}

/// The options portion of a spawn request, as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLabRequestOptions {
    #[serde(default)]
    pub image_list: Option<FormValue>,

    #[serde(default)]
    pub image_dropdown: Option<FormValue>,

    #[serde(default)]
    pub image_class: Option<FormValue>,

    #[serde(default)]
    pub image_tag: Option<FormValue>,

    #[serde(default)]
    pub size: Option<FormValue>,

    #[serde(default)]
    pub enable_debug: Option<FormValue>,

    #[serde(default)]
    pub reset_user_env: Option<FormValue>,
}

/// Validated lab request options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabRequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_list: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dropdown: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_class: Option<ImageClass>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    pub size: LabSize,

    #[serde(default)]
    pub enable_debug: bool,

    #[serde(default)]
    pub reset_user_env: bool,
}

impl RawLabRequestOptions {
    /// Normalize raw form values into validated options.
    ///
    /// Exactly one way of selecting an image must survive normalization:
    /// a reference in `image_list` (or, when that is the dropdown sentinel,
    /// in `image_dropdown`), an image class, or an image tag.
    pub fn normalize(self) -> Result<LabRequestOptions, ControllerError> {
        let image_list = self
            .image_list
            .map(|v| v.into_scalar("image_list"))
            .transpose()?
            .flatten()
            .filter(|value| value != DROPDOWN_SENTINEL_VALUE);
        let mut image_dropdown =
            self.image_dropdown.map(|v| v.into_scalar("image_dropdown")).transpose()?.flatten();
        if image_list.is_some() {
            image_dropdown = None;
        }
        let image_class = self
            .image_class
            .map(|v| v.into_scalar("image_class"))
            .transpose()?
            .flatten()
            .map(|value| {
                ImageClass::parse(&value).ok_or(ControllerError::InvalidOptions {
                    msg: format!("Invalid image class \"{value}\""),
                    loc: Some("image_class"),
                })
            })
            .transpose()?;
        let image_tag = self.image_tag.map(|v| v.into_scalar("image_tag")).transpose()?.flatten();

        let selectors = [
            image_list.is_some() || image_dropdown.is_some(),
            image_class.is_some(),
            image_tag.is_some(),
        ];
        match selectors.iter().filter(|s| **s).count() {
            0 => {
                return Err(ControllerError::InvalidOptions {
                    msg: "No image to spawn specified".to_string(),
                    loc: Some("image_list"),
                });
            }
            1 => (),
            _ => {
                return Err(ControllerError::InvalidOptions {
                    msg: "Image specified in more than one way".to_string(),
                    loc: Some("image_list"),
                });
            }
        }

        let size = self
            .size
            .map(|v| v.into_scalar("size"))
            .transpose()?
            .flatten()
            .ok_or(ControllerError::InvalidOptions {
                msg: "No lab size specified".to_string(),
                loc: Some("size"),
            })?;
        let size = LabSize::parse(&size).ok_or(ControllerError::InvalidLabSize { size })?;

        let enable_debug = self
            .enable_debug
            .map(|v| v.into_bool("enable_debug"))
            .transpose()?
            .flatten()
            .unwrap_or(false);
        let reset_user_env = self
            .reset_user_env
            .map(|v| v.into_bool("reset_user_env"))
            .transpose()?
            .flatten()
            .unwrap_or(false);

        Ok(LabRequestOptions {
            image_list,
            image_dropdown,
            image_class,
            image_tag,
            size,
            enable_debug,
            reset_user_env,
        })
    }
}

/// Body of a lab creation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabSpecification {
    pub options: RawLabRequestOptions,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// User identity stored with lab state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub uid: i64,

    pub gid: i64,

    #[serde(default)]
    pub groups: Vec<UserGroup>,
}

impl UserInfo {
    pub fn from_gafaelfawr(user: &GafaelfawrUser) -> Self {
        UserInfo {
            username: user.info.username.clone(),
            name: user.info.name.clone(),
            uid: user.info.uid,
            gid: user.info.gid,
            groups: user.info.groups.clone(),
        }
    }
}

/// Everything the controller records about one user's lab.
#[derive(Debug, Clone, Serialize)]
pub struct LabState {
    pub user: UserInfo,

    pub options: LabRequestOptions,

    pub env: BTreeMap<String, String>,

    pub status: LabStatus,

    /// Cluster-internal URL at which the lab will answer.
    pub internal_url: String,

    pub resources: LabResources,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<ResourceQuantity>,
}
