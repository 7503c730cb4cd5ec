//! Runtime configuration for the Nublado controller.
//!
//! Configuration comes from one YAML file, deserialized with serde. Field
//! names are camel-case to match the Helm values that generate the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_derive::Deserialize as DeserializeDerive;
use url::Url;

use crate::constants::SLACK_WEBHOOK_ENV;
use crate::errors::ControllerError;
use crate::models::kubernetes::Toleration;
use crate::models::lab::{LabSize, LabSizeDefinition};
use crate::models::policy::RSPImageFilterPolicy;
use crate::unit_conversion::parse_duration;

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Name of the controller, used in metadata responses.
    #[serde(default = "default_name")]
    pub name: String,

    /// URL prefix under which all routes are served.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Port on which to listen.
    #[serde(default = "default_port")]
    pub port: u16,

    pub lab: LabConfig,

    pub images: ImageConfig,

    #[serde(default)]
    pub prepuller: PrepullerConfig,

    pub gafaelfawr: GafaelfawrConfig,

    /// Incoming webhook for Slack alerts. Normally provided via the
    /// environment instead of the file so the secret stays out of the chart.
    #[serde(default)]
    pub slack_webhook: Option<String>,
}

fn default_name() -> String {
    "Nublado".to_string()
}

fn default_path_prefix() -> String {
    "/nublado".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The Slack webhook may be overridden from the environment so that the
    /// secret never has to appear in the configuration file.
    pub fn from_file(path: &Path) -> Result<Config, ControllerError> {
        let error = |error: String| ControllerError::InvalidConfig {
            path: path.display().to_string(),
            error,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
        let mut config: Config = serde_yaml::from_str(&contents).map_err(|e| error(e.to_string()))?;
        if let Ok(webhook) = std::env::var(SLACK_WEBHOOK_ENV) {
            config.slack_webhook = Some(webhook);
        }
        config.validate().map_err(|e| error(e))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.lab.sizes.is_empty() {
            return Err("lab.sizes must not be empty".to_string());
        }
        for size in &self.lab.sizes {
            size.memory_bytes().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// How the username portion of home directory paths is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeserializeDerive)]
pub enum UserHomeDirectorySchema {
    /// `/home/rachel`
    #[default]
    #[serde(rename = "username")]
    Username,

    /// `/home/r/rachel`
    #[serde(rename = "initialThenUsername")]
    InitialThenUsername,

    /// `/home/r/rachel/rachel`
    #[serde(rename = "initialThenUsernameNested")]
    InitialThenUsernameNested,
}

/// Whether the lab UI file browser may ascend to the container root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeserializeDerive)]
#[serde(rename_all = "lowercase")]
pub enum LabFileBrowserRoot {
    #[default]
    Home,
    Root,
}

impl LabFileBrowserRoot {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabFileBrowserRoot::Home => "home",
            LabFileBrowserRoot::Root => "root",
        }
    }
}

/// Backing medium for the lab's `/tmp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeserializeDerive)]
#[serde(rename_all = "lowercase")]
pub enum TmpSource {
    #[default]
    Memory,
    Disk,
}

/// A secret projected from a controller-namespace secret into the lab.
#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabSecret {
    /// Name of the source secret in the controller namespace.
    pub secret_name: String,

    /// Key within that secret.
    pub secret_key: String,
}

#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabConfig {
    /// Prefix for per-user lab namespaces.
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,

    /// Namespace in which the controller itself (and its prepull pods) run.
    #[serde(default = "default_controller_namespace")]
    pub controller_namespace: String,

    /// Available lab sizes, in menu order.
    pub sizes: Vec<LabSizeDefinition>,

    /// Size selected by default on the spawn form.
    #[serde(default)]
    pub default_size: Option<LabSize>,

    /// Static environment variables set in every lab.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Secrets to copy from the controller namespace into each lab.
    #[serde(default)]
    pub secrets: Vec<LabSecret>,

    /// Static files mounted into the lab, keyed by mount path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    #[serde(default)]
    pub homedir_schema: UserHomeDirectorySchema,

    /// Base path under which user home directories live.
    #[serde(default = "default_homedir_path")]
    pub homedir_path: String,

    /// Path component appended after the username portion, if any.
    #[serde(default)]
    pub homedir_suffix: String,

    #[serde(default)]
    pub file_browser_root: LabFileBrowserRoot,

    #[serde(default)]
    pub tmp_source: TmpSource,

    /// Extra annotations to add to each lab pod.
    #[serde(default)]
    pub extra_annotations: BTreeMap<String, String>,

    /// Command run to start the lab.
    #[serde(default = "default_lab_start_command")]
    pub lab_start_command: Vec<String>,

    /// Where the lab expects its configuration directory.
    #[serde(default = "default_jupyterlab_config_dir")]
    pub jupyterlab_config_dir: String,

    /// Where lab secrets are mounted.
    #[serde(default = "default_secrets_path")]
    pub secrets_path: String,

    /// Pull secret to copy into lab namespaces, if any.
    #[serde(default)]
    pub pull_secret: Option<String>,

    /// How long a lab may stay pending before the spawn fails.
    #[serde(default = "default_spawn_timeout", deserialize_with = "deserialize_duration")]
    pub spawn_timeout: Duration,

    /// How long lab deletion may take before it is reported as an error.
    #[serde(default = "default_delete_timeout", deserialize_with = "deserialize_duration")]
    pub delete_timeout: Duration,

    /// How often to reconcile in-memory state against Kubernetes.
    #[serde(default = "default_reconcile_interval", deserialize_with = "deserialize_duration")]
    pub reconcile_interval: Duration,

    /// Labs whose state records are younger than this are left alone by the
    /// reconciler, so a half-built lab is not torn down mid-spawn.
    #[serde(default = "default_spawn_grace_period", deserialize_with = "deserialize_duration")]
    pub spawn_grace_period: Duration,
}

fn default_namespace_prefix() -> String {
    "userlabs".to_string()
}

fn default_controller_namespace() -> String {
    "nublado".to_string()
}

fn default_homedir_path() -> String {
    "/home".to_string()
}

fn default_lab_start_command() -> Vec<String> {
    vec!["/opt/lsst/software/jupyterlab/runlab.sh".to_string()]
}

fn default_jupyterlab_config_dir() -> String {
    "/opt/lsst/software/jupyterlab/etc".to_string()
}

fn default_secrets_path() -> String {
    "/opt/lsst/software/jupyterlab/secrets".to_string()
}

fn default_spawn_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_delete_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_spawn_grace_period() -> Duration {
    Duration::from_secs(120)
}

impl LabConfig {
    /// The namespace for a user's lab.
    pub fn namespace_for_user(&self, username: &str) -> String {
        format!("{}-{username}", self.namespace_prefix)
    }

    /// Look up the definition of a configured size.
    pub fn size_definition(&self, size: LabSize) -> Option<&LabSizeDefinition> {
        self.sizes.iter().find(|definition| definition.size == size)
    }

    /// The home directory for a user, following the configured schema.
    pub fn homedir_for_user(&self, username: &str) -> String {
        let initial = username.chars().next().map(String::from).unwrap_or_default();
        let mut homedir = match self.homedir_schema {
            UserHomeDirectorySchema::Username => format!("{}/{username}", self.homedir_path),
            UserHomeDirectorySchema::InitialThenUsername => {
                format!("{}/{initial}/{username}", self.homedir_path)
            }
            UserHomeDirectorySchema::InitialThenUsernameNested => {
                format!("{}/{initial}/{username}/{username}", self.homedir_path)
            }
        };
        if !self.homedir_suffix.is_empty() {
            homedir = format!("{homedir}/{}", self.homedir_suffix);
        }
        homedir
    }
}

/// Docker Registry from which to get images.
#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase")]
pub struct DockerSourceConfig {
    /// Hostname and optional port of the Docker registry holding lab images.
    #[serde(default = "default_docker_registry")]
    pub registry: String,

    /// Docker repository path to the lab image, without tags or digests.
    /// This is sometimes called the image name.
    pub repository: String,

    /// Path to a file containing a JSON-encoded dictionary of Docker
    /// credentials, in the same format as a Kubernetes pull secret.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

fn default_docker_registry() -> String {
    "docker.io".to_string()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("/etc/secrets/.dockerconfigjson")
}

/// Google Artifact Registry from which to get images.
///
/// Google's naming convention is unfortunate: it uses "repository" for a
/// management level within a project that does not include the image name,
/// unlike the rest of the Docker world. This struct uses the Google
/// terminology, and `path` for what everything else calls the repository.
#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase")]
pub struct GARSourceConfig {
    /// Region or multiregion of the registry, the hostname with the
    /// `-docker.pkg.dev` suffix removed.
    pub location: String,

    /// Google Cloud Platform project ID containing the registry.
    pub project_id: String,

    /// Google Artifact Registry repository name.
    pub repository: String,

    /// Google Artifact Registry image name.
    pub image: String,
}

impl GARSourceConfig {
    /// Hostname holding the registry.
    pub fn registry(&self) -> String {
        format!("{}-docker.pkg.dev", self.location)
    }

    /// Parent string for list requests against the Google API.
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/repositories/{}",
            self.project_id, self.location, self.repository
        )
    }

    /// What everything else calls a repository.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.project_id, self.repository, self.image)
    }
}

/// Source of lab images.
#[derive(Debug, Clone, DeserializeDerive)]
#[serde(tag = "type")]
pub enum ImageSourceConfig {
    #[serde(rename = "docker")]
    Docker(DockerSourceConfig),

    #[serde(rename = "google")]
    Google(GARSourceConfig),
}

impl ImageSourceConfig {
    /// Registry hostname images come from.
    pub fn registry(&self) -> String {
        match self {
            ImageSourceConfig::Docker(docker) => docker.registry.clone(),
            ImageSourceConfig::Google(gar) => gar.registry(),
        }
    }

    /// Repository path used in image references.
    pub fn repository(&self) -> String {
        match self {
            ImageSourceConfig::Docker(docker) => docker.repository.clone(),
            ImageSourceConfig::Google(gar) => gar.path(),
        }
    }
}

#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageConfig {
    pub source: ImageSourceConfig,

    /// This image is shown first on the menu as the default choice.
    #[serde(default = "default_recommended_tag")]
    pub recommended_tag: String,

    /// This many releases, starting with the most recent, are prepulled and
    /// shown as menu selections.
    #[serde(default = "default_num_releases")]
    pub num_releases: usize,

    #[serde(default = "default_num_weeklies")]
    pub num_weeklies: usize,

    #[serde(default = "default_num_dailies")]
    pub num_dailies: usize,

    /// If set, only images with a matching SAL cycle are shown and
    /// prepulled.
    #[serde(default)]
    pub cycle: Option<i32>,

    /// Image tags to prepull and pin to the menu even when they would not
    /// normally qualify.
    #[serde(default)]
    pub pin: Vec<String>,

    /// Tags automatically recognized as alias tags rather than unknown
    /// tags, which results in different sorting and better descriptions.
    #[serde(default)]
    pub alias_tags: Vec<String>,

    /// How frequently to refresh the list of remote and cached images.
    #[serde(default = "default_refresh_interval", deserialize_with = "deserialize_duration")]
    pub refresh_interval: Duration,

    /// Optional display filter applied after refresh.
    #[serde(default)]
    pub filter: Option<RSPImageFilterPolicy>,
}

fn default_recommended_tag() -> String {
    "recommended".to_string()
}

fn default_num_releases() -> usize {
    1
}

fn default_num_weeklies() -> usize {
    2
}

fn default_num_dailies() -> usize {
    3
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PrepullerConfig {
    /// Tolerations matched against node taints to determine prepull
    /// eligibility.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Only nodes with these labels are considered for prepulling.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// How many prepull pods may run at once for a single image.
    #[serde(default = "default_prepull_concurrency")]
    pub concurrency: usize,
}

fn default_prepull_concurrency() -> usize {
    4
}

impl Default for PrepullerConfig {
    fn default() -> Self {
        PrepullerConfig {
            tolerations: Vec::new(),
            node_selector: BTreeMap::new(),
            concurrency: default_prepull_concurrency(),
        }
    }
}

#[derive(Debug, Clone, DeserializeDerive)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GafaelfawrConfig {
    /// Base URL of the Gafaelfawr service.
    pub base_url: Url,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "
name: Nublado
lab:
  namespacePrefix: userlabs
  sizes:
    - size: small
      cpu: 1.0
      memory: 2Gi
    - size: medium
      cpu: 2.0
      memory: 4Gi
  env:
    API_ROUTE: /api
  secrets:
    - secretName: extra-secret
      secretKey: token
  spawnTimeout: 10m
images:
  source:
    type: docker
    registry: lighthouse.ceres
    repository: library/sketchbook
  numWeeklies: 2
prepuller:
  tolerations:
    - key: informatics
      operator: Exists
gafaelfawr:
  baseUrl: https://lighthouse.ceres
";

    #[test]
    fn test_deserialize() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.name, "Nublado");
        assert_eq!(config.path_prefix, "/nublado");
        assert_eq!(config.lab.sizes.len(), 2);
        assert_eq!(config.lab.spawn_timeout, Duration::from_secs(600));
        assert_eq!(config.lab.namespace_for_user("rachel"), "userlabs-rachel");
        assert_eq!(config.images.num_weeklies, 2);
        assert_eq!(config.images.num_dailies, 3);
        assert_eq!(config.images.source.registry(), "lighthouse.ceres");
        assert_eq!(config.prepuller.tolerations.len(), 1);
        match &config.images.source {
            ImageSourceConfig::Docker(docker) => {
                assert_eq!(docker.repository, "library/sketchbook");
            }
            _ => panic!("wrong source type"),
        }
    }

    #[test]
    fn test_gar_source() {
        let source: GARSourceConfig = serde_yaml::from_str(
            "
            location: us-central1
            projectId: ceres-lighthouse-6ab4
            repository: library
            image: sketchbook
            ",
        )
        .unwrap();
        assert_eq!(source.registry(), "us-central1-docker.pkg.dev");
        assert_eq!(
            source.parent(),
            "projects/ceres-lighthouse-6ab4/locations/us-central1/repositories/library"
        );
        assert_eq!(source.path(), "ceres-lighthouse-6ab4/library/sketchbook");
    }

    #[test]
    fn test_homedir_schemas() {
        let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.lab.homedir_for_user("rachel"), "/home/rachel");
        config.lab.homedir_schema = UserHomeDirectorySchema::InitialThenUsername;
        config.lab.homedir_path = "/u/home".to_string();
        config.lab.homedir_suffix = "jhome".to_string();
        assert_eq!(config.lab.homedir_for_user("rachel"), "/u/home/r/rachel/jhome");
    }
}
