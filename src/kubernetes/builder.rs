//! Deterministic construction of the Kubernetes objects for a lab.
//!
//! The builder is pure: identical inputs yield identical objects modulo
//! Kubernetes-assigned fields, so tests can compare output directly and
//! retries are safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvFromSource, LocalObjectReference, Namespace, Pod, PodSpec, ResourceQuota, ResourceQuotaSpec,
    ResourceRequirements, Secret, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::{Config, TmpSource};
use crate::constants::{LAB_PORT, LAB_SERVICE_NAME};
use crate::models::gafaelfawr::GafaelfawrUser;
use crate::models::image::RSPImage;
use crate::models::lab::{LabRequestOptions, LabResources, ResourceQuantity};

/// Base passwd entries present in every lab, before the user is appended.
const BASE_PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
bin:x:1:1:bin:/bin:/sbin/nologin
daemon:x:2:2:daemon:/sbin:/sbin/nologin
adm:x:3:4:adm:/var/adm:/sbin/nologin
lp:x:4:7:lp:/var/spool/lpd:/sbin/nologin
sync:x:5:0:sync:/sbin:/bin/sync
shutdown:x:6:0:shutdown:/sbin:/sbin/shutdown
halt:x:7:0:halt:/sbin:/sbin/halt
mail:x:8:12:mail:/var/spool/mail:/sbin/nologin
operator:x:11:0:operator:/root:/sbin/nologin
games:x:12:100:games:/usr/games:/sbin/nologin
ftp:x:14:50:FTP User:/var/ftp:/sbin/nologin
dbus:x:81:81:System message bus:/:/sbin/nologin
nobody:x:65534:65534:Kernel Overflow User:/:/sbin/nologin
";

/// Base group entries present in every lab, before user groups are
/// appended.
const BASE_GROUP: &str = "\
root:x:0:
bin:x:1:
daemon:x:2:
sys:x:3:
adm:x:4:
tty:x:5:
disk:x:6:
lp:x:7:
mem:x:8:
kmem:x:9:
wheel:x:10:
cdrom:x:11:
mail:x:12:
ftp:x:50:
dbus:x:81:
utmp:x:22:
utempter:x:35:
input:x:999:
systemd-journal:x:190:
systemd-network:x:192:
nobody:x:65534:
";

/// Replace slashes so a file path can be used as a ConfigMap key.
fn deslashify(path: &str) -> String {
    path.replace('/', "_._")
}

/// Format a CPU quantity the way Kubernetes expects.
fn cpu_quantity(cpu: f64) -> Quantity {
    Quantity(format!("{}m", (cpu * 1000.0).round() as i64))
}

fn memory_quantity(memory: i64) -> Quantity {
    Quantity(memory.to_string())
}

/// All of the Kubernetes objects that make up one lab.
#[derive(Debug, Clone)]
pub struct LabObjects {
    pub namespace: Namespace,
    pub quota: Option<ResourceQuota>,
    pub network_policy: NetworkPolicy,
    pub service: Service,
    pub secrets: Vec<Secret>,
    pub config_maps: Vec<ConfigMap>,
    pub pod: Pod,
}

/// Builds the Kubernetes objects for user labs and prepull pods.
pub struct LabBuilder {
    config: Arc<Config>,
}

impl LabBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        LabBuilder { config }
    }

    /// Name used for most per-user lab objects.
    pub fn object_name(username: &str) -> String {
        format!("{username}-nb")
    }

    /// The namespace for a user's lab.
    pub fn namespace_name(&self, username: &str) -> String {
        self.config.lab.namespace_for_user(username)
    }

    /// Cluster-internal URL at which the lab will answer.
    pub fn internal_url(&self, username: &str) -> String {
        let namespace = self.namespace_name(username);
        format!("http://{LAB_SERVICE_NAME}.{namespace}:{LAB_PORT}/nb/user/{username}/")
    }

    fn labels(&self, username: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("nublado.lsst.io/category".to_string(), "lab".to_string()),
            ("nublado.lsst.io/user".to_string(), username.to_string()),
        ])
    }

    fn metadata(&self, username: &str, name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|n| n.to_string()),
            labels: Some(self.labels(username)),
            ..ObjectMeta::default()
        }
    }

    /// Build every object for a user's lab.
    ///
    /// `secret_data` holds the values already read from the source secrets
    /// in the controller namespace; `pull_secret_data` is the data of the
    /// configured pull secret, if one is set.
    pub fn build_lab(
        &self,
        user: &GafaelfawrUser,
        options: &LabRequestOptions,
        env: &BTreeMap<String, String>,
        image: &RSPImage,
        resources: &LabResources,
        secret_data: BTreeMap<String, ByteString>,
        pull_secret_data: Option<BTreeMap<String, ByteString>>,
    ) -> LabObjects {
        let username = user.username();
        let namespace = self.namespace_name(username);
        let mut secrets = vec![self.build_secret(user, &namespace, secret_data)];
        if let Some(data) = pull_secret_data {
            secrets.push(self.build_pull_secret(username, &namespace, data));
        }
        LabObjects {
            namespace: self.build_namespace(username, &namespace),
            quota: self.build_quota(user, &namespace),
            network_policy: self.build_network_policy(username, &namespace),
            service: self.build_service(username, &namespace),
            secrets,
            config_maps: vec![
                self.build_env_config_map(user, options, env, image, resources, &namespace),
                self.build_files_config_map(username, &namespace),
                self.build_nss_config_map(user, &namespace),
            ],
            pod: self.build_pod(user, options, image, resources, &namespace),
        }
    }

    fn build_namespace(&self, username: &str, namespace: &str) -> Namespace {
        Namespace {
            metadata: self.metadata(username, namespace, None),
            ..Namespace::default()
        }
    }

    fn build_quota(&self, user: &GafaelfawrUser, namespace: &str) -> Option<ResourceQuota> {
        let quota = self.quota_for_user(user)?;
        Some(ResourceQuota {
            metadata: self.metadata(user.username(), &Self::object_name(user.username()), Some(namespace)),
            spec: Some(ResourceQuotaSpec {
                hard: Some(BTreeMap::from([
                    ("limits.cpu".to_string(), cpu_quantity(quota.cpu)),
                    ("limits.memory".to_string(), memory_quantity(quota.memory)),
                ])),
                ..ResourceQuotaSpec::default()
            }),
            status: None,
        })
    }

    /// The resource quota for a user, from their Gafaelfawr notebook quota.
    pub fn quota_for_user(&self, user: &GafaelfawrUser) -> Option<ResourceQuantity> {
        user.notebook_quota().map(|quota| ResourceQuantity {
            cpu: quota.cpu,
            memory: quota.memory_bytes(),
        })
    }

    fn build_network_policy(&self, username: &str, namespace: &str) -> NetworkPolicy {
        NetworkPolicy {
            metadata: self.metadata(username, &Self::object_name(username), Some(namespace)),
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(self.labels(username)),
                    match_expressions: None,
                },
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: None,
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(i32::from(LAB_PORT))),
                        ..NetworkPolicyPort::default()
                    }]),
                }]),
                egress: None,
            }),
        }
    }

    fn build_service(&self, username: &str, namespace: &str) -> Service {
        Service {
            metadata: self.metadata(username, LAB_SERVICE_NAME, Some(namespace)),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: i32::from(LAB_PORT),
                    target_port: Some(IntOrString::Int(i32::from(LAB_PORT))),
                    ..ServicePort::default()
                }]),
                selector: Some(self.labels(username)),
                ..ServiceSpec::default()
            }),
            status: None,
        }
    }

    fn build_secret(
        &self,
        user: &GafaelfawrUser,
        namespace: &str,
        mut data: BTreeMap<String, ByteString>,
    ) -> Secret {
        data.insert("token".to_string(), ByteString(user.token.clone().into_bytes()));
        Secret {
            metadata: self.metadata(user.username(), &Self::object_name(user.username()), Some(namespace)),
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        }
    }

    fn build_pull_secret(
        &self,
        username: &str,
        namespace: &str,
        data: BTreeMap<String, ByteString>,
    ) -> Secret {
        Secret {
            metadata: self.metadata(username, "pull-secret", Some(namespace)),
            data: Some(data),
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Secret::default()
        }
    }

    fn build_env_config_map(
        &self,
        user: &GafaelfawrUser,
        options: &LabRequestOptions,
        env: &BTreeMap<String, String>,
        image: &RSPImage,
        resources: &LabResources,
        namespace: &str,
    ) -> ConfigMap {
        let username = user.username();
        let mut data = self.config.lab.env.clone();
        data.extend(env.clone());

        let size_description = self
            .config
            .lab
            .size_definition(options.size)
            .map(|definition| definition.description())
            .unwrap_or_else(|| options.size.title());
        data.insert("JUPYTERLAB_CONFIG_DIR".to_string(), self.config.lab.jupyterlab_config_dir.clone());
        data.insert("CONTAINER_SIZE".to_string(), size_description);
        data.insert("CPU_GUARANTEE".to_string(), resources.requests.cpu.to_string());
        data.insert("CPU_LIMIT".to_string(), resources.limits.cpu.to_string());
        data.insert("MEM_GUARANTEE".to_string(), resources.requests.memory.to_string());
        data.insert("MEM_LIMIT".to_string(), resources.limits.memory.to_string());
        data.insert("IMAGE_DIGEST".to_string(), image.digest.clone());
        data.insert("IMAGE_DESCRIPTION".to_string(), image.display_name.clone());
        data.insert("JUPYTER_IMAGE_SPEC".to_string(), image.reference_with_digest());
        data.insert(
            "FILE_BROWSER_ROOT".to_string(),
            self.config.lab.file_browser_root.as_str().to_string(),
        );
        if options.enable_debug {
            data.insert("DEBUG".to_string(), "TRUE".to_string());
        }
        if options.reset_user_env {
            data.insert("RESET_USER_ENV".to_string(), "TRUE".to_string());
        }

        ConfigMap {
            metadata: self.metadata(username, &format!("{}-env", Self::object_name(username)), Some(namespace)),
            data: Some(data),
            ..ConfigMap::default()
        }
    }

    fn build_files_config_map(&self, username: &str, namespace: &str) -> ConfigMap {
        let data: BTreeMap<String, String> = self
            .config
            .lab
            .files
            .iter()
            .map(|(path, contents)| (deslashify(path), contents.clone()))
            .collect();
        ConfigMap {
            metadata: self.metadata(
                username,
                &format!("{}-files", Self::object_name(username)),
                Some(namespace),
            ),
            data: Some(data),
            ..ConfigMap::default()
        }
    }

    fn build_nss_config_map(&self, user: &GafaelfawrUser, namespace: &str) -> ConfigMap {
        let username = user.username();
        let homedir = self.config.lab.homedir_for_user(username);
        let gecos = user.info.name.clone().unwrap_or_default();
        let mut passwd = BASE_PASSWD.to_string();
        passwd.push_str(&format!(
            "{username}:x:{}:{}:{gecos}:{homedir}:/bin/bash\n",
            user.info.uid, user.info.gid
        ));
        let mut group = BASE_GROUP.to_string();
        for user_group in &user.info.groups {
            let Some(id) = user_group.id else {
                continue;
            };
            let members = if id == user.info.gid { "" } else { username };
            group.push_str(&format!("{}:x:{id}:{members}\n", user_group.name));
        }

        ConfigMap {
            metadata: self.metadata(username, &format!("{}-nss", Self::object_name(username)), Some(namespace)),
            data: Some(BTreeMap::from([
                ("passwd".to_string(), passwd),
                ("group".to_string(), group),
            ])),
            ..ConfigMap::default()
        }
    }

    fn build_pod(
        &self,
        user: &GafaelfawrUser,
        options: &LabRequestOptions,
        image: &RSPImage,
        resources: &LabResources,
        namespace: &str,
    ) -> Pod {
        let username = user.username();
        let name = Self::object_name(username);
        let homedir = self.config.lab.homedir_for_user(username);

        let volumes = vec![
            Volume {
                name: "nss".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: format!("{name}-nss"),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            },
            Volume {
                name: "files".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: format!("{name}-files"),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            },
            Volume {
                name: "secrets".to_string(),
                secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    ..k8s_openapi::api::core::v1::SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
            Volume {
                name: "tmp".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: match self.config.lab.tmp_source {
                        TmpSource::Memory => Some("Memory".to_string()),
                        TmpSource::Disk => None,
                    },
                    size_limit: None,
                }),
                ..Volume::default()
            },
        ];

        let mut volume_mounts = vec![
            VolumeMount {
                name: "nss".to_string(),
                mount_path: "/etc/passwd".to_string(),
                sub_path: Some("passwd".to_string()),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "nss".to_string(),
                mount_path: "/etc/group".to_string(),
                sub_path: Some("group".to_string()),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "secrets".to_string(),
                mount_path: self.config.lab.secrets_path.clone(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "tmp".to_string(),
                mount_path: "/tmp".to_string(),
                ..VolumeMount::default()
            },
        ];
        for path in self.config.lab.files.keys() {
            volume_mounts.push(VolumeMount {
                name: "files".to_string(),
                mount_path: path.clone(),
                sub_path: Some(deslashify(path)),
                read_only: Some(true),
                ..VolumeMount::default()
            });
        }

        let container = Container {
            name: "notebook".to_string(),
            image: Some(image.reference_with_digest()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(self.config.lab.lab_start_command.clone()),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: format!("{name}-env"),
                    optional: Some(false),
                }),
                ..EnvFromSource::default()
            }]),
            ports: Some(vec![ContainerPort {
                container_port: i32::from(LAB_PORT),
                name: Some("jupyterlab".to_string()),
                ..ContainerPort::default()
            }]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), cpu_quantity(resources.limits.cpu)),
                    ("memory".to_string(), memory_quantity(resources.limits.memory)),
                ])),
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), cpu_quantity(resources.requests.cpu)),
                    ("memory".to_string(), memory_quantity(resources.requests.memory)),
                ])),
                claims: None,
            }),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(user.info.uid),
                run_as_group: Some(user.info.gid),
                allow_privilege_escalation: Some(false),
                ..SecurityContext::default()
            }),
            working_dir: Some(homedir),
            volume_mounts: Some(volume_mounts.clone()),
            ..Container::default()
        };

        let image_pull_secrets = self
            .config
            .lab
            .pull_secret
            .as_ref()
            .map(|_| vec![LocalObjectReference { name: "pull-secret".to_string() }]);

        // The submitted options and user identity ride along as annotations
        // so the reconciler can rebuild lab state from cluster contents
        // after a controller restart.
        let mut annotations = self.config.lab.extra_annotations.clone();
        if let Ok(serialized) = serde_json::to_string(options) {
            annotations.insert("nublado.lsst.io/user-options".to_string(), serialized);
        }
        if let Ok(serialized) = serde_json::to_string(&crate::models::lab::UserInfo::from_gafaelfawr(user)) {
            annotations.insert("nublado.lsst.io/user-info".to_string(), serialized);
        }
        let mut metadata = self.metadata(username, &name, Some(namespace));
        metadata.annotations = Some(annotations);

        Pod {
            metadata,
            spec: Some(PodSpec {
                automount_service_account_token: Some(false),
                containers: vec![container],
                image_pull_secrets,
                restart_policy: Some("Never".to_string()),
                volumes: Some(volumes),
                ..PodSpec::default()
            }),
            status: None,
        }
    }

    /// Build a pod that pulls an image to a specific node and exits.
    pub fn build_prepull_pod(&self, image: &RSPImage, node: &str) -> Pod {
        let name = prepull_pod_name(&image.tag, node);
        Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.config.lab.controller_namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "nublado.lsst.io/category".to_string(),
                    "prepuller".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "prepull".to_string(),
                    image: Some(image.reference_with_digest()),
                    command: Some(vec!["/bin/true".to_string()]),
                    ..Container::default()
                }],
                node_name: Some(node.to_string()),
                restart_policy: Some("Never".to_string()),
                ..PodSpec::default()
            }),
            status: None,
        }
    }
}

/// Name of the prepull pod for a tag on a node, sanitized into a valid
/// Kubernetes object name.
pub fn prepull_pod_name(tag: &str, node: &str) -> String {
    let tag = tag.replace(['_', '.', '+'], "-").to_lowercase();
    format!("prepull-{tag}-{node}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gafaelfawr::{GafaelfawrUserInfo, UserGroup};
    use crate::models::lab::{LabSize, RawLabRequestOptions};
    use crate::models::tag::RSPImageTag;

    fn test_config() -> Arc<Config> {
        let yaml = "
lab:
  sizes:
    - size: small
      cpu: 1.0
      memory: 2Gi
    - size: medium
      cpu: 2.0
      memory: 4Gi
  env:
    API_ROUTE: /api
  files:
    /etc/dask/config.yaml: 'dask: true'
images:
  source:
    type: docker
    registry: lighthouse.ceres
    repository: library/sketchbook
gafaelfawr:
  baseUrl: https://lighthouse.ceres
";
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn test_user() -> GafaelfawrUser {
        GafaelfawrUser {
            info: GafaelfawrUserInfo {
                username: "rachel".to_string(),
                name: Some("Rachel (?)".to_string()),
                uid: 1101,
                gid: 1101,
                groups: vec![
                    UserGroup {
                        name: "rachel".to_string(),
                        id: Some(1101),
                    },
                    UserGroup {
                        name: "lunatics".to_string(),
                        id: Some(2028),
                    },
                ],
                quota: Some(crate::models::gafaelfawr::UserQuota {
                    api: Default::default(),
                    notebook: Some(crate::models::gafaelfawr::NotebookQuota {
                        cpu: 9.0,
                        memory: 27.0,
                        spawn: true,
                    }),
                }),
            },
            token: "token-of-affection".to_string(),
        }
    }

    fn test_image() -> RSPImage {
        RSPImage::from_tag(
            "lighthouse.ceres",
            "library/sketchbook",
            RSPImageTag::from_str("d_2077_10_23"),
            "sha256:1234",
        )
    }

    fn test_options() -> LabRequestOptions {
        let raw: RawLabRequestOptions = serde_json::from_value(serde_json::json!({
            "image_tag": "d_2077_10_23",
            "size": "medium",
        }))
        .unwrap();
        raw.normalize().unwrap()
    }

    fn build_objects() -> LabObjects {
        let config = test_config();
        let builder = LabBuilder::new(config.clone());
        let options = test_options();
        let resources = config.lab.size_definition(LabSize::Medium).unwrap().to_resources().unwrap();
        builder.build_lab(
            &test_user(),
            &options,
            &maplit::btreemap! {"X".to_string() => "1".to_string()},
            &test_image(),
            &resources,
            BTreeMap::new(),
            None,
        )
    }

    #[test]
    fn test_object_names() {
        let objects = build_objects();
        assert_eq!(objects.namespace.metadata.name.as_deref(), Some("userlabs-rachel"));
        assert_eq!(objects.pod.metadata.name.as_deref(), Some("rachel-nb"));
        assert_eq!(objects.pod.metadata.namespace.as_deref(), Some("userlabs-rachel"));
        assert_eq!(objects.service.metadata.name.as_deref(), Some("lab"));
        assert_eq!(objects.network_policy.metadata.name.as_deref(), Some("rachel-nb"));
        assert_eq!(objects.secrets[0].metadata.name.as_deref(), Some("rachel-nb"));
        let names: Vec<_> =
            objects.config_maps.iter().map(|cm| cm.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["rachel-nb-env", "rachel-nb-files", "rachel-nb-nss"]);
    }

    #[test]
    fn test_determinism() {
        let first = build_objects();
        let second = build_objects();
        assert_eq!(first.pod, second.pod);
        assert_eq!(first.config_maps, second.config_maps);
        assert_eq!(first.secrets, second.secrets);
    }

    #[test]
    fn test_quota() {
        let objects = build_objects();
        let quota = objects.quota.expect("user has a quota");
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard["limits.cpu"].0, "9000m");
        assert_eq!(hard["limits.memory"].0, (27_i64 * 1024 * 1024 * 1024).to_string());
    }

    #[test]
    fn test_env_config_map() {
        let objects = build_objects();
        let env = objects.config_maps[0].data.clone().unwrap();
        assert_eq!(env["API_ROUTE"], "/api");
        assert_eq!(env["X"], "1");
        assert_eq!(env["CONTAINER_SIZE"], "Medium (2.0 CPU, 4Gi RAM)");
        assert_eq!(env["IMAGE_DIGEST"], "sha256:1234");
        assert_eq!(
            env["JUPYTER_IMAGE_SPEC"],
            "lighthouse.ceres/library/sketchbook:d_2077_10_23@sha256:1234"
        );
        assert_eq!(env["JUPYTERLAB_CONFIG_DIR"], "/opt/lsst/software/jupyterlab/etc");
        assert!(!env.contains_key("DEBUG"));
    }

    #[test]
    fn test_nss_config_map() {
        let objects = build_objects();
        let nss = objects.config_maps[2].data.clone().unwrap();
        let passwd = &nss["passwd"];
        assert!(passwd.ends_with("rachel:x:1101:1101:Rachel (?):/home/rachel:/bin/bash\n"));
        let group = &nss["group"];
        assert!(group.contains("rachel:x:1101:\n"));
        assert!(group.contains("lunatics:x:2028:rachel\n"));
    }

    #[test]
    fn test_pod_spec() {
        let objects = build_objects();
        let spec = objects.pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.name, "notebook");
        assert_eq!(container.working_dir.as_deref(), Some("/home/rachel"));
        assert_eq!(
            container.image.as_deref(),
            Some("lighthouse.ceres/library/sketchbook:d_2077_10_23@sha256:1234")
        );
        let limits = container.resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits["cpu"].0, "2000m");

        // /tmp defaults to memory backing.
        let tmp = spec
            .volumes
            .unwrap()
            .into_iter()
            .find(|volume| volume.name == "tmp")
            .unwrap();
        assert_eq!(tmp.empty_dir.unwrap().medium.as_deref(), Some("Memory"));

        // Mounted files reflect the configured paths.
        let mounts = container.volume_mounts.clone().unwrap();
        assert!(
            mounts
                .iter()
                .any(|m| m.mount_path == "/etc/dask/config.yaml"
                    && m.sub_path.as_deref() == Some("_._etc_._dask_._config.yaml"))
        );
    }

    #[test]
    fn test_tmp_on_disk() {
        let mut config: Config = {
            let base = test_config();
            (*base).clone()
        };
        config.lab.tmp_source = TmpSource::Disk;
        let builder = LabBuilder::new(Arc::new(config));
        let options = test_options();
        let resources =
            builder.config.lab.size_definition(LabSize::Medium).unwrap().to_resources().unwrap();
        let objects = builder.build_lab(
            &test_user(),
            &options,
            &BTreeMap::new(),
            &test_image(),
            &resources,
            BTreeMap::new(),
            None,
        );
        let spec = objects.pod.spec.unwrap();
        let tmp = spec
            .volumes
            .unwrap()
            .into_iter()
            .find(|volume| volume.name == "tmp")
            .unwrap();
        assert!(tmp.empty_dir.unwrap().medium.is_none());
    }

    #[test]
    fn test_prepull_pod() {
        let config = test_config();
        let builder = LabBuilder::new(config);
        let pod = builder.build_prepull_pod(&test_image(), "node1");
        assert_eq!(pod.metadata.name.as_deref(), Some("prepull-d-2077-10-23-node1"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("nublado"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node1"));
        assert_eq!(spec.containers[0].command.clone().unwrap(), vec!["/bin/true"]);
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_internal_url() {
        let builder = LabBuilder::new(test_config());
        assert_eq!(
            builder.internal_url("rachel"),
            "http://lab.userlabs-rachel:8888/nb/user/rachel/"
        );
    }
}
