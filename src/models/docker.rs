//! Docker references and registry credentials.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use crate::errors::ControllerError;

/// A parsed Docker image reference:
/// `registry/repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    /// Hostname (and optional port) of the registry.
    pub registry: String,

    /// Repository path within the registry, sometimes called the image name.
    pub repository: String,

    /// Tag, if present.
    pub tag: Option<String>,

    /// Digest, if present.
    pub digest: Option<String>,
}

impl DockerReference {
    /// Parse a Docker reference string.
    ///
    /// The registry must be fully qualified; a leading component containing
    /// a dot or a port is treated as the registry host, and anything else is
    /// assumed to live on Docker Hub.
    pub fn parse(reference: &str) -> Result<Self, ControllerError> {
        let invalid = || ControllerError::InvalidDockerReference {
            reference: reference.to_string(),
            loc: None,
        };
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some(_) => return Err(invalid()),
            None => (reference, None),
        };
        let (registry, path) = match rest.split_once('/') {
            Some((first, path)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), path)
            }
            _ => ("docker.io".to_string(), rest),
        };
        if path.is_empty() {
            return Err(invalid());
        }
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                if repository.is_empty() || tag.is_empty() {
                    return Err(invalid());
                }
                (repository.to_string(), Some(tag.to_string()))
            }
            _ => (path.to_string(), None),
        };
        Ok(DockerReference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl Display for DockerReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Credentials for one Docker registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerCredentials {
    pub username: String,
    pub password: String,
}

impl DockerCredentials {
    /// Base64 `user:password` form used in Docker configuration files and
    /// HTTP Basic authentication.
    pub fn auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }
}

/// Store of Docker credentials in Docker configuration file format.
///
/// Lookup falls back through parent domains, so credentials registered for
/// `example.com` also apply to `registry.example.com`.
#[derive(Debug, Default, Clone)]
pub struct DockerCredentialStore {
    credentials: HashMap<String, DockerCredentials>,
}

impl DockerCredentialStore {
    pub fn new(credentials: HashMap<String, DockerCredentials>) -> Self {
        DockerCredentialStore { credentials }
    }

    /// Load a credential store from a file in Docker configuration format.
    pub fn from_path(path: &Path) -> Result<Self, ControllerError> {
        let read_error = |error: String| ControllerError::InvalidConfig {
            path: path.display().to_string(),
            error,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| read_error(e.to_string()))?;
        let parsed: serde_json::Value =
            serde_json::from_str(&contents).map_err(|e| read_error(e.to_string()))?;
        let mut credentials = HashMap::new();
        let auths = parsed
            .get("auths")
            .and_then(|auths| auths.as_object())
            .ok_or_else(|| read_error("no auths key".to_string()))?;
        for (host, entry) in auths {
            let username = entry.get("username").and_then(|v| v.as_str());
            let password = entry.get("password").and_then(|v| v.as_str());
            let parsed = match (username, password) {
                (Some(username), Some(password)) => DockerCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                _ => {
                    let auth = entry
                        .get("auth")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| read_error(format!("no credentials for {host}")))?;
                    let decoded = BASE64
                        .decode(auth)
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                        .ok_or_else(|| read_error(format!("invalid auth for {host}")))?;
                    let (username, password) = decoded
                        .split_once(':')
                        .ok_or_else(|| read_error(format!("invalid auth for {host}")))?;
                    DockerCredentials {
                        username: username.to_string(),
                        password: password.to_string(),
                    }
                }
            };
            credentials.insert(host.clone(), parsed);
        }
        Ok(DockerCredentialStore { credentials })
    }

    /// Look up credentials for a host, falling back through parent domains.
    pub fn get(&self, host: &str) -> Option<&DockerCredentials> {
        if let Some(credentials) = self.credentials.get(host) {
            return Some(credentials);
        }
        let mut remainder = host;
        while let Some((_, parent)) = remainder.split_once('.') {
            if let Some(credentials) = self.credentials.get(parent) {
                return Some(credentials);
            }
            remainder = parent;
        }
        None
    }

    pub fn set(&mut self, host: &str, credentials: DockerCredentials) {
        self.credentials.insert(host.to_string(), credentials);
    }

    /// Serialize back to Docker configuration file format.
    pub fn to_json(&self) -> serde_json::Value {
        let auths: serde_json::Map<String, serde_json::Value> = self
            .credentials
            .iter()
            .map(|(host, credentials)| {
                (
                    host.clone(),
                    json!({
                        "username": credentials.username,
                        "password": credentials.password,
                        "auth": credentials.auth(),
                    }),
                )
            })
            .collect();
        json!({ "auths": auths })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let reference = DockerReference::parse("lighthouse.ceres/library/sketchbook:latest_daily").unwrap();
        assert_eq!(reference.registry, "lighthouse.ceres");
        assert_eq!(reference.repository, "library/sketchbook");
        assert_eq!(reference.tag.as_deref(), Some("latest_daily"));
        assert_eq!(reference.digest, None);
        assert_eq!(reference.to_string(), "lighthouse.ceres/library/sketchbook:latest_daily");

        let reference =
            DockerReference::parse("lighthouse.ceres/library/sketchbook:w_2077_43@sha256:1234").unwrap();
        assert_eq!(reference.tag.as_deref(), Some("w_2077_43"));
        assert_eq!(reference.digest.as_deref(), Some("sha256:1234"));

        let reference = DockerReference::parse("lighthouse.ceres/library/sketchbook").unwrap();
        assert_eq!(reference.tag, None);

        let reference = DockerReference::parse("library/sketchbook:latest").unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/sketchbook");

        let reference = DockerReference::parse("localhost:5000/sketchbook:latest").unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "sketchbook");

        assert!(DockerReference::parse("lighthouse.ceres/sketchbook@").is_err());
    }

    #[test]
    fn test_credential_store() {
        let mut store = DockerCredentialStore::default();
        assert!(store.get("example.com").is_none());
        let credentials = DockerCredentials {
            username: "foo".to_string(),
            password: "blahblah".to_string(),
        };
        store.set("example.com", credentials.clone());
        assert_eq!(store.get("example.com"), Some(&credentials));
        assert_eq!(store.get("foo.example.com"), Some(&credentials));
        assert!(store.get("example.org").is_none());

        let serialized = store.to_json();
        let auth = serialized["auths"]["example.com"]["auth"].as_str().unwrap();
        assert_eq!(auth, BASE64.encode(b"foo:blahblah"));
    }
}
