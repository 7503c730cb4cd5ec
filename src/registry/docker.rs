//! Client for the Docker Registry v2 API.
//!
//! Handles both Basic and Bearer token authentication, and tag-list
//! pagination via `Link` headers as implemented by ghcr.io (Docker Hub does
//! not paginate at all).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, LINK, WWW_AUTHENTICATE};
use serde_derive::Deserialize;

use crate::config::{DockerSourceConfig, ImageConfig};
use crate::errors::ControllerError;
use crate::models::arch::filter_arch_tags;
use crate::models::docker::DockerCredentialStore;
use crate::models::image::{RSPImage, RSPImageCollection};
use crate::models::policy::filter_images;
use crate::models::tag::RSPImageTag;
use crate::registry::ImageSource;

/// How many digest lookups may run concurrently during a refresh.
const DIGEST_FETCH_CONCURRENCY: usize = 8;

/// Accept header sent when requesting manifests.
///
/// All of the multi-architecture manifest types, plus `application/json` at
/// a lower quality factor to accommodate older registries.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/json;q=0.5";

static LINK_NEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<(?P<uri>[^>]+)>\s*;\s*rel="?next"?"#).unwrap());

static CHALLENGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?P<key>\w+)="(?P<value>[^"]*)""#).unwrap());

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Client for the Docker Registry v2 API, serving as an image source.
pub struct DockerImageSource {
    http: reqwest::Client,
    source: DockerSourceConfig,
    credentials: DockerCredentialStore,
    images: ImageConfig,
    // Bearer tokens per registry host, cached across requests.
    tokens: Mutex<HashMap<String, String>>,
}

impl DockerImageSource {
    pub fn new(
        http: reqwest::Client,
        source: DockerSourceConfig,
        images: ImageConfig,
    ) -> Result<Self, ControllerError> {
        let credentials = DockerCredentialStore::from_path(&source.credentials_path)?;
        Ok(DockerImageSource {
            http,
            source,
            credentials,
            images,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn registry_error(&self, message: String) -> ControllerError {
        ControllerError::DockerRegistry {
            registry: self.source.registry.clone(),
            message,
        }
    }

    /// List the tags of the configured repository, following pagination and
    /// filtering out architecture-suffixed duplicates.
    pub async fn list_tags(&self) -> Result<Vec<String>, ControllerError> {
        let mut url = format!(
            "https://{}/v2/{}/tags/list",
            self.source.registry, self.source.repository
        );
        let mut seen = HashSet::new();
        let mut tags = Vec::new();
        loop {
            if !seen.insert(url.clone()) {
                return Err(ControllerError::DuplicateUrl { url });
            }
            let response = self.get(&url, None).await?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|link| link.to_str().ok())
                .and_then(parse_next_link);
            let body: TagList = response
                .json()
                .await
                .map_err(|e| self.registry_error(e.to_string()))?;
            tags.extend(body.tags);
            match next {
                Some(next) if next.starts_with("http") => url = next,
                Some(next) => url = format!("https://{}{next}", self.source.registry),
                None => break,
            }
        }
        Ok(filter_arch_tags(&tags))
    }

    /// Get the digest for one tag via a HEAD request for its manifest.
    pub async fn get_image_digest(&self, tag: &str) -> Result<String, ControllerError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{tag}",
            self.source.registry, self.source.repository
        );
        let response = self.head(&url, Some(MANIFEST_ACCEPT)).await?;
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|digest| digest.to_str().ok())
            .map(|digest| digest.to_string())
            .ok_or_else(|| self.registry_error(format!("no digest returned for tag {tag}")))
    }

    async fn get(&self, url: &str, accept: Option<&str>) -> Result<reqwest::Response, ControllerError> {
        self.request(reqwest::Method::GET, url, accept).await
    }

    async fn head(&self, url: &str, accept: Option<&str>) -> Result<reqwest::Response, ControllerError> {
        self.request(reqwest::Method::HEAD, url, accept).await
    }

    /// Make an authenticated request, answering a Bearer challenge with a
    /// token exchange and retrying once.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, ControllerError> {
        let response = self.send(method.clone(), url, accept).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return self.check_status(response, url).await;
        }
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|header| header.to_str().ok())
            .map(|header| header.to_string())
            .ok_or_else(|| self.registry_error(format!("authentication failed for {url}")))?;
        if challenge.trim_start().to_lowercase().starts_with("bearer") {
            self.exchange_token(&challenge).await?;
            let response = self.send(method, url, accept).await?;
            self.check_status(response, url).await
        } else {
            Err(self.registry_error(format!("authentication failed for {url}")))
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response, ControllerError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.registry_error(format!("status {} for {url}", response.status().as_u16())))
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, ControllerError> {
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(
                reqwest::header::ACCEPT,
                HeaderValue::from_str(accept).map_err(|e| self.registry_error(e.to_string()))?,
            );
        }
        let token = {
            let tokens = self.tokens.lock().expect("token cache lock poisoned");
            tokens.get(&self.source.registry).cloned()
        };
        let mut request = self.http.request(method, url).headers(headers);
        request = match token {
            Some(token) => request.bearer_auth(token),
            None => match self.credentials.get(&self.source.registry) {
                Some(credentials) => {
                    request.basic_auth(&credentials.username, Some(&credentials.password))
                }
                None => request,
            },
        };
        request.send().await.map_err(|e| self.registry_error(e.to_string()))
    }

    /// Exchange registry credentials for a bearer token, following the
    /// parameters of the authentication challenge.
    async fn exchange_token(&self, challenge: &str) -> Result<(), ControllerError> {
        let mut realm = None;
        let mut params = Vec::new();
        for capture in CHALLENGE_PARAM.captures_iter(challenge) {
            let key = capture["key"].to_string();
            let value = capture["value"].to_string();
            if key == "realm" {
                realm = Some(value);
            } else {
                params.push((key, value));
            }
        }
        let realm =
            realm.ok_or_else(|| self.registry_error("no realm in authentication challenge".to_string()))?;
        let credentials = self
            .credentials
            .get(&self.source.registry)
            .ok_or_else(|| self.registry_error(format!("no credentials for {}", self.source.registry)))?;
        let response = self
            .http
            .get(&realm)
            .query(&params)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(|e| self.registry_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.registry_error(format!(
                "status {} from token endpoint {realm}",
                response.status().as_u16()
            )));
        }
        let body: TokenResponse =
            response.json().await.map_err(|e| self.registry_error(e.to_string()))?;
        let mut tokens = self.tokens.lock().expect("token cache lock poisoned");
        tokens.insert(self.source.registry.clone(), body.token);
        Ok(())
    }

    /// Parse a tag, treating the configured recommended and alias tags as
    /// alias tags.
    fn parse_tag(&self, tag: &str) -> RSPImageTag {
        if tag == self.images.recommended_tag || self.images.alias_tags.iter().any(|alias| alias == tag) {
            RSPImageTag::alias(tag)
        } else {
            RSPImageTag::from_str(tag)
        }
    }
}

#[async_trait]
impl ImageSource for DockerImageSource {
    async fn list_images(&self) -> Result<RSPImageCollection, ControllerError> {
        let tags = self.list_tags().await?;
        let mut images: Vec<RSPImage> = tags
            .iter()
            .map(|tag| {
                RSPImage::from_tag(&self.source.registry, &self.source.repository, self.parse_tag(tag), "")
            })
            .filter(|image| self.images.cycle.is_none() || image.cycle == self.images.cycle)
            .collect();
        if let Some(policy) = &self.images.filter {
            images = filter_images(images, policy, Utc::now());
        }

        // Resolve each surviving tag to its digest. Tags are the unit of
        // listing in the Docker API, so this costs one HEAD request per tag.
        let resolved = futures::stream::iter(images.into_iter().map(|mut image| async move {
            let digest = self.get_image_digest(&image.tag).await?;
            image.digest = digest;
            Ok::<RSPImage, ControllerError>(image)
        }))
        .buffer_unordered(DIGEST_FETCH_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        let mut collection = RSPImageCollection::new([], self.images.cycle);
        for image in resolved {
            collection.add(image?);
        }
        Ok(collection)
    }

    async fn digest_for_tag(&self, tag: &str) -> Result<Option<String>, ControllerError> {
        Ok(Some(self.get_image_digest(tag).await?))
    }
}

/// Parse a `Link` header and return the target of a `rel="next"` link.
fn parse_next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find_map(|link| LINK_NEXT.captures(link).map(|captures| captures["uri"].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        let header = r#"</v2/library/sketchbook/tags/list?last=w_2021_22&n=0>; rel="next""#;
        assert_eq!(
            parse_next_link(header),
            Some("/v2/library/sketchbook/tags/list?last=w_2021_22&n=0".to_string())
        );
        let header = r#"<https://ghcr.io/v2/x/tags/list?last=a>; rel=next"#;
        assert_eq!(parse_next_link(header), Some("https://ghcr.io/v2/x/tags/list?last=a".to_string()));
        assert_eq!(parse_next_link(r#"</v2/x>; rel="prev""#), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn test_parse_challenge_params() {
        let challenge =
            r#"Bearer realm="https://lighthouse.ceres/auth",service="registry.docker.io",scope="repository:pull""#;
        let params: HashMap<String, String> = CHALLENGE_PARAM
            .captures_iter(challenge)
            .map(|c| (c["key"].to_string(), c["value"].to_string()))
            .collect();
        assert_eq!(params["realm"], "https://lighthouse.ceres/auth");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:pull");
    }
}
