//! Error taxonomy for the Nublado controller.
//!
//! Every error carries an HTTP status, a machine-readable type slug used in
//! the `detail` body of error responses, and a Slack Block Kit rendering for
//! alerting.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

/// Format a timestamp the way the Slack renderers expect.
fn format_datetime(datetime: DateTime<Utc>) -> String {
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Unknown user {user}")]
    UnknownUser { user: String },

    #[error("Invalid Docker reference \"{reference}\"")]
    InvalidDockerReference {
        reference: String,
        loc: Option<&'static str>,
    },

    #[error("Docker reference \"{reference}\" has no tag")]
    DockerReferenceNoTag {
        reference: String,
        loc: Option<&'static str>,
    },

    #[error("Docker tag \"{tag}\" not found")]
    UnknownImage { tag: String },

    #[error("Invalid lab size \"{size}\"")]
    InvalidLabSize { size: String },

    #[error("{msg}")]
    InvalidOptions { msg: String, loc: Option<&'static str> },

    #[error("User token is invalid")]
    InvalidToken,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Insufficient quota to spawn requested lab")]
    InsufficientQuota,

    #[error("Lab already exists for {user}")]
    LabExists { user: String },

    #[error("{message}")]
    MissingObject {
        message: String,
        user: Option<String>,
        kind: String,
        namespace: Option<String>,
        name: String,
    },

    #[error("{message}")]
    DuplicateObject {
        message: String,
        user: Option<String>,
        kind: String,
        namespace: String,
    },

    #[error("{}", kubernetes_error_message(message, kind, namespace.as_deref(), name, *status, body.as_deref()))]
    Kubernetes {
        message: String,
        user: Option<String>,
        kind: String,
        namespace: Option<String>,
        name: String,
        status: Option<u16>,
        body: Option<String>,
    },

    #[error("{operation} timed out after {:?}", (*failed_at - *started_at).num_milliseconds() as f64 / 1000.0)]
    Timeout {
        operation: String,
        user: Option<String>,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },

    #[error("Error talking to Docker registry {registry}: {message}")]
    DockerRegistry { registry: String, message: String },

    #[error("Duplicate pagination URL {url} from Docker registry")]
    DuplicateUrl { url: String },

    #[error("Error talking to Google Artifact Registry: {message}")]
    ArtifactRegistry { message: String },

    #[error("Error talking to Gafaelfawr: {message}")]
    Gafaelfawr { message: String },

    #[error("Error posting Slack message: {message}")]
    Slack { message: String },

    #[error("Invalid configuration {path}: {error}")]
    InvalidConfig { path: String, error: String },

    #[error("Lab spawn for {user} cancelled")]
    Cancelled { user: String },
}

fn kubernetes_error_message(
    message: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
    status: Option<u16>,
    body: Option<&str>,
) -> String {
    let mut result = format!("{message} ({}", object_str(kind, namespace, name));
    if let Some(status) = status {
        result.push_str(&format!(", status {status}"));
    }
    result.push(')');
    if let Some(body) = body {
        result.push_str(&format!(": {body}"));
    }
    result
}

fn object_str(kind: &str, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) if !name.is_empty() => format!("{kind} {namespace}/{name}"),
        Some(namespace) => format!("{kind} {namespace}"),
        None => format!("{kind} {name}"),
    }
}

impl ControllerError {
    /// Construct a Kubernetes error from a kube client error.
    pub fn from_kube(
        error: kube::Error,
        doing: &str,
        user: Option<&str>,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Self {
        let (status, body) = match &error {
            kube::Error::Api(response) => (Some(response.code), Some(response.message.clone())),
            _ => (None, Some(error.to_string())),
        };
        ControllerError::Kubernetes {
            message: format!("Error {doing}"),
            user: user.map(|u| u.to_string()),
            kind: kind.to_string(),
            namespace: namespace.map(|n| n.to_string()),
            name: name.to_string(),
            status,
            body,
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            ControllerError::UnknownUser { .. } => 404,
            ControllerError::InvalidDockerReference { .. } => 422,
            ControllerError::DockerReferenceNoTag { .. } => 422,
            ControllerError::UnknownImage { .. } => 400,
            ControllerError::InvalidLabSize { .. } => 422,
            ControllerError::InvalidOptions { .. } => 422,
            ControllerError::InvalidToken => 401,
            ControllerError::PermissionDenied => 403,
            ControllerError::InsufficientQuota => 403,
            ControllerError::LabExists { .. } => 409,
            ControllerError::MissingObject { .. } => 404,
            ControllerError::DuplicateObject { .. } => 500,
            ControllerError::Kubernetes { .. } => 500,
            ControllerError::Timeout { .. } => 500,
            ControllerError::DockerRegistry { .. }
            | ControllerError::DuplicateUrl { .. }
            | ControllerError::ArtifactRegistry { .. }
            | ControllerError::Gafaelfawr { .. } => 502,
            ControllerError::Slack { .. } => 500,
            ControllerError::InvalidConfig { .. } => 500,
            ControllerError::Cancelled { .. } => 500,
        }
    }

    /// Machine-readable slug used in the error response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            ControllerError::UnknownUser { .. } => "unknown_user",
            ControllerError::InvalidDockerReference { .. } => "invalid_docker_reference",
            ControllerError::DockerReferenceNoTag { .. } => "invalid_docker_reference",
            ControllerError::UnknownImage { .. } => "unknown_image",
            ControllerError::InvalidLabSize { .. } => "invalid_lab_size",
            ControllerError::InvalidOptions { .. } => "invalid_options",
            ControllerError::InvalidToken => "invalid_token",
            ControllerError::PermissionDenied => "permission_denied",
            ControllerError::InsufficientQuota => "insufficient_quota",
            ControllerError::LabExists { .. } => "lab_exists",
            ControllerError::MissingObject { .. } => "missing_object",
            ControllerError::DuplicateObject { .. } => "duplicate_object",
            ControllerError::Kubernetes { .. } => "kubernetes_error",
            ControllerError::Timeout { .. } => "timeout",
            ControllerError::DockerRegistry { .. } => "docker_registry_error",
            ControllerError::DuplicateUrl { .. } => "docker_registry_error",
            ControllerError::ArtifactRegistry { .. } => "artifact_registry_error",
            ControllerError::Gafaelfawr { .. } => "gafaelfawr_error",
            ControllerError::Slack { .. } => "slack_error",
            ControllerError::InvalidConfig { .. } => "invalid_config",
            ControllerError::Cancelled { .. } => "cancelled",
        }
    }

    /// Location of the offending input, for input validation errors.
    pub fn loc(&self) -> Option<Vec<String>> {
        let body_options = |field: &str| {
            Some(vec!["body".to_string(), "options".to_string(), field.to_string()])
        };
        match self {
            ControllerError::UnknownUser { .. } => {
                Some(vec!["path".to_string(), "username".to_string()])
            }
            ControllerError::InvalidDockerReference { loc, .. }
            | ControllerError::DockerReferenceNoTag { loc, .. }
            | ControllerError::InvalidOptions { loc, .. } => {
                (*loc).and_then(|field| body_options(field))
            }
            ControllerError::UnknownImage { .. } => body_options("image_tag"),
            ControllerError::InvalidLabSize { .. } => body_options("size"),
            ControllerError::InsufficientQuota => body_options("size"),
            _ => None,
        }
    }

    /// The name of the error class shown in Slack alerts.
    pub fn exception_type(&self) -> &'static str {
        match self {
            ControllerError::Kubernetes { .. } => "KubernetesError",
            ControllerError::Timeout { .. } => "ControllerTimeoutError",
            ControllerError::MissingObject { .. } => "MissingObjectError",
            ControllerError::DuplicateObject { .. } => "DuplicateObjectError",
            ControllerError::DockerRegistry { .. } => "DockerRegistryError",
            ControllerError::DuplicateUrl { .. } => "DuplicateUrlError",
            ControllerError::ArtifactRegistry { .. } => "ArtifactRegistryError",
            ControllerError::Gafaelfawr { .. } => "GafaelfawrError",
            _ => "ControllerError",
        }
    }

    /// The user associated with this error, if any.
    pub fn user(&self) -> Option<&str> {
        match self {
            ControllerError::UnknownUser { user }
            | ControllerError::LabExists { user }
            | ControllerError::Cancelled { user } => Some(user),
            ControllerError::MissingObject { user, .. }
            | ControllerError::DuplicateObject { user, .. }
            | ControllerError::Kubernetes { user, .. }
            | ControllerError::Timeout { user, .. } => user.as_deref(),
            _ => None,
        }
    }

    /// JSON body for an HTTP error response.
    pub fn to_detail(&self) -> Value {
        let mut entry = serde_json::Map::new();
        if let Some(loc) = self.loc() {
            entry.insert("loc".to_string(), json!(loc));
        }
        entry.insert("msg".to_string(), json!(self.to_string()));
        entry.insert("type".to_string(), json!(self.error_type()));
        json!({ "detail": [Value::Object(entry)] })
    }

    /// The error summary shown as the first block of a Slack alert: the
    /// message without any trailing response body.
    pub fn slack_summary(&self) -> String {
        if let ControllerError::Kubernetes {
            message,
            kind,
            namespace,
            name,
            status,
            ..
        } = self
        {
            kubernetes_error_message(message, kind, namespace.as_deref(), name, *status, None)
        } else {
            self.to_string()
        }
    }

    /// Render this error as Slack Block Kit blocks.
    ///
    /// `summary` overrides the first block, letting callers add context like
    /// `Error in Nublado: ...`.
    pub fn to_slack_blocks(&self, summary: Option<&str>) -> Value {
        let mut blocks = Vec::new();
        let summary = summary.map(|s| s.to_string()).unwrap_or_else(|| self.slack_summary());
        blocks.push(section_text(&summary));

        let mut fields = Vec::new();
        match self {
            ControllerError::Timeout {
                started_at,
                failed_at,
                ..
            } => {
                fields.push(field_text("Started at", &format_datetime(*started_at)));
                fields.push(field_text("Failed at", &format_datetime(*failed_at)));
            }
            _ => {
                fields.push(field_text("Exception type", self.exception_type()));
                fields.push(field_text("Failed at", &format_datetime(Utc::now())));
            }
        }
        if let Some(user) = self.user() {
            fields.push(field_text("User", user));
        }
        if let ControllerError::Kubernetes { status: Some(status), .. } = self {
            fields.push(field_text("Status", &status.to_string()));
        }
        blocks.push(json!({ "type": "section", "fields": fields }));

        match self {
            ControllerError::Kubernetes {
                kind,
                namespace,
                name,
                body,
                ..
            } => {
                blocks.push(section_text(&format!(
                    "*Object*\n{}",
                    object_str(kind, namespace.as_deref(), name)
                )));
                if let Some(body) = body {
                    blocks.push(section_text(&format!("*Error*\n```\n{body}\n```")));
                }
            }
            ControllerError::MissingObject {
                kind,
                namespace,
                name,
                ..
            } => {
                blocks.push(section_text(&format!(
                    "*Object*\n{}",
                    object_str(kind, namespace.as_deref(), name)
                )));
            }
            ControllerError::DuplicateObject { kind, namespace, .. } => {
                blocks.push(section_text(&format!("*Object*\n{kind} {namespace}")));
            }
            _ => (),
        }

        blocks.push(json!({ "type": "divider" }));
        json!({ "blocks": blocks })
    }
}

fn section_text(text: &str) -> Value {
    json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": text, "verbatim": true },
    })
}

fn field_text(label: &str, value: &str) -> Value {
    json!({ "type": "mrkdwn", "text": format!("*{label}*\n{value}"), "verbatim": true })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_kubernetes_error_message() {
        let error = ControllerError::Kubernetes {
            message: "Error creating object".to_string(),
            user: Some("rachel".to_string()),
            kind: "Secret".to_string(),
            namespace: Some("userlabs-rachel".to_string()),
            name: "rachel-nb".to_string(),
            status: Some(400),
            body: Some("Something bad happened".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Error creating object (Secret userlabs-rachel/rachel-nb, status 400): Something bad happened"
        );
        assert_eq!(
            error.slack_summary(),
            "Error creating object (Secret userlabs-rachel/rachel-nb, status 400)"
        );
        assert_eq!(error.status(), 500);
        assert_eq!(error.error_type(), "kubernetes_error");
    }

    #[test]
    fn test_kubernetes_error_slack() {
        let error = ControllerError::Kubernetes {
            message: "whatever".to_string(),
            user: Some("whomever".to_string()),
            kind: "kind".to_string(),
            namespace: Some("namespace".to_string()),
            name: "name".to_string(),
            status: Some(503),
            body: Some("Some response body".to_string()),
        };
        let blocks = error.to_slack_blocks(None);
        let blocks = blocks["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["text"]["text"], "whatever (kind namespace/name, status 503)");
        let fields = blocks[1]["fields"].as_array().unwrap();
        assert_eq!(fields[0]["text"], "*Exception type*\nKubernetesError");
        assert!(fields[1]["text"].as_str().unwrap().starts_with("*Failed at*"));
        assert_eq!(fields[2]["text"], "*User*\nwhomever");
        assert_eq!(fields[3]["text"], "*Status*\n503");
        assert_eq!(blocks[2]["text"]["text"], "*Object*\nkind namespace/name");
        assert_eq!(blocks[3]["text"]["text"], "*Error*\n```\nSome response body\n```");
        assert_eq!(blocks[4]["type"], "divider");
    }

    #[test]
    fn test_timeout_error_slack() {
        let started_at = Utc.with_ymd_and_hms(2001, 11, 30, 0, 0, 0).unwrap();
        let failed_at = Utc.with_ymd_and_hms(2001, 12, 30, 0, 0, 0).unwrap();
        let error = ControllerError::Timeout {
            operation: "whatever".to_string(),
            user: Some("whomever".to_string()),
            started_at,
            failed_at,
        };
        assert_eq!(error.to_string(), "whatever timed out after 2592000.0");

        let blocks = error.to_slack_blocks(None);
        let blocks = blocks["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["text"]["text"], "whatever timed out after 2592000.0");
        let fields = blocks[1]["fields"].as_array().unwrap();
        assert_eq!(fields[0]["text"], "*Started at*\n2001-11-30 00:00:00");
        assert_eq!(fields[1]["text"], "*Failed at*\n2001-12-30 00:00:00");
        assert_eq!(fields[2]["text"], "*User*\nwhomever");
        assert_eq!(blocks[2]["type"], "divider");
    }

    #[test]
    fn test_duplicate_object_error_slack() {
        let error = ControllerError::DuplicateObject {
            message: "whatever".to_string(),
            user: Some("whomever".to_string()),
            kind: "kind".to_string(),
            namespace: "namespace".to_string(),
        };
        let blocks = error.to_slack_blocks(None);
        let blocks = blocks["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["text"]["text"], "whatever");
        assert_eq!(blocks[2]["text"]["text"], "*Object*\nkind namespace");
    }

    #[test]
    fn test_detail_body() {
        let error = ControllerError::LabExists {
            user: "rachel".to_string(),
        };
        assert_eq!(
            error.to_detail(),
            json!({"detail": [{"msg": "Lab already exists for rachel", "type": "lab_exists"}]})
        );

        let error = ControllerError::UnknownUser {
            user: "rachel".to_string(),
        };
        assert_eq!(
            error.to_detail(),
            json!({"detail": [{
                "loc": ["path", "username"],
                "msg": "Unknown user rachel",
                "type": "unknown_user",
            }]})
        );

        let error = ControllerError::DockerReferenceNoTag {
            reference: "lighthouse.ceres/library/sketchbook".to_string(),
            loc: Some("image_list"),
        };
        assert_eq!(
            error.to_detail(),
            json!({"detail": [{
                "loc": ["body", "options", "image_list"],
                "msg": "Docker reference \"lighthouse.ceres/library/sketchbook\" has no tag",
                "type": "invalid_docker_reference",
            }]})
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ControllerError::InvalidToken.status(), 401);
        assert_eq!(ControllerError::PermissionDenied.status(), 403);
        assert_eq!(ControllerError::InsufficientQuota.status(), 403);
        assert_eq!(
            ControllerError::LabExists {
                user: "x".to_string()
            }
            .status(),
            409
        );
        assert_eq!(
            ControllerError::InvalidLabSize {
                size: "gargantuan".to_string()
            }
            .status(),
            422
        );
        assert_eq!(
            ControllerError::UnknownImage {
                tag: "unknown".to_string()
            }
            .status(),
            400
        );
    }
}
