//! Models for talking to Gafaelfawr.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

/// Gafaelfawr's representation of a single group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    /// Name of the group, following Unix naming conventions.
    pub name: String,

    /// Numeric GID of the group (POSIX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// Notebook Aspect quota information for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookQuota {
    /// CPU equivalents.
    pub cpu: f64,

    /// Maximum memory use in GiB.
    pub memory: f64,

    /// Whether the user is allowed to spawn a lab.
    #[serde(default = "default_true")]
    pub spawn: bool,
}

impl NotebookQuota {
    /// Maximum memory use in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory * 1024.0 * 1024.0 * 1024.0) as i64
    }
}

fn default_true() -> bool {
    true
}

/// Quota information for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    /// Mapping of service names to allowed requests per 15 minutes.
    #[serde(default)]
    pub api: BTreeMap<String, i64>,

    /// Notebook Aspect quota, if any.
    #[serde(default)]
    pub notebook: Option<NotebookQuota>,
}

/// User metadata from Gafaelfawr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GafaelfawrUserInfo {
    /// Username of the lab user.
    pub username: String,

    /// Human-friendly display name, may contain spaces, capital letters,
    /// and non-ASCII characters.
    #[serde(default)]
    pub name: Option<String>,

    /// Numeric UID for the user (POSIX).
    pub uid: i64,

    /// Numeric GID of the user's primary group (POSIX).
    pub gid: i64,

    /// Groups to which the user belongs.
    #[serde(default)]
    pub groups: Vec<UserGroup>,

    /// Quota information, if any.
    #[serde(default)]
    pub quota: Option<UserQuota>,
}

/// User information from Gafaelfawr supplemented with the user's delegated
/// notebook token, bundled together for internal plumbing.
#[derive(Debug, Clone)]
pub struct GafaelfawrUser {
    pub info: GafaelfawrUserInfo,
    pub token: String,
}

impl GafaelfawrUser {
    pub fn username(&self) -> &str {
        &self.info.username
    }

    /// The user's notebook quota, if one is set.
    pub fn notebook_quota(&self) -> Option<&NotebookQuota> {
        self.info.quota.as_ref().and_then(|quota| quota.notebook.as_ref())
    }
}

/// Metadata about a token, from the Gafaelfawr token-info route.
#[derive(Debug, Clone, Deserialize)]
pub struct GafaelfawrTokenInfo {
    pub token: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_info_deserialization() {
        let user: GafaelfawrUserInfo = serde_json::from_str(
            r#"{
                "username": "rachel",
                "name": "Rachel (?)",
                "uid": 1101,
                "gid": 1101,
                "groups": [{"name": "rachel", "id": 1101}, {"name": "lunatics", "id": 2028}],
                "quota": {"api": {}, "notebook": {"cpu": 9, "memory": 27}}
            }"#,
        )
        .unwrap();
        assert_eq!(user.username, "rachel");
        assert_eq!(user.groups.len(), 2);
        let quota = user.quota.unwrap().notebook.unwrap();
        assert!(quota.spawn);
        assert_eq!(quota.memory_bytes(), 27 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_no_spawn_quota() {
        let quota: NotebookQuota =
            serde_json::from_str(r#"{"cpu": 1, "memory": 1, "spawn": false}"#).unwrap();
        assert!(!quota.spawn);
    }
}
