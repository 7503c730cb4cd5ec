use std::time::Duration;

/// Form value signaling that the image should be taken from the dropdown.
pub const DROPDOWN_SENTINEL_VALUE: &str = "use_image_from_dropdown";

/// Implicit tag used by Docker/Kubernetes when no tag is specified.
pub const DOCKER_DEFAULT_TAG: &str = "latest";

/// Port on which spawned labs listen.
pub const LAB_PORT: u16 = 8888;

/// Name of the per-namespace Service pointing at the lab pod.
pub const LAB_SERVICE_NAME: &str = "lab";

/// How many times to retry a Google Artifact Registry list call.
pub const GAR_RETRY_LIMIT: usize = 3;

/// Pause between Google Artifact Registry retries.
pub const GAR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Environment variable consulted for the Slack alert webhook.
pub const SLACK_WEBHOOK_ENV: &str = "NUBLADO_SLACK_WEBHOOK";

/// How long a single prepull pod may take before it is abandoned.
pub const PREPULL_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the prepuller looks for missing images.
pub const PREPULL_INTERVAL: Duration = Duration::from_secs(60);
