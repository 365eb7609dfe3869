//! Session configuration and project credentials.

use std::time::Duration;

/// Login material for one project. Obtained elsewhere; treated as opaque.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Server base URL, e.g. `https://www.overleaf.com`
    pub base_url: String,
    /// Raw `Cookie` header value of an authenticated browser session
    pub cookie: String,
    /// CSRF token scraped from the project page
    pub csrf: String,
}

impl Credentials {
    pub fn new(
        base_url: impl Into<String>,
        cookie: impl Into<String>,
        csrf: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookie: cookie.into(),
            csrf: csrf.into(),
        }
    }

    /// `{base}/project/{project_id}`
    pub fn project_url(&self, project_id: &str) -> String {
        format!("{}/project/{project_id}", self.base_url)
    }
}

/// Tunables for a project session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an in-flight update may wait for its acknowledgement
    pub ack_timeout: Duration,
    /// Keep-alive period
    pub heartbeat_interval: Duration,
    /// Attach a track-changes id to outbound updates
    pub track_changes: bool,
    /// Bound on `joinProject` / `joinDoc` replies
    pub join_timeout: Duration,
    /// Capacity of the inbound event channel
    pub inbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(20),
            track_changes: false,
            join_timeout: Duration::from_secs(30),
            inbound_capacity: 256,
        }
    }
}
