use std::time::Duration;

use serde::Deserialize;

/// Default Feishu Open API base URL.
pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Largest page size accepted by the field listing endpoint.
const MAX_PAGE_SIZE: u32 = 500;

/// Configuration for the Bitable client.
///
/// Can be built in code with [`BitableConfig::new`] and the `with_*` methods,
/// or deserialized from the embedding application's own config file. The
/// client never reads credentials from the environment itself.
#[derive(Clone, Deserialize)]
pub struct BitableConfig {
    /// Feishu application id used for the tenant token exchange.
    pub app_id: String,

    /// Feishu application secret used for the tenant token exchange.
    pub app_secret: String,

    /// Base URL of the Open API. Override this for testing against a mock
    /// server.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Renew the cached access token this many seconds before it expires.
    #[serde(default = "default_refresh_margin_seconds")]
    pub token_refresh_margin_seconds: u64,

    /// Parent type used when uploading record attachments
    /// (`bitable_file` or `bitable_image`).
    #[serde(default = "default_parent_type")]
    pub attachment_parent_type: String,

    /// Page size for field listing.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl std::fmt::Debug for BitableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitableConfig")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .field(
                "token_refresh_margin_seconds",
                &self.token_refresh_margin_seconds,
            )
            .field("attachment_parent_type", &self.attachment_parent_type)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl BitableConfig {
    /// Create a new configuration with the given application credentials.
    ///
    /// Uses the public Feishu API base URL, a 30s request timeout and a 60s
    /// token refresh margin.
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            base_url: default_base_url(),
            timeout_seconds: default_timeout_seconds(),
            token_refresh_margin_seconds: default_refresh_margin_seconds(),
            attachment_parent_type: default_parent_type(),
            page_size: default_page_size(),
        }
    }

    /// Override the API base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the per-request timeout in seconds.
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set how long before expiry the access token is renewed.
    #[must_use]
    pub fn with_token_refresh_margin(mut self, seconds: u64) -> Self {
        self.token_refresh_margin_seconds = seconds;
        self
    }

    /// Set the parent type used for attachment uploads.
    #[must_use]
    pub fn with_attachment_parent_type(mut self, parent_type: impl Into<String>) -> Self {
        self.attachment_parent_type = parent_type.into();
        self
    }

    /// Set the field listing page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Base URL without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_seconds)
    }

    /// Page size clamped to the range the API accepts.
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_refresh_margin_seconds() -> u64 {
    60
}

fn default_parent_type() -> String {
    "bitable_file".to_owned()
}

fn default_page_size() -> u32 {
    100
}
