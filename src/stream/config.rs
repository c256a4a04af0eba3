//! Connection configuration and endpoint construction.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::reconnect::ReconnectPolicy;
use crate::stream::client::StreamClientError;

/// Local development websocket base for the inference service.
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000";
/// Environment variable read by [`StreamConfig::from_env`] for the base URL.
pub const WS_BASE_URL_ENV: &str = "WORKBENCH_WS_BASE_URL";
/// Path segments between the base URL and the inference id.
pub const STREAM_PATH_SEGMENTS: [&str; 4] = ["api", "v1", "ws", "stream"];
/// Keep-alive ping interval while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Immutable configuration for one streaming session.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    inference_id: String,
    base_url: String,
    endpoint_override: Option<String>,
    user_id: Option<String>,
    credential: Option<SecretString>,
    reconnect: ReconnectPolicy,
}

impl StreamConfig {
    /// Creates a config for `inference_id` against the local development base.
    pub fn new(inference_id: impl Into<String>) -> Self {
        Self {
            inference_id: inference_id.into(),
            base_url: DEFAULT_WS_BASE_URL.to_string(),
            endpoint_override: None,
            user_id: None,
            credential: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Like [`StreamConfig::new`], but takes the base URL from
    /// `WORKBENCH_WS_BASE_URL` when it is set and non-empty.
    pub fn from_env(inference_id: impl Into<String>) -> Self {
        let config = Self::new(inference_id);
        match std::env::var(WS_BASE_URL_ENV) {
            Ok(base) if !base.trim().is_empty() => config.with_base_url(base),
            _ => config,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().to_string();
        self
    }

    /// Sets a fully-qualified endpoint.
    ///
    /// Only `ws://` and `wss://` URLs are used verbatim; anything else is
    /// ignored and the endpoint is built from the base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim_end().to_string());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches an opaque credential, sent as a bearer token on the handshake.
    pub fn with_credential(mut self, credential: SecretString) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect.interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn inference_id(&self) -> &str {
        &self.inference_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn credential(&self) -> Option<&SecretString> {
        self.credential.as_ref()
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// Resolves the websocket URL this session connects to.
    pub fn endpoint_url(&self) -> Result<String, StreamClientError> {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
                return Ok(endpoint.to_string());
            }
        }

        if self.inference_id.trim().is_empty() {
            return Err(StreamClientError::InvalidEndpoint(
                "inference_id must not be empty".to_string(),
            ));
        }

        let mut url = Url::parse(&self.base_url).map_err(|err| {
            StreamClientError::InvalidEndpoint(format!("base url `{}`: {err}", self.base_url))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(StreamClientError::InvalidEndpoint(format!(
                "base url `{}` must use ws or wss",
                self.base_url
            )));
        }

        url.path_segments_mut()
            .map_err(|_| {
                StreamClientError::InvalidEndpoint(format!(
                    "base url `{}` cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(STREAM_PATH_SEGMENTS)
            .push(&self.inference_id);

        if let Some(user_id) = self.user_id.as_deref() {
            url.query_pairs_mut().append_pair("user_id", user_id);
        }

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{StreamConfig, DEFAULT_WS_BASE_URL};
    use crate::stream::client::StreamClientError;

    #[test]
    fn config_uses_documented_defaults() {
        let config = StreamConfig::new("inf-1");
        let policy = config.reconnect_policy();
        assert!(policy.enabled);
        assert_eq!(policy.interval, Duration::from_millis(3000));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(
            config.endpoint_url().expect("endpoint"),
            format!("{DEFAULT_WS_BASE_URL}/api/v1/ws/stream/inf-1")
        );
    }

    #[test]
    fn endpoint_appends_encoded_user_id() {
        let config = StreamConfig::new("inf-2")
            .with_base_url("wss://stream.example.com/")
            .with_user_id("ada lovelace&co");
        assert_eq!(
            config.endpoint_url().expect("endpoint"),
            "wss://stream.example.com/api/v1/ws/stream/inf-2?user_id=ada+lovelace%26co"
        );
    }

    #[test]
    fn full_endpoint_override_is_used_verbatim() {
        let config = StreamConfig::new("ignored")
            .with_user_id("u1")
            .with_endpoint("wss://edge.example/custom/socket?token=abc  \n");
        assert_eq!(
            config.endpoint_url().expect("endpoint"),
            "wss://edge.example/custom/socket?token=abc"
        );
    }

    #[test]
    fn non_websocket_override_falls_back_to_base() {
        let config = StreamConfig::new("inf-3").with_endpoint("https://not-a-socket");
        assert_eq!(
            config.endpoint_url().expect("endpoint"),
            "ws://localhost:8000/api/v1/ws/stream/inf-3"
        );
    }

    #[test]
    fn base_url_path_is_preserved() {
        let config = StreamConfig::new("inf-4").with_base_url("ws://gateway:9000/proxy");
        assert_eq!(
            config.endpoint_url().expect("endpoint"),
            "ws://gateway:9000/proxy/api/v1/ws/stream/inf-4"
        );
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        let empty = StreamConfig::new("  ");
        assert!(matches!(
            empty.endpoint_url(),
            Err(StreamClientError::InvalidEndpoint(_))
        ));

        let http = StreamConfig::new("inf-5").with_base_url("http://localhost:8000");
        assert!(matches!(
            http.endpoint_url(),
            Err(StreamClientError::InvalidEndpoint(_))
        ));

        let garbage = StreamConfig::new("inf-6").with_base_url("not a url");
        assert!(matches!(
            garbage.endpoint_url(),
            Err(StreamClientError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn reconnect_builders_update_policy() {
        let config = StreamConfig::new("inf-7")
            .with_reconnect(false)
            .with_reconnect_interval(Duration::from_millis(50))
            .with_max_reconnect_attempts(2);
        let policy = config.reconnect_policy();
        assert!(!policy.enabled);
        assert_eq!(policy.interval, Duration::from_millis(50));
        assert_eq!(policy.max_attempts, 2);
    }
}
