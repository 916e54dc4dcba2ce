// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Directory session config.

use crate::error::DirectoryError;
use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "logimesh-directory.toml";

const DEFAULT_ENDPOINT: &str = "127.0.0.1:8091";
const DEFAULT_NAMESPACE: &str = "default";

/// Settings of a directory session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Backend connection endpoints.
    pub endpoints: Vec<String>,
    /// Namespace used when a service name carries none.
    pub namespace: String,
    /// Bound on a single register call.
    /// Default is 10s.
    #[serde(with = "humantime_serde")]
    pub register_timeout: Duration,
    /// TTL announced on registration; heartbeats are sent every `ttl / 2`.
    /// Default is 5s.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Pause before a watch subscription is re-opened after the backend closed it.
    /// Default is 1s.
    #[serde(with = "humantime_serde")]
    pub watch_retry: Duration,
    /// Number of watch changes buffered per subscriber before the oldest are dropped.
    /// Default is 64.
    pub watch_buffer: usize,
    /// Route selectors applied by resolvers created from this session.
    pub route: RouteOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            namespace: DEFAULT_NAMESPACE.to_string(),
            register_timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(5),
            watch_retry: Duration::from_secs(1),
            watch_buffer: 64,
            route: RouteOptions::default(),
        }
    }
}

impl SessionConfig {
    /// Returns a default config pointing at the given endpoints.
    pub fn new<E: Into<String>>(endpoints: impl IntoIterator<Item = E>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Loads a config file, or the default file when `path` is `None`.
    ///
    /// A missing default file yields the default config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, DirectoryError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            },
        }
    }

    /// Reads a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DirectoryError::Config(FastStr::from_string(format!("read {}: {e}", path.display()))))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, DirectoryError> {
        let config: Self = toml::from_str(content).map_err(|e| DirectoryError::Config(FastStr::from_string(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that are inconsistent regardless of the backend.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.ttl.is_zero() {
            return Err(DirectoryError::Config(FastStr::from_static_str("ttl must be positive")));
        }
        if self.watch_buffer == 0 {
            return Err(DirectoryError::Config(FastStr::from_static_str("watch_buffer must be positive")));
        }
        Ok(())
    }

    /// Heartbeat period derived from the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        heartbeat_interval(self.ttl)
    }

    /// Set the default namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
    /// Set the register call timeout.
    pub fn with_register_timeout(mut self, register_timeout: Duration) -> Self {
        self.register_timeout = register_timeout;
        self
    }
    /// Set the registration TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    /// Set the watch re-subscribe pause.
    pub fn with_watch_retry(mut self, watch_retry: Duration) -> Self {
        self.watch_retry = watch_retry;
        self
    }
    /// Set the route selectors.
    pub fn with_route(mut self, route: RouteOptions) -> Self {
        self.route = route;
        self
    }
}

/// Heartbeats go out at half the TTL, never at zero.
pub(crate) fn heartbeat_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_millis(1))
}

/// Routing selectors of a resolver.
///
/// Destination fields narrow the target; source fields describe the caller to rule routing.
/// Every field is optional and absence means unconstrained.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    /// destination namespace
    pub dst_namespace: Option<String>,
    /// destination service
    pub dst_service: Option<String>,
    /// destination metadata the instances must carry
    pub dst_metadata: HashMap<String, String>,
    /// caller namespace
    pub src_namespace: Option<String>,
    /// caller service
    pub src_service: Option<String>,
    /// caller metadata matched by routing rules
    pub src_metadata: HashMap<String, String>,
}

impl RouteOptions {
    /// Destination metadata as a selector.
    pub fn dst_selector(&self) -> HashMap<FastStr, FastStr> {
        to_selector(&self.dst_metadata)
    }

    /// Caller metadata as a selector.
    pub fn src_selector(&self) -> HashMap<FastStr, FastStr> {
        to_selector(&self.src_metadata)
    }
}

fn to_selector(map: &HashMap<String, String>) -> HashMap<FastStr, FastStr> {
    map.iter().map(|(k, v)| (FastStr::new(k), FastStr::new(v))).collect()
}

/// Serde adapter for humantime durations such as `"1m 30s"`.
mod humantime_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{RouteOptions, SessionConfig};
    use crate::error::DirectoryError;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoints, vec!["127.0.0.1:8091".to_string()]);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2500));
        assert_eq!(config.route, RouteOptions::default());
    }

    #[test]
    fn test_from_toml() {
        let config = SessionConfig::from_toml(
            r#"
            endpoints = ["10.0.0.1:8091", "10.0.0.2:8091"]
            namespace = "prod"
            ttl = "8s"
            register_timeout = "1m 30s"

            [route]
            src_service = "gateway"
            src_metadata = { env = "canary" }
            dst_metadata = { zone = "a" }
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.ttl, Duration::from_secs(8));
        assert_eq!(config.register_timeout, Duration::from_secs(90));
        assert_eq!(config.watch_retry, Duration::from_secs(1));
        assert_eq!(config.route.src_service.as_deref(), Some("gateway"));
        assert_eq!(config.route.src_metadata.get("env").map(String::as_str), Some("canary"));
        assert_eq!(config.route.dst_selector().len(), 1);
    }

    #[test]
    fn test_invalid_toml() {
        assert_matches!(SessionConfig::from_toml(r#"ttl = "soon""#), Err(DirectoryError::Config(_)));
        assert_matches!(SessionConfig::from_toml(r#"ttl = "0s""#), Err(DirectoryError::Config(_)));
    }

    #[test]
    fn test_missing_explicit_file() {
        let missing = std::path::Path::new("/nonexistent/logimesh-directory.toml");
        assert_matches!(SessionConfig::load(Some(missing)), Err(DirectoryError::Config(_)));
    }
}
