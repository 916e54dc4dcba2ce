// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Service descriptors, cache keys and instance keys.

use crate::error::DirectoryError;
use faststr::FastStr;
use std::fmt::{self, Display, Write};

/// Prefix of every cache key produced by [`ServiceDescriptor::cache_key`].
pub const CACHE_KEY_PREFIX: &str = "logimesh";

const SEPARATOR: char = ':';

/// A resolvable service scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    namespace: FastStr,
    service: FastStr,
}

impl ServiceDescriptor {
    /// Creates a descriptor.
    pub fn new(namespace: impl Into<FastStr>, service: impl Into<FastStr>) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    /// Namespace of the service.
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the service.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns `namespace:service`.
    pub fn description(&self) -> FastStr {
        FastStr::from_string(format!("{}{SEPARATOR}{}", self.namespace, self.service))
    }

    /// Parses a `namespace:service` description.
    ///
    /// A description without a separator is taken as a bare service name in `default_namespace`.
    pub fn from_description(description: &str, default_namespace: &str) -> Result<Self, DirectoryError> {
        let (namespace, service) = match description.split_once(SEPARATOR) {
            Some((namespace, service)) => (namespace, service),
            None => (default_namespace, description),
        };
        if namespace.is_empty() || service.is_empty() {
            return Err(DirectoryError::InvalidKey(FastStr::from_string(format!("malformed description {description:?}"))));
        }
        Ok(Self::new(FastStr::new(namespace), FastStr::new(service)))
    }

    /// Returns the cache key `logimesh:namespace:service`.
    pub fn cache_key(&self) -> FastStr {
        FastStr::from_string(format!("{CACHE_KEY_PREFIX}{SEPARATOR}{}{SEPARATOR}{}", self.namespace, self.service))
    }

    /// Parses a cache key produced by [`ServiceDescriptor::cache_key`].
    pub fn from_cache_key(cache_key: &str) -> Result<Self, DirectoryError> {
        let mut parts = cache_key.splitn(3, SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(CACHE_KEY_PREFIX), Some(namespace), Some(service)) if !namespace.is_empty() && !service.is_empty() => {
                Ok(Self::new(FastStr::new(namespace), FastStr::new(service)))
            },
            _ => Err(DirectoryError::InvalidKey(FastStr::from_string(format!("malformed cache key {cache_key:?}")))),
        }
    }
}

impl Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.namespace, self.service)
    }
}

/// Correlates directory records with runtime instances.
///
/// Rendered as `namespace:service:host:port`. Separators and backslashes inside a
/// component are escaped, so two keys are equal exactly when all four parts are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey(FastStr);

impl InstanceKey {
    /// Builds the key of one instance.
    pub fn new(namespace: &str, service: &str, host: &str, port: u16) -> Self {
        let mut key = String::with_capacity(namespace.len() + service.len() + host.len() + 9);
        push_escaped(&mut key, namespace);
        key.push(SEPARATOR);
        push_escaped(&mut key, service);
        key.push(SEPARATOR);
        push_escaped(&mut key, host);
        key.push(SEPARATOR);
        let _ = write!(key, "{port}");
        Self(FastStr::from_string(key))
    }

    /// The rendered key.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn push_escaped(buf: &mut String, part: &str) {
    for c in part.chars() {
        if c == SEPARATOR || c == '\\' {
            buf.push('\\');
        }
        buf.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::{InstanceKey, ServiceDescriptor};
    use crate::error::DirectoryError;
    use assert_matches::assert_matches;

    #[test]
    fn test_instance_key_format() {
        let key = InstanceKey::new("default", "orders", "10.0.0.1", 8080);
        assert_eq!(key.as_str(), "default:orders:10.0.0.1:8080");
    }

    #[test]
    fn test_instance_key_equality() {
        let a = InstanceKey::new("default", "orders", "10.0.0.1", 8080);
        assert_eq!(a, InstanceKey::new("default", "orders", "10.0.0.1", 8080));
        assert_ne!(a, InstanceKey::new("default", "orders", "10.0.0.1", 8081));
        assert_ne!(a, InstanceKey::new("default", "orders", "10.0.0.2", 8080));
        assert_ne!(a, InstanceKey::new("prod", "orders", "10.0.0.1", 8080));
    }

    #[test]
    fn test_instance_key_separator_in_parts() {
        // Without escaping both would render as "a:b:c:h:1".
        let a = InstanceKey::new("a:b", "c", "h", 1);
        let b = InstanceKey::new("a", "b:c", "h", 1);
        assert_ne!(a, b);
        let v6 = InstanceKey::new("default", "orders", "::1", 80);
        assert_eq!(v6.as_str(), r"default:orders:\:\:1:80");
    }

    #[test]
    fn test_description() {
        let desc = ServiceDescriptor::from_description("prod:orders", "default").unwrap();
        assert_eq!(desc.namespace(), "prod");
        assert_eq!(desc.service(), "orders");
        assert_eq!(desc.description().as_str(), "prod:orders");

        let bare = ServiceDescriptor::from_description("orders", "default").unwrap();
        assert_eq!(bare, ServiceDescriptor::new("default", "orders"));

        assert_matches!(ServiceDescriptor::from_description(":orders", "default"), Err(DirectoryError::InvalidKey(_)));
    }

    #[test]
    fn test_cache_key() {
        let desc = ServiceDescriptor::new("prod", "orders");
        assert_eq!(desc.cache_key().as_str(), "logimesh:prod:orders");
        assert_eq!(ServiceDescriptor::from_cache_key(&desc.cache_key()).unwrap(), desc);
        assert_matches!(ServiceDescriptor::from_cache_key("orders"), Err(DirectoryError::InvalidKey(_)));
        assert_matches!(ServiceDescriptor::from_cache_key("other:prod:orders"), Err(DirectoryError::InvalidKey(_)));
    }
}
