// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Directory errors.

use faststr::FastStr;

/// Errors produced by the directory layer.
///
/// Payloads are [`FastStr`] so one failed build can be cloned out to every caller
/// waiting on it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The backend connection or its context could not be constructed.
    #[error("directory backend unavailable: {0}")]
    BackendUnavailable(FastStr),
    /// Resolution succeeded but the service currently has no instances.
    #[error("no instance remains for {0}")]
    NoInstances(FastStr),
    /// A registration misses a required field.
    #[error("invalid registration: {0}")]
    InvalidRegistration(FastStr),
    /// Rule routing or load balancing failed.
    #[error("routing failure: {0}")]
    RoutingFailure(FastStr),
    /// A service description or cache key could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(FastStr),
    /// The configuration could not be read or is inconsistent.
    #[error("invalid config: {0}")]
    Config(FastStr),
    /// Any other failed backend call.
    #[error("directory backend error: {0}")]
    Backend(FastStr),
}

impl DirectoryError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DirectoryError::NoInstances(_) | DirectoryError::Backend(_))
    }
}
