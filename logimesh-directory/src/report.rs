// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Call result reporting.
//!
//! After each call the outcome and latency are reported to the directory against the
//! instance that served it. The call's own result is always handed back unchanged.

pub use crate::backend::RetStatus;
use crate::backend::{CallResult, DirectoryBackend};
use crate::error::DirectoryError;
use crate::instance::{Instance, TAG_INSTANCE_ID, TAG_NAMESPACE};
use crate::key::ServiceDescriptor;
use crate::session::DirectorySession;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tarpc::client::stub::Stub;
use tarpc::client::RpcError;
use tarpc::context;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Code reported for a successful call.
pub const RET_CODE_SUCCESS: i32 = 0;
/// Code reported for a failed call whose error carries no code.
pub const RET_CODE_UNKNOWN: i32 = -1;

/// Errors exposing a protocol return code.
pub trait RetCode {
    /// The code, if the error has one.
    fn ret_code(&self) -> Option<i32>;
}

impl RetCode for RpcError {
    fn ret_code(&self) -> Option<i32> {
        match self {
            RpcError::DeadlineExceeded => Some(504),
            RpcError::Server(e) => Some(match e.kind {
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => 400,
                io::ErrorKind::PermissionDenied => 403,
                io::ErrorKind::NotFound => 404,
                io::ErrorKind::Unsupported => 501,
                io::ErrorKind::TimedOut => 504,
                _ => 500,
            }),
            _ => None,
        }
    }
}

impl RetCode for DirectoryError {
    fn ret_code(&self) -> Option<i32> {
        None
    }
}

/// What happened to one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The backend accepted the report.
    Reported,
    /// The instance carries no instance id, nothing was sent.
    Skipped,
    /// The backend rejected the report; the error was logged.
    Failed,
}

/// Reports call outcomes to the directory.
#[derive(Debug)]
pub struct CallResultReporter<B> {
    session: DirectorySession<B>,
}

impl<B> Clone for CallResultReporter<B> {
    fn clone(&self) -> Self {
        Self { session: self.session.clone() }
    }
}

impl<B: DirectoryBackend> CallResultReporter<B> {
    /// Creates a reporter over a session.
    pub fn new(session: DirectorySession<B>) -> Self {
        Self { session }
    }

    /// Awaits `call`, reports its outcome against `target` and returns the result untouched.
    pub async fn observe<T, E, F>(&self, target: &Instance, service: &ServiceDescriptor, call: F) -> Result<T, E>
    where
        E: RetCode,
        F: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = call.await;
        let delay = start.elapsed();
        let (code, status) = match &result {
            Ok(_) => (RET_CODE_SUCCESS, RetStatus::Success),
            Err(e) => (e.ret_code().unwrap_or(RET_CODE_UNKNOWN), RetStatus::Fail),
        };
        self.report(target, service, code, status, delay).await;
        result
    }

    /// Reports one outcome. Instances without an instance id tag are skipped.
    ///
    /// The namespace tag of the instance, when present, takes precedence over the namespace of `service`.
    pub async fn report(&self, target: &Instance, service: &ServiceDescriptor, code: i32, status: RetStatus, delay: Duration) -> ReportOutcome {
        let Some(instance_id) = target.tag(TAG_INSTANCE_ID).filter(|id| !id.is_empty()) else {
            debug!("[LOGIMESH] skip reporting call to {}: no instance id", target.address);
            return ReportOutcome::Skipped;
        };
        let service = match target.tag(TAG_NAMESPACE) {
            Some(namespace) if !namespace.is_empty() && namespace.as_str() != service.namespace() => ServiceDescriptor::new(namespace.clone(), service.service().to_string()),
            _ => service.clone(),
        };
        let result = CallResult {
            service,
            instance_id: instance_id.clone(),
            code,
            status,
            delay,
        };
        match self.session.backend().report_call_result(result).await {
            Ok(()) => ReportOutcome::Reported,
            Err(e) => {
                warn!("[LOGIMESH] report call result of {instance_id} failed: {e}");
                ReportOutcome::Failed
            },
        }
    }
}

/// A [`Stub`] reporting every call it forwards to the instance it is bound to.
#[derive(Debug)]
pub struct ReportingStub<S, B> {
    inner: S,
    reporter: CallResultReporter<B>,
    target: Arc<Instance>,
    service: ServiceDescriptor,
}

impl<S, B> ReportingStub<S, B> {
    /// Wraps `inner`, the stub connected to `target` of `service`.
    pub fn new(inner: S, reporter: CallResultReporter<B>, target: Arc<Instance>, service: ServiceDescriptor) -> Self {
        Self { inner, reporter, target, service }
    }

    /// The instance calls are reported against.
    pub fn target(&self) -> &Arc<Instance> {
        &self.target
    }

    /// The wrapped stub.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, B> Stub for ReportingStub<S, B>
where
    S: Stub,
    B: DirectoryBackend,
{
    type Req = S::Req;
    type Resp = S::Resp;

    async fn call(&self, ctx: context::Context, request: Self::Req) -> Result<Self::Resp, RpcError> {
        self.reporter.observe(&self.target, &self.service, self.inner.call(ctx, request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::{CallResultReporter, ReportOutcome, ReportingStub, RetCode, RetStatus, RET_CODE_SUCCESS, RET_CODE_UNKNOWN};
    use crate::backend::memory::MemoryDirectory;
    use crate::config::SessionConfig;
    use crate::instance::{DirectoryInstance, Instance};
    use crate::key::ServiceDescriptor;
    use crate::session::DirectorySession;
    use assert_matches::assert_matches;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;
    use tarpc::client::stub::Stub;
    use tarpc::client::RpcError;
    use tarpc::{context, ServerError};

    fn reporter() -> CallResultReporter<MemoryDirectory> {
        CallResultReporter::new(DirectorySession::from_backend(SessionConfig::default(), MemoryDirectory::new()))
    }

    fn target() -> Arc<Instance> {
        Arc::new(Instance::from_record(&DirectoryInstance::new("prod", "orders", "10.0.0.1", 80).with_id("ins-1")))
    }

    struct Echo;

    impl Stub for Echo {
        type Req = u32;
        type Resp = u32;

        async fn call(&self, _: context::Context, request: u32) -> Result<u32, RpcError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match request {
                0 => Err(RpcError::Shutdown),
                1 => Err(RpcError::Server(ServerError::new(io::ErrorKind::NotFound, "gone".to_string()))),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn test_ret_codes() {
        assert_eq!(RpcError::DeadlineExceeded.ret_code(), Some(504));
        assert_eq!(RpcError::Shutdown.ret_code(), None);
        assert_eq!(RpcError::Server(ServerError::new(io::ErrorKind::Other, String::new())).ret_code(), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stub_reports_and_passes_through() {
        let reporter = reporter();
        let service = ServiceDescriptor::new("default", "orders");
        let stub = ReportingStub::new(Echo, reporter.clone(), target(), service);

        assert_eq!(stub.call(context::current(), 7).await.unwrap(), 7);
        assert_matches!(stub.call(context::current(), 0).await, Err(RpcError::Shutdown));
        assert_matches!(stub.call(context::current(), 1).await, Err(RpcError::Server(_)));

        let results = reporter.session.backend().call_results();
        assert_eq!(results.len(), 3);
        assert_eq!((results[0].code, results[0].status), (RET_CODE_SUCCESS, RetStatus::Success));
        assert_eq!((results[1].code, results[1].status), (RET_CODE_UNKNOWN, RetStatus::Fail));
        assert_eq!((results[2].code, results[2].status), (404, RetStatus::Fail));
        assert!(results.iter().all(|r| r.instance_id.as_str() == "ins-1" && r.service.namespace() == "prod"));
        assert!(results[0].delay >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_skipped_without_instance_id() {
        let reporter = reporter();
        let mut anonymous = (*target()).clone();
        anonymous.tags.clear();
        let service = ServiceDescriptor::new("default", "orders");
        let outcome = reporter.report(&anonymous, &service, RET_CODE_SUCCESS, RetStatus::Success, Duration::ZERO).await;
        assert_eq!(outcome, ReportOutcome::Skipped);

        let result: Result<u32, RpcError> = reporter.observe(&anonymous, &service, async { Err(RpcError::DeadlineExceeded) }).await;
        assert_matches!(result, Err(RpcError::DeadlineExceeded));
        assert!(reporter.session.backend().call_results().is_empty());
    }
}
