// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use logimesh_directory::{
    Balancer, CallResultReporter, DirectoryInstance, DirectorySession, MemoryDirectory, Registry, RegistryInfo, ReportingStub, Resolver, SessionConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tarpc::client::stub::Stub;
use tarpc::client::RpcError;
use tarpc::context;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Flags {
    /// Config file, `./logimesh-directory.toml` when present otherwise.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Service to register and call.
    #[clap(long, default_value = "orders")]
    service: String,
    /// Address the local endpoint is registered with.
    #[clap(long, default_value = "127.0.0.1:8888")]
    addr: String,
    /// Number of calls to make.
    #[clap(long, default_value_t = 6)]
    calls: u32,
}

/// Answers every request locally, failing every third one.
struct FakeCall;

impl Stub for FakeCall {
    type Req = u32;
    type Resp = String;

    async fn call(&self, _: context::Context, request: u32) -> Result<String, RpcError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if request % 3 == 2 {
            Err(RpcError::DeadlineExceeded)
        } else {
            Ok(format!("reply #{request}"))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing();

    let config = SessionConfig::load(flags.config.as_deref())?.with_watch_retry(Duration::from_millis(200));
    let session = DirectorySession::<MemoryDirectory>::connect(config).await?;

    let registry = Registry::new(session.clone());
    let info = RegistryInfo::new(flags.service.clone(), flags.addr.clone()).with_tag("env", "demo");
    let registration = registry.register(&info).await?;

    let resolver = Resolver::new(session.clone());
    let balancer = Balancer::new(session.clone());
    let reporter = CallResultReporter::new(session.clone());
    let description = resolver.target(&flags.service);
    let descriptor = resolver.descriptor(&description)?;

    let changes = resolver.watch(&description)?;
    let following = balancer.follow(changes);

    // Another process joins the service.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session
        .backend()
        .upsert(DirectoryInstance::new(descriptor.namespace().to_string(), descriptor.service().to_string(), "127.0.0.1", 8889).with_id("peer-1").with_weight(5));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = resolver.resolve(&description).await?;
    for n in 0..flags.calls {
        let mut picker = balancer.get_picker(&result).await?;
        let Some(target) = picker.select() else {
            tracing::warn!("no instance of {description} available");
            continue;
        };
        picker.release();
        let stub = ReportingStub::new(FakeCall, reporter.clone(), target, descriptor.clone());
        match stub.call(context::current(), n).await {
            Ok(reply) => tracing::info!("{} answered {reply}", stub.target().address),
            Err(e) => tracing::warn!("{} failed: {e}", stub.target().address),
        }
    }
    for result in session.backend().call_results() {
        tracing::info!("reported {} code={} status={:?} delay={:?}", result.instance_id, result.code, result.status, result.delay);
    }

    registry.deregister(&info).await?;
    tracing::info!("deregistered {}", registration.instance_id);
    resolver.close().await;
    following.shutdown().await;
    session.close().await;
    Ok(())
}
