//! krilld: watches annotated Services and Ingresses and provisions
//! load-balancer pools for them through the control-plane API.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::store;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use krill_controller::ingress::is_managed_ingress;
use krill_controller::service::is_managed_service;
use krill_controller::{
    run_watch, Controller, Handler, IngressController, KubeEventSink, KubeStatusSink,
    RetryPolicy, ServiceController, WorkQueue,
};
use krill_core::PoolManager;
use krill_manager::{HttpPoolManager, ManagerOptions};

#[derive(Parser, Debug)]
#[command(name = "krilld", version, about = "Krill load-balancer pool controller")]
struct Cli {
    /// Name of the cluster this controller serves; part of every
    /// generated pool name.
    #[arg(long = "cluster-name", env = "KRILL_CLUSTER_NAME")]
    cluster_name: String,

    /// Base URL of the pool control-plane API.
    #[arg(long = "pool-api-url", env = "KRILL_POOL_API_URL")]
    pool_api_url: String,

    /// Bearer token presented to the control plane.
    #[arg(long = "bearer-token", env = "KRILL_BEARER_TOKEN")]
    bearer_token: Option<String>,

    /// Skip verification of the control plane's TLS certificate.
    #[arg(long = "insecure-skip-tls-verify", action = ArgAction::SetTrue)]
    insecure_skip_tls_verify: bool,

    /// Namespace to watch (default: all namespaces).
    #[arg(long = "namespace")]
    namespace: Option<String>,

    /// Concurrent workers per controller.
    #[arg(long = "workers", default_value_t = 2)]
    workers: usize,

    /// Per-request timeout towards the control plane, in seconds.
    #[arg(long = "request-timeout-secs", default_value_t = 30)]
    request_timeout_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("KRILL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KRILL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KRILL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let manager: Arc<dyn PoolManager> = Arc::new(
        HttpPoolManager::new(ManagerOptions {
            base_url: cli.pool_api_url.clone(),
            bearer_token: cli.bearer_token.clone(),
            insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
            timeout: Duration::from_secs(cli.request_timeout_secs),
        })
        .context("building the control-plane client")?,
    );

    // Reachability probe; a failure here is not fatal since every
    // reconcile pass retries with backoff anyway.
    match manager.get_version().await {
        Ok(version) => info!(version = %version, "connected to the pool control plane"),
        Err(e) => warn!(error = %e, "control-plane version probe failed; continuing"),
    }

    let client = Client::try_default()
        .await
        .context("building the Kubernetes client")?;
    let status = Arc::new(KubeStatusSink::new(client.clone()));
    let events = Arc::new(KubeEventSink::new(client.clone(), "krill"));

    let token = CancellationToken::new();
    let policy = RetryPolicy::from_env();
    let mut tasks = Vec::new();

    // Service pipeline.
    {
        let api: Api<Service> = match &cli.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let (cache, writer) = store();
        let queue = Arc::new(WorkQueue::new(policy.clone()));
        let controller = Controller::new(
            Arc::clone(&queue),
            Arc::new(ServiceController::new(
                cli.cluster_name.clone(),
                Arc::new(cache),
                Arc::clone(&manager),
                status.clone(),
                events.clone(),
            )) as Arc<dyn Handler<Service>>,
        );
        tasks.push(tokio::spawn({
            let token = token.clone();
            async move { run_watch(api, writer, queue, is_managed_service, token).await }
        }));
        tasks.push(tokio::spawn({
            let token = token.clone();
            let workers = cli.workers;
            async move {
                controller.run(workers, token).await;
                Ok(())
            }
        }));
    }

    // Ingress pipeline.
    {
        let api: Api<Ingress> = match &cli.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let (cache, writer) = store();
        let queue = Arc::new(WorkQueue::new(policy.clone()));
        let controller = Controller::new(
            Arc::clone(&queue),
            Arc::new(IngressController::new(
                cli.cluster_name.clone(),
                Arc::new(cache),
                Arc::clone(&manager),
                status.clone(),
                events.clone(),
            )) as Arc<dyn Handler<Ingress>>,
        );
        tasks.push(tokio::spawn({
            let token = token.clone();
            async move { run_watch(api, writer, queue, is_managed_ingress, token).await }
        }));
        tasks.push(tokio::spawn({
            let token = token.clone();
            let workers = cli.workers;
            async move {
                controller.run(workers, token).await;
                Ok(())
            }
        }));
    }

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received; draining");
    token.cancel();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "task failed"),
            Err(e) => warn!(error = %e, "task panicked"),
        }
    }
    info!("krilld stopped");
    Ok(())
}
