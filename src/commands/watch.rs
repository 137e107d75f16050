//! `kubearchive watch` — runs the FilterStore reconciler, the watch
//! supervisor, and a small health/metrics HTTP server side by side,
//! grounded on the teacher's `watch_loop` + `start_http_server` shape in
//! its own `commands/watch.rs`, generalized from one fixed `Pod` watch
//! to the dynamic, policy-driven kind set.

use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::watcher::{self, Event};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use kubearchive::config::Config;
use kubearchive::discovery::DiscoveryCache;
use kubearchive::dispatcher::EventDispatcher;
use kubearchive::filterstore::{FilterStoreHandle, PolicyChange};
use kubearchive::policy::{self, ClusterPolicy, NamespacePolicy};
use kubearchive::supervisor::WatchSupervisor;
use std::sync::Arc;

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static POLICY_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("policy_events_total", "Total ClusterPolicy/NamespacePolicy events observed")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub async fn run() -> Result<()> {
    println!("Starting kubearchive watch controller...\n");
    info!("controller_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;
    let config = Config::default();

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {e}. Is the cluster running?");
        }
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    println!("  HTTP server ................. http://{addr}");
    println!("Watch controller running. Press Ctrl+C to stop.\n");

    let store = FilterStoreHandle::new();
    let discovery = DiscoveryCache::new(config.discovery_cache_ttl);
    let dispatcher = Arc::new(EventDispatcher::new(config.event_target_url.clone()));
    let supervisor = Arc::new(WatchSupervisor::new(
        client.clone(),
        discovery,
        dispatcher,
        config.watch_timeout_lower,
        config.watch_timeout_upper,
    ));

    let ready = Arc::new(Mutex::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cluster_handle = tokio::spawn(watch_cluster_policies(
        client.clone(),
        store.clone(),
        supervisor.clone(),
        ready.clone(),
        shutdown_tx.subscribe(),
    ));
    let namespace_handle = tokio::spawn(watch_namespace_policies(
        client.clone(),
        store.clone(),
        supervisor.clone(),
        config.operator_namespace.clone(),
        shutdown_tx.subscribe(),
    ));
    let http_handle = tokio::spawn(start_http_server(ready.clone(), shutdown_tx.subscribe(), addr));

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Stopping watch controller...");

    let _ = shutdown_tx.send(());
    let _ = cluster_handle.await?;
    let _ = namespace_handle.await?;
    let _ = http_handle.await?;

    info!("controller_stopped");
    println!("Watch controller stopped.");
    Ok(())
}

async fn watch_cluster_policies(
    client: Client,
    store: FilterStoreHandle,
    supervisor: Arc<WatchSupervisor>,
    ready: Arc<Mutex<bool>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let api: Api<ClusterPolicy> = Api::all(client);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("cluster_policy_watch_shutdown");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Applied(cp))) => {
                        let name = cp.metadata.name.clone().unwrap_or_default();
                        if let Err(e) = policy::validate_cluster_policy(&name, &cp.spec) {
                            warn!(error = %e, "cluster_policy_invalid_skipping");
                            continue;
                        }
                        POLICY_EVENTS.inc();
                        let new_store = store.apply(&PolicyChange::ClusterUpserted(cp.spec)).await;
                        supervisor.reconcile(&new_store).await;
                        *ready.lock().await = true;
                    }
                    Some(Ok(Event::Deleted(_))) => {
                        POLICY_EVENTS.inc();
                        let new_store = store.apply(&PolicyChange::ClusterDeleted).await;
                        supervisor.reconcile(&new_store).await;
                    }
                    Some(Ok(Event::Restarted(cps))) => {
                        for cp in cps {
                            let name = cp.metadata.name.clone().unwrap_or_default();
                            if let Err(e) = policy::validate_cluster_policy(&name, &cp.spec) {
                                warn!(error = %e, "cluster_policy_invalid_skipping");
                                continue;
                            }
                            POLICY_EVENTS.inc();
                            let new_store = store.apply(&PolicyChange::ClusterUpserted(cp.spec)).await;
                            supervisor.reconcile(&new_store).await;
                        }
                        *ready.lock().await = true;
                    }
                    Some(Err(e)) => warn!(error = %e, "cluster_policy_watch_error"),
                    None => return,
                }
            }
        }
    }
}

async fn watch_namespace_policies(
    client: Client,
    store: FilterStoreHandle,
    supervisor: Arc<WatchSupervisor>,
    operator_namespace: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let api: Api<NamespacePolicy> = Api::all(client);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("namespace_policy_watch_shutdown");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Applied(np))) => {
                        apply_namespace_policy(&store, &supervisor, &operator_namespace, np).await;
                    }
                    Some(Ok(Event::Deleted(np))) => {
                        let namespace = np.metadata.namespace.clone().unwrap_or_default();
                        POLICY_EVENTS.inc();
                        let new_store = store.apply(&PolicyChange::NamespaceDeleted { namespace }).await;
                        supervisor.reconcile(&new_store).await;
                    }
                    Some(Ok(Event::Restarted(nps))) => {
                        for np in nps {
                            apply_namespace_policy(&store, &supervisor, &operator_namespace, np).await;
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "namespace_policy_watch_error"),
                    None => return,
                }
            }
        }
    }
}

async fn apply_namespace_policy(
    store: &FilterStoreHandle,
    supervisor: &Arc<WatchSupervisor>,
    operator_namespace: &str,
    np: NamespacePolicy,
) {
    let namespace = np.metadata.namespace.clone().unwrap_or_default();
    let current_cluster =
        policy::ClusterPolicySpec { resources: store.snapshot().await.cluster.clone() };
    if let Err(e) = policy::validate_namespace_policy(
        &np.metadata.name.clone().unwrap_or_default(),
        &namespace,
        &np.spec,
        operator_namespace,
        &current_cluster,
    ) {
        warn!(error = %e, "namespace_policy_invalid_skipping");
        return;
    }
    POLICY_EVENTS.inc();
    let new_store = store.apply(&PolicyChange::NamespaceUpserted { namespace, spec: np.spec }).await;
    supervisor.reconcile(&new_store).await;
}

async fn start_http_server(ready: Arc<Mutex<bool>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(move || readyz(ready.clone())))
        .route("/metrics", get(metrics));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "http_server_bind_failed");
            return;
        }
    };

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    });
    if let Err(e) = serve.await {
        warn!(error = %e, "http_server_failed");
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(ready: Arc<Mutex<bool>>) -> impl IntoResponse {
    if *ready.lock().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "metrics_encode_failed");
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

