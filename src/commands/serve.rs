//! `kubearchive serve` — runs the archive read API (`spec.md` §4.8)
//! standalone, wiring the auth pipeline, discovery cache, and an
//! in-memory archive store behind [`kubearchive::archive_api::router`].
//!
//! The relational archive store's physical schema is a non-goal
//! (`spec.md` Non-goals), so this command serves [`MemoryArchiveStore`]
//! as its reference implementation of [`ArchiveStore`] — swapping in a
//! real backing store means providing another impl of that trait, not
//! changing anything in this file.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;

use kubearchive::archive_api::{self, ApiState, MemoryArchiveStore};
use kubearchive::auth::AuthPipeline;
use kubearchive::config::Config;
use kubearchive::discovery::DiscoveryCache;

pub async fn run(addr: String) -> Result<()> {
    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;
    let config = Config::default();

    let state = ApiState {
        auth: Arc::new(AuthPipeline::new(client.clone(), &config)),
        discovery: DiscoveryCache::new(config.discovery_cache_ttl),
        store: Arc::new(MemoryArchiveStore::default()),
        config: config.clone(),
        http: reqwest::Client::new(),
    };

    let app = archive_api::router(state);

    let socket_addr: SocketAddr = addr.parse().context("Invalid listen address")?;
    println!("Serving archive read API on http://{socket_addr}");

    let listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind {socket_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Archive read API server failed")?;

    println!("Archive read API stopped.");
    Ok(())
}
