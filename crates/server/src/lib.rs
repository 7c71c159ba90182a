//! azad-kube-proxy server library.
//!
//! Wires the authentication layer, the identity pipeline and the two
//! listeners together, and owns the process lifecycle: initial group sync,
//! background sync task and graceful shutdown.

#![deny(missing_docs)]

mod auth;
mod cors;
mod error;
mod health;
mod metrics;
mod proxy;
mod transport;
mod user;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use auth::AuthLayer;
use axum::{Router, routing::get};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use config::Config;
use graph::{GraphClient, GroupSyncer, SyncReason};
use proxy::AppState;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use user::GraphDirectory;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for serving the proxy.
pub struct ServeConfig {
    /// The socket address (IP and port) the proxy listener will bind to.
    pub listen_address: SocketAddr,
    /// The deserialized TOML configuration.
    pub config: Config,
}

/// Starts and runs the proxy with the provided configuration.
///
/// Returns once both listeners have drained after a shutdown signal, or with
/// an error when startup fails. A failing initial group sync is fatal: the
/// proxy must never serve requests against an empty group cache.
pub async fn serve(ServeConfig { listen_address, config }: ServeConfig) -> anyhow::Result<()> {
    let prometheus = metrics::install_recorder()?;

    let config = Arc::new(config);

    let cache = cache::from_config(&config.cache, config.azure.group_sync_interval)
        .await
        .map_err(|e| anyhow!("failed to initialize the cache backend: {e}"))?;

    let graph = Arc::new(GraphClient::new(&config.azure));

    let syncer = GroupSyncer::new(
        graph.clone(),
        cache.clone(),
        config.azure.group_sync_interval,
        config.azure.group_filter_prefix.clone(),
    );

    syncer
        .sync(SyncReason::Initial)
        .await
        .map_err(|e| anyhow!("initial group sync failed: {e}"))?;

    let cancel = CancellationToken::new();
    let sync_task = tokio::spawn(syncer.run(cancel.clone()));

    // Read once at startup; the kubelet rotates the file but the mounted
    // token stays valid for the lifetime of the pod.
    let sa_token = tokio::fs::read_to_string(&config.kubernetes.token_path)
        .await
        .with_context(|| {
            format!(
                "failed to read the service account token from {}",
                config.kubernetes.token_path.display()
            )
        })?
        .trim()
        .to_string();

    let transport = Arc::new(transport::ReqwestTransport::new(&config.kubernetes)?);

    let state = Arc::new(AppState {
        directory: Arc::new(GraphDirectory::new(graph.clone(), cache.clone())),
        cache,
        transport,
        graph,
        sa_token,
        config: config.clone(),
    });

    let cors = match &config.server.cors {
        Some(cors_config) => cors::generate(cors_config),
        None => CorsLayer::permissive(),
    };

    // Health routes stay outside the auth layer; probes carry no token.
    let protected = Router::new()
        .fallback(proxy::handler)
        .layer(AuthLayer::new(&config.azure))
        .with_state(state.clone());

    let app = Router::new()
        .route("/readyz", get(health::readyz))
        .route("/healthz", get(health::healthz))
        .with_state(state.clone())
        .merge(protected)
        .layer(cors);

    let metrics_app = Router::new()
        .route("/readyz", get(health::readyz))
        .route("/healthz", get(health::healthz))
        .with_state(state)
        .merge(metrics::router(prometheus));

    let tls_config = match &config.server.tls {
        Some(tls) => Some(
            RustlsConfig::from_pem_file(&tls.certificate, &tls.key)
                .await
                .map_err(|e| anyhow!("failed to load TLS certificate and key: {e}"))?,
        ),
        None => None,
    };

    let proxy_handle = Handle::new();
    let metrics_handle = Handle::new();

    let metrics_address = config.metrics.listen_address;
    log::info!("metrics endpoint available at: http://{metrics_address}/metrics");

    let mut metrics_server: JoinHandle<std::io::Result<()>> = tokio::spawn({
        let handle = metrics_handle.clone();

        async move {
            axum_server::bind(metrics_address)
                .handle(handle)
                .serve(metrics_app.into_make_service())
                .await
        }
    });

    let scheme = if tls_config.is_some() { "https" } else { "http" };
    log::info!("proxying the Kubernetes API at: {scheme}://{listen_address}");

    let mut proxy_server: JoinHandle<std::io::Result<()>> = tokio::spawn({
        let handle = proxy_handle.clone();

        async move {
            match tls_config {
                Some(rustls_config) => {
                    axum_server::bind_rustls(listen_address, rustls_config)
                        .handle(handle)
                        .serve(app.into_make_service())
                        .await
                }
                None => {
                    axum_server::bind(listen_address)
                        .handle(handle)
                        .serve(app.into_make_service())
                        .await
                }
            }
        }
    });

    let mut proxy_finished = false;
    let mut metrics_finished = false;
    let mut listener_error = None;

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            log::info!("shutdown signal received");
        }
        result = &mut proxy_server => {
            listener_error = server_exit_error("proxy", result);
            proxy_finished = true;
        }
        result = &mut metrics_server => {
            listener_error = server_exit_error("metrics", result);
            metrics_finished = true;
        }
    }

    cancel.cancel();
    proxy_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    metrics_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

    if !proxy_finished {
        let _ = proxy_server.await;
    }

    if !metrics_finished {
        let _ = metrics_server.await;
    }

    // An in-flight sync pass completes before the task exits.
    let _ = sync_task.await;

    // A listener that stopped on its own is a startup or runtime failure; the
    // process must exit nonzero after draining.
    if let Some(error) = listener_error {
        return Err(error);
    }

    log::info!("shutdown complete");

    Ok(())
}

fn server_exit_error(
    name: &str,
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => {
            log::info!("{name} listener stopped");
            None
        }
        Ok(Err(error)) => Some(anyhow!("{name} listener failed: {error}")),
        Err(error) => Some(anyhow!("{name} listener task panicked: {error}")),
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install the SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }

    Ok(())
}
