//! Exposition endpoint.
//!
//! Two listeners: the metrics listener serves `/metrics` (optionally behind
//! basic auth and TLS) plus the health paths, and the health listener serves
//! only `/health` and `/ready`, always plaintext and unauthenticated.

pub mod auth;

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::FibreMetrics;

use self::auth::Credentials;

/// Certificate and private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Listener configuration for [`ExpositionServer`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: IpAddr,
    /// Port 0 binds an ephemeral port.
    pub metrics_port: u16,
    pub health_port: u16,
    pub auth: Option<Credentials>,
    pub tls: Option<TlsFiles>,
    /// How long in-flight requests may run after shutdown starts.
    pub shutdown_grace: Duration,
}

/// Metrics and health HTTP listeners.
pub struct ExpositionServer {
    settings: ServerSettings,
    metrics: Arc<FibreMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<std::io::Result<()>>>>,
    metrics_addr: parking_lot::Mutex<Option<SocketAddr>>,
    health_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl ExpositionServer {
    pub fn new(settings: ServerSettings, metrics: Arc<FibreMetrics>) -> Self {
        Self {
            settings,
            metrics,
            shutdown: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            metrics_addr: parking_lot::Mutex::new(None),
            health_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Bound address of the metrics listener, once started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        *self.metrics_addr.lock()
    }

    /// Bound address of the health listener, once started.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        *self.health_addr.lock()
    }

    /// Binds both listeners and starts serving.
    ///
    /// Failing to load TLS material or to bind either port is an error.
    pub async fn start(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = metrics_router(Arc::clone(&self.metrics), self.settings.auth.clone());
        let metrics_bind = SocketAddr::new(self.settings.listen_addr, self.settings.metrics_port);

        let metrics_addr = match &self.settings.tls {
            Some(tls) => self.serve_tls(app, metrics_bind, tls, cancel.clone()).await?,
            None => self.serve_plain(app, metrics_bind, cancel.clone()).await?,
        };
        *self.metrics_addr.lock() = Some(metrics_addr);

        let health_bind = SocketAddr::new(self.settings.listen_addr, self.settings.health_port);
        let health_addr = self
            .serve_plain(health_router(), health_bind, cancel)
            .await?;
        *self.health_addr.lock() = Some(health_addr);

        tracing::info!(
            metrics = %metrics_addr,
            health = %health_addr,
            tls = self.settings.tls.is_some(),
            auth = self.settings.auth.is_some(),
            "exposition endpoints started"
        );

        Ok(())
    }

    async fn serve_plain(
        &self,
        app: Router,
        bind_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });

        self.tasks.lock().push(tokio::spawn(server.into_future()));
        Ok(local_addr)
    }

    async fn serve_tls(
        &self,
        app: Router,
        bind_addr: SocketAddr,
        tls: &TlsFiles,
        cancel: CancellationToken,
    ) -> Result<SocketAddr> {
        // Only the first install succeeds; later calls find it already set.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .with_context(|| {
                format!(
                    "loading TLS certificate {} and key {}",
                    tls.cert.display(),
                    tls.key.display()
                )
            })?;

        let handle = axum_server::Handle::new();
        let server = axum_server::bind_rustls(bind_addr, config).handle(handle.clone());
        let task = tokio::spawn(
            server.serve(app.into_make_service_with_connect_info::<SocketAddr>()),
        );

        let Some(local_addr) = handle.listening().await else {
            let err = match task.await {
                Ok(Err(e)) => anyhow::Error::from(e),
                Ok(Ok(())) => anyhow::anyhow!("server exited before listening"),
                Err(e) => anyhow::Error::from(e),
            };
            return Err(err.context(format!("listening on {bind_addr} with TLS")));
        };

        let grace = self.settings.shutdown_grace;
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(grace));
        });

        self.tasks.lock().push(task);
        Ok(local_addr)
    }

    /// Stops accepting connections and waits for in-flight requests to drain.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let grace = self.settings.shutdown_grace;
        for task in tasks {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task failed"),
                Err(_) => tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "HTTP server did not drain in time"
                ),
            }
        }

        tracing::info!("exposition endpoints stopped");
        Ok(())
    }
}

/// Shared state for the metrics listener.
#[derive(Clone)]
struct MetricsState {
    metrics: Arc<FibreMetrics>,
    auth: Option<Arc<Credentials>>,
}

/// Router for the metrics listener.
pub fn metrics_router(metrics: Arc<FibreMetrics>, auth: Option<Credentials>) -> Router {
    let state = MetricsState {
        metrics,
        auth: auth.map(Arc::new),
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

/// Router for the health listener.
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(health_handler))
        .fallback(not_found_handler)
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(
    State(state): State<MetricsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Some(creds) = &state.auth {
        if let Err(e) = creds.verify(headers.get(header::AUTHORIZATION)) {
            tracing::debug!(peer = %peer, error = %e, "metrics request rejected");
            state.metrics.record_error(e.label());
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, auth::challenge())],
                "Unauthorized",
            )
                .into_response();
        }
    }

    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
                .into_response()
        }
    }
}

/// GET /health, /ready
async fn health_handler() -> &'static str {
    "OK"
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}
