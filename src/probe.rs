use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_channel::oneshot;
use serde::Serialize;
use tap::TapFallible;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::controller::{Controller, Probe};
use crate::metrics::Metrics;

#[derive(Clone)]
struct ProbeState {
    controller: Arc<Controller>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    #[serde(flatten)]
    probe: Probe,
    updaters: BTreeMap<String, bool>,
}

pub fn router(controller: Arc<Controller>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(export_metrics))
        .with_state(ProbeState {
            controller,
            metrics,
        })
}

async fn health(State(state): State<ProbeState>) -> impl IntoResponse {
    let probe = state.controller.health().probe();

    let updaters = state
        .controller
        .updater_health()
        .into_iter()
        .map(|(name, health)| (name, health.is_healthy()))
        .collect();

    let status = if probe.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(HealthBody { probe, updaters }))
}

async fn export_metrics(State(state): State<ProbeState>) -> Response {
    match state.metrics.gather() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),

        Err(err) => {
            error!(%err, "encode metrics failed");

            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The running health and metrics listener.
pub struct ProbeServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProbeServer {
    /// Bind `addr` and serve the probe endpoints in the background.
    pub async fn serve(
        addr: SocketAddr,
        controller: Arc<Controller>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .tap_err(|err| error!(%addr, %err, "bind health port failed"))?;

        let local_addr = listener.local_addr()?;
        let app = router(controller, metrics);
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_signal.await;
                })
                .await;

            if let Err(err) = result {
                error!(%err, "probe server failed");
            }
        });

        info!(%local_addr, "probe server listening");

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());

        if let Err(err) = self.task.await {
            error!(%err, "probe server task failed");
        }

        info!("probe server stopped");
    }
}
