use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use futures_util::future;
use log::{error, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::deploy::runner::Deployer;
use crate::deploy::status::{container_state, ContainerState};
use crate::deploy::{DeployReport, DeployRequest};
use crate::docker::get_docker;

struct AppState {
    deployer: Arc<Deployer>,
}

/// Serve the deploy API until `shutdown` resolves.
pub async fn serve(
    deployer: Arc<Deployer>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(Arc::new(AppState { deployer }));

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/deployments", get(list_deployments))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Run one deployment attempt and report the outcome.
///
/// The attempt runs in its own task so a caller that gives up and drops
/// the connection never cancels a deployment mid-stream. The response is
/// always 200 with the `{exitCode, targetUrl | message}` shape, a
/// malformed body included.
async fn deploy(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Json<DeployReport> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected deploy request: {rejection}");
            return Json(DeployReport::failure(format!(
                "Invalid deploy request: {}",
                rejection.body_text()
            )));
        }
    };

    let deployer = Arc::clone(&state.deployer);
    let attempt = tokio::spawn(async move { deployer.deploy(&request).await });

    let report = match attempt.await {
        Ok(Ok(deployment)) => {
            info!(
                "Deployed {} at {}",
                deployment.key, deployment.endpoint
            );
            DeployReport::success(deployment.endpoint)
        }
        Ok(Err(err)) => {
            error!("Deployment failed: {err}");
            DeployReport::failure(err.to_string())
        }
        Err(err) => {
            error!("Deployment task panicked: {err}");
            DeployReport::failure(format!("Deployment task failed: {err}"))
        }
    };
    Json(report)
}

#[derive(Debug, Serialize)]
struct DeploymentRow {
    repo: String,
    branch: String,
    port: u16,
    endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<ContainerState>,
}

/// Both tables joined with the live container state per entry.
async fn list_deployments(State(state): State<Arc<AppState>>) -> Json<Vec<DeploymentRow>> {
    let snapshot = state.deployer.snapshot().await;

    let rows = snapshot.into_iter().map(|entry| async move {
        let state = match &entry.container {
            Some(name) => match container_state(name).await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Unable to inspect container {name}: {e}");
                    None
                }
            },
            None => None,
        };
        DeploymentRow {
            repo: entry.key.repo,
            branch: entry.key.branch,
            port: entry.port,
            endpoint: entry.endpoint,
            container: entry.container,
            state,
        }
    });

    Json(future::join_all(rows).await)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    docker: bool,
}

async fn healthz() -> Json<Health> {
    let docker = match get_docker().ping().await {
        Ok(_) => true,
        Err(e) => {
            warn!("Docker ping failed: {e}");
            false
        }
    };
    Json(Health {
        status: "ok",
        docker,
    })
}
