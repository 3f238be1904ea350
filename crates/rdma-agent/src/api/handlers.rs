use std::sync::Arc;

use error_stack::Report;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::IntoResponse;
use poem::Response;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::errors::hook_error_status;
use super::CreateContainerRequest;
use super::CreateContainerResponse;
use super::HookResponse;
use super::PodSandboxRequest;
use super::SynchronizeRequest;
use super::SynchronizeResponse;
use crate::domain::orchestrator::HookError;
use crate::domain::orchestrator::HookHandler;
use crate::domain::orchestrator::Orchestrator;
use crate::domain::types::NetworkStatus;

fn success<T: Serialize + Send>(data: T, message: &str) -> Response {
    Json(HookResponse::ok(data, message)).into_response()
}

fn failure<T: Serialize + Send>(error: Report<HookError>) -> Response {
    warn!("Hook failed: {error:?}");
    let status = hook_error_status(error.current_context());
    Json(HookResponse::<T>::failed(error.to_string()))
        .with_status(status)
        .into_response()
}

#[handler]
pub async fn run_pod_sandbox(
    Data(orchestrator): Data<&Arc<Orchestrator>>,
    Json(request): Json<PodSandboxRequest>,
) -> Response {
    match orchestrator.run_pod_sandbox(&request.pod).await {
        Ok(()) => success((), "pod sandbox started"),
        Err(e) => failure::<()>(e),
    }
}

/// Provisions RDMA devices for the pod and returns the container adjustment
#[handler]
pub async fn create_container(
    Data(orchestrator): Data<&Arc<Orchestrator>>,
    Json(request): Json<CreateContainerRequest>,
) -> Response {
    match orchestrator
        .create_container(&request.pod, &request.container)
        .await
    {
        Ok(adjust) => success(
            CreateContainerResponse {
                adjust,
                update: Vec::new(),
            },
            "container adjusted",
        ),
        Err(e) => failure::<CreateContainerResponse>(e),
    }
}

#[handler]
pub async fn stop_pod_sandbox(
    Data(orchestrator): Data<&Arc<Orchestrator>>,
    Json(request): Json<PodSandboxRequest>,
) -> Response {
    match orchestrator.stop_pod_sandbox(&request.pod).await {
        Ok(()) => success((), "pod sandbox stopped"),
        Err(e) => failure::<()>(e),
    }
}

#[handler]
pub async fn remove_pod_sandbox(
    Data(orchestrator): Data<&Arc<Orchestrator>>,
    Json(request): Json<PodSandboxRequest>,
) -> Response {
    match orchestrator.remove_pod_sandbox(&request.pod).await {
        Ok(()) => success((), "pod sandbox removed"),
        Err(e) => failure::<()>(e),
    }
}

#[handler]
pub async fn synchronize(
    Data(orchestrator): Data<&Arc<Orchestrator>>,
    Json(request): Json<SynchronizeRequest>,
) -> Response {
    match orchestrator
        .synchronize(&request.pods, &request.containers)
        .await
    {
        Ok(update) => success(SynchronizeResponse { update }, "synchronized"),
        Err(e) => failure::<SynchronizeResponse>(e),
    }
}

#[handler]
pub async fn shutdown(Data(orchestrator): Data<&Arc<Orchestrator>>) -> Response {
    orchestrator.shutdown().await;
    success((), "shutdown acknowledged")
}

/// Network status of a provisioned pod, in network-status annotation form
#[handler]
pub async fn get_network_status(
    Path((namespace, name)): Path<(String, String)>,
    Data(orchestrator): Data<&Arc<Orchestrator>>,
) -> Response {
    match orchestrator.network_status(&namespace, &name) {
        Some(statuses) => success(statuses, "network status found"),
        None => {
            debug!(namespace, name, "no network status");
            Json(HookResponse::<Vec<NetworkStatus>>::failed(format!(
                "Pod {name} has no RDMA networks in namespace {namespace}"
            )))
            .with_status(StatusCode::NOT_FOUND)
            .into_response()
        }
    }
}

#[handler]
pub async fn healthz() -> &'static str {
    "ok"
}
