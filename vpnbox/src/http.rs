//! Status and control surface consumed by the web UI.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use std::sync::Arc;

use vpnbox_lib::config::VpnOpt;
use vpnbox_lib::controller::{Controller, Error as ControllerError};
use vpnbox_lib::state::ControllerState;

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/vpns", get(list_vpns))
        .route("/api/vpn", post(set_vpn))
        .with_state(controller)
}

async fn get_state(State(controller): State<Arc<Controller>>) -> Json<ControllerState> {
    Json(controller.get_state())
}

async fn list_vpns(State(controller): State<Arc<Controller>>) -> Json<Vec<VpnOpt>> {
    Json(controller.list_vpns())
}

#[derive(Debug, Deserialize)]
struct SetVpnRequest {
    name: String,
}

async fn set_vpn(
    State(controller): State<Arc<Controller>>,
    body: Result<Json<SetVpnRequest>, JsonRejection>,
) -> (StatusCode, String) {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return (StatusCode::BAD_REQUEST, rejection.to_string()),
    };

    tracing::info!(name = %request.name, "vpn switch requested");
    match controller.set_vpn_by_name(&request.name).await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e @ ControllerError::VpnNotFound(_)) => (StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!(error = ?e, name = %request.name, "vpn switch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
