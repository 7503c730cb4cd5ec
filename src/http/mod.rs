//! HTTP edge: route table and error mapping.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;

use crate::context::ProcessContext;
use crate::errors::ControllerError;

pub mod handlers;

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        (status, Json(self.to_detail())).into_response()
    }
}

/// Build the application router, mounted under the configured path prefix.
pub fn build_router(context: Arc<ProcessContext>) -> Router {
    let prefix = context.config.path_prefix.clone();
    let api = Router::new()
        .route("/", get(handlers::get_index))
        .route("/spawner/v1/lab-form/{username}", get(handlers::get_lab_form))
        .route("/spawner/v1/labs", get(handlers::get_lab_users))
        .route(
            "/spawner/v1/labs/{username}",
            get(handlers::get_lab_state).delete(handlers::delete_lab),
        )
        .route("/spawner/v1/labs/{username}/create", axum::routing::post(handlers::create_lab))
        .route("/spawner/v1/labs/{username}/events", get(handlers::get_lab_events))
        .route("/spawner/v1/user-status", get(handlers::get_user_status))
        .route("/spawner/v1/images", get(handlers::get_images))
        .route("/spawner/v1/prepulls", get(handlers::get_prepulls))
        .with_state(context);
    Router::new().nest(&prefix, api)
}
