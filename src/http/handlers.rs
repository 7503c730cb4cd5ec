//! Request handlers for the controller's HTTP surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json, Response};
use futures::{Stream, StreamExt};
use serde_json::json;

use crate::context::ProcessContext;
use crate::errors::ControllerError;
use crate::models::gafaelfawr::GafaelfawrUser;
use crate::models::lab::LabSpecification;

/// Extract the identity headers added by the auth layer in front of us.
fn auth_headers(headers: &HeaderMap) -> Result<(String, String), ControllerError> {
    let user = headers
        .get("X-Auth-Request-User")
        .and_then(|value| value.to_str().ok())
        .ok_or(ControllerError::PermissionDenied)?;
    let token = headers
        .get("X-Auth-Request-Token")
        .and_then(|value| value.to_str().ok())
        .ok_or(ControllerError::InvalidToken)?;
    Ok((user.to_string(), token.to_string()))
}

/// Validate the request's token against Gafaelfawr and check that the
/// resulting user matches both the identity header and the username in the
/// request path.
async fn authenticated_user(
    context: &ProcessContext,
    headers: &HeaderMap,
    username: Option<&str>,
) -> Result<GafaelfawrUser, ControllerError> {
    let (header_user, token) = auth_headers(headers)?;
    let user = context.gafaelfawr.get_user(&token).await?;
    if user.username() != header_user {
        return Err(ControllerError::PermissionDenied);
    }
    if let Some(username) = username {
        if username != user.username() {
            return Err(ControllerError::PermissionDenied);
        }
    }
    Ok(user)
}

/// `GET /` - application metadata.
pub async fn get_index(State(context): State<Arc<ProcessContext>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": context.config.name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /spawner/v1/lab-form/{username}` - the HTML spawner form.
pub async fn get_lab_form(
    State(context): State<Arc<ProcessContext>>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Html<String>, ControllerError> {
    let user = authenticated_user(&context, &headers, Some(&username)).await?;
    info!("Creating options form for {username}");
    let images = context.image_service.menu_images();
    let form = context.form.spawner_form(&user, &images)?;
    Ok(Html(form))
}

/// `GET /spawner/v1/labs` - all users with labs.
pub async fn get_lab_users(State(context): State<Arc<ProcessContext>>) -> Json<Vec<String>> {
    Json(context.lab_manager.list_users())
}

/// `GET /spawner/v1/labs/{username}` - lab state for a user.
pub async fn get_lab_state(
    State(context): State<Arc<ProcessContext>>,
    Path(username): Path<String>,
) -> Result<Response, ControllerError> {
    match context.lab_manager.get_state(&username) {
        Some(state) => Ok(Json(state).into_response()),
        None => Err(ControllerError::UnknownUser { user: username }),
    }
}

/// `POST /spawner/v1/labs/{username}/create` - begin a lab spawn.
pub async fn create_lab(
    State(context): State<Arc<ProcessContext>>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Json(spec): Json<LabSpecification>,
) -> Result<Response, ControllerError> {
    let user = authenticated_user(&context, &headers, Some(&username)).await?;
    context.lab_manager.create(user, spec).await?;
    let location = format!("{}/spawner/v1/labs/{username}", context.config.path_prefix);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

/// `DELETE /spawner/v1/labs/{username}` - begin lab teardown.
pub async fn delete_lab(
    State(context): State<Arc<ProcessContext>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ControllerError> {
    context.lab_manager.delete(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /spawner/v1/labs/{username}/events` - lab progress as SSE.
pub async fn get_lab_events(
    State(context): State<Arc<ProcessContext>>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ControllerError> {
    authenticated_user(&context, &headers, Some(&username)).await?;
    let events = context.lab_manager.events_for(&username)?;
    let stream = events.map(|event| {
        Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(event.to_sse_data()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /spawner/v1/user-status` - the requesting user's own lab.
pub async fn get_user_status(
    State(context): State<Arc<ProcessContext>>,
    headers: HeaderMap,
) -> Result<Response, ControllerError> {
    let user = authenticated_user(&context, &headers, None).await?;
    match context.lab_manager.get_state(user.username()) {
        Some(state) => Ok(Json(state).into_response()),
        None => Err(ControllerError::UnknownUser {
            user: user.username().to_string(),
        }),
    }
}

/// `GET /spawner/v1/images` - spawnable images.
pub async fn get_images(State(context): State<Arc<ProcessContext>>) -> Response {
    Json(context.image_service.images()).into_response()
}

/// `GET /spawner/v1/prepulls` - prepuller status.
pub async fn get_prepulls(State(context): State<Arc<ProcessContext>>) -> Response {
    Json(context.image_service.prepull_status()).into_response()
}
