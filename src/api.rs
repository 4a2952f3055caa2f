//! HTTP surface.
//!
//! ```text
//! POST   /api/requests/draft                  ensure the caller's draft
//! GET    /api/cart                            draft id + quantity badge
//! GET    /api/requests/{id}                   view
//! PUT    /api/requests/{id}                   edit note
//! DELETE /api/requests/{id}                   delete
//! GET    /api/requests/{id}/preview           engine output, not persisted
//! POST   /api/requests/{id}/items             add beam
//! PUT    /api/requests/{id}/items/{beam_id}   edit item
//! DELETE /api/requests/{id}/items/{beam_id}   remove item
//! PUT    /api/requests/{id}/form|complete|reject
//! POST   /api/requests/{id}/async_result      result callback (x-async-token)
//! GET    /health
//! ```
//!
//! The acting user comes from the `x-actor-id` and `x-moderator` headers set
//! by the authentication layer in front of this service.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::callback::{ResultCallback, ResultPayload};
use crate::domain::actor::Actor;
use crate::domain::beam::{BeamId, Catalog};
use crate::domain::request::{ItemUpdate, Request, RequestId};
use crate::error::BeamcheckError;
use crate::http::ASYNC_TOKEN_HEADER;
use crate::manager::Storage;
use crate::service::{CartSummary, Preview, RequestService, RequestView};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const MODERATOR_HEADER: &str = "x-moderator";

/// Shared handler state.
pub struct ApiState<S, C> {
    pub service: RequestService<S, C>,
    pub callback: Arc<ResultCallback<S, C>>,
}

impl<S, C> Clone for ApiState<S, C> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            callback: self.callback.clone(),
        }
    }
}

/// Error response: a status code and a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<BeamcheckError> for ApiError {
    fn from(err: BeamcheckError) -> Self {
        let status = match &err {
            BeamcheckError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BeamcheckError::Validation(_) | BeamcheckError::InvalidState(..) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BeamcheckError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            BeamcheckError::IdMismatch { .. } | BeamcheckError::StaleGeneration { .. } => {
                StatusCode::CONFLICT
            }
            BeamcheckError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            BeamcheckError::HttpClient(_)
            | BeamcheckError::Serialization(_)
            | BeamcheckError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request handling failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

impl<St> FromRequestParts<St> for Actor
where
    St: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> ApiResult<Self> {
        let id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing actor"))?;
        let moderator = parts
            .headers
            .get(MODERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| matches!(v.trim(), "true" | "1"));

        Ok(Actor {
            id: id.into(),
            moderator,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NoteBody {
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddItemBody {
    beam_id: BeamId,
    #[serde(default = "one")]
    quantity: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

/// Build the router over the given state.
pub fn router<S, C>(state: ApiState<S, C>) -> Router
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/api/cart", get(cart::<S, C>))
        .route("/api/requests/draft", post(ensure_draft::<S, C>))
        .route(
            "/api/requests/{id}",
            get(view::<S, C>)
                .put(update_note::<S, C>)
                .delete(delete_request::<S, C>),
        )
        .route("/api/requests/{id}/preview", get(preview::<S, C>))
        .route("/api/requests/{id}/items", post(add_item::<S, C>))
        .route(
            "/api/requests/{id}/items/{beam_id}",
            put(update_item::<S, C>).delete(remove_item::<S, C>),
        )
        .route("/api/requests/{id}/form", put(form::<S, C>))
        .route("/api/requests/{id}/complete", put(complete::<S, C>))
        .route("/api/requests/{id}/reject", put(reject::<S, C>))
        .route("/api/requests/{id}/async_result", post(async_result::<S, C>))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(Health {
            status: "up",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn rendered<S, C>(state: &ApiState<S, C>, request: &Request) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    Ok(Json(state.service.render(request).await?))
}

async fn cart<S, C>(State(state): State<ApiState<S, C>>, actor: Actor) -> ApiResult<Json<CartSummary>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    Ok(Json(state.service.cart_summary(&actor).await?))
}

async fn ensure_draft<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let draft = state.service.ensure_draft(&actor).await?;
    rendered(&state, &draft).await
}

async fn view<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    Ok(Json(state.service.view(&actor, id).await?))
}

async fn preview<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<Json<Preview>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    Ok(Json(state.service.preview(&actor, id).await?))
}

async fn update_note<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
    Json(body): Json<NoteBody>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state.service.update_note(&actor, id, body.note).await?;
    rendered(&state, &request).await
}

async fn delete_request<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<StatusCode>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    state.service.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_item<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
    Json(body): Json<AddItemBody>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state
        .service
        .add_item(&actor, id, body.beam_id, body.quantity)
        .await?;
    rendered(&state, &request).await
}

async fn update_item<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path((id, beam_id)): Path<(RequestId, BeamId)>,
    Json(update): Json<ItemUpdate>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state
        .service
        .update_item(&actor, id, beam_id, &update)
        .await?;
    rendered(&state, &request).await
}

async fn remove_item<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path((id, beam_id)): Path<(RequestId, BeamId)>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state.service.remove_item(&actor, id, beam_id).await?;
    rendered(&state, &request).await
}

async fn form<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state.service.form(&actor, id).await?;
    rendered(&state, &request).await
}

async fn complete<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state.service.complete(&actor, id).await?;
    rendered(&state, &request).await
}

async fn reject<S, C>(
    State(state): State<ApiState<S, C>>,
    actor: Actor,
    Path(id): Path<RequestId>,
) -> ApiResult<Json<RequestView>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let request = state.service.reject(&actor, id).await?;
    rendered(&state, &request).await
}

/// Called by the external computation service, not by users.
async fn async_result<S, C>(
    State(state): State<ApiState<S, C>>,
    Path(id): Path<RequestId>,
    headers: HeaderMap,
    Json(payload): Json<ResultPayload>,
) -> ApiResult<Json<serde_json::Value>>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    let token = headers
        .get(ASYNC_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    match state.callback.accept(id, token, payload).await {
        Ok(_) => Ok(Json(json!({ "ok": true }))),
        Err(BeamcheckError::Unauthorized(message)) => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, message))
        }
        Err(e) => Err(e.into()),
    }
}
