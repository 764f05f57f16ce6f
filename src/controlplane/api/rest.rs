//! REST API
//!
//! Resource-provider routes under
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{ns}/{kind}/{name}`.
//! Literal segments are matched ignoring ASCII case, so they are captured as
//! path parameters and checked by [`EntityPath::resolve`].

use crate::apierror::{ApiError, ErrorCode};
use crate::controlplane::metrics::ControlPlaneMetrics;
use crate::controlplane::orchestrator::{DeleteOutcome, PutOutcome};
use crate::controlplane::ControlPlane;
use crate::domain::{
    ProviderRegistrationDefinition, ResourceDefinition, ResourceKind, ResourceScope,
    RESOURCE_PROVIDER_NAMESPACE,
};
use crate::error::{Error, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{
        header::{HeaderName, LOCATION, RETRY_AFTER},
        StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Header carrying the operation-status URL of an accepted operation
pub const AZURE_ASYNC_OPERATION: HeaderName = HeaderName::from_static("azure-asyncoperation");

const LIST_SETTINGS_ACTION: &str = "listsettings";

// =============================================================================
// Path Parameters
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubscriptionPath {
    subscriptions: String,
    subscription_id: String,
}

#[derive(Debug, Deserialize)]
struct EntityPath {
    subscriptions: String,
    subscription_id: String,
    resource_groups: String,
    resource_group: String,
    providers: String,
    namespace: String,
    kind: String,
    name: String,
    #[serde(default)]
    action: Option<String>,
}

impl EntityPath {
    /// Check the literal segments and the namespace, then split into kind and scope
    fn resolve(self) -> std::result::Result<(ResourceKind, ResourceScope), ApiError> {
        let literals_match = self.subscriptions.eq_ignore_ascii_case("subscriptions")
            && self.resource_groups.eq_ignore_ascii_case("resourceGroups")
            && self.providers.eq_ignore_ascii_case("providers");
        if !literals_match {
            return Err(ApiError::not_found("The requested route does not exist."));
        }
        if !self.namespace.eq_ignore_ascii_case(RESOURCE_PROVIDER_NAMESPACE) {
            return Err(ApiError::not_found(format!(
                "The resource provider namespace '{}' is not served here.",
                self.namespace
            )));
        }
        let kind = ResourceKind::from_segment(&self.kind).ok_or_else(|| {
            ApiError::not_found(format!("The resource type '{}' does not exist.", self.kind))
        })?;

        Ok((
            kind,
            ResourceScope::new(self.subscription_id, self.resource_group, self.name),
        ))
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    control_plane: Arc<ControlPlane>,
    metrics: Arc<ControlPlaneMetrics>,
    retry_after_secs: u64,
    max_body_size: usize,
}

impl RestRouter {
    pub fn new(control_plane: Arc<ControlPlane>, metrics: Arc<ControlPlaneMetrics>) -> Self {
        Self {
            control_plane,
            metrics,
            retry_after_secs: 10,
            max_body_size: 10 * 1024 * 1024,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Build the router with all routes
    pub fn build(self) -> Router {
        let state = AppState {
            control_plane: self.control_plane,
            metrics: self.metrics,
            retry_after_secs: self.retry_after_secs,
        };

        Router::new()
            // Subscription lifecycle notifications
            .route(
                "/:subscriptions/:subscription_id",
                get(subscription_notification).put(subscription_notification),
            )
            // Provider registrations, resources and operation status
            .route(
                "/:subscriptions/:subscription_id/:resource_groups/:resource_group/:providers/:namespace/:kind/:name",
                get(get_entity).put(put_entity).delete(delete_entity),
            )
            .route(
                "/:subscriptions/:subscription_id/:resource_groups/:resource_group/:providers/:namespace/:kind/:name/:action",
                post(post_action),
            )
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(handle_panic))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    control_plane: Arc<ControlPlane>,
    metrics: Arc<ControlPlaneMetrics>,
    retry_after_secs: u64,
}

impl AppState {
    fn reject(&self, err: impl Into<ApiError>) -> ApiError {
        let err = err.into();
        self.metrics.record_api_error(err.code());
        err
    }

    /// Response for an operation that continues in the background
    fn accepted(&self, status: StatusCode, operation_url: String, body: Option<Response>) -> Response {
        let headers = [
            (LOCATION, operation_url.clone()),
            (AZURE_ASYNC_OPERATION, operation_url),
            (RETRY_AFTER, self.retry_after_secs.to_string()),
        ];
        match body {
            Some(body) => (status, headers, body).into_response(),
            None => (status, headers).into_response(),
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    if body.is_empty() {
        return Err(Error::Validation("Request content is missing.".into()));
    }
    serde_json::from_slice(body).map_err(|e| {
        Error::Validation(format!("Failed to deserialize request content: {}", e))
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Subscription registration and state changes need no bookkeeping
async fn subscription_notification(
    State(state): State<AppState>,
    Path(path): Path<SubscriptionPath>,
) -> std::result::Result<StatusCode, ApiError> {
    if !path.subscriptions.eq_ignore_ascii_case("subscriptions") {
        return Err(state.reject(ApiError::not_found("The requested route does not exist.")));
    }
    debug!("Subscription notification for {}", path.subscription_id);
    Ok(StatusCode::OK)
}

async fn get_entity(
    State(state): State<AppState>,
    Path(path): Path<EntityPath>,
) -> std::result::Result<Response, ApiError> {
    let (kind, scope) = path.resolve().map_err(|e| state.reject(e))?;
    let cp = &state.control_plane;

    let response = match kind {
        ResourceKind::ProviderRegistrations => cp
            .registrations()
            .get(&scope)
            .await
            .map(|view| Json(view).into_response()),
        ResourceKind::Resources => cp
            .orchestrator()
            .get(&scope)
            .await
            .map(|view| Json(view).into_response()),
        ResourceKind::OperationStatus => cp
            .orchestrator()
            .operation_status(&scope)
            .await
            .map(|result| Json(result).into_response()),
    };
    response.map_err(|e| state.reject(e))
}

async fn put_entity(
    State(state): State<AppState>,
    Path(path): Path<EntityPath>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let (kind, scope) = path.resolve().map_err(|e| state.reject(e))?;
    let cp = &state.control_plane;

    match kind {
        ResourceKind::ProviderRegistrations => {
            let definition: ProviderRegistrationDefinition =
                parse_body(&body).map_err(|e| state.reject(e))?;
            let view = cp
                .registrations()
                .register(&scope, definition)
                .await
                .map_err(|e| state.reject(e))?;
            info!("Registered provider {}", view.id);
            Ok(Json(view).into_response())
        }
        ResourceKind::Resources => {
            let definition: ResourceDefinition = parse_body(&body).map_err(|e| state.reject(e))?;
            let outcome = cp
                .orchestrator()
                .create_or_update(&scope, definition)
                .await
                .map_err(|e| state.reject(e))?;
            match outcome {
                PutOutcome::Unchanged(view) => Ok(Json(view).into_response()),
                PutOutcome::Accepted {
                    view,
                    operation_url,
                } => Ok(state.accepted(
                    StatusCode::CREATED,
                    operation_url,
                    Some(Json(view).into_response()),
                )),
            }
        }
        ResourceKind::OperationStatus => Err(state.reject(ApiError::bad_request(
            "Operation status cannot be written.",
        ))),
    }
}

async fn delete_entity(
    State(state): State<AppState>,
    Path(path): Path<EntityPath>,
) -> std::result::Result<Response, ApiError> {
    let (kind, scope) = path.resolve().map_err(|e| state.reject(e))?;
    let cp = &state.control_plane;

    match kind {
        ResourceKind::ProviderRegistrations => {
            cp.registrations()
                .delete(&scope)
                .await
                .map_err(|e| state.reject(e))?;
            Ok(StatusCode::OK.into_response())
        }
        ResourceKind::Resources => {
            let outcome = cp
                .orchestrator()
                .delete(&scope)
                .await
                .map_err(|e| state.reject(e))?;
            match outcome {
                DeleteOutcome::Deleted => Ok(StatusCode::OK.into_response()),
                DeleteOutcome::Accepted { operation_url } => {
                    Ok(state.accepted(StatusCode::ACCEPTED, operation_url, None))
                }
            }
        }
        ResourceKind::OperationStatus => Err(state.reject(ApiError::bad_request(
            "Operation status cannot be deleted.",
        ))),
    }
}

async fn post_action(
    State(state): State<AppState>,
    Path(path): Path<EntityPath>,
) -> std::result::Result<Response, ApiError> {
    let action = path.action.clone().unwrap_or_default();
    let (kind, scope) = path.resolve().map_err(|e| state.reject(e))?;

    if kind != ResourceKind::ProviderRegistrations
        || !action.eq_ignore_ascii_case(LIST_SETTINGS_ACTION)
    {
        return Err(state.reject(ApiError::not_found(format!(
            "The action '{}' does not exist on {}.",
            action, kind
        ))));
    }

    let settings = state
        .control_plane
        .registrations()
        .list_settings(&scope)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(settings).into_response())
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.control_plane.ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "document store unavailable")
    }
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let reason = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Request handler panicked: {}", reason);
    ApiError::new(
        ErrorCode::InternalOperationError,
        "The request failed due to an internal error.",
    )
    .into_response()
}
