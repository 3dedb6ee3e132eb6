//! HTTP adapter
//!
//! Open Service Broker shaped REST endpoints over the `Broker`:
//! - Service instances: provision, update, deprovision, last operation
//! - Service bindings: bind, unbind
//! - Health check
//!
//! Handlers only translate; every decision lives in the broker.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::broker::{
    Broker, BrokerError, DeprovisionDetails, ProvisionDetails, UpdateDetails,
};
use crate::cluster::{ClusterId, SchedulingInfo, SchedulingStatus};

/// Shared state of the HTTP adapter
#[derive(Clone)]
pub struct ApiState {
    pub broker: Broker,
}

impl ApiState {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }
}

/// Create the broker API router
pub fn create_router(state: ApiState) -> Router {
    let api_key = state.broker.config().broker.api_key.clone();

    let service_instances = Router::new()
        .route(
            "/v2/service_instances/{instance_id}",
            put(provision).patch(update).delete(deprovision),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(last_operation),
        )
        .route(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(bind).delete(unbind),
        )
        .route_layer(middleware::from_fn_with_state(api_key, require_api_key));

    Router::new()
        .merge(service_instances)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

/// Status code for a broker error
pub fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Consistency(_)
        | BrokerError::Timeout(_)
        | BrokerError::Backend(_)
        | BrokerError::Store(_)
        | BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    description: String,
}

/// A broker error on its way out as a response
struct ApiError {
    status: StatusCode,
    error: BrokerError,
}

impl ApiError {
    /// Missing instances are reported as gone
    fn gone_if_missing(error: BrokerError) -> Self {
        let status = match error {
            BrokerError::NotFound(_) => StatusCode::GONE,
            ref other => status_for(other),
        };
        Self { status, error }
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        Self {
            status: status_for(&error),
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed with {}: {}", self.status, self.error);
        } else {
            debug!("Request rejected with {}: {}", self.status, self.error);
        }
        let body = ErrorBody {
            error: self.error.kind(),
            description: self.error.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Middleware
// ============================================================================

async fn require_api_key(
    State(api_key): State<Option<String>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = api_key else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        debug!("Rejecting request without a valid API key");
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Service instance endpoints
// ============================================================================

#[derive(Serialize)]
struct OperationResponse {
    operation: &'static str,
}

#[derive(Serialize)]
struct EmptyResponse {}

async fn provision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(details): Json<ProvisionDetails>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = if details.service_id.is_empty() && details.plan_id.is_empty() {
        "recreate"
    } else {
        "provision"
    };
    state
        .broker
        .provision(ClusterId::from(instance_id), details)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(OperationResponse { operation })))
}

async fn update(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(details): Json<UpdateDetails>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .broker
        .update(ClusterId::from(instance_id), details)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            operation: "update",
        }),
    ))
}

async fn deprovision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(details): Query<DeprovisionDetails>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .broker
        .deprovision(ClusterId::from(instance_id), details)
        .await
        .map_err(ApiError::gone_if_missing)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            operation: "deprovision",
        }),
    ))
}

/// Last operation in the platform's vocabulary
#[derive(Debug, Serialize)]
pub struct LastOperationResponse {
    pub state: &'static str,
    pub description: String,
}

impl From<SchedulingInfo> for LastOperationResponse {
    fn from(info: SchedulingInfo) -> Self {
        let state = match info.status {
            SchedulingStatus::Success => "succeeded",
            SchedulingStatus::Failed => "failed",
            SchedulingStatus::InProgress | SchedulingStatus::Unknown => "in progress",
        };
        Self {
            state,
            description: format!(
                "{} ({}/{} steps)",
                info.last_message, info.completed_steps, info.steps
            ),
        }
    }
}

async fn last_operation(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .broker
        .last_operation(ClusterId::from(instance_id))
        .await
        .map_err(ApiError::gone_if_missing)?;
    Ok(Json(LastOperationResponse::from(info)))
}

// ============================================================================
// Binding endpoints
// ============================================================================

async fn bind(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let binding = state
        .broker
        .bind(ClusterId::from(instance_id), &binding_id)
        .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .broker
        .unbind(ClusterId::from(instance_id), &binding_id)
        .await
        .map_err(ApiError::gone_if_missing)?;
    Ok(Json(EmptyResponse {}))
}
