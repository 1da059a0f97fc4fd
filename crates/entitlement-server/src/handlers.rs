//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

use entitlement_sync::{CheckoutRequest, EntitlementView, Plan, SyncError};

use crate::state::{AppState, Billing};

type ApiError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn new(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
        (
            status,
            Json(Self {
                error: error.into(),
                code: code.into(),
            }),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalBody {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
}

// ============================================================================
// Helpers
// ============================================================================

fn billing(state: &AppState) -> Result<&Billing, ApiError> {
    state.billing.as_ref().ok_or_else(|| {
        ErrorResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Payments not configured",
            "PAYMENTS_DISABLED",
        )
    })
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ErrorResponse::new(StatusCode::BAD_REQUEST, message, "INVALID_REQUEST")
}

/// Reject JSON that axum could not extract with our own error shape
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(|e| {
        tracing::debug!(error = %e, "Rejected request body");
        bad_request("Request body must be a JSON object")
    })
}

fn require_device_id(device_id: Option<String>) -> Result<String, ApiError> {
    device_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request("deviceId is required"))
}

/// Only the paid plans can be purchased
fn parse_paid_plan(plan: Option<&str>) -> Result<Plan, ApiError> {
    match plan {
        Some("monthly") => Ok(Plan::Monthly),
        Some("yearly") => Ok(Plan::Yearly),
        _ => Err(bad_request("plan must be \"monthly\" or \"yearly\"")),
    }
}

fn upstream_error(e: &SyncError, code: &str) -> ApiError {
    let (status, code) = match e {
        SyncError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, code),
        SyncError::CustomerNotFound(_) => (StatusCode::NOT_FOUND, "NO_CUSTOMER"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, code),
    };
    ErrorResponse::new(status, e.user_message(), code)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.billing.is_some(),
    })
}

/// Create a Stripe checkout session for a device
pub async fn create_checkout(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutBody>, JsonRejection>,
) -> Result<Json<UrlResponse>, ApiError> {
    let body = parse_body(payload)?;
    let plan = parse_paid_plan(body.plan.as_deref())?;
    let device_id = require_device_id(body.device_id)?;
    let billing = billing(&state)?;

    let request = CheckoutRequest { plan, device_id };
    let session = billing
        .provider
        .create_checkout_session(&request)
        .await
        .map_err(|e| {
            tracing::error!(device_id = %request.device_id, error = %e, "Checkout error");
            upstream_error(&e, "CHECKOUT_ERROR")
        })?;

    tracing::info!(
        device_id = %request.device_id,
        plan = %request.plan,
        session_id = %session.id,
        "Checkout session created"
    );

    Ok(Json(UrlResponse { url: session.url }))
}

/// Open the billing portal for a device that has paid before
pub async fn create_portal(
    State(state): State<AppState>,
    payload: Result<Json<PortalBody>, JsonRejection>,
) -> Result<Json<UrlResponse>, ApiError> {
    let body = parse_body(payload)?;
    let device_id = require_device_id(body.device_id)?;
    let billing = billing(&state)?;

    let record = state.store.get(&device_id).await.map_err(|e| {
        tracing::error!(device_id = %device_id, error = %e, "Entitlement lookup failed");
        upstream_error(&e, "STORAGE_ERROR")
    })?;

    let customer_id = record
        .and_then(|r| r.customer_id)
        .ok_or_else(|| SyncError::CustomerNotFound(device_id.clone()))
        .map_err(|e| {
            tracing::debug!(device_id = %device_id, "Portal requested before any checkout");
            upstream_error(&e, "PORTAL_ERROR")
        })?;

    let session = billing
        .provider
        .create_portal_session(&customer_id)
        .await
        .map_err(|e| {
            tracing::error!(device_id = %device_id, error = %e, "Portal error");
            upstream_error(&e, "PORTAL_ERROR")
        })?;

    Ok(Json(UrlResponse { url: session.url }))
}

/// Current entitlement for a device. Unknown devices and storage failures
/// both read as the free default.
pub async fn entitlement_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<EntitlementView> {
    let view = match state.store.get(&device_id).await {
        Ok(Some(record)) => record.view(),
        Ok(None) => EntitlementView::default(),
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "Status lookup failed, reporting free");
            EntitlementView::default()
        }
    };
    Json(view)
}

/// Stripe webhook handler
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let billing = billing(&state)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                "Missing Stripe signature",
                "MISSING_SIGNATURE",
            )
        })?;

    billing.webhooks.handle(&body, signature).await.map_err(|e| {
        tracing::warn!(error = %e, "Webhook signature failed");
        ErrorResponse::new(StatusCode::BAD_REQUEST, "Invalid signature", "INVALID_SIGNATURE")
    })?;

    Ok(Json(WebhookAck { received: true }))
}
