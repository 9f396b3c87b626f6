use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use blackraven_contract::{CreateTransferRequest, DeactivateRequest, DeactivationResponse};
use chrono::Utc;
use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::identity::{bearer_token, secrets_match, CurrentUser, IdentityProvider};
use crate::service::TransferService;

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub service: TransferService,
    pub identity: Arc<dyn IdentityProvider>,
    pub cron_secret: Option<String>,
    /// Set when the listener is reachable from outside loopback; the sweep
    /// trigger then refuses to run without a configured secret.
    pub require_cron_secret: bool,
}

impl AppState {
    pub fn new(
        service: TransferService,
        identity: Arc<dyn IdentityProvider>,
        cron_secret: Option<String>,
        require_cron_secret: bool,
    ) -> Self {
        Self {
            service,
            identity,
            cron_secret: cron_secret.filter(|secret| !secret.is_empty()),
            require_cron_secret,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = encoded_body_limit(state.service.settings().max_payload_bytes);
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/transfers", get(list_transfers).post(create_transfer))
        .route(
            "/v1/transfers/{transfer_id}",
            get(get_transfer).delete(delete_transfer),
        )
        .route("/v1/transfers/{transfer_id}/send-now", post(send_now))
        .route("/v1/transfers/{transfer_id}/deactivate", post(deactivate))
        .route("/v1/cron/sweep", get(run_sweep).post(run_sweep))
        .route("/v1/events/stream", get(stream_events))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Room for the base64 expansion of the largest accepted payload plus the
/// rest of the JSON document.
fn encoded_body_limit(max_payload_bytes: usize) -> usize {
    max_payload_bytes.div_ceil(3) * 4 + 64 * 1024
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.service.storage().ping().await.is_ok();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let view = state
        .service
        .create(&user, payload)
        .await
        .map_err(service_error)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let items = state.service.list(&user).await.map_err(service_error)?;
    Ok((StatusCode::OK, Json(json!({ "items": items }))))
}

async fn get_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transfer_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let view = state
        .service
        .get(&user, &transfer_id)
        .await
        .map_err(service_error)?;
    Ok((StatusCode::OK, Json(view)))
}

async fn send_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transfer_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let summary = state
        .service
        .send_now(&user, &transfer_id, Utc::now())
        .await
        .map_err(service_error)?;
    Ok((StatusCode::OK, Json(summary)))
}

async fn deactivate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transfer_id): Path<String>,
    Json(payload): Json<DeactivateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let outcome = state
        .service
        .deactivate(&user, &transfer_id, &payload.passphrase, Utc::now())
        .await
        .map_err(service_error)?;

    let status = match &outcome {
        DeactivationResponse::IncorrectPassphrase { .. } => StatusCode::FORBIDDEN,
        DeactivationResponse::Deactivated { .. }
        | DeactivationResponse::BruteForceDetected { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn delete_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transfer_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;
    state
        .service
        .delete(&user, &transfer_id)
        .await
        .map_err(service_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize_cron(&state, &headers)?;
    let report = state
        .service
        .sweep_due(Utc::now())
        .await
        .map_err(service_error)?;
    Ok((StatusCode::OK, Json(report)))
}

async fn stream_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<
    Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>>,
    ApiError,
> {
    let user = authenticate(&state, &headers).await?;
    let receiver = state.service.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |item| {
        let owner = user.id.clone();
        async move {
            match item {
                Ok(envelope) if envelope.owner_id == owner => {
                    let data =
                        serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
                    Some(Ok(SseEvent::default().event(envelope.event).data(data)))
                }
                _ => None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CurrentUser, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| service_error(ServiceError::Unauthenticated))?;
    match state.identity.current_user(token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(service_error(ServiceError::Unauthenticated)),
        Err(e) => Err(service_error(ServiceError::Operational(e))),
    }
}

fn authorize_cron(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = state.cron_secret.as_deref() else {
        if state.require_cron_secret {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error":"cron_secret_required_but_not_configured"})),
            ));
        }
        return Ok(());
    };

    let provided = bearer_token(headers).unwrap_or_default();
    if secrets_match(provided, secret) {
        Ok(())
    } else {
        warn!("rejected sweep trigger with invalid credentials");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn service_error(error: ServiceError) -> ApiError {
    match error {
        ServiceError::Validation(fields) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "validation_failed", "fields": fields })),
        ),
        ServiceError::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ),
        ServiceError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error":"transfer_not_found"})),
        ),
        ServiceError::Conflict(reason) => {
            info!(reason = %reason, "request rejected by transfer state");
            (
                StatusCode::CONFLICT,
                Json(json!({ "error": "conflict", "detail": reason })),
            )
        }
        ServiceError::Operational(error) => {
            error!(error = %format!("{error:#}"), "request failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "operational_error", "detail": "temporarily unable to complete the request" })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{StaticTokenIdentityProvider, StaticUser};
    use crate::service::ServiceSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use blackraven_delivery::{DeliveryRegistry, InMemoryDelivery};
    use blackraven_storage::{BlackravenStorage, InMemoryBlobStore};
    use blackraven_transfer::{HashingParams, PassphraseHasher};
    use tower::ServiceExt;

    const OWNER_TOKEN: &str = "owner-token";

    async fn test_router(cron_secret: Option<&str>) -> (Router, Arc<InMemoryDelivery>) {
        let storage = BlackravenStorage::in_memory().await.expect("storage");
        let delivery = Arc::new(InMemoryDelivery::new());
        let mut registry = DeliveryRegistry::new();
        registry.register("email", delivery.clone());
        let hasher = PassphraseHasher::new(HashingParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        })
        .expect("hasher");
        let service = TransferService::new(
            storage,
            Arc::new(InMemoryBlobStore::new()),
            registry,
            hasher,
            ServiceSettings::default(),
        );
        let identity = StaticTokenIdentityProvider::new(vec![StaticUser {
            id: "owner-1".to_string(),
            email: "owner@example.com".to_string(),
            token: OWNER_TOKEN.to_string(),
        }]);
        let state = AppState::new(
            service,
            Arc::new(identity),
            cron_secret.map(str::to_string),
            true,
        );
        (build_router(state), delivery)
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {OWNER_TOKEN}"));
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn create_body(end_date: &str) -> Value {
        json!({
            "filename": "will.pdf",
            "media_type": "application/pdf",
            "payload_base64": STANDARD.encode(b"last words"),
            "start_date": "2020-01-01T00:00:00Z",
            "end_date": end_date,
            "recipients": { "email": "heir@example.com" },
            "deactivation_passphrase": "Str0ng!pass"
        })
    }

    #[tokio::test]
    async fn liveness_needs_no_credentials() {
        let (router, _) = test_router(None).await;
        let response = router
            .oneshot(Request::get("/health/live").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn transfer_routes_require_a_known_token() {
        let (router, _) = test_router(None).await;
        let response = router
            .clone()
            .oneshot(Request::get("/v1/transfers").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::get("/v1/transfers")
                    .header("authorization", "Bearer someone-else")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_then_fetch_transfer() {
        let (router, _) = test_router(None).await;
        let response = router
            .clone()
            .oneshot(authed("POST", "/v1/transfers", Some(create_body("2099-01-01T00:00:00Z"))))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = read_json(response).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(created["size_display"], "10 Bytes");
        assert!(created.get("passphrase_hash").is_none());

        let id = created["transfer_id"].as_str().expect("id").to_string();
        let response = router
            .clone()
            .oneshot(authed("GET", &format!("/v1/transfers/{id}"), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(authed("GET", "/v1/transfers", None))
            .await
            .expect("response");
        let listed = read_json(response).await;
        assert_eq!(listed["items"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn invalid_upload_reports_fields() {
        let (router, _) = test_router(None).await;
        let mut body = create_body("2099-01-01T00:00:00Z");
        body["recipients"] = json!({ "email": "not-an-email" });
        let response = router
            .oneshot(authed("POST", "/v1/transfers", Some(body)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = read_json(response).await;
        assert_eq!(payload["error"], "validation_failed");
        assert_eq!(payload["fields"][0]["field"], "recipients.email");
    }

    #[tokio::test]
    async fn wrong_passphrase_is_forbidden_with_remaining_count() {
        let (router, _) = test_router(None).await;
        let response = router
            .clone()
            .oneshot(authed("POST", "/v1/transfers", Some(create_body("2099-01-01T00:00:00Z"))))
            .await
            .expect("response");
        let id = read_json(response).await["transfer_id"]
            .as_str()
            .expect("id")
            .to_string();

        let response = router
            .oneshot(authed(
                "POST",
                &format!("/v1/transfers/{id}/deactivate"),
                Some(json!({ "passphrase": "wrong" })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let payload = read_json(response).await;
        assert_eq!(payload["outcome"], "incorrect_passphrase");
        assert_eq!(payload["attempts_remaining"], 4);
    }

    #[tokio::test]
    async fn unknown_transfer_is_not_found() {
        let (router, _) = test_router(None).await;
        let response = router
            .oneshot(authed("DELETE", "/v1/transfers/missing", None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sweep_requires_configured_secret() {
        let (router, _) = test_router(None).await;
        let response = router
            .oneshot(Request::post("/v1/cron/sweep").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn sweep_with_secret_delivers_due_transfers() {
        let (router, delivery) = test_router(Some("cron-secret")).await;
        let response = router
            .clone()
            .oneshot(authed("POST", "/v1/transfers", Some(create_body("2020-06-01T00:00:00Z"))))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(
                Request::get("/v1/cron/sweep")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(delivery.delivered().is_empty());

        let response = router
            .oneshot(
                Request::get("/v1/cron/sweep")
                    .header("authorization", "Bearer cron-secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let report = read_json(response).await;
        assert_eq!(report["sent"], 1);
        assert_eq!(delivery.delivered_to("heir@example.com"), 1);
    }

    #[test]
    fn body_limit_covers_base64_expansion() {
        assert_eq!(encoded_body_limit(3), 4 + 64 * 1024);
        assert!(encoded_body_limit(25 * 1024 * 1024) > 25 * 1024 * 1024 * 4 / 3);
    }
}
