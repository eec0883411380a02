mod drive;
mod forms;
mod http;
mod lifecycle;
mod metrics;
mod models;
mod notifier;
mod scheduler;
mod security;
mod store;
mod webhook;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use drive::GoogleDriveClient;
use lifecycle::{FlowConfig, FlowError, FlowErrorKind, Lifecycle};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, InboundFile, ProcessOrderRequest, ProcessOrderResponse, RestartRequest,
    UploadResponse,
};
use notifier::{LogNotifier, Notifier, SmtpNotifier};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, RedisStore, RequestStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use webhook::{IngestOutcome, OrderWebhook, RejectReason};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "courier.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let config = FlowConfig::from_env();

    let store: Arc<dyn RequestStore> = match std::env::var("REDIS_URL").ok() {
        Some(url) => match redis::Client::open(url) {
            Ok(client) => {
                info!(target = "courier.api", "using redis-backed request store");
                Arc::new(RedisStore::new(client))
            }
            Err(err) => {
                warn!(
                    target = "courier.api",
                    error = %err,
                    "REDIS_URL invalid; falling back to in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let notifier: Arc<dyn Notifier> = match SmtpNotifier::from_env() {
        Some(smtp) => Arc::new(smtp),
        None => {
            warn!(
                target = "courier.api",
                "SMTP not configured; emails will be logged instead of sent"
            );
            Arc::new(LogNotifier)
        }
    };

    let lifecycle = Lifecycle::new(
        store,
        Arc::new(GoogleDriveClient::from_env()),
        notifier.clone(),
        config,
    );

    let webhook_secret = std::env::var("SHOPIFY_WEBHOOK_SECRET").unwrap_or_default();
    if webhook_secret.is_empty() {
        warn!(
            target = "courier.api",
            "SHOPIFY_WEBHOOK_SECRET not set; webhook deliveries will be rejected"
        );
    }
    let webhook = OrderWebhook::new(webhook_secret, lifecycle.clone(), notifier);

    let _sweeper = scheduler::spawn(lifecycle.clone());

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        lifecycle,
        webhook,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/process-order", post(process_order))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/shopify-webhook", post(shopify_webhook))
        .route("/upload-form/{id}", get(upload_form))
        .route("/upload", post(upload))
        .route("/request-restart", post(request_restart))
        .route("/reset-upload/{id}", get(reset_upload))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "courier.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    lifecycle: Lifecycle,
    webhook: OrderWebhook,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "courier-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Flow(FlowError::unauthorized(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Courier API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Operator-facing order intake, mirroring what the webhook does for
/// automated orders.
///
/// - Method: `POST`
/// - Path: `/process-order`
/// - Auth: `Authorization: Bearer <key>` or `X-Courier-Key: <key>`
async fn process_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ProcessOrderRequest>,
) -> Result<Json<ProcessOrderResponse>, AppError> {
    crate::metrics::inc_requests("/process-order");
    info!(
        target = "courier.api",
        seller_id = %context.seller_id,
        api_key = %context.api_key_id,
        receipt_id = %payload.receipt_id,
        "order intake invoked",
    );

    let created = state
        .lifecycle
        .create_request(
            &payload.name,
            &payload.email,
            &payload.receipt_id,
            payload.timestamp,
        )
        .await?;
    Ok(Json(ProcessOrderResponse {
        success: true,
        upload_link: created.upload_link,
    }))
}

/// Shopify order webhook. The HMAC is checked against the raw body before
/// anything is parsed, so this handler takes `Bytes`, not `Json`.
///
/// - Method: `POST`
/// - Path: `/shopify-webhook`
/// - Auth: `X-Shopify-Hmac-Sha256` signature
async fn shopify_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/shopify-webhook");
    let signature = headers
        .get("X-Shopify-Hmac-Sha256")
        .and_then(|value| value.to_str().ok());

    let outcome = state.webhook.ingest_order_event(&body, signature).await?;
    let response = match outcome {
        IngestOutcome::Accepted { upload_link } => (
            StatusCode::OK,
            Json(json!({ "success": true, "upload_link": upload_link })),
        )
            .into_response(),
        IngestOutcome::Duplicate => (
            StatusCode::OK,
            Json(json!({ "success": true, "duplicate": true })),
        )
            .into_response(),
        IngestOutcome::Rejected(reason) => {
            let status = match reason {
                RejectReason::MissingSignature | RejectReason::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                _ => StatusCode::BAD_REQUEST,
            };
            let payload = ApiError {
                error: reason.as_str().to_string(),
                detail: None,
            };
            (status, Json(payload)).into_response()
        }
    };
    Ok(response)
}

/// Buyer-facing upload page. Renders per lifecycle state; a bad or unknown
/// id gets the generic invalid-link page, never a stack of detail.
async fn upload_form(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    crate::metrics::inc_requests("/upload-form");
    let Ok(id) = Uuid::parse_str(&id) else {
        return (StatusCode::NOT_FOUND, Html(forms::invalid_link_page())).into_response();
    };
    match state.lifecycle.get_request(id).await {
        Ok(Some(record)) => {
            let completed_at = state.lifecycle.config.local_timestamp(record.last_updated_at);
            Html(forms::page_for(&record, &completed_at, max_upload_files())).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Html(forms::invalid_link_page())).into_response(),
        Err(err) => {
            error!(target = "courier.api", error = %err, "upload form lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(forms::error_page()),
            )
                .into_response()
        }
    }
}

/// Multipart upload submission from the buyer form.
///
/// - Method: `POST`
/// - Path: `/upload`
/// - Fields: `id` (text) plus up to `MAX_UPLOAD_FILES` file parts
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    crate::metrics::inc_requests("/upload");
    let max_files = max_upload_files();
    let mut id: Option<Uuid> = None;
    let mut files: Vec<InboundFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| FlowError::validation("upload", format!("malformed multipart body: {err}")))?
    {
        let field_name = field.name().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        if field_name.as_deref() == Some("id") && file_name.is_none() {
            let text = field.text().await.map_err(|err| {
                FlowError::validation("upload", format!("unreadable id field: {err}"))
            })?;
            id = Some(
                Uuid::parse_str(text.trim())
                    .map_err(|_| FlowError::not_found("upload", "no matching upload request"))?,
            );
            continue;
        }

        let Some(file_name) = file_name else {
            continue;
        };
        if files.len() >= max_files {
            return Err(AppError::Flow(FlowError::validation(
                "upload",
                format!("too many files; at most {max_files} per upload"),
            )));
        }
        let bytes = field.bytes().await.map_err(|err| {
            FlowError::validation("upload", format!("unreadable file part: {err}"))
        })?;
        files.push(InboundFile {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    let id = id.ok_or_else(|| FlowError::validation("upload", "missing id field"))?;
    let outcomes = state.lifecycle.submit_files(id, files).await?;
    let success = outcomes.iter().all(|file| file.error.is_none());
    Ok(Json(UploadResponse {
        success,
        files: outcomes,
    }))
}

/// Buyer asks to redo a completed upload.
///
/// - Method: `POST`
/// - Path: `/request-restart`
async fn request_restart(
    State(state): State<AppState>,
    Json(payload): Json<RestartRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/request-restart");
    state.lifecycle.request_reset(payload.id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Seller confirms a pending reset from the emailed link. Responses are
/// HTML since this lands in a browser tab.
async fn reset_upload(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    crate::metrics::inc_requests("/reset-upload");
    let Ok(id) = Uuid::parse_str(&id) else {
        return (StatusCode::NOT_FOUND, Html(forms::invalid_link_page())).into_response();
    };
    match state.lifecycle.confirm_reset(id).await {
        Ok(()) => Html(
            "<!doctype html><html><body><main><h1>Upload reset</h1>\
             <p>The buyer's files were removed and their upload link is active again.</p>\
             </main></body></html>"
                .to_string(),
        )
        .into_response(),
        Err(err) if err.kind() == FlowErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, Html(forms::invalid_link_page())).into_response()
        }
        Err(err) if err.kind() == FlowErrorKind::InvalidState => (
            StatusCode::CONFLICT,
            Html(
                "<!doctype html><html><body><main><h1>Nothing to reset</h1>\
                 <p>No reset is pending for this order. It may already have been \
                 confirmed or expired.</p></main></body></html>"
                    .to_string(),
            ),
        )
            .into_response(),
        Err(err) => {
            error!(target = "courier.api", error = %err, "reset confirmation failed");
            (status_for(err.kind()), Html(forms::error_page())).into_response()
        }
    }
}

#[derive(Debug)]
enum AppError {
    Flow(FlowError),
}

impl From<FlowError> for AppError {
    fn from(value: FlowError) -> Self {
        Self::Flow(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Flow(err) => {
                let payload = ApiError {
                    error: err.op().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status_for(err.kind()), Json(payload)).into_response()
            }
        }
    }
}

fn status_for(kind: FlowErrorKind) -> StatusCode {
    match kind {
        FlowErrorKind::Validation => StatusCode::BAD_REQUEST,
        FlowErrorKind::NotFound => StatusCode::NOT_FOUND,
        FlowErrorKind::InvalidState => StatusCode::CONFLICT,
        FlowErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        FlowErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        FlowErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(25 * 1024 * 1024)
}

fn max_upload_files() -> usize {
    std::env::var("MAX_UPLOAD_FILES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10)
}
