use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Auth + rate limiting for the operator-facing intake route. The buyer
/// routes stay public: their capability is the unguessable request id.
#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
    limiter: Arc<TokenBuckets>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub seller_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    seller_id: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            records: Arc::new(load_keys_from_env()),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            seller_id: record.seller_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Courier-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response(
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.seller_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context.clone());
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let payload = ApiError {
                error: "rate_limited".to_string(),
                detail: Some("Too many requests".to_string()),
            };
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Courier-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// `COURIER_API_KEYS` is `seller:key[,seller:key...]`.
fn load_keys_from_env() -> HashMap<String, KeyRecord> {
    let raw = env::var("COURIER_API_KEYS").unwrap_or_else(|_| "seller:dev-key".to_string());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let seller = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (seller, key) {
            (Some(seller), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    KeyRecord {
                        seller_id: seller.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "courier.api",
                "ignored malformed COURIER_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "courier.api",
            "COURIER_API_KEYS produced no keys; falling back to dev credentials"
        );
        entries.insert(
            "dev-key".to_string(),
            KeyRecord {
                seller_id: "seller".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "courier.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_numeric(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_numeric(headers, "X-RateLimit-Remaining", remaining);
        insert_numeric(headers, "X-RateLimit-Reset", reset);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(0.0) as u64;
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_numeric(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_numeric(headers, "X-RateLimit-Remaining", 0);
        insert_numeric(headers, "X-RateLimit-Reset", reset);
    }
}

fn insert_numeric(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}
