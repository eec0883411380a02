use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// Lifecycle state of an upload request. Transitions are owned by
/// `lifecycle`; nothing else writes this field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Pending,
    Completed,
    CompletedResetRequested,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::CompletedResetRequested => "completed-reset-requested",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One order's upload-request record, the only persistent entity.
///
/// `id` doubles as the capability token embedded in the upload link, so it
/// must be unguessable (UUID v4) and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub id: Uuid,
    pub buyer_name: String,
    pub buyer_email: String,
    /// External order identifier (Shopify order id or receipt id). Unique
    /// across records; the webhook dedup key.
    pub order_reference: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl UploadRequest {
    pub fn new(
        buyer_name: String,
        buyer_email: String,
        order_reference: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_name,
            buyer_email,
            order_reference,
            created_at,
            last_updated_at: created_at,
            status: RequestStatus::Pending,
        }
    }

    /// Remote folder name for this order. Deterministic and injective in
    /// `(order_reference, buyer_name)`, so a retried upload addresses the
    /// same folder instead of creating a second one.
    pub fn folder_name(&self) -> String {
        format!("Order-{}-{}", self.order_reference, self.buyer_name)
    }
}

/// One file handed to the upload handler after transport-level validation
/// (multipart parsing, size/count limits) has already happened.
#[derive(Debug, Clone)]
pub struct InboundFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessOrderRequest {
    pub name: String,
    pub email: String,
    pub receipt_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ProcessOrderResponse {
    pub success: bool,
    pub upload_link: String,
}

/// Per-file outcome of a best-effort upload batch. A failed file carries
/// `error` and no `file_id`; the rest of the batch is unaffected.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub file_name: String,
    pub file_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartRequest {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
