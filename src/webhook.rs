use crate::lifecycle::{FlowError, FlowErrorKind, Lifecycle};
use crate::notifier::{Notifier, upload_link_email};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Outcome of one webhook delivery. `Rejected` carries the reason so the
/// endpoint can pick the right status code (401 for signature problems,
/// 400 for payload problems).
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted { upload_link: String },
    Duplicate,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingSignature,
    InvalidSignature,
    MalformedPayload,
    MissingOrderId,
    MissingEmail,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingSignature => "missing signature",
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::MalformedPayload => "malformed payload",
            RejectReason::MissingOrderId => "missing order id",
            RejectReason::MissingEmail => "missing email",
        }
    }
}

/// The slice of a Shopify order payload the lifecycle needs. Everything
/// else in the delivery is ignored.
#[derive(Debug, Deserialize)]
struct OrderEvent {
    id: Option<i64>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    contact_email: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    customer: Option<OrderCustomer>,
}

#[derive(Debug, Deserialize)]
struct OrderCustomer {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Signature-verified, idempotent order ingestion from the commerce
/// platform webhook.
#[derive(Clone)]
pub struct OrderWebhook {
    secret: String,
    lifecycle: Lifecycle,
    notifier: Arc<dyn Notifier>,
}

impl OrderWebhook {
    pub fn new(secret: String, lifecycle: Lifecycle, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            secret,
            lifecycle,
            notifier,
        }
    }

    /// Verify the HMAC before anything else touches the body. The raw,
    /// unparsed bytes are the MAC input; `Mac::verify_slice` compares in
    /// constant time.
    fn verify_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let Ok(provided) = BASE64.decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&provided).is_ok()
    }

    pub async fn ingest_order_event(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, FlowError> {
        let Some(signature) = signature else {
            warn!(target = "courier.webhook", "delivery without signature header");
            return Ok(IngestOutcome::Rejected(RejectReason::MissingSignature));
        };
        if self.secret.is_empty() || !self.verify_signature(raw_body, signature) {
            warn!(target = "courier.webhook", "signature verification failed");
            return Ok(IngestOutcome::Rejected(RejectReason::InvalidSignature));
        }

        // Only now is the body trusted enough to parse.
        let Ok(event) = serde_json::from_slice::<OrderEvent>(raw_body) else {
            return Ok(IngestOutcome::Rejected(RejectReason::MalformedPayload));
        };
        let Some(order_id) = event.id else {
            return Ok(IngestOutcome::Rejected(RejectReason::MissingOrderId));
        };
        let order_reference = order_id.to_string();

        if self
            .lifecycle
            .find_by_order_reference(&order_reference)
            .await?
            .is_some()
        {
            info!(
                target = "courier.webhook",
                order_reference = %order_reference,
                "duplicate delivery suppressed"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let Some(buyer_email) = buyer_email(&event) else {
            warn!(
                target = "courier.webhook",
                order_reference = %order_reference,
                "order has no resolvable email"
            );
            return Ok(IngestOutcome::Rejected(RejectReason::MissingEmail));
        };
        let buyer_name = buyer_name(&event);

        let created = match self
            .lifecycle
            .create_request(&buyer_name, &buyer_email, &order_reference, event.created_at)
            .await
        {
            Ok(created) => created,
            // A concurrent delivery of the same order beat us to the store.
            Err(err) if err.kind() == FlowErrorKind::Validation
                && err.detail().starts_with("duplicate order reference") =>
            {
                return Ok(IngestOutcome::Duplicate);
            }
            Err(err) => return Err(err),
        };

        let (subject, body) = upload_link_email(&created.record.buyer_name, &created.upload_link);
        if let Err(err) = self.notifier.send(&buyer_email, &subject, &body).await {
            // Best-effort: the record stays Pending and the link can be
            // re-sent operationally.
            warn!(
                target = "courier.webhook",
                order_reference = %order_reference,
                error = %err,
                "upload link email failed"
            );
        }

        Ok(IngestOutcome::Accepted {
            upload_link: created.upload_link,
        })
    }
}

fn buyer_email(event: &OrderEvent) -> Option<String> {
    event
        .email
        .clone()
        .or_else(|| event.contact_email.clone())
        .or_else(|| event.customer.as_ref().and_then(|c| c.email.clone()))
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
}

fn buyer_name(event: &OrderEvent) -> String {
    let joined = event
        .customer
        .as_ref()
        .map(|customer| {
            [customer.first_name.as_deref(), customer.last_name.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    if joined.is_empty() {
        "Customer".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveError, RemoteFile, RemoteFileStore};
    use crate::lifecycle::FlowConfig;
    use crate::models::RequestStatus;
    use crate::notifier::NotifyError;
    use crate::store::{MemoryStore, RequestStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NullDrive;

    #[async_trait]
    impl RemoteFileStore for NullDrive {
        async fn find_folder(&self, _name: &str) -> Result<Option<String>, DriveError> {
            Ok(None)
        }
        async fn find_or_create_folder(&self, _name: &str) -> Result<String, DriveError> {
            Err(DriveError::MissingCredentials)
        }
        async fn share_folder(&self, _folder_id: &str, _email: &str) -> Result<(), DriveError> {
            Ok(())
        }
        async fn upload_file(
            &self,
            _folder_id: &str,
            _file_name: &str,
            _content_type: &str,
            _bytes: Vec<u8>,
        ) -> Result<String, DriveError> {
            Err(DriveError::MissingCredentials)
        }
        async fn list_files(&self, _folder_id: &str) -> Result<Vec<RemoteFile>, DriveError> {
            Ok(Vec::new())
        }
        async fn delete_file(&self, _file_id: &str) -> Result<(), DriveError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    const SECRET: &str = "shpss_test_secret";

    fn build() -> (OrderWebhook, MemoryStore, Arc<RecordingNotifier>) {
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let lifecycle = Lifecycle::new(
            Arc::new(store.clone()),
            Arc::new(NullDrive),
            notifier.clone(),
            FlowConfig {
                base_url: "http://localhost:3000".to_string(),
                seller_email: "seller@x.com".to_string(),
                grace_days: 5,
                seller_timezone: chrono_tz::UTC,
            },
        );
        let webhook = OrderWebhook::new(SECRET.to_string(), lifecycle, notifier.clone());
        (webhook, store, notifier)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn order_body() -> Vec<u8> {
        serde_json::json!({
            "id": 820982911946154508i64,
            "email": "jane@x.com",
            "created_at": "2026-08-20T09:30:00-04:00",
            "customer": { "first_name": "Jane", "last_name": "Doe" },
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn verified_delivery_creates_pending_record_and_emails_buyer() {
        let (webhook, store, notifier) = build();
        let body = order_body();
        let signature = sign(&body);

        let outcome = webhook
            .ingest_order_event(&body, Some(&signature))
            .await
            .unwrap();
        let IngestOutcome::Accepted { upload_link } = outcome else {
            panic!("expected accepted, got {outcome:?}");
        };

        let record = store
            .get_by_order_reference("820982911946154508")
            .await
            .unwrap()
            .expect("record created");
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.buyer_name, "Jane Doe");
        assert!(upload_link.contains(&record.id.to_string()));
        assert_eq!(notifier.sent.lock().unwrap().as_slice(), ["jane@x.com"]);
    }

    #[tokio::test]
    async fn redelivery_of_same_order_is_suppressed() {
        let (webhook, store, notifier) = build();
        let body = order_body();
        let signature = sign(&body);

        webhook
            .ingest_order_event(&body, Some(&signature))
            .await
            .unwrap();
        let outcome = webhook
            .ingest_order_event(&body, Some(&signature))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Duplicate));

        // Exactly one record, exactly one email.
        assert!(
            store
                .get_by_order_reference("820982911946154508")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_before_any_persistence() {
        let (webhook, store, _) = build();
        let body = order_body();
        let signature = sign(&body);
        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");

        let outcome = webhook
            .ingest_order_event(&tampered, Some(&signature))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::InvalidSignature)
        ));
        assert!(
            store
                .get_by_order_reference("820982911946154508")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let (webhook, _, _) = build();
        let outcome = webhook.ingest_order_event(&order_body(), None).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::MissingSignature)
        ));
    }

    #[tokio::test]
    async fn garbage_signature_encoding_is_rejected() {
        let (webhook, _, _) = build();
        let outcome = webhook
            .ingest_order_event(&order_body(), Some("not-base64!!"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn order_without_email_is_rejected_with_reason() {
        let (webhook, store, notifier) = build();
        let body = serde_json::json!({
            "id": 1001,
            "customer": { "first_name": "Jane" },
        })
        .to_string()
        .into_bytes();
        let signature = sign(&body);

        let outcome = webhook
            .ingest_order_event(&body, Some(&signature))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::MissingEmail)
        ));
        assert!(store.get_by_order_reference("1001").await.unwrap().is_none());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn verified_garbage_json_is_rejected_as_malformed() {
        let (webhook, _, _) = build();
        let body = b"not json at all".to_vec();
        let signature = sign(&body);
        let outcome = webhook
            .ingest_order_event(&body, Some(&signature))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::MalformedPayload)
        ));
    }
}
