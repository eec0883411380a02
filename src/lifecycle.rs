use crate::drive::RemoteFileStore;
use crate::models::{InboundFile, RequestStatus, UploadRequest, UploadedFile};
use crate::notifier::{Notifier, reset_confirmation_email};
use crate::store::{RequestStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::{env, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("operation `{op}` failed: {message}")]
pub struct FlowError {
    op: &'static str,
    message: String,
    kind: FlowErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    Validation,
    NotFound,
    InvalidState,
    Unauthorized,
    Upstream,
    Storage,
}

impl FlowError {
    pub fn validation(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::Validation)
    }

    pub fn not_found(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::NotFound)
    }

    pub fn invalid_state(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::InvalidState)
    }

    pub fn unauthorized(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::Unauthorized)
    }

    pub fn upstream(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::Upstream)
    }

    pub fn storage(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, FlowErrorKind::Storage)
    }

    fn new(op: &'static str, message: impl Into<String>, kind: FlowErrorKind) -> Self {
        Self {
            op,
            message: message.into(),
            kind,
        }
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn kind(&self) -> FlowErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

fn store_error(op: &'static str, err: StoreError) -> FlowError {
    match err {
        StoreError::DuplicateOrder(reference) => {
            FlowError::validation(op, format!("duplicate order reference: {reference}"))
        }
        StoreError::Backend(message) => FlowError::storage(op, message),
    }
}

#[derive(Clone)]
pub struct FlowConfig {
    pub base_url: String,
    pub seller_email: String,
    pub grace_days: i64,
    pub seller_timezone: Tz,
}

impl FlowConfig {
    pub fn from_env() -> Self {
        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let seller_email = env::var("SELLER_EMAIL").unwrap_or_default();
        let grace_days = env::var("RESET_GRACE_DAYS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value >= 1)
            .unwrap_or(5);
        let seller_timezone = env::var("SELLER_TIMEZONE")
            .ok()
            .and_then(|value| value.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC);
        Self {
            base_url,
            seller_email,
            grace_days,
            seller_timezone,
        }
    }

    pub fn upload_link(&self, id: Uuid) -> String {
        format!("{}/upload-form/{id}", self.base_url)
    }

    pub fn reset_link(&self, id: Uuid) -> String {
        format!("{}/reset-upload/{id}", self.base_url)
    }

    /// Stable display form of a timestamp in the seller's local time zone.
    pub fn local_timestamp(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.seller_timezone)
            .format("%Y-%m-%d %H:%M %Z")
            .to_string()
    }
}

/// The order-to-upload lifecycle: intake, upload handling, reset workflow
/// and the stale-reset sweep. Collaborators are injected once at startup;
/// every status transition goes through the store's compare-and-swap.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn RequestStore>,
    drive: Arc<dyn RemoteFileStore>,
    notifier: Arc<dyn Notifier>,
    pub config: Arc<FlowConfig>,
}

#[derive(Debug)]
pub struct CreatedRequest {
    pub record: UploadRequest,
    pub upload_link: String,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn RequestStore>,
        drive: Arc<dyn RemoteFileStore>,
        notifier: Arc<dyn Notifier>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            drive,
            notifier,
            config: Arc::new(config),
        }
    }

    /// Order Intake: validate, persist a fresh `Pending` record and hand
    /// back the capability link. No remote-file-store or notifier calls
    /// happen here; the webhook path layers its own email on top.
    pub async fn create_request(
        &self,
        buyer_name: &str,
        buyer_email: &str,
        order_reference: &str,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Result<CreatedRequest, FlowError> {
        let buyer_name = buyer_name.trim();
        let buyer_email = buyer_email.trim();
        let order_reference = order_reference.trim();
        if buyer_name.is_empty() || buyer_email.is_empty() || order_reference.is_empty() {
            return Err(FlowError::validation(
                "intake",
                "missing required fields: name, email, or receipt_id",
            ));
        }

        let record = UploadRequest::new(
            buyer_name.to_string(),
            buyer_email.to_string(),
            order_reference.to_string(),
            occurred_at.unwrap_or_else(Utc::now),
        );
        self.store
            .create(&record)
            .await
            .map_err(|err| store_error("intake", err))?;

        let upload_link = self.config.upload_link(record.id);
        info!(
            target = "courier.flow",
            request_id = %record.id,
            order_reference = %record.order_reference,
            "upload request created"
        );
        Ok(CreatedRequest {
            record,
            upload_link,
        })
    }

    pub async fn get_request(&self, id: Uuid) -> Result<Option<UploadRequest>, FlowError> {
        self.store
            .get_by_id(id)
            .await
            .map_err(|err| store_error("lookup", err))
    }

    pub async fn find_by_order_reference(
        &self,
        reference: &str,
    ) -> Result<Option<UploadRequest>, FlowError> {
        self.store
            .get_by_order_reference(reference)
            .await
            .map_err(|err| store_error("lookup", err))
    }

    /// Upload Handler: deliver a batch of files to the order's folder and
    /// complete the record.
    ///
    /// The per-file loop is best-effort by design: every file is attempted
    /// and the result is a fold of per-item outcomes, never an early abort.
    pub async fn submit_files(
        &self,
        id: Uuid,
        files: Vec<InboundFile>,
    ) -> Result<Vec<UploadedFile>, FlowError> {
        let record = self
            .store
            .get_by_id(id)
            .await
            .map_err(|err| store_error("upload", err))?
            .ok_or_else(|| FlowError::not_found("upload", "no matching upload request"))?;

        if record.status != RequestStatus::Pending {
            return Err(FlowError::invalid_state(
                "upload",
                format!("request is {}, not pending", record.status),
            ));
        }
        if files.is_empty() {
            return Err(FlowError::validation("upload", "no files provided"));
        }

        let folder_name = record.folder_name();
        let folder_id = self
            .drive
            .find_or_create_folder(&folder_name)
            .await
            .map_err(|err| FlowError::upstream("upload", err.to_string()))?;

        if self.config.seller_email.is_empty() {
            warn!(
                target = "courier.flow",
                request_id = %id,
                "SELLER_EMAIL not configured; folder left unshared"
            );
        } else {
            self.drive
                .share_folder(&folder_id, &self.config.seller_email)
                .await
                .map_err(|err| FlowError::upstream("upload", err.to_string()))?;
        }

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            match self
                .drive
                .upload_file(&folder_id, &file.file_name, &file.content_type, file.bytes)
                .await
            {
                Ok(file_id) => outcomes.push(UploadedFile {
                    file_name: file.file_name,
                    file_id: Some(file_id),
                    error: None,
                }),
                Err(err) => {
                    warn!(
                        target = "courier.flow",
                        request_id = %id,
                        file_name = %file.file_name,
                        error = %err,
                        "file upload failed; continuing with batch"
                    );
                    outcomes.push(UploadedFile {
                        file_name: file.file_name,
                        file_id: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let completed_at = Utc::now();
        let swapped = self
            .store
            .update_status(
                id,
                RequestStatus::Pending,
                RequestStatus::Completed,
                completed_at,
            )
            .await
            .map_err(|err| store_error("upload", err))?;
        if !swapped {
            // A concurrent submission won the swap after our files went out;
            // the remote folder may hold both batches.
            return Err(FlowError::invalid_state(
                "upload",
                "request was completed concurrently",
            ));
        }

        crate::metrics::files_uploaded(outcomes.iter().filter(|f| f.error.is_none()).count());
        info!(
            target = "courier.flow",
            request_id = %id,
            files = outcomes.len(),
            completed_at = %self.config.local_timestamp(completed_at),
            "upload request completed"
        );
        Ok(outcomes)
    }

    /// Reset Workflow, step one: the buyer asks to redo the upload. The
    /// seller gets the confirmation link; a reset already in flight is a
    /// no-op and does not re-send the notice.
    pub async fn request_reset(&self, id: Uuid) -> Result<(), FlowError> {
        let record = self
            .store
            .get_by_id(id)
            .await
            .map_err(|err| store_error("reset_request", err))?
            .ok_or_else(|| FlowError::not_found("reset_request", "no matching upload request"))?;

        match record.status {
            RequestStatus::CompletedResetRequested => return Ok(()),
            RequestStatus::Completed => {}
            RequestStatus::Pending => {
                return Err(FlowError::invalid_state(
                    "reset_request",
                    "request is still pending; nothing to reset",
                ));
            }
        }

        let swapped = self
            .store
            .update_status(
                id,
                RequestStatus::Completed,
                RequestStatus::CompletedResetRequested,
                Utc::now(),
            )
            .await
            .map_err(|err| store_error("reset_request", err))?;
        if !swapped {
            return Err(FlowError::invalid_state(
                "reset_request",
                "request changed state concurrently",
            ));
        }

        if self.config.seller_email.is_empty() {
            warn!(
                target = "courier.flow",
                request_id = %id,
                "SELLER_EMAIL not configured; reset notice not sent"
            );
            return Ok(());
        }
        let (subject, body) = reset_confirmation_email(
            &record.buyer_name,
            &record.order_reference,
            &self.config.reset_link(id),
        );
        if let Err(err) = self
            .notifier
            .send(&self.config.seller_email, &subject, &body)
            .await
        {
            // Best-effort: the transition already committed.
            warn!(
                target = "courier.flow",
                request_id = %id,
                error = %err,
                "reset notice delivery failed"
            );
        }
        Ok(())
    }

    /// Reset Workflow, step two: purge the remote files and reopen the
    /// request. The folder itself stays and is reused by the next upload.
    pub async fn confirm_reset(&self, id: Uuid) -> Result<(), FlowError> {
        let record = self
            .store
            .get_by_id(id)
            .await
            .map_err(|err| store_error("reset_confirm", err))?
            .ok_or_else(|| FlowError::not_found("reset_confirm", "no matching upload request"))?;

        if record.status != RequestStatus::CompletedResetRequested {
            return Err(FlowError::invalid_state(
                "reset_confirm",
                format!("request is {}, no reset pending", record.status),
            ));
        }

        let folder_name = record.folder_name();
        let folder_id = self
            .drive
            .find_folder(&folder_name)
            .await
            .map_err(|err| FlowError::upstream("reset_confirm", err.to_string()))?
            .ok_or_else(|| FlowError::not_found("reset_confirm", "remote folder missing"))?;

        let files = self
            .drive
            .list_files(&folder_id)
            .await
            .map_err(|err| FlowError::upstream("reset_confirm", err.to_string()))?;
        let mut failed = 0usize;
        for file in &files {
            if let Err(err) = self.drive.delete_file(&file.id).await {
                // An orphaned remote file beats a buyer stuck unable to
                // re-upload; log and keep purging.
                failed += 1;
                warn!(
                    target = "courier.flow",
                    request_id = %id,
                    file_id = %file.id,
                    error = %err,
                    "remote file delete failed"
                );
            }
        }

        let swapped = self
            .store
            .update_status(
                id,
                RequestStatus::CompletedResetRequested,
                RequestStatus::Pending,
                Utc::now(),
            )
            .await
            .map_err(|err| store_error("reset_confirm", err))?;
        if !swapped {
            return Err(FlowError::invalid_state(
                "reset_confirm",
                "request changed state concurrently",
            ));
        }

        info!(
            target = "courier.flow",
            request_id = %id,
            purged = files.len() - failed,
            failed = failed,
            "reset confirmed; request reopened"
        );
        Ok(())
    }

    /// Reversion sweep: every reset request older than the grace window
    /// expires back to `Completed`. Per-record failures are logged and do
    /// not stop the sweep.
    pub async fn revert_stale_resets(&self, now: DateTime<Utc>) -> Result<usize, FlowError> {
        let candidates = self
            .store
            .list_by_status(RequestStatus::CompletedResetRequested)
            .await
            .map_err(|err| store_error("sweep", err))?;
        let cutoff = now - Duration::days(self.config.grace_days);

        let mut reverted = 0usize;
        for record in candidates {
            if record.last_updated_at >= cutoff {
                continue;
            }
            match self
                .store
                .update_status(
                    record.id,
                    RequestStatus::CompletedResetRequested,
                    RequestStatus::Completed,
                    now,
                )
                .await
            {
                Ok(true) => reverted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        target = "courier.flow",
                        request_id = %record.id,
                        error = %err,
                        "sweep revert failed for record; continuing"
                    );
                }
            }
        }
        Ok(reverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveError, RemoteFile};
    use crate::notifier::NotifyError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDriveState {
        folders: HashMap<String, String>,
        files: HashMap<String, Vec<RemoteFile>>,
        next_id: usize,
    }

    #[derive(Default)]
    struct FakeDrive {
        state: Mutex<FakeDriveState>,
        shares: Mutex<Vec<(String, String)>>,
        folders_created: AtomicUsize,
        uploads_attempted: AtomicUsize,
        fail_uploads_named: Option<String>,
    }

    impl FakeDrive {
        fn failing_on(file_name: &str) -> Self {
            Self {
                fail_uploads_named: Some(file_name.to_string()),
                ..Self::default()
            }
        }

        fn files_in(&self, folder_id: &str) -> Vec<RemoteFile> {
            self.state
                .lock()
                .unwrap()
                .files
                .get(folder_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RemoteFileStore for FakeDrive {
        async fn find_folder(&self, name: &str) -> Result<Option<String>, DriveError> {
            Ok(self.state.lock().unwrap().folders.get(name).cloned())
        }

        async fn find_or_create_folder(&self, name: &str) -> Result<String, DriveError> {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.folders.get(name) {
                return Ok(existing.clone());
            }
            state.next_id += 1;
            let id = format!("folder-{}", state.next_id);
            state.folders.insert(name.to_string(), id.clone());
            self.folders_created.fetch_add(1, Ordering::SeqCst);
            Ok(id)
        }

        async fn share_folder(&self, folder_id: &str, email: &str) -> Result<(), DriveError> {
            self.shares
                .lock()
                .unwrap()
                .push((folder_id.to_string(), email.to_string()));
            Ok(())
        }

        async fn upload_file(
            &self,
            folder_id: &str,
            file_name: &str,
            _content_type: &str,
            _bytes: Vec<u8>,
        ) -> Result<String, DriveError> {
            self.uploads_attempted.fetch_add(1, Ordering::SeqCst);
            if self.fail_uploads_named.as_deref() == Some(file_name) {
                return Err(DriveError::Request("simulated upload failure".to_string()));
            }
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("file-{}", state.next_id);
            state
                .files
                .entry(folder_id.to_string())
                .or_default()
                .push(RemoteFile {
                    id: id.clone(),
                    name: file_name.to_string(),
                });
            Ok(id)
        }

        async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, DriveError> {
            Ok(self.files_in(folder_id))
        }

        async fn delete_file(&self, file_id: &str) -> Result<(), DriveError> {
            let mut state = self.state.lock().unwrap();
            for files in state.files.values_mut() {
                files.retain(|file| file.id != file_id);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Send("simulated smtp outage".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    fn test_config() -> FlowConfig {
        FlowConfig {
            base_url: "http://localhost:3000".to_string(),
            seller_email: "seller@x.com".to_string(),
            grace_days: 5,
            seller_timezone: chrono_tz::UTC,
        }
    }

    fn build(drive: Arc<FakeDrive>, notifier: Arc<RecordingNotifier>) -> (Lifecycle, MemoryStore) {
        let store = MemoryStore::new();
        let lifecycle = Lifecycle::new(
            Arc::new(store.clone()),
            drive,
            notifier,
            test_config(),
        );
        (lifecycle, store)
    }

    fn files(names: &[&str]) -> Vec<InboundFile> {
        names
            .iter()
            .map(|name| InboundFile {
                file_name: name.to_string(),
                content_type: "image/jpeg".to_string(),
                bytes: vec![0u8; 16],
            })
            .collect()
    }

    #[tokio::test]
    async fn intake_creates_pending_record_with_link() {
        let (lifecycle, _) = build(Arc::default(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .expect("intake");
        assert_eq!(created.record.status, RequestStatus::Pending);
        assert!(created.upload_link.ends_with(&format!(
            "/upload-form/{}",
            created.record.id
        )));
    }

    #[tokio::test]
    async fn intake_rejects_missing_fields() {
        let (lifecycle, _) = build(Arc::default(), Arc::default());
        let err = lifecycle
            .create_request("", "jane@x.com", "1001", None)
            .await
            .expect_err("empty name must fail");
        assert_eq!(err.kind(), FlowErrorKind::Validation);
        assert_eq!(err.op(), "intake");
    }

    #[tokio::test]
    async fn intake_rejects_duplicate_order_reference() {
        let (lifecycle, _) = build(Arc::default(), Arc::default());
        lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        let err = lifecycle
            .create_request("John Doe", "john@x.com", "1001", None)
            .await
            .expect_err("duplicate reference must fail");
        assert_eq!(err.kind(), FlowErrorKind::Validation);
    }

    #[tokio::test]
    async fn submit_files_uploads_and_completes() {
        let drive = Arc::new(FakeDrive::default());
        let (lifecycle, store) = build(drive.clone(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();

        let outcomes = lifecycle
            .submit_files(created.record.id, files(&["a.jpg", "b.jpg"]))
            .await
            .expect("upload");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|f| f.file_id.is_some() && f.error.is_none()));

        let stored = store.get_by_id(created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);

        let shares = drive.shares.lock().unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].1, "seller@x.com");
    }

    #[tokio::test]
    async fn submit_files_guard_rejects_completed_record() {
        let drive = Arc::new(FakeDrive::default());
        let (lifecycle, _) = build(drive.clone(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        lifecycle
            .submit_files(created.record.id, files(&["a.jpg"]))
            .await
            .unwrap();
        let attempted_before = drive.uploads_attempted.load(Ordering::SeqCst);

        let err = lifecycle
            .submit_files(created.record.id, files(&["b.jpg"]))
            .await
            .expect_err("completed record must not accept files");
        assert_eq!(err.kind(), FlowErrorKind::InvalidState);
        // The guard fires before any remote write.
        assert_eq!(drive.uploads_attempted.load(Ordering::SeqCst), attempted_before);
    }

    #[tokio::test]
    async fn submit_files_unknown_id_is_not_found() {
        let (lifecycle, _) = build(Arc::default(), Arc::default());
        let err = lifecycle
            .submit_files(Uuid::new_v4(), files(&["a.jpg"]))
            .await
            .expect_err("unknown id");
        assert_eq!(err.kind(), FlowErrorKind::NotFound);
    }

    #[tokio::test]
    async fn batch_continues_past_individual_failures() {
        let drive = Arc::new(FakeDrive::failing_on("bad.jpg"));
        let (lifecycle, store) = build(drive.clone(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();

        let outcomes = lifecycle
            .submit_files(created.record.id, files(&["good.jpg", "bad.jpg", "also-good.jpg"]))
            .await
            .expect("best-effort batch still succeeds");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].error.is_none());
        assert!(outcomes[1].error.is_some());
        assert!(outcomes[1].file_id.is_none());
        assert!(outcomes[2].error.is_none());

        // All files attempted, so the record completes anyway.
        let stored = store.get_by_id(created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn folder_resolution_is_idempotent_across_reset_cycle() {
        let drive = Arc::new(FakeDrive::default());
        let (lifecycle, _) = build(drive.clone(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();

        lifecycle
            .submit_files(created.record.id, files(&["a.jpg"]))
            .await
            .unwrap();
        lifecycle.request_reset(created.record.id).await.unwrap();
        lifecycle.confirm_reset(created.record.id).await.unwrap();
        lifecycle
            .submit_files(created.record.id, files(&["b.jpg"]))
            .await
            .unwrap();

        assert_eq!(drive.folders_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_cycle_reopens_request_and_purges_files() {
        let drive = Arc::new(FakeDrive::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (lifecycle, store) = build(drive.clone(), notifier.clone());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        lifecycle
            .submit_files(created.record.id, files(&["a.jpg", "b.jpg"]))
            .await
            .unwrap();

        lifecycle.request_reset(created.record.id).await.unwrap();
        let stored = store.get_by_id(created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::CompletedResetRequested);
        {
            let sent = notifier.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "seller@x.com");
        }

        lifecycle.confirm_reset(created.record.id).await.unwrap();
        let stored = store.get_by_id(created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);

        let folder_id = drive
            .find_folder(&created.record.folder_name())
            .await
            .unwrap()
            .expect("folder is kept for reuse");
        assert!(drive.files_in(&folder_id).is_empty());

        // The record is re-upload-able after the cycle.
        lifecycle
            .submit_files(created.record.id, files(&["c.jpg"]))
            .await
            .expect("upload after reset");
    }

    #[tokio::test]
    async fn repeat_reset_request_is_noop_without_second_notice() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (lifecycle, _) = build(Arc::default(), notifier.clone());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        lifecycle
            .submit_files(created.record.id, files(&["a.jpg"]))
            .await
            .unwrap();

        lifecycle.request_reset(created.record.id).await.unwrap();
        lifecycle.request_reset(created.record.id).await.unwrap();
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_request_on_pending_record_is_invalid() {
        let (lifecycle, _) = build(Arc::default(), Arc::default());
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        let err = lifecycle
            .request_reset(created.record.id)
            .await
            .expect_err("pending record has nothing to reset");
        assert_eq!(err.kind(), FlowErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn notifier_outage_does_not_block_reset_request() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let (lifecycle, store) = build(Arc::default(), notifier);
        let created = lifecycle
            .create_request("Jane Doe", "jane@x.com", "1001", None)
            .await
            .unwrap();
        lifecycle
            .submit_files(created.record.id, files(&["a.jpg"]))
            .await
            .unwrap();

        lifecycle
            .request_reset(created.record.id)
            .await
            .expect("transition committed despite smtp outage");
        let stored = store.get_by_id(created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::CompletedResetRequested);
    }

    #[tokio::test]
    async fn confirm_reset_without_remote_folder_is_not_found() {
        let (lifecycle, store) = build(Arc::default(), Arc::default());
        // Record goes straight to reset-requested without any upload, so no
        // remote folder exists.
        let record = UploadRequest {
            status: RequestStatus::CompletedResetRequested,
            ..UploadRequest::new(
                "Jane Doe".to_string(),
                "jane@x.com".to_string(),
                "1001".to_string(),
                Utc::now(),
            )
        };
        store.create(&record).await.unwrap();

        let err = lifecycle
            .confirm_reset(record.id)
            .await
            .expect_err("missing folder");
        assert_eq!(err.kind(), FlowErrorKind::NotFound);
    }

    #[tokio::test]
    async fn sweep_reverts_only_records_past_grace_window() {
        let (lifecycle, store) = build(Arc::default(), Arc::default());
        let now = Utc::now();

        let mut stale = UploadRequest::new(
            "Jane Doe".to_string(),
            "jane@x.com".to_string(),
            "3001".to_string(),
            now - Duration::days(10),
        );
        stale.status = RequestStatus::CompletedResetRequested;
        stale.last_updated_at = now - Duration::days(6);
        store.create(&stale).await.unwrap();

        let mut fresh = UploadRequest::new(
            "John Doe".to_string(),
            "john@x.com".to_string(),
            "3002".to_string(),
            now - Duration::days(2),
        );
        fresh.status = RequestStatus::CompletedResetRequested;
        fresh.last_updated_at = now - Duration::days(1);
        store.create(&fresh).await.unwrap();

        let reverted = lifecycle.revert_stale_resets(now).await.unwrap();
        assert_eq!(reverted, 1);

        let stale = store.get_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, RequestStatus::Completed);
        let fresh = store.get_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, RequestStatus::CompletedResetRequested);
    }

    #[test]
    fn local_timestamp_uses_seller_timezone() {
        let config = FlowConfig {
            seller_timezone: chrono_tz::America::New_York,
            ..test_config()
        };
        let at = "2026-08-25T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let rendered = config.local_timestamp(at);
        assert_eq!(rendered, "2026-08-25 08:00 EDT");
    }
}
