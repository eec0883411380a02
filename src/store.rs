use crate::models::{RequestStatus, UploadRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate order reference: {0}")]
    DuplicateOrder(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable keyed records for upload requests.
///
/// `update_status` is deliberately a compare-and-swap: the `status` field is
/// the only coordination between concurrent handlers, so the conditional
/// write has to happen at the store boundary, not as a read-then-write in
/// the caller.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new record. Fails with `DuplicateOrder` if a record with
    /// the same order reference already exists.
    async fn create(&self, record: &UploadRequest) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<UploadRequest>, StoreError>;

    async fn get_by_order_reference(
        &self,
        reference: &str,
    ) -> Result<Option<UploadRequest>, StoreError>;

    /// Set `status` and stamp `last_updated_at` only if the current status
    /// equals `expected`. Returns `Ok(true)` when the swap happened,
    /// `Ok(false)` when the record is missing or in another state.
    async fn update_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_by_status(&self, status: RequestStatus)
    -> Result<Vec<UploadRequest>, StoreError>;
}

/// In-process store backed by a mutexed map. The default when no
/// `REDIS_URL` is configured; also what the tests run against.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<Uuid, UploadRequest>,
    by_reference: HashMap<String, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, record: &UploadRequest) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.by_reference.contains_key(&record.order_reference) {
            return Err(StoreError::DuplicateOrder(record.order_reference.clone()));
        }
        guard
            .by_reference
            .insert(record.order_reference.clone(), record.id);
        guard.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<UploadRequest>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard.records.get(&id).cloned())
    }

    async fn get_by_order_reference(
        &self,
        reference: &str,
    ) -> Result<Option<UploadRequest>, StoreError> {
        let guard = self.inner.lock().await;
        let id = guard.by_reference.get(reference).copied();
        Ok(id.and_then(|id| guard.records.get(&id).cloned()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        match guard.records.get_mut(&id) {
            Some(record) if record.status == expected => {
                record.status = new_status;
                record.last_updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<UploadRequest>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .records
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect())
    }
}

/// Redis-backed store. Records live at `upload_request:{id}` as JSON, with
/// an order-reference index and one id set per status for the sweep.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    cas_script: Arc<redis::Script>,
}

const CAS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local rec = cjson.decode(raw)
if rec.status ~= ARGV[1] then return 0 end
rec.status = ARGV[2]
rec.last_updated_at = ARGV[3]
redis.call('SET', KEYS[1], cjson.encode(rec))
redis.call('SREM', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[4])
return 1
"#;

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            cas_script: Arc::new(redis::Script::new(CAS_SCRIPT)),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn record_key(id: Uuid) -> String {
        format!("upload_request:{id}")
    }

    fn reference_key(reference: &str) -> String {
        format!("upload_request:order:{reference}")
    }

    fn status_key(status: RequestStatus) -> String {
        format!("upload_request:status:{status}")
    }

    fn decode(raw: &str) -> Result<UploadRequest, StoreError> {
        serde_json::from_str(raw).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl RequestStore for RedisStore {
    async fn create(&self, record: &UploadRequest) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let claimed: bool = conn
            .set_nx(
                Self::reference_key(&record.order_reference),
                record.id.to_string(),
            )
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if !claimed {
            return Err(StoreError::DuplicateOrder(record.order_reference.clone()));
        }
        let json =
            serde_json::to_string(record).map_err(|err| StoreError::Backend(err.to_string()))?;
        let _: () = conn
            .set(Self::record_key(record.id), json)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let _: () = conn
            .sadd(Self::status_key(record.status), record.id.to_string())
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<UploadRequest>, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(Self::record_key(id))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        raw.map(|raw| Self::decode(&raw)).transpose()
    }

    async fn get_by_order_reference(
        &self,
        reference: &str,
    ) -> Result<Option<UploadRequest>, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let id: Option<String> = conn
            .get(Self::reference_key(reference))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let Some(id) = id else { return Ok(None) };
        let id = Uuid::parse_str(&id).map_err(|err| StoreError::Backend(err.to_string()))?;
        self.get_by_id(id).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let swapped: i64 = self
            .cas_script
            .key(Self::record_key(id))
            .key(Self::status_key(expected))
            .key(Self::status_key(new_status))
            .arg(expected.as_str())
            .arg(new_status.as_str())
            .arg(at.to_rfc3339())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(swapped == 1)
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<UploadRequest>, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .smembers(Self::status_key(status))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut records = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            if let Some(record) = self.get_by_id(id).await?
                && record.status == status
            {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_record(reference: &str) -> UploadRequest {
        UploadRequest::new(
            "Jane Doe".to_string(),
            "jane@x.com".to_string(),
            reference.to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_order_reference() {
        let store = MemoryStore::new();
        store.create(&sample_record("1001")).await.expect("first");
        let err = store
            .create(&sample_record("1001"))
            .await
            .expect_err("second create must fail");
        assert!(matches!(err, StoreError::DuplicateOrder(reference) if reference == "1001"));
    }

    #[tokio::test]
    async fn update_status_swaps_only_from_expected_state() {
        let store = MemoryStore::new();
        let record = sample_record("1002");
        store.create(&record).await.unwrap();

        let stamp = Utc::now();
        let swapped = store
            .update_status(
                record.id,
                RequestStatus::Pending,
                RequestStatus::Completed,
                stamp,
            )
            .await
            .unwrap();
        assert!(swapped);

        // Second swap from Pending must lose: the record is now Completed.
        let swapped = store
            .update_status(
                record.id,
                RequestStatus::Pending,
                RequestStatus::Completed,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!swapped);

        let stored = store.get_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stored.last_updated_at, stamp);
    }

    #[tokio::test]
    async fn update_status_on_unknown_id_is_false_not_error() {
        let store = MemoryStore::new();
        let swapped = store
            .update_status(
                Uuid::new_v4(),
                RequestStatus::Pending,
                RequestStatus::Completed,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[tokio::test]
    async fn list_by_status_filters_records() {
        let store = MemoryStore::new();
        let first = sample_record("2001");
        let second = sample_record("2002");
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();
        store
            .update_status(
                first.id,
                RequestStatus::Pending,
                RequestStatus::Completed,
                Utc::now(),
            )
            .await
            .unwrap();

        let pending = store.list_by_status(RequestStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }
}
