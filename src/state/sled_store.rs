use crate::models::PipelineRecord;
use crate::state::{RecordStore, StoreError, StoreResult};
use async_trait::async_trait;
use sled::{Db, Tree};
use std::marker::PhantomData;
use std::path::Path;

const INDEX_SEPARATOR: u8 = 0x00;

/// Persistent record store on a sled tree named after the record table.
///
/// A second tree indexes records by correlation id with keys of the form
/// `correlation_id \0 id`, so one prefix scan yields a pipeline run.
#[derive(Clone)]
pub struct SledRecordStore<R: PipelineRecord> {
    db: Db,
    records: Tree,
    correlation_index: Tree,
    _record: PhantomData<fn() -> R>,
}

impl<R: PipelineRecord> SledRecordStore<R> {
    /// Open a dedicated database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref()).map_err(backend::<R>)?;
        tracing::info!(path = ?path.as_ref(), table = R::TABLE, "Initialized Sled record store");
        Self::open(&db)
    }

    /// Open the record trees inside an existing database
    pub fn open(db: &Db) -> StoreResult<Self> {
        let records = db.open_tree(R::TABLE).map_err(backend::<R>)?;
        let correlation_index = db
            .open_tree(format!("{}_by_correlation", R::TABLE))
            .map_err(backend::<R>)?;

        Ok(Self {
            db: db.clone(),
            records,
            correlation_index,
            _record: PhantomData,
        })
    }

    fn index_prefix(correlation_id: &str) -> Vec<u8> {
        let mut key = correlation_id.as_bytes().to_vec();
        key.push(INDEX_SEPARATOR);
        key
    }

    fn index_key(correlation_id: &str, id: &str) -> Vec<u8> {
        let mut key = Self::index_prefix(correlation_id);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn encode(record: &R) -> StoreResult<Vec<u8>> {
        bincode::serialize(record).map_err(|e| StoreError::Codec {
            table: R::TABLE,
            message: format!("Failed to serialize record: {}", e),
        })
    }

    fn decode(bytes: &[u8]) -> StoreResult<R> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec {
            table: R::TABLE,
            message: format!("Failed to deserialize record: {}", e),
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await.map_err(backend::<R>)?;
        Ok(())
    }
}

fn backend<R: PipelineRecord>(err: sled::Error) -> StoreError {
    StoreError::Backend {
        table: R::TABLE,
        message: err.to_string(),
    }
}

#[async_trait]
impl<R: PipelineRecord> RecordStore<R> for SledRecordStore<R> {
    async fn save(&self, record: &R) -> StoreResult<()> {
        let bytes = Self::encode(record)?;
        let previous = self
            .records
            .insert(record.id().as_bytes(), bytes)
            .map_err(backend::<R>)?;

        if let Some(previous) = previous {
            let previous = Self::decode(&previous)?;
            if previous.correlation_id() != record.correlation_id() {
                self.correlation_index
                    .remove(Self::index_key(previous.correlation_id(), previous.id()))
                    .map_err(backend::<R>)?;
            }
        }

        self.correlation_index
            .insert(
                Self::index_key(record.correlation_id(), record.id()),
                &[] as &[u8],
            )
            .map_err(backend::<R>)?;

        tracing::debug!(table = R::TABLE, id = %record.id(), correlation_id = %record.correlation_id(), "Record saved");
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<R>> {
        match self.records.get(id.as_bytes()).map_err(backend::<R>)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> StoreResult<Vec<R>> {
        let prefix = Self::index_prefix(correlation_id);
        let mut found = Vec::new();

        for entry in self.correlation_index.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(backend::<R>)?;
            let id = &key[prefix.len()..];
            if let Some(bytes) = self.records.get(id).map_err(backend::<R>)? {
                found.push(Self::decode(&bytes)?);
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentRecord, RecordStatus};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn payment(id: &str, correlation_id: &str) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            correlation_id: correlation_id.to_string(),
            transaction_id: correlation_id.to_string(),
            customer_id: "C1".to_string(),
            product_id: "P1".to_string(),
            amount: 123.45,
            currency: "USD".to_string(),
            payment_method: "PAYPAL".to_string(),
            processor_reference: format!("REF-{}", id),
            status: RecordStatus::Processed,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_find_by_id() {
        let dir = TempDir::new().unwrap();
        let store = SledRecordStore::<PaymentRecord>::new(dir.path()).unwrap();

        let record = payment("P-1", "T1");
        store.save(&record).await.unwrap();

        assert_eq!(store.find_by_id("P-1").await.unwrap(), Some(record));
        assert!(store.find_by_id("P-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_correlation_prefix_does_not_leak() {
        let dir = TempDir::new().unwrap();
        let store = SledRecordStore::<PaymentRecord>::new(dir.path()).unwrap();

        store.save(&payment("P-1", "T1")).await.unwrap();
        store.save(&payment("P-2", "T10")).await.unwrap();

        let found = store.find_by_correlation_id("T1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payment_id, "P-1");
    }

    #[tokio::test]
    async fn test_resave_moves_index_entry() {
        let dir = TempDir::new().unwrap();
        let store = SledRecordStore::<PaymentRecord>::new(dir.path()).unwrap();

        store.save(&payment("P-1", "T1")).await.unwrap();
        store.save(&payment("P-1", "T2")).await.unwrap();

        assert!(store.find_by_correlation_id("T1").await.unwrap().is_empty());
        assert_eq!(store.find_by_correlation_id("T2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let mut record = payment("P-1", "T1");
        record.created_at = Utc::now() - Duration::minutes(5);

        {
            let store = SledRecordStore::<PaymentRecord>::new(dir.path()).unwrap();
            store.save(&record).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledRecordStore::<PaymentRecord>::new(dir.path()).unwrap();
        assert_eq!(store.find_by_id("P-1").await.unwrap(), Some(record));
    }
}
