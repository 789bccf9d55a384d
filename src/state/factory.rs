use crate::config::{StoreBackend, StoreConfig};
use crate::error::{AppError, Result};
use crate::models::{BillingRecord, InvoiceRecord, PaymentRecord};
use crate::state::{InMemoryRecordStore, RecordStore, SledRecordStore};
use std::sync::Arc;

/// One store per pipeline record type
#[derive(Clone)]
pub struct StoreSet {
    pub billing: Arc<dyn RecordStore<BillingRecord>>,
    pub payment: Arc<dyn RecordStore<PaymentRecord>>,
    pub invoice: Arc<dyn RecordStore<InvoiceRecord>>,
}

/// Create the record stores based on configuration
pub fn create_stores(config: &StoreConfig) -> Result<StoreSet> {
    match config.backend {
        StoreBackend::Sled => {
            let path = config.path.as_ref().ok_or_else(|| {
                AppError::Configuration("Sled backend requires 'path' configuration".to_string())
            })?;

            tracing::info!(path = ?path, "Initializing Sled storage backend");

            let db = sled::open(path)
                .map_err(|e| AppError::Store(format!("cannot open sled database: {}", e)))?;
            Ok(StoreSet {
                billing: Arc::new(SledRecordStore::open(&db)?),
                payment: Arc::new(SledRecordStore::open(&db)?),
                invoice: Arc::new(SledRecordStore::open(&db)?),
            })
        }

        StoreBackend::Memory => Ok(create_in_memory_stores()),
    }
}

/// Create in-memory stores (for testing and development)
pub fn create_in_memory_stores() -> StoreSet {
    tracing::info!("Initializing in-memory storage backend");
    StoreSet {
        billing: Arc::new(InMemoryRecordStore::new()),
        payment: Arc::new(InMemoryRecordStore::new()),
        invoice: Arc::new(InMemoryRecordStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_sled_stores() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Sled,
            path: Some(temp_dir.path().to_path_buf()),
        };

        let stores = create_stores(&config).unwrap();
        assert!(stores.billing.find_by_id("missing").await.unwrap().is_none());
        assert!(stores.invoice.find_by_correlation_id("T1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_memory_stores() {
        let stores = create_stores(&StoreConfig::default()).unwrap();
        assert!(stores.payment.find_by_id("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_sled_requires_path() {
        let config = StoreConfig {
            backend: StoreBackend::Sled,
            path: None,
        };

        assert!(matches!(
            create_stores(&config),
            Err(AppError::Configuration(_))
        ));
    }
}
