//! Pipeline runs against the embedded sled backend

mod common;

use billing_pipeline::config::{StoreBackend, StoreConfig};
use billing_pipeline::models::{BillingRecord, RecordStatus};
use billing_pipeline::state::{create_stores, RecordStore};
use chrono::Utc;
use common::*;

fn sled_config(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        backend: StoreBackend::Sled,
        path: Some(dir.path().join("records")),
    }
}

#[tokio::test]
async fn test_pipeline_writes_to_sled() {
    let dir = tempfile::tempdir().unwrap();
    let stores = create_stores(&sled_config(&dir)).unwrap();
    let pipeline = start_pipeline(&test_config(), stores.clone()).await;

    pipeline
        .runtime
        .billing()
        .create_billing_as("T-sled".to_string(), billing_request(42.0, "GBP"), None)
        .await
        .unwrap();

    let invoice = eventually(|| {
        let stores = stores.clone();
        async move {
            stores
                .invoice
                .find_by_correlation_id("T-sled")
                .await
                .unwrap()
                .into_iter()
                .next()
        }
    })
    .await;
    assert_eq!(invoice.currency, "GBP");
    assert_eq!(invoice.status, RecordStatus::Generated);

    let billing = stores.billing.find_by_id("T-sled").await.unwrap().unwrap();
    assert_eq!(billing.amount, 42.0);
    let payments = stores.payment.find_by_correlation_id("T-sled").await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].payment_id, invoice.payment_id);

    pipeline.runtime.shutdown().await;
}

#[tokio::test]
async fn test_sled_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = sled_config(&dir);

    {
        let stores = create_stores(&config).unwrap();
        stores
            .billing
            .save(&BillingRecord {
                transaction_id: "T-persist".to_string(),
                correlation_id: "T-persist".to_string(),
                customer_id: "customer-1".to_string(),
                product_id: "product-1".to_string(),
                amount: 9.99,
                currency: "USD".to_string(),
                status: RecordStatus::Pending,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let reopened = create_stores(&config).unwrap();
    let record = reopened.billing.find_by_id("T-persist").await.unwrap().unwrap();
    assert_eq!(record.amount, 9.99);
    assert_eq!(
        reopened
            .billing
            .find_by_correlation_id("T-persist")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(reopened.payment.find_by_id("T-persist").await.unwrap().is_none());
}

#[test]
fn test_sled_without_path_is_configuration_error() {
    let config = StoreConfig {
        backend: StoreBackend::Sled,
        path: None,
    };
    let err = create_stores(&config).err().unwrap();
    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
}
