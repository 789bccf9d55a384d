pub mod factory;
pub mod sled_store;
pub mod store;

pub use factory::{create_in_memory_stores, create_stores, StoreSet};
pub use sled_store::SledRecordStore;
pub use store::InMemoryRecordStore;

use crate::error::AppError;
use crate::messaging::HandlerError;
use crate::models::PipelineRecord;
use async_trait::async_trait;
use thiserror::Error;

/// Record store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database refused the operation
    #[error("{table}: {message}")]
    Backend { table: &'static str, message: String },

    /// A stored value could not be encoded or decoded
    #[error("{table}: codec failure: {message}")]
    Codec { table: &'static str, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::store_write(err.to_string())
    }
}

/// Persistence for one pipeline record type
#[async_trait]
pub trait RecordStore<R: PipelineRecord>: Send + Sync {
    /// Insert or replace a record by id
    async fn save(&self, record: &R) -> StoreResult<()>;

    /// Get a record by its entity id
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<R>>;

    /// All records of one pipeline run, oldest first
    async fn find_by_correlation_id(&self, correlation_id: &str) -> StoreResult<Vec<R>>;
}
