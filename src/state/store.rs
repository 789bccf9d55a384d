use crate::models::PipelineRecord;
use crate::state::{RecordStore, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory record store (for development and testing)
#[derive(Clone)]
pub struct InMemoryRecordStore<R: PipelineRecord> {
    records: Arc<DashMap<String, R>>,
    correlation_index: Arc<DashMap<String, Vec<String>>>,
}

impl<R: PipelineRecord> InMemoryRecordStore<R> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            correlation_index: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R: PipelineRecord> Default for InMemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: PipelineRecord> RecordStore<R> for InMemoryRecordStore<R> {
    async fn save(&self, record: &R) -> StoreResult<()> {
        let id = record.id().to_string();
        let replaced = self.records.insert(id.clone(), record.clone());

        if let Some(previous) = replaced {
            if previous.correlation_id() != record.correlation_id() {
                if let Some(mut ids) = self.correlation_index.get_mut(previous.correlation_id()) {
                    ids.retain(|existing| existing != &id);
                }
            }
        }

        let mut ids = self
            .correlation_index
            .entry(record.correlation_id().to_string())
            .or_default();
        if !ids.contains(&id) {
            ids.push(id.clone());
        }

        tracing::debug!(table = R::TABLE, id = %id, correlation_id = %record.correlation_id(), "Record saved");
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<R>> {
        Ok(self.records.get(id).map(|entry| entry.clone()))
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> StoreResult<Vec<R>> {
        let ids = match self.correlation_index.get(correlation_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|entry| entry.clone()))
            .collect())
    }
}
