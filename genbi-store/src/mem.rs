use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{IndexStore, SemanticIndex, StoreError};

/// Non-durable index store.
///
/// Keeps snapshots in a map; useful for tests and for running without a data directory.
pub struct InMemoryIndexStore {
    saved: Mutex<HashMap<String, SemanticIndex>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self {
            saved: Mutex::new(HashMap::new()),
        }
    }

    /// Number of documents in the saved snapshot for `database_id`.
    pub async fn saved_len(&self, database_id: &str) -> Option<usize> {
        let inner = self.saved.lock().await;
        inner.get(database_id).map(|i| i.len())
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn load(&self, database_id: &str) -> Result<Option<SemanticIndex>, StoreError> {
        let inner = self.saved.lock().await;
        Ok(inner.get(database_id).cloned())
    }

    async fn save(&self, index: &SemanticIndex) -> Result<(), StoreError> {
        let mut inner = self.saved.lock().await;
        inner.insert(index.database_id().to_string(), index.clone());
        Ok(())
    }

    async fn delete(&self, database_id: &str) -> Result<(), StoreError> {
        let mut inner = self.saved.lock().await;
        inner.remove(database_id);
        Ok(())
    }
}
