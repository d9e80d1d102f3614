use std::collections::HashMap;
use std::sync::Arc;

use genbi_embed::{EmbedError, Embedder};
use genbi_store::{IndexStore, ScoredDocument, SemanticIndex, StoreError};
use genbi_types::{DatabaseSchema, KnowledgeFact, SchemaDocument};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::documents::{fact_to_document, schema_to_documents};
use crate::normalize::{normalize_text, MAX_TEXT_LEN};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct IndexReport {
    pub database_id: String,
    pub tables: usize,
    /// Documents added by this call.
    pub documents: usize,
    /// Documents in the index afterwards.
    pub total_documents: usize,
}

type Slot = Arc<RwLock<Option<SemanticIndex>>>;

/// Owns one semantic index per database id.
///
/// Each id gets its own lock: retrievals share it, mutations (index, reindex, facts,
/// delete, lazy loads) take it exclusively. Ids never contend with each other beyond
/// the brief slot lookup. A slot only stays in the map while it holds an index or a
/// call is using it.
pub struct SchemaIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IndexStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SchemaIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn IndexStore>) -> Self {
        Self {
            embedder,
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, database_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(database_id.to_string()).or_default())
    }

    /// Drop the map entry for `database_id` if `slot` holds no index and no other call
    /// shares it. Slots are only cloned under the map lock, so the count cannot grow
    /// while it is checked.
    async fn release(&self, database_id: &str, slot: Slot) {
        let mut slots = self.slots.lock().await;
        let unused = slots
            .get(database_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
            && Arc::strong_count(&slot) == 2
            && slot.try_read().map(|guard| guard.is_none()).unwrap_or(false);
        if unused {
            slots.remove(database_id);
        }
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Make sure the index for `database_id` is in memory. Caller holds the write lock.
    async fn ensure_resident(
        &self,
        guard: &mut Option<SemanticIndex>,
        database_id: &str,
    ) -> Result<bool, StoreError> {
        if guard.is_some() {
            return Ok(true);
        }
        match self.store.load(database_id).await? {
            Some(index) => {
                *guard = Some(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn embed_documents(&self, documents: &[SchemaDocument]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        self.embedder.embed(&texts).await
    }

    async fn append_and_save(
        &self,
        guard: &mut Option<SemanticIndex>,
        database_id: &str,
        documents: Vec<SchemaDocument>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(usize, usize), IndexError> {
        let index = guard.get_or_insert_with(|| SemanticIndex::new(database_id));
        let added = index.append(documents, embeddings)?;
        self.store.save(index).await?;
        Ok((added, index.len()))
    }

    async fn extend_slot(
        &self,
        slot: &Slot,
        database_id: &str,
        documents: Vec<SchemaDocument>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(usize, usize), IndexError> {
        let mut guard = slot.write().await;
        self.ensure_resident(&mut guard, database_id).await?;
        self.append_and_save(&mut guard, database_id, documents, embeddings)
            .await
    }

    async fn replace_slot(
        &self,
        slot: &Slot,
        database_id: &str,
        documents: Vec<SchemaDocument>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(usize, usize), IndexError> {
        let mut guard = slot.write().await;
        *guard = None;
        self.store.delete(database_id).await?;
        self.append_and_save(&mut guard, database_id, documents, embeddings)
            .await
    }

    /// Index every table, column and the relationship set of `schema`.
    ///
    /// Appends to an existing index (resident or persisted). Use [`reindex`](Self::reindex)
    /// or [`delete`](Self::delete) first to rebuild from scratch.
    pub async fn index(&self, database_id: &str, schema: &DatabaseSchema) -> Result<IndexReport, IndexError> {
        info!(database_id, tables = schema.tables.len(), "indexing schema");
        let documents = schema_to_documents(schema, database_id);
        let embeddings = self.embed_documents(&documents).await?;

        let slot = self.slot(database_id).await;
        let appended = self.extend_slot(&slot, database_id, documents, embeddings).await;
        self.release(database_id, slot).await;
        let (added, total) = appended?;

        info!(database_id, added, total, "indexed schema");
        Ok(IndexReport {
            database_id: database_id.to_string(),
            tables: schema.tables.len(),
            documents: added,
            total_documents: total,
        })
    }

    /// Drop whatever exists for `database_id` and index `schema` from scratch.
    pub async fn reindex(&self, database_id: &str, schema: &DatabaseSchema) -> Result<IndexReport, IndexError> {
        let documents = schema_to_documents(schema, database_id);
        let embeddings = self.embed_documents(&documents).await?;

        let slot = self.slot(database_id).await;
        let rebuilt = self.replace_slot(&slot, database_id, documents, embeddings).await;
        self.release(database_id, slot).await;
        let (added, total) = rebuilt?;

        info!(database_id, added, "re-indexed schema");
        Ok(IndexReport {
            database_id: database_id.to_string(),
            tables: schema.tables.len(),
            documents: added,
            total_documents: total,
        })
    }

    /// `k` nearest documents to `question`, empty when nothing is indexed or on failure.
    pub async fn retrieve(&self, database_id: &str, question: &str, k: usize) -> Vec<SchemaDocument> {
        match self.retrieve_scored(database_id, question, k).await {
            Ok(hits) => hits.into_iter().map(|h| h.document).collect(),
            Err(e) => {
                error!(database_id, error = %e, "error retrieving context");
                Vec::new()
            }
        }
    }

    /// Like [`retrieve`](Self::retrieve) but surfaces errors and scores.
    pub async fn retrieve_scored(
        &self,
        database_id: &str,
        question: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, IndexError> {
        let slot = self.slot(database_id).await;
        let hits = self.search_slot(&slot, database_id, question, k).await;
        self.release(database_id, slot).await;
        hits
    }

    async fn search_slot(
        &self,
        slot: &Slot,
        database_id: &str,
        question: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, IndexError> {
        let resident = slot.read().await.is_some();
        if !resident {
            let mut guard = slot.write().await;
            if !self.ensure_resident(&mut guard, database_id).await? {
                debug!(database_id, "no index to retrieve from");
                return Ok(Vec::new());
            }
        }

        let query = self
            .embedder
            .embed_one(&normalize_text(question, MAX_TEXT_LEN))
            .await?;
        let guard = slot.read().await;
        match guard.as_ref() {
            Some(index) => Ok(index.search(&query, k)?),
            // Deleted between the load and the search.
            None => Ok(Vec::new()),
        }
    }

    /// Append one instruction or example pair. Facts never create an index.
    pub async fn index_fact(&self, database_id: &str, fact: &KnowledgeFact) -> bool {
        match self.try_index_fact(database_id, fact).await {
            Ok(true) => {
                info!(database_id, "indexed knowledge fact");
                true
            }
            Ok(false) => {
                warn!(database_id, "no index found for knowledge fact");
                false
            }
            Err(e) => {
                error!(database_id, error = %e, "error indexing knowledge fact");
                false
            }
        }
    }

    async fn try_index_fact(&self, database_id: &str, fact: &KnowledgeFact) -> Result<bool, IndexError> {
        let slot = self.slot(database_id).await;
        let added = self.append_fact(&slot, database_id, fact).await;
        self.release(database_id, slot).await;
        added
    }

    async fn append_fact(&self, slot: &Slot, database_id: &str, fact: &KnowledgeFact) -> Result<bool, IndexError> {
        let mut guard = slot.write().await;
        if !self.ensure_resident(&mut guard, database_id).await? {
            return Ok(false);
        }
        let documents = vec![fact_to_document(fact, database_id)];
        let embeddings = self.embed_documents(&documents).await?;
        self.append_and_save(&mut guard, database_id, documents, embeddings)
            .await?;
        Ok(true)
    }

    /// Remove the index from memory and durable storage. Succeeds when nothing existed.
    pub async fn delete(&self, database_id: &str) -> bool {
        let slot = self.slot(database_id).await;
        let removed = {
            let mut guard = slot.write().await;
            if guard.take().is_some() {
                info!(database_id, "removed index from memory");
            }
            self.store.delete(database_id).await
        };
        self.release(database_id, slot).await;
        match removed {
            Ok(()) => true,
            Err(e) => {
                error!(database_id, error = %e, "error deleting index");
                false
            }
        }
    }

    /// Whether an index exists in memory or in the store.
    pub async fn is_indexed(&self, database_id: &str) -> bool {
        let slot = self.slot(database_id).await;
        let found = {
            let mut guard = slot.write().await;
            self.ensure_resident(&mut guard, database_id)
                .await
                .unwrap_or(false)
        };
        self.release(database_id, slot).await;
        found
    }
}
