use async_trait::async_trait;
use genbi_types::SchemaDocument;
use thiserror::Error;

pub mod arrow_file;
pub use arrow_file::ArrowIndexStore;

pub mod mem;
pub use mem::InMemoryIndexStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("arrow error: {0}")]
    Arrow(String),
    #[error("corrupt index: {0}")]
    Corrupt(String),
    #[error("embedding dimension mismatch; expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },
    #[error("{documents} documents but {embeddings} embeddings")]
    LengthMismatch { documents: usize, embeddings: usize },
    #[error("invalid database id '{0}'")]
    InvalidId(String),
}

/// A document paired with its similarity to the query.
#[derive(Clone, Debug)]
pub struct ScoredDocument {
    pub position: usize,
    pub score: f32,
    pub document: SchemaDocument,
}

/// Append-only nearest-neighbour index for one database id.
///
/// Embeddings are stored row-major in one contiguous buffer.
#[derive(Clone, Debug)]
pub struct SemanticIndex {
    database_id: String,
    dim: usize,
    documents: Vec<SchemaDocument>,
    embeddings: Vec<f32>,
}

impl SemanticIndex {
    pub fn new(database_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            dim: 0,
            documents: Vec::new(),
            embeddings: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        database_id: String,
        dim: usize,
        documents: Vec<SchemaDocument>,
        embeddings: Vec<f32>,
    ) -> Result<Self, StoreError> {
        if documents.len() * dim != embeddings.len() {
            return Err(StoreError::Corrupt(format!(
                "{} documents of dim {} vs {} values",
                documents.len(),
                dim,
                embeddings.len()
            )));
        }
        Ok(Self {
            database_id,
            dim,
            documents,
            embeddings,
        })
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Embedding dimension; zero until the first append.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[SchemaDocument] {
        &self.documents
    }

    pub fn embeddings(&self) -> &[f32] {
        &self.embeddings
    }

    pub fn append(
        &mut self,
        documents: Vec<SchemaDocument>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize, StoreError> {
        if documents.len() != embeddings.len() {
            return Err(StoreError::LengthMismatch {
                documents: documents.len(),
                embeddings: embeddings.len(),
            });
        }
        let mut dim = self.dim;
        for e in &embeddings {
            if dim == 0 {
                dim = e.len();
            }
            if e.len() != dim || dim == 0 {
                return Err(StoreError::DimMismatch {
                    expected: dim,
                    actual: e.len(),
                });
            }
        }
        self.dim = dim;
        let added = documents.len();
        for e in embeddings {
            self.embeddings.extend_from_slice(&e);
        }
        self.documents.extend(documents);
        Ok(added)
    }

    /// Top-`k` documents by cosine similarity; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, StoreError> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dim {
            return Err(StoreError::DimMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(query, e)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(position, score)| ScoredDocument {
                position,
                score,
                document: self.documents[position].clone(),
            })
            .collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Durable home of semantic indexes, keyed by database id.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Load a persisted index, `None` when nothing was saved for this id.
    async fn load(&self, database_id: &str) -> Result<Option<SemanticIndex>, StoreError>;

    /// Replace the persisted copy with `index`.
    async fn save(&self, index: &SemanticIndex) -> Result<(), StoreError>;

    /// Remove the persisted copy. Removing a missing index is not an error.
    async fn delete(&self, database_id: &str) -> Result<(), StoreError>;
}
