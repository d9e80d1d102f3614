use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow_array::{builder::StringBuilder, Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use genbi_types::{DocumentKind, Metadata, SchemaDocument};
use tracing::{debug, info, warn};

use crate::{IndexStore, SemanticIndex, StoreError};

const INDEX_FILE: &str = "index.arrow";
const CONTENT_DUMP_FILE: &str = "indexed_content.json";

/// Persists each semantic index as an Arrow IPC file under `<root>/<database_id>/`.
///
/// Layout: `kind` utf8, `content` utf8, `metadata` utf8 (JSON object),
/// `embedding` FixedSizeList<Float32>. The true dimension and the database id
/// live in the schema metadata so an empty index still round-trips.
///
/// With [`with_content_dump`](Self::with_content_dump) every save also writes a readable
/// `indexed_content.json` beside the Arrow file for inspecting what was indexed.
pub struct ArrowIndexStore {
    root: PathBuf,
    dump_content: bool,
}

impl ArrowIndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dump_content: false,
        }
    }

    pub fn with_content_dump(mut self, enabled: bool) -> Self {
        self.dump_content = enabled;
        self
    }

    fn dir_for(&self, database_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !database_id.is_empty()
            && !database_id.starts_with('.')
            && database_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidId(database_id.to_string()));
        }
        Ok(self.root.join(database_id))
    }
}

fn arrow_err(e: arrow_schema::ArrowError) -> StoreError {
    StoreError::Arrow(e.to_string())
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn index_to_batch(index: &SemanticIndex) -> Result<RecordBatch, StoreError> {
    let mut kind_builder = StringBuilder::new();
    let mut content_builder = StringBuilder::new();
    let mut meta_builder = StringBuilder::new();
    for doc in index.documents() {
        kind_builder.append_value(doc.kind.as_str());
        content_builder.append_value(&doc.content);
        let meta = serde_json::to_string(&doc.metadata)
            .map_err(|e| StoreError::Corrupt(format!("metadata encode: {e}")))?;
        meta_builder.append_value(meta);
    }

    // FixedSizeList needs a positive width even when nothing has been appended yet.
    let width = index.dim().max(1);
    let value_array = Float32Array::from(index.embeddings().to_vec());
    let item_field = Arc::new(Field::new("item", DataType::Float32, false));
    let embedding_array = FixedSizeListArray::try_new(
        item_field.clone(),
        width as i32,
        Arc::new(value_array) as ArrayRef,
        None,
    )
    .map_err(arrow_err)?;

    let mut schema_meta = HashMap::new();
    schema_meta.insert("database_id".to_string(), index.database_id().to_string());
    schema_meta.insert("dim".to_string(), index.dim().to_string());
    let schema = Arc::new(Schema::new_with_metadata(
        vec![
            Field::new("kind", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(item_field, width as i32),
                false,
            ),
        ],
        schema_meta,
    ));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(kind_builder.finish()),
        Arc::new(content_builder.finish()),
        Arc::new(meta_builder.finish()),
        Arc::new(embedding_array),
    ];
    RecordBatch::try_new(schema, columns).map_err(arrow_err)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, StoreError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| StoreError::Corrupt(format!("missing column '{name}'")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::Corrupt(format!("column '{name}' not utf8")))
}

fn read_index(path: &Path, database_id: &str) -> Result<SemanticIndex, StoreError> {
    let file = File::open(path).map_err(io_err)?;
    let reader = FileReader::try_new(file, None).map_err(arrow_err)?;
    let dim: usize = reader
        .schema()
        .metadata()
        .get("dim")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::Corrupt("missing dim".into()))?;

    let mut documents = Vec::new();
    let mut embeddings: Vec<f32> = Vec::new();
    for batch in reader {
        let batch = batch.map_err(arrow_err)?;
        let kinds = string_column(&batch, "kind")?;
        let contents = string_column(&batch, "content")?;
        let metas = string_column(&batch, "metadata")?;
        let emb_idx = batch
            .schema()
            .index_of("embedding")
            .map_err(|_| StoreError::Corrupt("missing column 'embedding'".into()))?;
        let emb_list = batch
            .column(emb_idx)
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| StoreError::Corrupt("embedding column not a fixed size list".into()))?;

        for row in 0..batch.num_rows() {
            let metadata: Metadata = serde_json::from_str(metas.value(row))
                .map_err(|e| StoreError::Corrupt(format!("metadata decode: {e}")))?;
            documents.push(SchemaDocument {
                kind: DocumentKind::parse(kinds.value(row)),
                content: contents.value(row).to_string(),
                metadata,
            });

            let values = emb_list.value(row);
            let values = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| StoreError::Corrupt("embedding values not f32".into()))?;
            if values.len() != dim {
                return Err(StoreError::DimMismatch {
                    expected: dim,
                    actual: values.len(),
                });
            }
            embeddings.extend_from_slice(values.values());
        }
    }

    SemanticIndex::from_parts(database_id.to_string(), dim, documents, embeddings)
}

fn write_index(dir: &Path, batch: &RecordBatch) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
    let file = File::create(&tmp).map_err(io_err)?;
    let mut writer = FileWriter::try_new(file, &batch.schema()).map_err(arrow_err)?;
    writer.write(batch).map_err(arrow_err)?;
    writer.finish().map_err(arrow_err)?;
    std::fs::rename(&tmp, dir.join(INDEX_FILE)).map_err(io_err)
}

fn content_dump(index: &SemanticIndex) -> serde_json::Value {
    let mut per_kind: std::collections::BTreeMap<&str, usize> = Default::default();
    for doc in index.documents() {
        *per_kind.entry(doc.kind.as_str()).or_default() += 1;
    }
    serde_json::json!({
        "database_id": index.database_id(),
        "total_documents": index.len(),
        "embedding_dim": index.dim(),
        "documents_by_kind": per_kind,
        "indexed_documents": index.documents(),
    })
}

fn write_content_dump(dir: &Path, dump: &serde_json::Value) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(dump)
        .map_err(|e| StoreError::Corrupt(format!("content dump encode: {e}")))?;
    std::fs::write(dir.join(CONTENT_DUMP_FILE), text).map_err(io_err)
}

#[async_trait]
impl IndexStore for ArrowIndexStore {
    async fn load(&self, database_id: &str) -> Result<Option<SemanticIndex>, StoreError> {
        let path = self.dir_for(database_id)?.join(INDEX_FILE);
        if !path.exists() {
            debug!(database_id, "no persisted index");
            return Ok(None);
        }
        let id = database_id.to_string();
        let index = tokio::task::spawn_blocking(move || read_index(&path, &id))
            .await
            .map_err(|e| StoreError::Io(format!("load task: {e}")))??;
        info!(database_id, documents = index.len(), "loaded index from disk");
        Ok(Some(index))
    }

    async fn save(&self, index: &SemanticIndex) -> Result<(), StoreError> {
        let dir = self.dir_for(index.database_id())?;
        let batch = index_to_batch(index)?;
        let dump = self.dump_content.then(|| content_dump(index));
        let dump_dir = dir.clone();
        tokio::task::spawn_blocking(move || write_index(&dir, &batch))
            .await
            .map_err(|e| StoreError::Io(format!("save task: {e}")))??;
        debug!(database_id = index.database_id(), documents = index.len(), "saved index");

        if let Some(dump) = dump {
            let written = tokio::task::spawn_blocking(move || write_content_dump(&dump_dir, &dump))
                .await
                .map_err(|e| StoreError::Io(format!("dump task: {e}")))
                .and_then(|r| r);
            match written {
                Ok(()) => info!(database_id = index.database_id(), "wrote indexed content dump"),
                Err(e) => warn!(database_id = index.database_id(), error = %e, "could not write indexed content dump"),
            }
        }
        Ok(())
    }

    async fn delete(&self, database_id: &str) -> Result<(), StoreError> {
        // An id that could never have been saved has nothing on disk.
        let dir = match self.dir_for(database_id) {
            Ok(dir) => dir,
            Err(StoreError::InvalidId(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !dir.exists() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&dir))
            .await
            .map_err(|e| StoreError::Io(format!("delete task: {e}")))?
            .map_err(io_err)?;
        info!(database_id, "deleted index files");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> SemanticIndex {
        let mut index = SemanticIndex::new("sales");
        index
            .append(
                vec![
                    SchemaDocument::new(DocumentKind::Table, "Table: orders")
                        .with_meta("table_name", "orders"),
                    SchemaDocument::new(DocumentKind::Relationships, "orders.customer_id -> customers.id"),
                ],
                vec![vec![0.6, 0.8, 0.0], vec![0.0, 0.0, 1.0]],
            )
            .unwrap();
        index
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowIndexStore::new(dir.path());
        let index = sample_index();
        store.save(&index).await.unwrap();

        let loaded = store.load("sales").await.unwrap().expect("index on disk");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.embeddings(), index.embeddings());
        assert_eq!(loaded.documents()[0].table_name(), Some("orders"));
        assert_eq!(loaded.documents()[1].kind, DocumentKind::Relationships);
    }

    #[tokio::test]
    async fn empty_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowIndexStore::new(dir.path());
        store.save(&SemanticIndex::new("empty")).await.unwrap();
        let loaded = store.load("empty").await.unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dim(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowIndexStore::new(dir.path());
        store.save(&sample_index()).await.unwrap();
        store.delete("sales").await.unwrap();
        store.delete("sales").await.unwrap();
        assert!(store.load("sales").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowIndexStore::new(dir.path());
        assert!(matches!(
            store.load("../etc").await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.save(&SemanticIndex::new("bad id")).await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn content_dump_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        ArrowIndexStore::new(dir.path())
            .save(&sample_index())
            .await
            .unwrap();
        assert!(!dir.path().join("sales").join(CONTENT_DUMP_FILE).exists());

        ArrowIndexStore::new(dir.path())
            .with_content_dump(true)
            .save(&sample_index())
            .await
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("sales").join(CONTENT_DUMP_FILE)).unwrap();
        let dump: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(dump["database_id"], "sales");
        assert_eq!(dump["total_documents"], 2);
        assert_eq!(dump["embedding_dim"], 3);
        assert_eq!(dump["documents_by_kind"]["table"], 1);
        assert_eq!(dump["indexed_documents"][0]["content"], "Table: orders");
    }

    #[tokio::test]
    async fn deleting_an_unsavable_id_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowIndexStore::new(dir.path());
        store.save(&sample_index()).await.unwrap();
        store.delete("bad id").await.unwrap();
        store.delete("../sales").await.unwrap();
        assert!(store.load("sales").await.unwrap().is_some());
    }
}
