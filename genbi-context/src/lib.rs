//! Schema knowledge for retrieval: turning schemas and facts into documents, indexing them
//! per database, and assembling retrieved documents into prompt context.

pub mod documents;
pub mod format;
pub mod indexer;
pub mod normalize;

pub use documents::{fact_to_document, schema_to_documents};
pub use format::format_context;
pub use indexer::{IndexError, IndexReport, SchemaIndexer};
pub use normalize::normalize_text;
