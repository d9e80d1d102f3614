use std::fmt::Write;

use genbi_types::{ColumnSchema, DatabaseSchema, DocumentKind, KnowledgeFact, Relationship, SchemaDocument, TableSchema};

use crate::normalize::{
    normalize_text, MAX_DESCRIPTION_LEN, MAX_IDENT_LEN, MAX_INLINE_DESCRIPTION_LEN, MAX_TEXT_LEN,
    MAX_TYPE_LEN,
};

/// Convert a schema into retrievable documents: one per table, one per column and,
/// when there are foreign keys, one consolidated relationships document.
pub fn schema_to_documents(schema: &DatabaseSchema, database_id: &str) -> Vec<SchemaDocument> {
    let mut documents = Vec::with_capacity(schema.tables.len() + schema.column_count() + 1);

    for table in &schema.tables {
        let table_name = normalize_text(&table.name, MAX_IDENT_LEN);
        let columns: Vec<serde_json::Value> = table
            .columns
            .iter()
            .map(|c| normalize_text(&c.name, MAX_IDENT_LEN).into())
            .collect();
        documents.push(
            SchemaDocument::new(DocumentKind::Table, format_table(table))
                .with_meta("database_id", database_id)
                .with_meta("table_name", table_name.clone())
                .with_meta("columns", columns),
        );

        for column in &table.columns {
            documents.push(
                SchemaDocument::new(DocumentKind::Column, format_column(table, column))
                    .with_meta("database_id", database_id)
                    .with_meta("table_name", table_name.clone())
                    .with_meta("column_name", normalize_text(&column.name, MAX_IDENT_LEN))
                    .with_meta("column_type", normalize_text(&column.data_type, MAX_TYPE_LEN)),
            );
        }
    }

    if !schema.relationships.is_empty() {
        documents.push(
            SchemaDocument::new(
                DocumentKind::Relationships,
                format_relationships(&schema.relationships),
            )
            .with_meta("database_id", database_id),
        );
    }

    documents
}

fn table_description(table: &TableSchema) -> Option<String> {
    table
        .description
        .as_deref()
        .or(table.table_comment.as_deref())
        .map(|d| normalize_text(d, MAX_DESCRIPTION_LEN))
        .filter(|d| !d.is_empty())
}

fn format_table(table: &TableSchema) -> String {
    let mut text = format!("Table: {}\n", normalize_text(&table.name, MAX_IDENT_LEN));
    if let Some(desc) = table_description(table) {
        let _ = writeln!(text, "Description: {desc}");
    }
    text.push_str("Columns:\n");
    for col in &table.columns {
        let _ = write!(
            text,
            "  - {} ({})",
            normalize_text(&col.name, MAX_IDENT_LEN),
            normalize_text(&col.data_type, MAX_TYPE_LEN)
        );
        if let Some(desc) = col.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = write!(text, ": {}", normalize_text(desc, MAX_INLINE_DESCRIPTION_LEN));
        }
        text.push('\n');
    }
    if let Some(pk) = table.primary_key.as_ref().filter(|pk| !pk.is_empty()) {
        let pk: Vec<String> = pk.iter().map(|k| normalize_text(k, MAX_IDENT_LEN)).collect();
        let _ = writeln!(text, "Primary Key: {}", pk.join(", "));
    }
    text
}

fn format_column(table: &TableSchema, column: &ColumnSchema) -> String {
    let mut text = format!(
        "Column: {}\nTable: {}\nType: {}\n",
        normalize_text(&column.name, MAX_IDENT_LEN),
        normalize_text(&table.name, MAX_IDENT_LEN),
        normalize_text(&column.data_type, MAX_TYPE_LEN)
    );
    if let Some(desc) = column.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = writeln!(
            text,
            "Column Description: {}",
            normalize_text(desc, MAX_DESCRIPTION_LEN)
        );
    }
    if let Some(desc) = table_description(table) {
        let _ = writeln!(text, "Table Description: {desc}");
    }
    text
}

fn format_relationships(relationships: &[Relationship]) -> String {
    let mut text = String::from(
        "DATABASE RELATIONSHIPS (Foreign Keys):\n\nUse these relationships to JOIN tables correctly:\n\n",
    );
    for rel in relationships {
        let from_table = normalize_text(&rel.from_table, MAX_IDENT_LEN);
        let from_col = normalize_text(&rel.from_column, MAX_IDENT_LEN);
        let to_table = normalize_text(&rel.to_table, MAX_IDENT_LEN);
        let to_col = normalize_text(&rel.to_column, MAX_IDENT_LEN);
        let _ = writeln!(text, "- {from_table}.{from_col} -> {to_table}.{to_col}");
        let _ = writeln!(
            text,
            "  JOIN {to_table} ON {from_table}.{from_col} = {to_table}.{to_col}\n"
        );
    }
    text
}

/// Render a knowledge-base fact as a single document.
pub fn fact_to_document(fact: &KnowledgeFact, database_id: &str) -> SchemaDocument {
    match fact {
        KnowledgeFact::Instruction { id, title, content } => {
            let title = normalize_text(title, MAX_IDENT_LEN);
            let content = normalize_text(content, MAX_TEXT_LEN);
            SchemaDocument::new(
                DocumentKind::Instruction,
                format!("INSTRUCTION: {title}\n\n{content}"),
            )
            .with_meta("database_id", database_id)
            .with_meta("instruction_id", id.as_str())
            .with_meta("title", title)
        }
        KnowledgeFact::SqlPair {
            id,
            question,
            sql,
            description,
        } => {
            let question = normalize_text(question, MAX_TEXT_LEN);
            let sql = normalize_text(sql, MAX_TEXT_LEN);
            let mut text = format!("EXAMPLE QUERY:\nQuestion: {question}\nSQL: {sql}");
            if let Some(desc) = description.as_deref().filter(|d| !d.trim().is_empty()) {
                let _ = write!(text, "\nExplanation: {}", normalize_text(desc, MAX_TEXT_LEN));
            }
            SchemaDocument::new(DocumentKind::SqlPair, text)
                .with_meta("database_id", database_id)
                .with_meta("pair_id", id.as_str())
                .with_meta("question", question)
                .with_meta("sql", sql)
        }
    }
}
