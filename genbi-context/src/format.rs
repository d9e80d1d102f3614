use genbi_types::{DocumentKind, SchemaDocument};

fn banner(out: &mut Vec<String>, title: &str, leading_blank: bool) {
    let rule = "=".repeat(60);
    out.push(if leading_blank { format!("\n{rule}") } else { rule.clone() });
    out.push(title.to_string());
    out.push(rule);
}

/// Assemble retrieved documents into the prompt context block.
///
/// Section order is fixed: relationships, instructions, example queries, tables (grouped
/// by table in first-seen order), then anything uncategorized. The generation prompts
/// tell the model to lean on relationships for JOINs, so they lead.
pub fn format_context(docs: &[SchemaDocument]) -> String {
    let mut relationships = Vec::new();
    let mut instructions = Vec::new();
    let mut sql_pairs = Vec::new();
    let mut tables: Vec<(&str, Vec<&SchemaDocument>)> = Vec::new();
    let mut other = Vec::new();

    for doc in docs {
        match doc.kind {
            DocumentKind::Relationships => relationships.push(doc),
            DocumentKind::Instruction => instructions.push(doc),
            DocumentKind::SqlPair => sql_pairs.push(doc),
            DocumentKind::Table | DocumentKind::Column => match doc.table_name() {
                Some(name) => match tables.iter_mut().find(|(t, _)| *t == name) {
                    Some((_, group)) => group.push(doc),
                    None => tables.push((name, vec![doc])),
                },
                None => other.push(doc),
            },
            DocumentKind::Other => other.push(doc),
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let mut started = false;
    let mut section = |parts: &mut Vec<String>, title: &str, docs: &[&SchemaDocument]| {
        if docs.is_empty() {
            return;
        }
        banner(parts, title, started);
        started = true;
        parts.extend(docs.iter().map(|d| d.content.clone()));
    };

    section(&mut parts, "DATABASE RELATIONSHIPS", &relationships);
    section(&mut parts, "DOMAIN KNOWLEDGE & INSTRUCTIONS", &instructions);
    section(&mut parts, "EXAMPLE QUERIES (Similar to this question)", &sql_pairs);

    if !tables.is_empty() {
        banner(&mut parts, "DATABASE SCHEMA", started);
        for (name, group) in &tables {
            parts.push(format!("\n--- Table: {name} ---"));
            parts.extend(group.iter().map(|d| d.content.clone()));
        }
    }

    parts.extend(other.iter().map(|d| d.content.clone()));
    parts.join("\n")
}
