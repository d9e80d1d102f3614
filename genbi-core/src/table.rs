use genbi_types::ExecutionOutcome;
use serde_json::Value;

pub const DEFAULT_MAX_WIDTH: usize = 100;
const MIN_WIDTH: usize = 10;

fn cell(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => "NULL".into(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn clip(text: &str, max_width: usize) -> String {
    if text.chars().count() <= max_width {
        return text.to_string();
    }
    let keep = max_width.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    format!(" {text}{} ", " ".repeat(width.saturating_sub(len)))
}

/// Render rows as a boxed ASCII table with a `Total rows: N` footer.
///
/// Column widths are clamped to `10..=max_width`; longer values end in `...`.
pub fn format_table(outcome: &ExecutionOutcome, max_width: usize) -> String {
    if !outcome.success || outcome.rows.is_empty() {
        return "No results".into();
    }
    let max_width = max_width.max(MIN_WIDTH);

    let widths: Vec<usize> = outcome
        .columns
        .iter()
        .map(|col| {
            outcome
                .rows
                .iter()
                .map(|row| cell(row.get(col)).chars().count())
                .fold(col.chars().count().max(MIN_WIDTH), usize::max)
                .min(max_width)
        })
        .collect();

    let separator = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |cells: Vec<String>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| pad(&clip(c, max_width), *w))
            .collect();
        format!("|{}|", padded.join("|"))
    };

    let mut lines = vec![separator.clone()];
    lines.push(line(outcome.columns.clone()));
    lines.push(separator.clone());
    for row in &outcome.rows {
        lines.push(line(outcome.columns.iter().map(|c| cell(row.get(c))).collect()));
    }
    lines.push(separator);
    lines.push(format!("Total rows: {}", outcome.row_count));
    lines.join("\n")
}
