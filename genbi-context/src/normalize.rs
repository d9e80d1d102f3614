/// Cap for free text (fact bodies, questions, SQL examples).
pub const MAX_TEXT_LEN: usize = 1000;
/// Cap for table and column descriptions.
pub const MAX_DESCRIPTION_LEN: usize = 500;
/// Cap for column descriptions inside a table listing.
pub const MAX_INLINE_DESCRIPTION_LEN: usize = 300;
/// Cap for identifiers (table, column, constraint names, titles).
pub const MAX_IDENT_LEN: usize = 200;
/// Cap for SQL type names.
pub const MAX_TYPE_LEN: usize = 100;

fn is_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1f | 0x7f..=0x9f)
}

/// Reduce `text` to single-spaced printable ASCII of at most `max_len` characters.
///
/// Control characters are dropped (ASCII whitespace controls count as whitespace),
/// anything else outside `' '..='~'` becomes a space.
/// Embedding providers have rejected raw schema comments, so every indexed field goes
/// through here.
pub fn normalize_text(text: &str, max_len: usize) -> String {
    let printable: String = text
        .chars()
        .filter(|c| c.is_ascii_whitespace() || !is_control(*c))
        .map(|c| if (' '..='~').contains(&c) { c } else { ' ' })
        .collect();
    let collapsed = printable.split_whitespace().collect::<Vec<_>>().join(" ");
    // Pure ASCII from here on, so byte and char offsets agree.
    let end = collapsed.len().min(max_len);
    collapsed[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_controls_and_non_ascii() {
        assert_eq!(normalize_text("  caf\u{e9}\u{0007} menu\t\n ", 100), "caf menu");
        assert_eq!(normalize_text("a\u{0}b", 100), "ab");
        assert_eq!(normalize_text("", 10), "");
    }

    #[test]
    fn long_noisy_input_is_bounded() {
        let unit = "r\u{e9}sum\u{e9}\u{1}\u{7f}  \u{85}x ";
        let mut input = String::new();
        while input.chars().count() < 2000 {
            input.push_str(unit);
        }
        let input: String = input.chars().take(2000).collect();

        let out = normalize_text(&input, MAX_TEXT_LEN);
        assert!(out.len() <= MAX_TEXT_LEN);
        assert!(out.chars().all(|c| (' '..='~').contains(&c)));
        assert!(!out.contains("  "));
        assert_eq!(out, out.trim());
    }

    #[test]
    fn truncation_never_leaves_trailing_space() {
        assert_eq!(normalize_text("ab cd", 3), "ab");
    }
}
