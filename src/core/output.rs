//! Compact output rendering helpers for CLI surfaces and result messages.
//!
//! Keeps captured process output bounded before it lands in a record's
//! `result` column or on the terminal.

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Keep the first `max_chars` characters of multi-line output, marking truncation.
pub fn bounded_block(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim_end();
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}\n[truncated]", head)
    } else {
        head
    }
}
