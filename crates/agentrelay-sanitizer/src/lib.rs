//! Output sanitization.
//!
//! Every line the executor reads from the agent subprocess, and every
//! comment body bound for the GitHub API, passes through [`escape_html`]
//! before it touches a task's log or a rendered comment. This crate has no
//! dependencies and no collaborators; it is pure text transformation.

/// Maximum size, in bytes, the comment updater tool accepts for a single
/// `update_coordinating_comment` body (see the design's §4.6).
pub const MAX_COMMENT_BYTES: usize = 65_536;

/// HTML-escapes `text` so it is safe to embed in a Markdown/HTML rendered
/// GitHub comment or the inspection UI's log view.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Truncates `text` to at most `max_bytes`, respecting UTF-8 char
/// boundaries, and appends a marker noting truncation occurred.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let marker = "\n… (truncated)";
    let budget = max_bytes.saturating_sub(marker.len());
    let mut end = budget.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], marker)
}

/// Validates and sanitizes a comment body for the comment updater tool:
/// non-empty, HTML-escaped, and bounded to [`MAX_COMMENT_BYTES`].
pub fn sanitize_comment_body(body: &str) -> Result<String, String> {
    if body.trim().is_empty() {
        return Err("comment body must not be empty".to_string());
    }
    let escaped = escape_html(body);
    if escaped.len() > MAX_COMMENT_BYTES {
        return Err(format!(
            "comment body of {} bytes exceeds the {MAX_COMMENT_BYTES}-byte limit after sanitization",
            escaped.len()
        ));
    }
    Ok(escaped)
}
