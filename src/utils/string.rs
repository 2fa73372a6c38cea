/// Find the largest valid UTF-8 boundary at or before the given byte index.
/// Returns the byte index that is safe to slice at.
#[inline]
fn safe_byte_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    s.char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0)
}

/// Truncate a string with a marker if it exceeds the maximum length (UTF-8 safe).
///
/// Returns an owned String. The max_len is in bytes, but truncation respects
/// UTF-8 character boundaries to avoid panics with multi-byte characters.
#[inline]
pub fn truncate_with_marker(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = safe_byte_boundary(s, max_len);
        format!("{}...[truncated]", &s[..boundary])
    }
}

/// Truncate a string to maximum length, returning a borrowed slice (UTF-8 safe).
#[inline]
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let boundary = safe_byte_boundary(s, max_len);
        &s[..boundary]
    }
}

/// Truncate a string to maximum character count (UTF-8 safe).
/// Adds "..." suffix if truncated.
#[inline]
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

/// Derive a branch-safe slug from a task description.
///
/// Lowercases, replaces every non-alphanumeric run with a single hyphen,
/// trims leading/trailing hyphens, and caps the result at `max_len` chars.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len().min(max_len));
    let mut last_hyphen = true;

    for c in text.chars() {
        if slug.len() >= max_len {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
