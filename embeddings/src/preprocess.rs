//! Normalization of raw code text before hashing and embedding.

/// Appended to text that was cut to fit the length budget.
pub const TRUNCATION_MARKER: &str = "...";

/// Collapse whitespace and bound the length of `text`.
///
/// Every run of whitespace (newlines included) becomes a single space and
/// the result is trimmed. When more than `max_length` characters remain, the
/// text is cut and [`TRUNCATION_MARKER`] is appended; the marker counts
/// toward `max_length`, so for `max_length >= 3` the output is at most
/// `max_length` characters long.
///
/// The function is total and idempotent:
/// `preprocess(&preprocess(t, n), n) == preprocess(t, n)`.
pub fn preprocess(text: &str, max_length: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalized.chars().count() <= max_length {
        return normalized;
    }

    let keep = max_length.saturating_sub(TRUNCATION_MARKER.len());
    let mut truncated: String = normalized.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
