//! Tolerant JSON extraction from model text.

/// Byte range of the first complete JSON object starting at or after `from`.
///
/// Brace balancing skips string literals, so braces inside quoted values do
/// not end the object early.
pub fn balanced_object_span(text: &str, from: usize) -> Option<(usize, usize)> {
    let rel = text.get(from..)?.find('{')?;
    let start = from + rel;

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some((start, end));
                }
            }
            _ => {}
        }
    }
    None
}

/// First `{...}` after `from` that parses as a JSON object.
pub fn object_at(text: &str, from: usize) -> Option<serde_json::Map<String, serde_json::Value>> {
    let (start, end) = balanced_object_span(text, from)?;
    match serde_json::from_str::<serde_json::Value>(&text[start..end]) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Every parseable top-level JSON object in `text`, in order.
pub fn objects_in(text: &str) -> Vec<serde_json::Map<String, serde_json::Value>> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some((start, end)) = balanced_object_span(text, cursor) {
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_str::<serde_json::Value>(&text[start..end])
        {
            out.push(map);
            cursor = end;
        } else {
            // Not valid JSON at this brace; look for a later object.
            cursor = start + 1;
        }
    }
    out
}

/// The whole text as a JSON object, after stripping one surrounding fence.
pub fn whole_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let body = strip_code_fences(text);
    match serde_json::from_str::<serde_json::Value>(body.trim()) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Removes a leading ```lang line and a trailing ``` line, if present.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}\n... (truncated, {} total characters)", s.chars().count())
}
