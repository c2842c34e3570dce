use std::borrow::Cow;

const REDACTED: &str = "[REDACTED]";

const PREFIX_PATTERNS: [&str; 12] = [
    "sk-",
    "ghp_",
    "github_pat_",
    "gho_",
    "xoxb-",
    "xoxp-",
    "xoxa-",
    "xoxs-",
    "glpat-",
    "AKIA",
    "hf_",
    "ya29.",
];

const MARKER_PATTERNS: [&str; 8] = [
    "Bearer ",
    "bearer ",
    "password=",
    "password: ",
    "PASSWORD=",
    "api_key=",
    "token=",
    "secret=",
];

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '+' | '/' | '=')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if !is_secret_char(c) {
            break;
        }
        end = from + i + c.len_utf8();
    }
    end
}

/// Replace the token following each occurrence of `marker`.
///
/// With `keep_marker` the marker text itself survives, so `password=hunter2`
/// becomes `password=[REDACTED]`.
fn redact_after(text: &mut String, marker: &str, keep_marker: bool) {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(marker) {
        let start = search_from + rel;
        let content_start = start + marker.len();
        let end = token_end(text, content_start);
        if end == content_start {
            search_from = content_start;
            continue;
        }
        let replace_from = if keep_marker { content_start } else { start };
        text.replace_range(replace_from..end, REDACTED);
        search_from = replace_from + REDACTED.len();
    }
}

/// Redact secret-looking tokens.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let hit = PREFIX_PATTERNS
        .iter()
        .chain(MARKER_PATTERNS.iter())
        .any(|pattern| input.contains(pattern));
    if !hit {
        return Cow::Borrowed(input);
    }

    let mut text = input.to_string();
    for prefix in PREFIX_PATTERNS {
        redact_after(&mut text, prefix, false);
    }
    for marker in MARKER_PATTERNS {
        redact_after(&mut text, marker, true);
    }
    Cow::Owned(text)
}

/// Turn raw tail text into an excerpt safe to persist and show to a human.
///
/// Control characters go, secrets are redacted, runs of blanks collapse and
/// empty lines are dropped. Long excerpts keep their end, which is where the
/// question is.
pub fn sanitize_excerpt(input: &str, max_chars: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();
    let redacted = redact_secrets(&cleaned);

    let collapsed = redacted
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let count = collapsed.chars().count();
    if count <= max_chars || max_chars == 0 {
        return collapsed;
    }
    let keep = max_chars.saturating_sub(1);
    let tail: String = collapsed.chars().skip(count - keep).collect();
    format!("…{tail}")
}
