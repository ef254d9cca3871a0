//! String and path helpers shared by the resolvers and the assembler

use std::path::Path;

/// Split `input` on any character in `delims`, dropping empty pieces.
pub fn split_any(input: &str, delims: &str) -> Vec<String> {
    input
        .split(|c: char| delims.contains(c))
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove every occurrence of the characters in `chars`.
pub fn strip(input: &str, chars: &str) -> String {
    input.chars().filter(|c| !chars.contains(*c)).collect()
}

/// Trim the characters in `chars` from both ends.
pub fn trim<'a>(input: &'a str, chars: &str) -> &'a str {
    input.trim_matches(|c: char| chars.contains(c))
}

/// Filesystem-safe name for a cache entry keyed by `entity`.
///
/// Path separators become dots and glob stars are dropped, so
/// `/usr/lib/libQt6*` maps to `.usr.lib.libQt6`.
pub fn cache_name(entity: &str) -> String {
    strip(&entity.replace('/', "."), "*")
}

/// Render a command token, single-quoting it when the shell would split it.
pub fn quote_token(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'))
    {
        format!("'{}'", token.replace('\'', r"'\''"))
    } else {
        token.to_string()
    }
}

/// Render a full command line, quoting tokens as needed.
pub fn render_command(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| quote_token(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last path component, or the whole string when there is none.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

/// Everything before the last `/`, or `/` for top-level paths.
pub fn dirname(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => ".",
    }
}

/// Resolve `.` and `..` components of an absolute path without touching
/// the filesystem.
pub fn normalize_lexical(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether a directory exists and has at least one entry.
pub async fn dir_has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
