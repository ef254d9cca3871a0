//! Lexical helpers for scanning shell scripts
//!
//! This is a heuristic scanner, not a shell parser. Nothing found in a
//! script is ever executed; command substitutions are refused outright.

use crate::util;
use std::collections::HashMap;

const DELIMITERS: &str = " \t()=;\"|&<>`";

const BUILTINS: &[&str] = &[
    "echo", "printf", "cd", "exec", "export", "set", "unset", "test", "true", "false", "read",
    "shift", "exit", "return", "local", "eval", "source", ".", "[", "[[", "]", "]]", "if", "then",
    "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac", "in", "function",
    "{", "}", "!",
];

const DECLARATIONS: &[&str] = &["export ", "local ", "readonly ", "declare "];

pub fn is_builtin(token: &str) -> bool {
    BUILTINS.contains(&token)
}

/// Interpreter words of a `#!` line, flags dropped.
///
/// `#!/usr/bin/env bash -e` yields `["/usr/bin/env", "bash"]`.
pub fn shebang(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix("#!")?;
    let words: Vec<String> = rest
        .split_whitespace()
        .filter(|w| !w.starts_with('-'))
        .map(str::to_string)
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

/// Whether the interpreter is one whose scripts are not shell.
pub fn is_python(interpreter: &[String]) -> bool {
    interpreter
        .iter()
        .any(|w| util::basename(w).starts_with("python"))
}

/// Split a line into candidate words.
///
/// Single-quoted spans are literal text and never yield candidates.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut visible = String::with_capacity(line.len());
    let mut quoted = false;
    for c in line.chars() {
        if c == '\'' {
            quoted = !quoted;
            visible.push(' ');
        } else if quoted {
            visible.push(' ');
        } else {
            visible.push(c);
        }
    }
    util::split_any(&visible, DELIMITERS)
}

/// A `KEY=VALUE` assignment, if the whole line is one.
///
/// Values with embedded whitespace and function definitions are ignored.
pub fn assignment(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    for prefix in DECLARATIONS {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim_start();
        }
    }

    let (key, value) = line.split_once('=')?;
    let valid_key = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_key || value.is_empty() || value == "()" || value.contains(char::is_whitespace) {
        return None;
    }

    let value = ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

/// Split off a here-document: the code before `<<` and its terminator.
pub fn split_heredoc(line: &str) -> (&str, Option<String>) {
    let Some(pos) = line.find("<<") else {
        return (line, None);
    };
    let rest = &line[pos + 2..];
    if rest.starts_with('<') {
        // here-string
        return (line, None);
    }
    let word = rest
        .trim_start_matches('-')
        .split_whitespace()
        .next()
        .map(|w| util::strip(w, "'\""))
        .unwrap_or_default();
    if word.is_empty() {
        return (line, None);
    }
    (&line[..pos], Some(word))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Every reference was known
    Resolved(String),
    /// At least one reference is unknown; the text keeps it verbatim
    Partial(String),
    /// Command substitution, which is never evaluated
    Unsafe,
}

/// Variables assigned so far in a script
#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    vars: HashMap<String, String>,
}

impl VariableTable {
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Record an assignment, expanding known references in the value.
    pub fn assign(&mut self, key: String, raw: String) {
        let value = match self.substitute(&raw) {
            Substitution::Resolved(v) | Substitution::Partial(v) => v,
            Substitution::Unsafe => raw,
        };
        self.vars.insert(key, value);
    }

    /// Expand `$NAME`, `${NAME}` and `${NAME:-default}` references.
    pub fn substitute(&self, token: &str) -> Substitution {
        if token.contains("$(") || token.contains('`') {
            return Substitution::Unsafe;
        }

        let mut out = String::with_capacity(token.len());
        let mut unresolved = false;
        let mut rest = token;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            if let Some(braced) = rest.strip_prefix('{') {
                let Some(end) = braced.find('}') else {
                    return Substitution::Partial(token.to_string());
                };
                let inner = &braced[..end];
                let (name, default) = match inner.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (inner, None),
                };
                match (self.get(name), default) {
                    (Some(value), _) => out.push_str(value),
                    (None, Some(default)) => out.push_str(default),
                    (None, None) => {
                        unresolved = true;
                        out.push_str("${");
                        out.push_str(inner);
                        out.push('}');
                    }
                }
                rest = &braced[end + 1..];
            } else {
                let len = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                let name = &rest[..len];
                match self.get(name) {
                    Some(value) if !name.is_empty() => out.push_str(value),
                    _ => {
                        unresolved = true;
                        out.push('$');
                        out.push_str(name);
                    }
                }
                rest = &rest[len..];
            }
        }
        out.push_str(rest);

        if unresolved {
            Substitution::Partial(out)
        } else {
            Substitution::Resolved(out)
        }
    }
}
