//! Section/key lexer.
//!
//! Reads the git-config style syntax used by Hapfiles and `.gitmodules`:
//!
//! ```text
//! # comment
//! [section]
//! key = value
//! [section "name"]
//! key = "quoted value" ; trailing comment
//! ```
//!
//! Section kinds and keys are case-insensitive and returned lowercased.
//! Sections with the same kind and name are kept as separate entries; merging
//! them is up to the caller.

use regex::Regex;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

static HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[\s*([A-Za-z][A-Za-z0-9.-]*)\s*(?:"((?:[^"\\]|\\.)*)")?\s*\]$"#).unwrap()
});

static ENTRY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9-]*)\s*(?:=(.*))?$").unwrap());

/// A `[kind "name"]` section and its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub name: Option<String>,
    /// Line of the section header, 1-based.
    pub line: usize,
    pub entries: Vec<Entry>,
}

/// A single `key = value` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub line: usize,
}

impl Section {
    /// All values for a key, in file order.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// The last value for a key.
    pub fn last(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Header as written, e.g. `host "web"`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} \"{}\"", self.kind, name),
            None => self.kind.clone(),
        }
    }
}

/// Parse text into sections.
pub fn parse_sections(text: &str) -> ConfigResult<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            let header = strip_comment(line);
            let caps = HEADER_REGEX.captures(header).ok_or_else(|| ConfigError::Parse {
                line: line_no,
                message: format!("invalid section header: {}", header),
            })?;
            let name = match caps.get(2) {
                Some(m) => Some(unescape(m.as_str(), line_no)?),
                None => None,
            };
            sections.push(Section {
                kind: caps[1].to_ascii_lowercase(),
                name,
                line: line_no,
                entries: Vec::new(),
            });
            continue;
        }

        let caps = ENTRY_REGEX.captures(line).ok_or_else(|| ConfigError::Parse {
            line: line_no,
            message: format!("expected 'key = value', found: {}", line),
        })?;
        let key = caps[1].to_ascii_lowercase();
        // A bare key is a boolean flag, as in git-config.
        let value = match caps.get(2) {
            Some(m) => parse_value(m.as_str(), line_no)?,
            None => "true".to_string(),
        };

        let section = sections.last_mut().ok_or_else(|| ConfigError::Parse {
            line: line_no,
            message: format!("'{}' appears before any section", key),
        })?;
        section.entries.push(Entry {
            key,
            value,
            line: line_no,
        });
    }

    Ok(sections)
}

/// Drop a trailing comment from a header line. Header names cannot contain
/// `#` or `;` outside of quotes.
fn strip_comment(line: &str) -> &str {
    match line.rfind(']') {
        Some(end) => &line[..=end],
        None => line,
    }
}

/// Decode a value: strip unquoted comments and surrounding whitespace,
/// remove quotes and process escapes.
fn parse_value(raw: &str, line: usize) -> ConfigResult<String> {
    let mut out = String::new();
    let mut in_quotes = false;
    // Length of `out` up to the last quoted or escaped character, so trailing
    // whitespace after it survives trimming.
    let mut keep = 0;
    let mut chars = raw.trim_start().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                keep = out.len();
            }
            '\\' => {
                let escaped = chars.next().ok_or_else(|| ConfigError::Parse {
                    line,
                    message: "trailing backslash".to_string(),
                })?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    '"' | '\\' => escaped,
                    other => {
                        return Err(ConfigError::Parse {
                            line,
                            message: format!("unknown escape \\{}", other),
                        });
                    }
                });
                keep = out.len();
            }
            '#' | ';' if !in_quotes => break,
            _ => {
                out.push(c);
                if in_quotes {
                    keep = out.len();
                }
            }
        }
    }

    if in_quotes {
        return Err(ConfigError::Parse {
            line,
            message: "unterminated quote".to_string(),
        });
    }

    let trimmed_len = out.trim_end().len().max(keep);
    out.truncate(trimmed_len);
    Ok(out)
}

fn unescape(raw: &str, line: usize) -> ConfigResult<String> {
    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => out.push(escaped),
                None => {
                    return Err(ConfigError::Parse {
                        line,
                        message: "trailing backslash in section name".to_string(),
                    });
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
