//! Frontmatter handling for record files: splitting, lenient parsing, YAML
//! scalar quoting and line-level patching.
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub type Fields = Map<String, Value>;

const DELIMITER: &str = "---";
const INDICATORS: &[char] = &[
    '-', '?', ':', ',', '[', ']', '{', '}', '#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`',
];

static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*):(?:\s+(.*?))?\s*$").unwrap());

/// Split file content into `(header, body)`. `None` when there is no
/// well-formed frontmatter block.
pub fn split(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

/// Parse a header block. Valid YAML is parsed structurally; anything else
/// falls back to reading top-level `key: value` lines one by one.
pub fn parse(header: &str) -> Fields {
    if let Ok(serde_yaml::Value::Mapping(map)) = serde_yaml::from_str::<serde_yaml::Value>(header) {
        let mut fields = Fields::new();
        for (k, v) in map {
            let (Some(key), Ok(value)) = (k.as_str(), serde_json::to_value(&v)) else {
                continue;
            };
            fields.insert(key.to_string(), value);
        }
        return fields;
    }
    parse_lenient(header)
}

fn parse_lenient(header: &str) -> Fields {
    let mut fields = Fields::new();
    for line in header.lines() {
        let Some(caps) = KEY_LINE.captures(line) else {
            continue;
        };
        let Some(value) = caps.get(2).map(|m| m.as_str()).filter(|v| !v.is_empty()) else {
            continue;
        };
        fields.insert(caps[1].to_string(), Value::String(unquote(value)));
    }
    fields
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        if let Ok(s) = serde_json::from_str::<String>(value) {
            return s;
        }
        return value[1..value.len() - 1].to_string();
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].replace("''", "'");
    }
    value.to_string()
}

/// Read a field as a non-empty string; numbers are accepted as text.
pub fn field_str(fields: &Fields, key: &str) -> Option<String> {
    let s = match fields.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Whether `value` must be quoted to survive a YAML round trip as the same string.
pub fn needs_quotes(value: &str) -> bool {
    if value.is_empty()
        || value.starts_with(INDICATORS)
        || value.contains(": ")
        || value.contains(" #")
        || value.contains('\n')
        || value.contains('\r')
        || value.trim() != value
    {
        return true;
    }
    // Plain scalars such as `true`, `null` or `42` would read back as non-strings.
    !matches!(
        serde_yaml::from_str::<serde_yaml::Value>(value),
        Ok(serde_yaml::Value::String(ref s)) if s == value
    )
}

/// Render `value` as a YAML scalar, double-quoting only when required.
pub fn quote_scalar(value: &str) -> String {
    if !needs_quotes(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Set top-level keys by rewriting their lines in place, leaving every other
/// line of the file untouched. Missing keys are appended to the header; a file
/// without frontmatter gets a new block.
pub fn patch(content: &str, updates: &[(&str, &str)]) -> String {
    let Some((header, body)) = split(content) else {
        let mut out = String::from("---\n");
        for (key, value) in updates {
            out.push_str(&format!("{key}: {}\n", quote_scalar(value)));
        }
        out.push_str("---\n");
        out.push_str(content);
        return out;
    };

    let mut lines: Vec<String> = header.lines().map(str::to_string).collect();
    for (key, value) in updates {
        let rendered = format!("{key}: {}", quote_scalar(value));
        let prefix = format!("{key}:");
        let found = lines.iter().position(|l| {
            l.strip_prefix(&prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t']))
        });
        match found {
            Some(idx) => {
                lines[idx] = rendered;
                // Drop continuation lines of a multi-line value.
                while lines
                    .get(idx + 1)
                    .is_some_and(|l| l.starts_with([' ', '\t']))
                {
                    lines.remove(idx + 1);
                }
            }
            None => lines.push(rendered),
        }
    }

    let mut out = String::from("---\n");
    for line in &lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    out
}

/// Record id encoded in a file name: the segment before `--`.
pub fn id_from_filename(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(".md").unwrap_or(name);
    let (id, _) = stem.split_once("--")?;
    let id = id.trim();
    (!id.is_empty()).then_some(id)
}

/// Title recovered from a file name: the slug after `--`, de-slugified.
pub fn title_from_filename(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".md").unwrap_or(name);
    let (_, slug) = stem.split_once("--")?;
    let words: Vec<&str> = slug
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .collect();
    let title = words.join(" ");
    let mut chars = title.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}
