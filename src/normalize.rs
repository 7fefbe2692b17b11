//! Converts backend payloads, whose field names vary across beans versions,
//! into the canonical [`Record`].
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::{BeansError, Result};
use crate::model::{Priority, Record, RecordType, Status};
use crate::workspace::WorkspaceConfig;

/// How strictly optional-but-expected fields are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `slug`, `path`, `body` and `etag` must be present.
    Strict,
    /// Missing `slug`, `path`, `body` and `etag` become empty strings.
    Partial,
}

const PARENT_KEYS: &[&str] = &["parentId", "parent_id", "parent"];
const BLOCKING_KEYS: &[&str] = &["blockingIds", "blocking_ids", "blocking"];
const BLOCKED_BY_KEYS: &[&str] = &["blockedByIds", "blocked_by_ids", "blockedBy", "blocked_by"];
const CREATED_KEYS: &[&str] = &["createdAt", "created_at"];
const UPDATED_KEYS: &[&str] = &["updatedAt", "updated_at"];

pub fn normalize(raw: &Value, mode: Mode, cfg: &WorkspaceConfig) -> Result<Record> {
    if !raw.is_object() {
        return Err(BeansError::parse("record is not an object", raw.to_string()));
    }
    let id = required(raw, "id")?;
    let title = required(raw, "title")?;
    let status = required(raw, "status")?;
    let kind = required(raw, "type")?;

    let expected = |key: &str| -> Result<String> {
        match (text(raw, key), mode) {
            (Some(v), _) => Ok(v.to_string()),
            (None, Mode::Partial) => Ok(String::new()),
            (None, Mode::Strict) => Err(BeansError::parse(
                format!("missing field '{key}' for record {id}"),
                raw.to_string(),
            )),
        }
    };
    let slug = expected("slug")?;
    let path = expected("path")?;
    let body = expected("body")?;
    let etag = expected("etag")?;

    Ok(Record {
        code: cfg.code_for(&id),
        slug,
        path,
        title,
        body,
        status: Status::from(status),
        kind: RecordType::from(kind),
        priority: first_str(raw, &["priority"]).map(Priority::from),
        tags: string_list(raw, &["tags"]),
        parent: first_str(raw, PARENT_KEYS).map(str::to_string),
        blocking: string_list(raw, BLOCKING_KEYS),
        blocked_by: string_list(raw, BLOCKED_BY_KEYS),
        created_at: timestamp(raw, CREATED_KEYS, &id),
        updated_at: timestamp(raw, UPDATED_KEYS, &id),
        etag,
        id,
    })
}

/// Short code for an id without a known prefix: the segment after the last `-`.
pub fn derive_code(id: &str) -> String {
    match id.rsplit_once('-') {
        Some((_, tail)) if !tail.is_empty() => tail.to_string(),
        _ => id.to_string(),
    }
}

fn required(raw: &Value, key: &str) -> Result<String> {
    match text(raw, key) {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(BeansError::parse(
            format!("missing required field '{key}'"),
            raw.to_string(),
        )),
    }
}

fn text<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

/// Related ids may arrive as plain strings or as `{ "id": ... }` objects.
fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
    .filter(|s| !s.trim().is_empty())
}

fn first_str<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(*k).and_then(id_of))
}

fn string_list(raw: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        let list: Vec<String> = match raw.get(*key) {
            Some(Value::Array(items)) => items.iter().filter_map(id_of).map(str::to_string).collect(),
            Some(other) => id_of(other).map(|s| vec![s.to_string()]).unwrap_or_default(),
            None => Vec::new(),
        };
        if !list.is_empty() {
            return list;
        }
    }
    Vec::new()
}

fn timestamp(raw: &Value, keys: &[&str], id: &str) -> DateTime<Utc> {
    let Some(value) = keys
        .iter()
        .find_map(|k| text(raw, k).filter(|v| !v.trim().is_empty()))
    else {
        return Utc::now();
    };
    match DateTime::parse_from_rfc3339(value.trim()) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(err) => {
            warn!(record = id, value, %err, "unparseable timestamp; using current time");
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> WorkspaceConfig {
        WorkspaceConfig {
            prefix: "app-".into(),
            ..Default::default()
        }
    }

    fn full() -> Value {
        json!({
            "id": "app-k3x9",
            "slug": "fix-login",
            "path": ".beans/app-k3x9--fix-login.md",
            "title": "Fix login",
            "body": "Steps...",
            "status": "in-progress",
            "type": "bug",
            "priority": "high",
            "tags": ["auth"],
            "parentId": "app-e1",
            "blockingIds": ["app-b2"],
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-02T10:00:00+02:00",
            "etag": "abc"
        })
    }

    #[test]
    fn strict_accepts_complete_payload() {
        let r = normalize(&full(), Mode::Strict, &cfg()).unwrap();
        assert_eq!(r.code, "k3x9");
        assert_eq!(r.status, Status::InProgress);
        assert_eq!(r.kind, RecordType::Bug);
        assert_eq!(r.priority, Some(Priority::High));
        assert_eq!(r.parent.as_deref(), Some("app-e1"));
        assert_eq!(r.blocking, vec!["app-b2"]);
        assert!(r.blocked_by.is_empty());
        assert_eq!(r.updated_at.to_rfc3339(), "2024-05-02T08:00:00+00:00");
    }

    #[test]
    fn strict_rejects_missing_etag_but_partial_defaults_it() {
        let mut raw = full();
        raw.as_object_mut().unwrap().remove("etag");
        raw.as_object_mut().unwrap().remove("path");
        let err = normalize(&raw, Mode::Strict, &cfg()).unwrap_err();
        assert!(matches!(err, BeansError::Parse { .. }));

        let r = normalize(&raw, Mode::Partial, &cfg()).unwrap();
        assert_eq!(r.etag, "");
        assert_eq!(r.path, "");
    }

    #[test]
    fn required_fields_are_enforced_in_both_modes() {
        for key in ["id", "title", "status", "type"] {
            let mut raw = full();
            raw[key] = json!("  ");
            let err = normalize(&raw, Mode::Partial, &cfg()).unwrap_err();
            match err {
                BeansError::Parse { message, raw } => {
                    assert!(message.contains(key));
                    assert!(!raw.is_empty());
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn legacy_aliases_are_resolved_in_order() {
        let raw = json!({
            "id": "app-1", "title": "t", "status": "todo", "type": "task",
            "parentId": "",
            "parent_id": "app-legacy",
            "parent": { "id": "app-object" },
            "blocked_by": [{ "id": "app-2" }, "app-3"],
            "created_at": "2024-01-01T00:00:00Z"
        });
        let r = normalize(&raw, Mode::Partial, &cfg()).unwrap();
        assert_eq!(r.parent.as_deref(), Some("app-legacy"));
        assert_eq!(r.blocked_by, vec!["app-2", "app-3"]);
        assert_eq!(r.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn bad_dates_fall_back_to_now() {
        let mut raw = full();
        raw["createdAt"] = json!("yesterday-ish");
        let before = Utc::now();
        let r = normalize(&raw, Mode::Strict, &cfg()).unwrap();
        assert!(r.created_at >= before);
    }

    #[test]
    fn code_derivation() {
        assert_eq!(derive_code("proj-ab12"), "ab12");
        assert_eq!(derive_code("plain"), "plain");
    }
}
