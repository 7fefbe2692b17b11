use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-backed enum with well-known variants plus a `Custom`
/// escape hatch for values a workspace declares on its own.
macro_rules! workspace_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Custom(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Custom(s) => s,
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($text => $name::$variant,)+
                    other => $name::Custom(other.to_string()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name::from(s.as_str())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> Self {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

workspace_enum!(
    /// Workflow state of a record.
    Status {
        Draft => "draft",
        Todo => "todo",
        InProgress => "in-progress",
        Completed => "completed",
        Scrapped => "scrapped",
    }
);

workspace_enum!(
    /// Kind of work a record describes.
    RecordType {
        Milestone => "milestone",
        Epic => "epic",
        Bug => "bug",
        Feature => "feature",
        Task => "task",
    }
);

workspace_enum!(
    Priority {
        Critical => "critical",
        High => "high",
        Normal => "normal",
        Low => "low",
        Deferred => "deferred",
    }
);

/// Canonical record as exposed past normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub code: String,
    pub slug: String,
    pub path: String,
    pub title: String,
    pub body: String,
    pub status: Status,
    #[serde(rename = "type")]
    pub kind: RecordType,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub parent: Option<String>,
    pub blocking: Vec<String>,
    pub blocked_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: String,
}

/// Selection passed to `list_records`; an empty filter means "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub status: Vec<Status>,
    pub kind: Vec<RecordType>,
    pub search: Option<String>,
    pub parent: Option<String>,
}

impl RecordFilter {
    pub fn by_parent(parent: &str) -> Self {
        Self {
            parent: Some(parent.to_string()),
            ..Default::default()
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.status.is_empty()
            && self.kind.is_empty()
            && self.search.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.parent.is_none()
    }

    /// In-process evaluation used when serving cached records.
    pub fn matches(&self, record: &Record) -> bool {
        if !self.status.is_empty() && !self.status.contains(&record.status) {
            return false;
        }
        if !self.kind.is_empty() && !self.kind.contains(&record.kind) {
            return false;
        }
        if let Some(parent) = &self.parent {
            if record.parent.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let hit = [&record.id, &record.title, &record.body]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Fields for a new record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Partial update. `parent: Some(None)` clears the parent link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Option<String>>,
}

impl RecordUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn clear_parent() -> Self {
        Self {
            parent: Some(None),
            ..Default::default()
        }
    }
}

/// Per-item result of an aggregate mutation.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub index: usize,
    pub result: crate::error::Result<T>,
}
