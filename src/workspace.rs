//! Workspace configuration (`.beans.yml`) merged over hard defaults, behind a
//! short time-based cache.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BeansError, Result};
use crate::model::{Priority, RecordType, Status};

pub const WORKSPACE_CONFIG_FILE: &str = ".beans.yml";
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(5);

/// Effective configuration of one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub records_dir: String,
    pub prefix: String,
    pub id_length: usize,
    pub default_status: Status,
    pub default_type: RecordType,
    pub statuses: Vec<Status>,
    /// Statuses at which a cascading status change stops.
    pub terminal_statuses: Vec<Status>,
    pub types: Vec<RecordType>,
    pub priorities: Vec<Priority>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            records_dir: ".beans".into(),
            prefix: "bean-".into(),
            id_length: 4,
            default_status: Status::Todo,
            default_type: RecordType::Task,
            statuses: vec![
                Status::Draft,
                Status::Todo,
                Status::InProgress,
                Status::Completed,
                Status::Scrapped,
            ],
            terminal_statuses: vec![Status::Completed, Status::Scrapped],
            types: vec![
                RecordType::Milestone,
                RecordType::Epic,
                RecordType::Bug,
                RecordType::Feature,
                RecordType::Task,
            ],
            priorities: vec![
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low,
                Priority::Deferred,
            ],
        }
    }
}

impl WorkspaceConfig {
    pub fn records_path(&self, root: &Path) -> PathBuf {
        root.join(&self.records_dir)
    }

    pub fn is_terminal(&self, status: &Status) -> bool {
        self.terminal_statuses.contains(status)
    }

    pub fn validate_status(&self, status: &Status) -> Result<()> {
        if self.statuses.contains(status) {
            return Ok(());
        }
        Err(BeansError::Validation(format!(
            "invalid status '{}'; expected one of: {}",
            status,
            join(&self.statuses)
        )))
    }

    pub fn validate_type(&self, kind: &RecordType) -> Result<()> {
        if self.types.contains(kind) {
            return Ok(());
        }
        Err(BeansError::Validation(format!(
            "invalid type '{}'; expected one of: {}",
            kind,
            join(&self.types)
        )))
    }

    pub fn validate_priority(&self, priority: &Priority) -> Result<()> {
        if self.priorities.contains(priority) {
            return Ok(());
        }
        Err(BeansError::Validation(format!(
            "invalid priority '{}'; expected one of: {}",
            priority,
            join(&self.priorities)
        )))
    }

    /// Strip the workspace prefix to get the short code shown in listings.
    pub fn code_for(&self, id: &str) -> String {
        if !self.prefix.is_empty() {
            if let Some(rest) = id.strip_prefix(&self.prefix) {
                if !rest.is_empty() {
                    return rest.to_string();
                }
            }
        }
        crate::normalize::derive_code(id)
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceFile {
    #[serde(default)]
    beans: Option<BeansSection>,
}

#[derive(Debug, Default, Deserialize)]
struct BeansSection {
    path: Option<String>,
    prefix: Option<String>,
    id_length: Option<usize>,
    default_status: Option<String>,
    default_type: Option<String>,
    statuses: Option<Vec<NamedEntry>>,
    terminal_statuses: Option<Vec<NamedEntry>>,
    types: Option<Vec<NamedEntry>>,
    priorities: Option<Vec<NamedEntry>>,
}

/// Enumerations may be listed as plain names or as `{ name: ... }` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamedEntry {
    Name(String),
    Detailed { name: String },
}

impl NamedEntry {
    fn name(&self) -> &str {
        match self {
            NamedEntry::Name(n) => n,
            NamedEntry::Detailed { name } => name,
        }
    }
}

fn names<T: for<'a> From<&'a str>>(entries: Option<Vec<NamedEntry>>) -> Option<Vec<T>> {
    let list: Vec<T> = entries?
        .iter()
        .map(NamedEntry::name)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(T::from)
        .collect();
    (!list.is_empty()).then_some(list)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parse `.beans.yml` content and merge it over the defaults.
pub fn parse(content: &str) -> std::result::Result<WorkspaceConfig, serde_yaml::Error> {
    let file: WorkspaceFile = serde_yaml::from_str(content)?;
    let mut cfg = WorkspaceConfig::default();
    let Some(section) = file.beans else {
        return Ok(cfg);
    };
    if let Some(path) = non_empty(section.path) {
        cfg.records_dir = path;
    }
    if let Some(prefix) = section.prefix {
        cfg.prefix = prefix.trim().to_string();
    }
    if let Some(len) = section.id_length.filter(|l| *l > 0) {
        cfg.id_length = len;
    }
    if let Some(statuses) = names(section.statuses) {
        cfg.statuses = statuses;
    }
    if let Some(terminal) = names(section.terminal_statuses) {
        cfg.terminal_statuses = terminal;
    }
    if let Some(types) = names(section.types) {
        cfg.types = types;
    }
    if let Some(priorities) = names(section.priorities) {
        cfg.priorities = priorities;
    }
    if let Some(s) = non_empty(section.default_status) {
        cfg.default_status = Status::from(s);
    }
    if let Some(t) = non_empty(section.default_type) {
        cfg.default_type = RecordType::from(t);
    }
    Ok(cfg)
}

/// Reads the workspace config at most once per TTL window.
#[derive(Debug)]
pub struct ConfigCache {
    root: PathBuf,
    ttl: Duration,
    slot: Mutex<Option<(Instant, Arc<WorkspaceConfig>)>>,
}

impl ConfigCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn get(&self) -> Arc<WorkspaceConfig> {
        if let Some(cfg) = self.fresh() {
            return cfg;
        }
        let cfg = Arc::new(self.read().await);
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some((Instant::now(), cfg.clone()));
        }
        cfg
    }

    fn fresh(&self) -> Option<Arc<WorkspaceConfig>> {
        let slot = self.slot.lock().ok()?;
        let (loaded_at, cfg) = slot.as_ref()?;
        (loaded_at.elapsed() < self.ttl).then(|| cfg.clone())
    }

    async fn read(&self) -> WorkspaceConfig {
        let path = self.root.join(WORKSPACE_CONFIG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match parse(&content) {
                Ok(cfg) => {
                    debug!(path = %path.display(), "loaded workspace config");
                    cfg
                }
                Err(err) => {
                    warn!(?err, path = %path.display(), "invalid workspace config; using defaults");
                    WorkspaceConfig::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => WorkspaceConfig::default(),
            Err(err) => {
                warn!(?err, path = %path.display(), "failed to read workspace config; using defaults");
                WorkspaceConfig::default()
            }
        }
    }
}
