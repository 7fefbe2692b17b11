//! Version-control history of record files.
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::frontmatter::{self, field_str, Fields};

pub const MAX_REVISIONS: usize = 20;
const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The two history primitives the repair pipeline needs. Missing repositories
/// or history simply yield nothing.
#[async_trait]
pub trait History: Send + Sync {
    /// Revisions touching `file`, newest first.
    async fn revisions(&self, file: &Path, limit: usize) -> Vec<String>;
    async fn content_at(&self, file: &Path, revision: &str) -> Option<String>;
}

/// Reads history through the `git` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitHistory;

impl GitHistory {
    async fn git(file: &Path, args: &[&str]) -> Option<String> {
        let dir = file.parent().filter(|p| !p.as_os_str().is_empty())?;
        let output = tokio::time::timeout(
            GIT_TIMEOUT,
            Command::new("git")
                .current_dir(dir)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            debug!(file = %file.display(), stderr = %String::from_utf8_lossy(&output.stderr).trim(), "git history unavailable");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl History for GitHistory {
    async fn revisions(&self, file: &Path, limit: usize) -> Vec<String> {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let limit = limit.to_string();
        Self::git(file, &["log", "--format=%H", "-n", &limit, "--", name])
            .await
            .map(|out| {
                out.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn content_at(&self, file: &Path, revision: &str) -> Option<String> {
        let name = file.file_name()?.to_str()?;
        let spec = format!("{revision}:./{name}");
        Self::git(file, &["show", &spec]).await
    }
}

/// History source for workspaces that are not under version control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

#[async_trait]
impl History for NoHistory {
    async fn revisions(&self, _file: &Path, _limit: usize) -> Vec<String> {
        Vec::new()
    }

    async fn content_at(&self, _file: &Path, _revision: &str) -> Option<String> {
        None
    }
}

/// Walk up to [`MAX_REVISIONS`] revisions newest first and return the
/// frontmatter of the most recent one carrying every `required` field, or the
/// one carrying the most of them when none is complete.
pub async fn recover_fields(history: &dyn History, file: &Path, required: &[&str]) -> Option<Fields> {
    let mut best: Option<(usize, Fields)> = None;
    for rev in history.revisions(file, MAX_REVISIONS).await {
        let Some(content) = history.content_at(file, &rev).await else {
            continue;
        };
        let Some((header, _)) = frontmatter::split(&content) else {
            continue;
        };
        let fields = frontmatter::parse(header);
        let score = required
            .iter()
            .filter(|k| field_str(&fields, k).is_some())
            .count();
        if score == required.len() {
            debug!(file = %file.display(), revision = %rev, "complete frontmatter found in history");
            return Some(fields);
        }
        if score > 0 && best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, fields));
        }
    }
    best.map(|(_, fields)| fields)
}
