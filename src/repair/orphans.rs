//! Record files the backend did not report, and file paths named in
//! whole-batch failures.
use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::frontmatter::id_from_filename;

/// Only this many characters of an error message are scanned for a path.
const MAX_SCAN_CHARS: usize = 64 * 1024;

/// All `*.md` files under `records_dir`, skipping hidden directories such as
/// the quarantine.
pub async fn record_files(records_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![records_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "cannot read records directory");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if !name.starts_with('.') {
                    pending.push(path);
                }
            } else if file_type.is_file() && name.ends_with(".md") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Files whose name-derived id is not among `known_ids` and whose path is not
/// among `known_paths`.
pub fn find_orphans(
    files: &[PathBuf],
    known_ids: &HashSet<String>,
    known_paths: &HashSet<PathBuf>,
) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|file| !known_paths.contains(*file))
        .filter(|file| {
            let id = file
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(id_from_filename);
            id.map_or(true, |id| !known_ids.contains(id))
        })
        .cloned()
        .collect()
}

/// Pull the offending record file out of a backend error message.
///
/// Only a file directly inside `records_dir` is accepted, named either by the
/// configured relative path or by its absolute path under `root`. A longer
/// path that merely ends in the records directory yields `None`.
pub fn extract_failed_path(message: &str, root: &Path, records_dir: &str) -> Option<PathBuf> {
    let dir = records_dir.trim_matches('/');
    if dir.is_empty() {
        return None;
    }
    let scan = match message.char_indices().nth(MAX_SCAN_CHARS) {
        Some((idx, _)) => &message[..idx],
        None => message,
    };
    let pattern = format!(
        r#"(?:^|[\s'"(\[=])((?:[^\s'"()\[\]]{{0,256}}/)?{}/([^\s'"()\[\]/]{{1,255}}\.md))"#,
        regex::escape(dir)
    );
    let re = Regex::new(&pattern).ok()?;
    for caps in re.captures_iter(scan) {
        let candidate = Path::new(&caps[1]);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            continue;
        }
        let relative = Path::new(dir).join(&caps[2]);
        let absolute = root.join(&relative);
        let exact = if candidate.is_absolute() {
            candidate == absolute
        } else {
            candidate.strip_prefix(".").unwrap_or(candidate) == relative
        };
        if exact {
            return Some(absolute);
        }
    }
    None
}
