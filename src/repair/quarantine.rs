use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Subdirectory of the records directory holding isolated files.
pub const QUARANTINE_DIR: &str = ".quarantine";
/// Suffix that keeps quarantined files out of `*.md` discovery.
pub const QUARANTINE_SUFFIX: &str = ".quarantined";

/// Destination for `file`; never overwrites an earlier quarantined copy.
pub async fn quarantine_target(records_dir: &Path, file: &Path) -> io::Result<PathBuf> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no name"))?;
    let dir = records_dir.join(QUARANTINE_DIR);
    let target = dir.join(format!("{name}{QUARANTINE_SUFFIX}"));
    if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    Ok(dir.join(format!("{name}.{stamp}{QUARANTINE_SUFFIX}")))
}

/// Move `file` into the quarantine directory with a single rename.
pub async fn quarantine_file(records_dir: &Path, file: &Path) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(records_dir.join(QUARANTINE_DIR)).await?;
    let target = quarantine_target(records_dir, file).await?;
    tokio::fs::rename(file, &target).await?;
    info!(from = %file.display(), to = %target.display(), "quarantined record file");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn moves_file_and_avoids_collisions() {
        let td = tempdir().unwrap();
        let records = td.path().join(".beans");
        std::fs::create_dir_all(&records).unwrap();

        let file = records.join("a--x.md");
        std::fs::write(&file, "one").unwrap();
        let first = quarantine_file(&records, &file).await.unwrap();
        assert_eq!(first, records.join(".quarantine/a--x.md.quarantined"));
        assert!(!file.exists());

        std::fs::write(&file, "two").unwrap();
        let second = quarantine_file(&records, &file).await.unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with(QUARANTINE_SUFFIX));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "two");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let td = tempdir().unwrap();
        let err = quarantine_file(td.path(), &td.path().join("gone--x.md")).await;
        assert!(err.is_err());
    }
}
