//! Malformed-record repair and quarantine.
//!
//! A record the normalizer rejects is repaired from its file when possible:
//! version-control history first, then the file name convention, then the
//! workspace defaults, and finally a freshly minted id. A record that still
//! lacks a required field is moved into quarantine.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::frontmatter::{self, field_str, Fields};
use crate::notify::{Notice, NoticeAction, Notifier};
use crate::workspace::WorkspaceConfig;

pub mod history;
pub mod orphans;
pub mod quarantine;

use history::History;

const REQUIRED: [&str; 3] = ["title", "status", "type"];
const REQUIRED_WITH_ID: [&str; 4] = ["id", "title", "status", "type"];

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// Frontmatter was fixed on disk; carries a payload for the normalizer.
    Repaired(Value),
    Quarantined(PathBuf),
    /// Neither repair nor quarantine succeeded; the file is untouched.
    LeftInPlace,
}

/// Reads and writes record files for the repair pipeline.
#[async_trait]
pub trait RecordFiles: Send + Sync {
    async fn read(&self, file: &Path) -> io::Result<String>;
    async fn write(&self, file: &Path, content: &str) -> io::Result<()>;
}

pub struct DiskFiles;

#[async_trait]
impl RecordFiles for DiskFiles {
    async fn read(&self, file: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(file).await
    }

    async fn write(&self, file: &Path, content: &str) -> io::Result<()> {
        tokio::fs::write(file, content).await
    }
}

/// Values resolved for the four fields every record needs.
#[derive(Debug, Default)]
struct Resolved {
    id: Option<String>,
    title: Option<String>,
    status: Option<String>,
    kind: Option<String>,
}

impl Resolved {
    fn from_fields(fields: &Fields) -> Self {
        Self {
            id: field_str(fields, "id"),
            title: field_str(fields, "title"),
            status: field_str(fields, "status"),
            kind: field_str(fields, "type"),
        }
    }

    fn fill_from(&mut self, other: Resolved) {
        self.id = self.id.take().or(other.id);
        self.title = self.title.take().or(other.title);
        self.status = self.status.take().or(other.status);
        self.kind = self.kind.take().or(other.kind);
    }
}

/// Per-file slot holding where the file was last quarantined to.
type FileLock = Arc<tokio::sync::Mutex<Option<PathBuf>>>;

pub struct RepairPipeline {
    root: PathBuf,
    history: Arc<dyn History>,
    files: Arc<dyn RecordFiles>,
    notifier: Arc<dyn Notifier>,
    notified: Mutex<HashSet<String>>,
    locks: Mutex<HashMap<PathBuf, FileLock>>,
}

impl RepairPipeline {
    pub fn new(root: impl Into<PathBuf>, history: Arc<dyn History>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            root: root.into(),
            history,
            files: Arc::new(DiskFiles),
            notifier,
            notified: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_files(mut self, files: Arc<dyn RecordFiles>) -> Self {
        self.files = files;
        self
    }

    /// Repair `file` or, failing that, quarantine it.
    ///
    /// Calls for the same file are serialized, so a later caller sees what an
    /// earlier one wrote instead of repairing the original content again.
    #[instrument(skip_all, fields(file = %file.display()))]
    pub async fn process(&self, file: &Path, cfg: &WorkspaceConfig, reason: &str) -> RepairOutcome {
        let lock = self.lock_for(file);
        let mut last_target = lock.lock().await;
        if let Some(outcome) = already_quarantined(file, &last_target).await {
            return outcome;
        }
        debug!(reason, "malformed record detected");
        match self.try_repair(file, cfg).await {
            Some((raw, true)) => {
                info!("malformed record repaired");
                self.notify_once(
                    file,
                    Notice::info(format!("Repaired malformed bean file {}", display_name(file))),
                );
                RepairOutcome::Repaired(raw)
            }
            Some((raw, false)) => {
                debug!("record file already complete; nothing written");
                RepairOutcome::Repaired(raw)
            }
            None => self.quarantine_locked(file, cfg, reason, &mut last_target).await,
        }
    }

    /// Move `file` out of discovery without attempting a repair.
    pub async fn quarantine(&self, file: &Path, cfg: &WorkspaceConfig, reason: &str) -> RepairOutcome {
        let lock = self.lock_for(file);
        let mut last_target = lock.lock().await;
        if let Some(outcome) = already_quarantined(file, &last_target).await {
            return outcome;
        }
        self.quarantine_locked(file, cfg, reason, &mut last_target).await
    }

    async fn quarantine_locked(
        &self,
        file: &Path,
        cfg: &WorkspaceConfig,
        reason: &str,
        last_target: &mut Option<PathBuf>,
    ) -> RepairOutcome {
        let records = cfg.records_path(&self.root);
        match quarantine::quarantine_file(&records, file).await {
            Ok(target) => {
                warn!(reason, to = %target.display(), "record quarantined");
                self.notify_once(
                    file,
                    Notice::warning(format!(
                        "Bean file {} is malformed and was moved to quarantine: {reason}",
                        display_name(file)
                    ))
                    .with_action(NoticeAction::OpenFile(target.clone())),
                );
                *last_target = Some(target.clone());
                RepairOutcome::Quarantined(target)
            }
            Err(err) => {
                warn!(%err, reason, "failed to quarantine record; leaving it in place");
                self.notify_once(
                    file,
                    Notice::warning(format!(
                        "Bean file {} is malformed and could not be quarantined: {reason}",
                        display_name(file)
                    )),
                );
                RepairOutcome::LeftInPlace
            }
        }
    }

    fn lock_for(&self, file: &Path) -> FileLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(file.to_path_buf()).or_default().clone()
    }

    /// The repaired payload, plus whether anything had to be written.
    async fn try_repair(&self, file: &Path, cfg: &WorkspaceConfig) -> Option<(Value, bool)> {
        let content = match self.files.read(file).await {
            Ok(content) => content,
            Err(err) => {
                warn!(%err, "cannot read malformed record");
                return None;
            }
        };
        let (header, body) = frontmatter::split(&content).unwrap_or(("", content.as_str()));
        let parsed = frontmatter::parse(header);
        let current = Resolved::from_fields(&parsed);
        let mut resolved = Resolved::from_fields(&parsed);
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let name_id = frontmatter::id_from_filename(name);

        let incomplete = resolved.title.is_none()
            || resolved.status.is_none()
            || resolved.kind.is_none()
            || (resolved.id.is_none() && name_id.is_none());
        if incomplete {
            let wanted: &[&str] = if resolved.id.is_none() && name_id.is_none() {
                &REQUIRED_WITH_ID
            } else {
                &REQUIRED
            };
            if let Some(past) = history::recover_fields(&*self.history, file, wanted).await {
                debug!("using frontmatter recovered from history");
                resolved.fill_from(Resolved::from_fields(&past));
            }
        }

        resolved.id = resolved.id.or_else(|| name_id.map(str::to_string));
        resolved.title = resolved.title.or_else(|| frontmatter::title_from_filename(name));
        resolved.status = resolved
            .status
            .or_else(|| Some(cfg.default_status.to_string()));
        resolved.kind = resolved.kind.or_else(|| Some(cfg.default_type.to_string()));
        if resolved.id.is_none() && resolved.title.is_some() {
            let id = mint_id(cfg);
            debug!(id = %id, "minted id for record without one");
            resolved.id = Some(id);
        }

        let (Some(id), Some(title), Some(status), Some(kind)) =
            (resolved.id, resolved.title, resolved.status, resolved.kind)
        else {
            debug!("required fields unrecoverable");
            return None;
        };

        let mut updates: Vec<(&str, &str)> = Vec::new();
        if current.title.is_none() {
            updates.push(("title", title.as_str()));
        }
        if current.status.is_none() {
            updates.push(("status", status.as_str()));
        }
        if current.kind.is_none() {
            updates.push(("type", kind.as_str()));
        }
        if current.id.is_none() && name_id != Some(id.as_str()) {
            updates.push(("id", id.as_str()));
        }

        let changed = !updates.is_empty();
        let fields = if !changed {
            parsed
        } else {
            let patched = frontmatter::patch(&content, &updates);
            if let Err(err) = self.files.write(file, &patched).await {
                warn!(%err, "failed to write repaired frontmatter");
                return None;
            }
            self.read_back(file).await?
        };

        let mut raw = fields;
        raw.insert("id".into(), Value::String(id));
        raw.insert("title".into(), Value::String(title));
        raw.insert("status".into(), Value::String(status));
        raw.insert("type".into(), Value::String(kind));
        raw.insert("body".into(), Value::String(body.to_string()));
        raw.insert("path".into(), Value::String(self.relative(file)));
        let slug = name
            .strip_suffix(".md")
            .and_then(|stem| stem.split_once("--"))
            .map(|(_, slug)| slug.to_string())
            .unwrap_or_default();
        raw.insert("slug".into(), Value::String(slug));
        Some((Value::Object(raw), changed))
    }

    /// Re-read a patched file; the repair only counts if disk agrees.
    async fn read_back(&self, file: &Path) -> Option<Fields> {
        let written = self.files.read(file).await.ok()?;
        let (header, _) = frontmatter::split(&written)?;
        let fields = frontmatter::parse(header);
        if REQUIRED.iter().all(|k| field_str(&fields, k).is_some()) {
            Some(fields)
        } else {
            warn!("repaired frontmatter did not read back");
            None
        }
    }

    fn relative(&self, file: &Path) -> String {
        file.strip_prefix(&self.root)
            .unwrap_or(file)
            .to_string_lossy()
            .into_owned()
    }

    fn notify_once(&self, file: &Path, notice: Notice) {
        let key = file.to_string_lossy().into_owned();
        let first = self
            .notified
            .lock()
            .map(|mut seen| seen.insert(key))
            .unwrap_or(false);
        if first {
            self.notifier.notify(notice);
        }
    }
}

/// The earlier outcome when a previous caller already moved `file` away.
async fn already_quarantined(file: &Path, last_target: &Option<PathBuf>) -> Option<RepairOutcome> {
    let target = last_target.as_ref()?;
    if tokio::fs::try_exists(file).await.unwrap_or(true) {
        return None;
    }
    debug!(to = %target.display(), "record already quarantined");
    Some(RepairOutcome::Quarantined(target.clone()))
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

/// New id: workspace prefix plus a random lowercase suffix.
fn mint_id(cfg: &WorkspaceConfig) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let len = cfg.id_length.clamp(1, suffix.len());
    format!("{}{}", cfg.prefix, &suffix[..len])
}

#[cfg(test)]
mod tests {
    use super::history::tests::FakeHistory;
    use super::history::NoHistory;
    use super::*;
    use crate::notify::{QueueNotifier, Severity};
    use tempfile::{tempdir, TempDir};

    /// Reads from disk; writes fail.
    struct ReadOnlyFiles;

    #[async_trait]
    impl RecordFiles for ReadOnlyFiles {
        async fn read(&self, file: &Path) -> io::Result<String> {
            DiskFiles.read(file).await
        }

        async fn write(&self, _file: &Path, _content: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    /// Reports success but never touches the disk.
    struct LostWrites;

    #[async_trait]
    impl RecordFiles for LostWrites {
        async fn read(&self, file: &Path) -> io::Result<String> {
            DiskFiles.read(file).await
        }

        async fn write(&self, _file: &Path, _content: &str) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        notices: Arc<QueueNotifier>,
        pipeline: RepairPipeline,
    }

    fn fixture(history: Arc<dyn History>) -> Fixture {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".beans")).unwrap();
        let notices = Arc::new(QueueNotifier::new());
        let pipeline = RepairPipeline::new(dir.path(), history, notices.clone());
        Fixture {
            dir,
            notices,
            pipeline,
        }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &str) -> PathBuf {
            let p = self.dir.path().join(".beans").join(name);
            std::fs::write(&p, content).unwrap();
            p
        }
    }

    #[tokio::test]
    async fn title_recovered_from_filename() {
        let f = fixture(Arc::new(NoHistory));
        let p = f.write(
            "app-k3x9--fix-the-login.md",
            "---\nstatus: todo\ntype: bug\n---\n\nBody text.\n",
        );
        let outcome = f.pipeline.process(&p, &WorkspaceConfig::default(), "missing title").await;
        let RepairOutcome::Repaired(raw) = outcome else {
            panic!("expected repair, got {outcome:?}");
        };
        assert_eq!(raw["id"], "app-k3x9");
        assert_eq!(raw["title"], "Fix the login");
        assert_eq!(raw["path"], ".beans/app-k3x9--fix-the-login.md");
        assert_eq!(raw["slug"], "fix-the-login");
        assert_eq!(
            std::fs::read_to_string(&p).unwrap(),
            "---\nstatus: todo\ntype: bug\ntitle: Fix the login\n---\n\nBody text.\n"
        );
        let notices = f.notices.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn unrecoverable_title_is_quarantined() {
        let f = fixture(Arc::new(NoHistory));
        let p = f.write("stray.md", "---\nid: app-1\nstatus: todo\ntype: task\n---\n");
        let outcome = f.pipeline.process(&p, &WorkspaceConfig::default(), "missing title").await;
        let target = f.dir.path().join(".beans/.quarantine/stray.md.quarantined");
        assert_eq!(outcome, RepairOutcome::Quarantined(target.clone()));
        assert!(!p.exists());
        assert!(target.exists());
        let notices = f.notices.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Warning);
        assert_eq!(notices[0].action, Some(NoticeAction::OpenFile(target)));
    }

    #[tokio::test]
    async fn title_recovered_from_history() {
        let history = FakeHistory::with(
            "stray.md",
            &[
                ("r2", "---\nid: app-1\nstatus: todo\n---\n"),
                ("r1", "---\nid: app-1\ntitle: From history\nstatus: draft\ntype: task\n---\n"),
            ],
        );
        let f = fixture(Arc::new(history));
        let p = f.write("stray.md", "---\nid: app-1\nstatus: todo\ntype: task\n---\nBody\n");
        let RepairOutcome::Repaired(raw) =
            f.pipeline.process(&p, &WorkspaceConfig::default(), "missing title").await
        else {
            panic!("expected repair");
        };
        assert_eq!(raw["title"], "From history");
        // Present fields win over history.
        assert_eq!(raw["status"], "todo");
        let written = std::fs::read_to_string(&p).unwrap();
        assert!(written.contains("title: From history\n"));
        assert!(written.ends_with("---\nBody\n"));
    }

    #[tokio::test]
    async fn missing_status_and_type_use_workspace_defaults() {
        let f = fixture(Arc::new(NoHistory));
        let p = f.write("app-2--thing.md", "---\ntitle: \"Thing: one\"\n---\n");
        let cfg = WorkspaceConfig {
            default_status: crate::model::Status::Draft,
            ..Default::default()
        };
        let RepairOutcome::Repaired(raw) = f.pipeline.process(&p, &cfg, "missing status").await else {
            panic!("expected repair");
        };
        assert_eq!(raw["status"], "draft");
        assert_eq!(raw["type"], "task");
        assert_eq!(raw["title"], "Thing: one");
        assert_eq!(
            std::fs::read_to_string(&p).unwrap(),
            "---\ntitle: \"Thing: one\"\nstatus: draft\ntype: task\n---\n"
        );
    }

    #[tokio::test]
    async fn id_is_minted_when_only_a_title_exists() {
        let f = fixture(Arc::new(NoHistory));
        let p = f.write("loose.md", "---\ntitle: Loose\nstatus: todo\ntype: task\n---\n");
        let cfg = WorkspaceConfig {
            prefix: "app-".into(),
            id_length: 6,
            ..Default::default()
        };
        let RepairOutcome::Repaired(raw) = f.pipeline.process(&p, &cfg, "missing id").await else {
            panic!("expected repair");
        };
        let id = raw["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("app-"));
        assert_eq!(id.len(), "app-".len() + 6);
        assert!(std::fs::read_to_string(&p).unwrap().contains(&format!("id: {id}\n")));
    }

    #[tokio::test]
    async fn notices_fire_once_per_file() {
        let f = fixture(Arc::new(NoHistory));
        let cfg = WorkspaceConfig::default();
        let p = f.write("stray.md", "garbage");
        f.pipeline.process(&p, &cfg, "bad").await;
        let p = f.write("stray.md", "garbage again");
        f.pipeline.process(&p, &cfg, "bad").await;
        assert_eq!(f.notices.drain().len(), 1);
    }

    #[tokio::test]
    async fn failed_quarantine_leaves_file_and_warns() {
        let f = fixture(Arc::new(NoHistory));
        let missing = f.dir.path().join(".beans/ghost.md");
        let outcome = f
            .pipeline
            .process(&missing, &WorkspaceConfig::default(), "unreadable")
            .await;
        assert_eq!(outcome, RepairOutcome::LeftInPlace);
        let notices = f.notices.drain();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].action.is_none());
    }

    #[tokio::test]
    async fn id_recovered_from_history_before_minting() {
        let history = FakeHistory::with(
            "loose.md",
            &[
                ("r2", "---\ntitle: Loose\nstatus: todo\ntype: task\n---\n"),
                ("r1", "---\nid: app-orig\ntitle: Loose\nstatus: todo\ntype: task\n---\n"),
            ],
        );
        let f = fixture(Arc::new(history));
        let p = f.write("loose.md", "---\ntitle: Loose\nstatus: todo\ntype: task\n---\n");
        let RepairOutcome::Repaired(raw) =
            f.pipeline.process(&p, &WorkspaceConfig::default(), "missing id").await
        else {
            panic!("expected repair");
        };
        assert_eq!(raw["id"], "app-orig");
        assert!(std::fs::read_to_string(&p).unwrap().contains("id: app-orig\n"));
    }

    #[tokio::test]
    async fn concurrent_repairs_of_one_file_agree_on_the_id() {
        let f = fixture(Arc::new(NoHistory));
        let p = f.write("loose.md", "---\ntitle: Loose\nstatus: todo\ntype: task\n---\n");
        let cfg = WorkspaceConfig::default();
        let (a, b) = tokio::join!(
            f.pipeline.process(&p, &cfg, "missing id"),
            f.pipeline.process(&p, &cfg, "missing id"),
        );
        let (RepairOutcome::Repaired(a), RepairOutcome::Repaired(b)) = (a, b) else {
            panic!("expected both repaired");
        };
        assert_eq!(a["id"], b["id"]);
        let written = std::fs::read_to_string(&p).unwrap();
        assert_eq!(written.matches("id: ").count(), 1);
        assert!(written.contains(&format!("id: {}\n", a["id"].as_str().unwrap())));
        assert_eq!(f.notices.drain().len(), 1);
    }

    #[tokio::test]
    async fn second_quarantine_reports_the_first_target() {
        let f = fixture(Arc::new(NoHistory));
        let cfg = WorkspaceConfig::default();
        let p = f.write("stray.md", "garbage");
        let (a, b) = tokio::join!(
            f.pipeline.process(&p, &cfg, "bad"),
            f.pipeline.quarantine(&p, &cfg, "listing aborted"),
        );
        let target = f.dir.path().join(".beans/.quarantine/stray.md.quarantined");
        assert_eq!(a, RepairOutcome::Quarantined(target.clone()));
        assert_eq!(b, RepairOutcome::Quarantined(target));
    }

    #[tokio::test]
    async fn complete_file_is_returned_without_a_notice() {
        let f = fixture(Arc::new(NoHistory));
        let content = "---\nid: app-1\ntitle: Fine\nstatus: todo\ntype: task\n---\nBody\n";
        let p = f.write("app-1--fine.md", content);
        let RepairOutcome::Repaired(raw) =
            f.pipeline.process(&p, &WorkspaceConfig::default(), "unreported").await
        else {
            panic!("expected record");
        };
        assert_eq!(raw["title"], "Fine");
        assert_eq!(std::fs::read_to_string(&p).unwrap(), content);
        assert!(f.notices.drain().is_empty());
    }

    #[tokio::test]
    async fn failed_write_quarantines() {
        let mut f = fixture(Arc::new(NoHistory));
        f.pipeline = f.pipeline.with_files(Arc::new(ReadOnlyFiles));
        let p = f.write("app-3--cannot-write.md", "---\nstatus: todo\n---\n");
        let outcome = f.pipeline.process(&p, &WorkspaceConfig::default(), "missing title").await;
        let target = f.dir.path().join(".beans/.quarantine/app-3--cannot-write.md.quarantined");
        assert_eq!(outcome, RepairOutcome::Quarantined(target.clone()));
        assert_eq!(std::fs::read_to_string(target).unwrap(), "---\nstatus: todo\n---\n");
        let notices = f.notices.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn write_that_does_not_read_back_quarantines() {
        let mut f = fixture(Arc::new(NoHistory));
        f.pipeline = f.pipeline.with_files(Arc::new(LostWrites));
        let p = f.write("app-4--lost.md", "---\nstatus: todo\n---\n");
        let outcome = f.pipeline.process(&p, &WorkspaceConfig::default(), "missing title").await;
        assert!(matches!(outcome, RepairOutcome::Quarantined(_)));
        assert!(!p.exists());
    }
}
