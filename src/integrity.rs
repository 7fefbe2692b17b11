//! Clears parent links that point at records which no longer exist.
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::model::Record;
use crate::notify::{Notice, Notifier};
use crate::store::RecordStore;

/// Outcome for all records that referenced one missing parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DanglingGroup {
    pub missing_parent: String,
    pub cleared: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub groups: Vec<DanglingGroup>,
}

impl IntegrityReport {
    /// Number of updates issued.
    pub fn mutations(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.cleared.len() + g.failed.len())
            .sum()
    }
}

/// Clear every parent reference in `records` that does not resolve within the
/// same set. Successfully cleared records are updated in place, so a second
/// pass over the same slice issues nothing.
pub async fn clear_dangling_parents(
    store: &dyn RecordStore,
    records: &mut [Record],
    notifier: &dyn Notifier,
) -> IntegrityReport {
    let ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
    let mut by_parent: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        if let Some(parent) = record.parent.as_deref().filter(|p| !ids.contains(*p)) {
            by_parent.entry(parent.to_string()).or_default().push(idx);
        }
    }

    let mut report = IntegrityReport::default();
    for (missing_parent, indices) in by_parent {
        let mut group = DanglingGroup {
            missing_parent,
            ..Default::default()
        };
        for idx in indices {
            let id = records[idx].id.clone();
            match store.clear_parent(&id).await {
                Ok(()) => {
                    records[idx].parent = None;
                    group.cleared.push(id);
                }
                Err(err) => {
                    warn!(record = %id, parent = %group.missing_parent, %err, "failed to clear dangling parent");
                    group.failed.push((id, err.to_string()));
                }
            }
        }
        notifier.notify(group_notice(&group));
        report.groups.push(group);
    }
    if !report.groups.is_empty() {
        info!(groups = report.groups.len(), updates = report.mutations(), "dangling parent links processed");
    }
    report
}

fn group_notice(group: &DanglingGroup) -> Notice {
    let total = group.cleared.len() + group.failed.len();
    if group.failed.is_empty() {
        Notice::info(format!(
            "Parent {} no longer exists; removed the link from {} bean(s)",
            group.missing_parent, total
        ))
    } else {
        Notice::warning(format!(
            "Parent {} no longer exists; could not remove the link from {} of {} bean(s)",
            group.missing_parent,
            group.failed.len(),
            total
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BeansError, Result};
    use crate::model::{RecordType, Status};
    use crate::notify::{QueueNotifier, Severity};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        fail: HashSet<String>,
        cleared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordStore for FakeStore {
        async fn children_of(&self, _parent_id: &str) -> Result<Vec<Record>> {
            Ok(vec![])
        }

        async fn apply_status(&self, _id: &str, _status: &Status) -> Result<()> {
            Ok(())
        }

        async fn clear_parent(&self, id: &str) -> Result<()> {
            self.cleared.lock().unwrap().push(id.to_string());
            if self.fail.contains(id) {
                return Err(BeansError::Backend("locked".into()));
            }
            Ok(())
        }
    }

    fn record(id: &str, parent: Option<&str>) -> Record {
        Record {
            id: id.into(),
            code: id.into(),
            slug: String::new(),
            path: String::new(),
            title: id.into(),
            body: String::new(),
            status: Status::Todo,
            kind: RecordType::Task,
            priority: None,
            tags: vec![],
            parent: parent.map(str::to_string),
            blocking: vec![],
            blocked_by: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: String::new(),
        }
    }

    #[tokio::test]
    async fn groups_by_missing_parent_and_reports_once_per_group() {
        let store = FakeStore {
            fail: ["c".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let notices = QueueNotifier::new();
        let mut records = vec![
            record("p", None),
            record("a", Some("p")),
            record("b", Some("gone-1")),
            record("c", Some("gone-2")),
            record("d", Some("gone-1")),
        ];
        let report = clear_dangling_parents(&store, &mut records, &notices).await;

        assert_eq!(report.mutations(), 3);
        assert_eq!(report.groups[0].missing_parent, "gone-1");
        assert_eq!(report.groups[0].cleared, vec!["b", "d"]);
        assert_eq!(report.groups[1].failed.len(), 1);
        assert_eq!(records[1].parent.as_deref(), Some("p"));
        assert_eq!(records[2].parent, None);
        assert_eq!(records[3].parent.as_deref(), Some("gone-2"));

        let notices = notices.drain();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].severity, Severity::Info);
        assert_eq!(notices[1].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let store = FakeStore::default();
        let notices = QueueNotifier::new();
        let mut records = vec![record("a", Some("gone")), record("b", Some("a"))];
        let first = clear_dangling_parents(&store, &mut records, &notices).await;
        let second = clear_dangling_parents(&store, &mut records, &notices).await;
        assert_eq!(first.mutations(), 1);
        assert_eq!(second.mutations(), 0);
        assert_eq!(store.cleared.lock().unwrap().len(), 1);
        assert_eq!(notices.drain().len(), 1);
    }
}
