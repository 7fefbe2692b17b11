//! Public service facade: fetch orchestration with offline fallback, plus the
//! record operations exposed to front ends.
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{BeansError, Result};
use crate::frontmatter::id_from_filename;
use crate::gateway::{join_messages, Gateway, GraphQlResponse, ProcessRunner};
use crate::integrity::clear_dangling_parents;
use crate::model::{BatchItem, NewRecord, Record, RecordFilter, RecordUpdate, Status};
use crate::normalize::{normalize, Mode};
use crate::notify::{Notice, Notifier};
use crate::propagate::propagate_status;
use crate::repair::history::{GitHistory, History};
use crate::repair::orphans::{extract_failed_path, find_orphans, record_files};
use crate::repair::{RepairOutcome, RepairPipeline};
use crate::store::RecordStore;
use crate::workspace::{ConfigCache, WorkspaceConfig};

pub const OFFLINE_TTL: Duration = Duration::from_secs(5 * 60);

const BEAN_FIELDS: &str = "fragment BeanFields on Bean { id slug path title body status type priority tags parentId blockingIds blockedByIds createdAt updatedAt etag }";

/// Last successful unfiltered listing.
#[derive(Debug, Clone)]
struct CacheSnapshot {
    records: Vec<Record>,
    taken_at: Instant,
}

#[derive(Debug, Default)]
struct OfflineState {
    snapshot: Option<CacheSnapshot>,
    degraded: bool,
}

pub struct BeansService {
    root: PathBuf,
    gateway: Gateway,
    config: ConfigCache,
    repair: RepairPipeline,
    notifier: Arc<dyn Notifier>,
    offline: Mutex<OfflineState>,
    offline_ttl: Duration,
}

impl BeansService {
    /// Service backed by the real binary and git history.
    pub fn new(settings: &Settings, notifier: Arc<dyn Notifier>) -> Self {
        let root = settings.workspace_root();
        let runner = Arc::new(ProcessRunner::new(settings.beans.binary.clone(), root.clone()));
        let gateway = Gateway::from_settings(runner, settings);
        Self::from_parts(
            root,
            gateway,
            Arc::new(GitHistory),
            notifier,
            settings.config_ttl(),
            settings.offline_ttl(),
        )
    }

    pub fn from_parts(
        root: impl Into<PathBuf>,
        gateway: Gateway,
        history: Arc<dyn History>,
        notifier: Arc<dyn Notifier>,
        config_ttl: Duration,
        offline_ttl: Duration,
    ) -> Self {
        let root = root.into();
        Self {
            config: ConfigCache::new(root.clone(), config_ttl),
            repair: RepairPipeline::new(root.clone(), history, notifier.clone()),
            root,
            gateway,
            notifier,
            offline: Mutex::new(OfflineState::default()),
            offline_ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the last listing was served from the offline cache.
    pub fn is_offline(&self) -> bool {
        self.offline_state().degraded
    }

    /// Drop the offline snapshot.
    pub fn clear_cache(&self) {
        self.offline_state().snapshot = None;
    }

    fn offline_state(&self) -> MutexGuard<'_, OfflineState> {
        self.offline.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn workspace_config(&self) -> Arc<WorkspaceConfig> {
        self.config.get().await
    }

    /// Probe the binary with the short timeout and return its version line.
    pub async fn check_available(&self) -> Result<String> {
        self.gateway.probe().await
    }

    pub async fn init(&self) -> Result<String> {
        self.gateway.exec_text(vec!["init".into()]).await
    }

    pub async fn schema(&self) -> Result<String> {
        self.gateway
            .exec_text(vec!["query".into(), "--schema".into()])
            .await
    }

    #[instrument(skip_all)]
    pub async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let cfg = self.config.get().await;
        for status in &filter.status {
            cfg.validate_status(status)?;
        }
        for kind in &filter.kind {
            cfg.validate_type(kind)?;
        }

        match self.fetch_records(filter, &cfg).await {
            Ok(records) => {
                if filter.is_unfiltered() {
                    self.store_snapshot(&records);
                }
                Ok(records)
            }
            Err(err) if err.is_unavailable() => self.serve_cached(filter, err),
            Err(err) => Err(err),
        }
    }

    fn store_snapshot(&self, records: &[Record]) {
        let mut state = self.offline_state();
        state.snapshot = Some(CacheSnapshot {
            records: records.to_vec(),
            taken_at: Instant::now(),
        });
        if state.degraded {
            state.degraded = false;
            info!("beans reachable again; leaving offline mode");
        }
    }

    fn serve_cached(&self, filter: &RecordFilter, err: BeansError) -> Result<Vec<Record>> {
        let mut state = self.offline_state();
        let Some(snapshot) = state
            .snapshot
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.offline_ttl)
        else {
            return Err(BeansError::Unavailable(err.to_string()));
        };
        let records: Vec<Record> = snapshot
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        let age = snapshot.taken_at.elapsed();
        if !state.degraded {
            state.degraded = true;
            warn!(error = %err, age_secs = age.as_secs(), "beans unavailable; serving cached records");
            self.notifier.notify(Notice::warning(format!(
                "beans is unavailable ({err}); showing cached data"
            )));
        }
        Ok(records)
    }

    async fn fetch_records(&self, filter: &RecordFilter, cfg: &WorkspaceConfig) -> Result<Vec<Record>> {
        let raw = match self.query_list(filter).await {
            Ok(raw) => raw,
            Err(err) => {
                let Some(file) = self.batch_abort_file(&err, cfg) else {
                    return Err(err);
                };
                warn!(file = %file.display(), "listing aborted on one record file; quarantining it");
                match self.repair.quarantine(&file, cfg, &err.to_string()).await {
                    RepairOutcome::Quarantined(_) => self.query_list(filter).await?,
                    _ => return Err(err),
                }
            }
        };

        let (mut records, handled) = self.normalize_batch(raw, cfg).await;
        if filter.is_unfiltered() {
            self.reconcile_orphans(&mut records, handled, cfg).await;
            clear_dangling_parents(self, &mut records, &*self.notifier).await;
        }
        Ok(records)
    }

    async fn query_list(&self, filter: &RecordFilter) -> Result<Vec<Value>> {
        let query = format!(
            "query ListBeans($filter: BeanFilter) {{ beans(filter: $filter) {{ ...BeanFields }} }} {BEAN_FIELDS}"
        );
        let resp = self
            .gateway
            .exec_graphql(&query, &list_variables(filter))
            .await?;
        match resp.into_data()? {
            Value::Object(mut data) => match data.remove("beans") {
                Some(Value::Array(items)) => Ok(items),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(BeansError::parse("`beans` is not a list", other.to_string())),
            },
            other => Err(BeansError::parse("missing `beans` in response", other.to_string())),
        }
    }

    /// The record file named in a whole-listing failure, if any.
    fn batch_abort_file(&self, err: &BeansError, cfg: &WorkspaceConfig) -> Option<PathBuf> {
        let message = match err {
            BeansError::Command { message }
            | BeansError::Rejected(message)
            | BeansError::Backend(message) => message,
            _ => return None,
        };
        extract_failed_path(message, &self.root, &cfg.records_dir)
    }

    /// Normalize each payload; a record that fails goes through repair instead
    /// of failing the batch. Returns the records plus every file handed to the
    /// repair pipeline.
    async fn normalize_batch(&self, raw: Vec<Value>, cfg: &WorkspaceConfig) -> (Vec<Record>, HashSet<PathBuf>) {
        let mut records = Vec::with_capacity(raw.len());
        let mut handled = HashSet::new();
        for item in raw {
            let err = match normalize(&item, Mode::Partial, cfg) {
                Ok(record) => {
                    records.push(record);
                    continue;
                }
                Err(err) => err,
            };
            let Some(file) = self.locate_file(&item, cfg).await else {
                warn!(error = %err, "malformed record has no locatable file; skipping");
                continue;
            };
            handled.insert(file.clone());
            if let Some(record) = self.repair_into_record(&file, cfg, &err.to_string()).await {
                records.push(record);
            }
        }
        (records, handled)
    }

    async fn repair_into_record(&self, file: &Path, cfg: &WorkspaceConfig, reason: &str) -> Option<Record> {
        match self.repair.process(file, cfg, reason).await {
            RepairOutcome::Repaired(raw) => match normalize(&raw, Mode::Partial, cfg) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "repaired record still invalid");
                    None
                }
            },
            RepairOutcome::Quarantined(_) | RepairOutcome::LeftInPlace => None,
        }
    }

    async fn locate_file(&self, raw: &Value, cfg: &WorkspaceConfig) -> Option<PathBuf> {
        let records_dir = cfg.records_path(&self.root);
        if let Some(path) = raw.get("path").and_then(Value::as_str).filter(|p| !p.trim().is_empty()) {
            let file = self.root.join(path);
            let contained = file.starts_with(&records_dir)
                && !file.components().any(|c| matches!(c, Component::ParentDir));
            if contained {
                return Some(file);
            }
            warn!(path, "record path outside the records directory");
            return None;
        }
        let id = raw.get("id").and_then(Value::as_str).filter(|s| !s.trim().is_empty())?;
        record_files(&records_dir).await.into_iter().find(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .and_then(id_from_filename)
                == Some(id)
        })
    }

    /// Feed record files the backend did not report through repair.
    async fn reconcile_orphans(&self, records: &mut Vec<Record>, handled: HashSet<PathBuf>, cfg: &WorkspaceConfig) {
        let records_dir = cfg.records_path(&self.root);
        let files = record_files(&records_dir).await;
        let known_ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut known_paths = handled;
        known_paths.extend(
            records
                .iter()
                .filter(|r| !r.path.is_empty())
                .map(|r| self.root.join(&r.path)),
        );
        for file in find_orphans(&files, &known_ids, &known_paths) {
            debug!(file = %file.display(), "record file not reported by beans");
            if let Some(record) = self
                .repair_into_record(&file, cfg, "file was not returned by beans")
                .await
            {
                records.push(record);
            }
        }
    }

    pub async fn show_record(&self, id: &str) -> Result<Record> {
        let cfg = self.config.get().await;
        let raw: Value = self
            .gateway
            .exec_json(vec!["show".into(), "--json".into(), id.to_string()])
            .await?;
        normalize(&raw, Mode::Strict, &cfg)
    }

    #[instrument(skip_all)]
    pub async fn create_record(&self, new: NewRecord) -> Result<Record> {
        let cfg = self.config.get().await;
        let new = prepare_new(new, &cfg)?;
        let query = format!(
            "mutation CreateBean($input: CreateBeanInput!) {{ createBean(input: $input) {{ ...BeanFields }} }} {BEAN_FIELDS}"
        );
        let data = self
            .gateway
            .exec_graphql(&query, &json!({ "input": new }))
            .await?
            .into_data()?;
        record_from(&data, "createBean", &cfg)
    }

    pub async fn create_records(&self, items: Vec<NewRecord>) -> Result<Vec<BatchItem<Record>>> {
        let cfg = self.config.get().await;
        let items = items
            .into_iter()
            .map(|n| prepare_new(n, &cfg))
            .collect::<Result<Vec<_>>>()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut decls = Vec::new();
        let mut fields = Vec::new();
        let mut vars = Map::new();
        for (i, item) in items.iter().enumerate() {
            decls.push(format!("$input{i}: CreateBeanInput!"));
            fields.push(format!("m{i}: createBean(input: $input{i}) {{ ...BeanFields }}"));
            vars.insert(format!("input{i}"), json!(item));
        }
        let query = batch_document("BatchCreate", &decls, &fields);
        let sent = self.gateway.exec_graphql(&query, &Value::Object(vars)).await;
        Ok(split_batch(sent, items.len(), |data| record_from_value(data, &cfg)))
    }

    /// Update a record; a status change cascades to its children.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn update_record(&self, id: &str, update: RecordUpdate) -> Result<Record> {
        let cfg = self.config.get().await;
        validate_update(&update, &cfg)?;
        let record = self.send_update(id, &update, &cfg).await?;
        if let Some(status) = &update.status {
            self.cascade(id, status, &cfg).await;
        }
        Ok(record)
    }

    pub async fn update_records(&self, items: Vec<(String, RecordUpdate)>) -> Result<Vec<BatchItem<Record>>> {
        let cfg = self.config.get().await;
        for (_, update) in &items {
            validate_update(update, &cfg)?;
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut decls = Vec::new();
        let mut fields = Vec::new();
        let mut vars = Map::new();
        for (i, (id, update)) in items.iter().enumerate() {
            decls.push(format!("$id{i}: ID!, $input{i}: UpdateBeanInput!"));
            fields.push(format!("m{i}: updateBean(id: $id{i}, input: $input{i}) {{ ...BeanFields }}"));
            vars.insert(format!("id{i}"), json!(id));
            vars.insert(format!("input{i}"), json!(update));
        }
        let query = batch_document("BatchUpdate", &decls, &fields);
        let sent = self.gateway.exec_graphql(&query, &Value::Object(vars)).await;
        let results = split_batch(sent, items.len(), |data| record_from_value(data, &cfg));

        for (item, (id, update)) in results.iter().zip(&items) {
            if let (Ok(_), Some(status)) = (&item.result, &update.status) {
                self.cascade(id, status, &cfg).await;
            }
        }
        Ok(results)
    }

    pub async fn delete_record(&self, id: &str) -> Result<()> {
        self.gateway
            .exec_text(vec!["delete".into(), "--force".into(), id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn delete_records(&self, ids: Vec<String>) -> Result<Vec<BatchItem<()>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut decls = Vec::new();
        let mut fields = Vec::new();
        let mut vars = Map::new();
        for (i, id) in ids.iter().enumerate() {
            decls.push(format!("$id{i}: ID!"));
            fields.push(format!("m{i}: deleteBean(id: $id{i})"));
            vars.insert(format!("id{i}"), json!(id));
        }
        let query = format!("mutation BatchDelete({}) {{ {} }}", decls.join(", "), fields.join(" "));
        let sent = self.gateway.exec_graphql(&query, &Value::Object(vars)).await;
        Ok(split_batch(sent, ids.len(), |_| Ok(())))
    }

    async fn send_update(&self, id: &str, update: &RecordUpdate, cfg: &WorkspaceConfig) -> Result<Record> {
        let query = format!(
            "mutation UpdateBean($id: ID!, $input: UpdateBeanInput!) {{ updateBean(id: $id, input: $input) {{ ...BeanFields }} }} {BEAN_FIELDS}"
        );
        let data = self
            .gateway
            .exec_graphql(&query, &json!({ "id": id, "input": update }))
            .await?
            .into_data()?;
        record_from(&data, "updateBean", cfg)
    }

    async fn cascade(&self, id: &str, status: &Status, cfg: &WorkspaceConfig) {
        let report = propagate_status(self, id, status, &cfg.terminal_statuses).await;
        if !report.updated.is_empty() || !report.failed.is_empty() {
            info!(
                parent = id,
                %status,
                updated = report.updated.len(),
                failed = report.failed.len(),
                "status propagated to children"
            );
        }
    }
}

#[async_trait]
impl RecordStore for BeansService {
    async fn children_of(&self, parent_id: &str) -> Result<Vec<Record>> {
        self.list_records(&RecordFilter::by_parent(parent_id)).await
    }

    async fn apply_status(&self, id: &str, status: &Status) -> Result<()> {
        let cfg = self.config.get().await;
        self.send_update(id, &RecordUpdate::status(status.clone()), &cfg)
            .await
            .map(|_| ())
    }

    async fn clear_parent(&self, id: &str) -> Result<()> {
        let cfg = self.config.get().await;
        self.send_update(id, &RecordUpdate::clear_parent(), &cfg)
            .await
            .map(|_| ())
    }
}

fn list_variables(filter: &RecordFilter) -> Value {
    let mut f = Map::new();
    if !filter.status.is_empty() {
        f.insert("status".into(), json!(filter.status));
    }
    if !filter.kind.is_empty() {
        f.insert("type".into(), json!(filter.kind));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        f.insert("search".into(), json!(search));
    }
    if let Some(parent) = &filter.parent {
        f.insert("parentId".into(), json!(parent));
    }
    if f.is_empty() {
        json!({})
    } else {
        json!({ "filter": f })
    }
}

fn prepare_new(mut new: NewRecord, cfg: &WorkspaceConfig) -> Result<NewRecord> {
    if new.title.trim().is_empty() {
        return Err(BeansError::Validation("title must be non-empty".into()));
    }
    let status = new.status.take().unwrap_or_else(|| cfg.default_status.clone());
    let kind = new.kind.take().unwrap_or_else(|| cfg.default_type.clone());
    cfg.validate_status(&status)?;
    cfg.validate_type(&kind)?;
    if let Some(priority) = &new.priority {
        cfg.validate_priority(priority)?;
    }
    new.status = Some(status);
    new.kind = Some(kind);
    Ok(new)
}

fn validate_update(update: &RecordUpdate, cfg: &WorkspaceConfig) -> Result<()> {
    if let Some(title) = &update.title {
        if title.trim().is_empty() {
            return Err(BeansError::Validation("title must be non-empty".into()));
        }
    }
    if let Some(status) = &update.status {
        cfg.validate_status(status)?;
    }
    if let Some(kind) = &update.kind {
        cfg.validate_type(kind)?;
    }
    if let Some(priority) = &update.priority {
        cfg.validate_priority(priority)?;
    }
    Ok(())
}

fn record_from(data: &Value, field: &str, cfg: &WorkspaceConfig) -> Result<Record> {
    match data.get(field) {
        Some(raw) if raw.is_object() => normalize(raw, Mode::Partial, cfg),
        _ => Err(BeansError::parse(format!("missing `{field}` in response"), data.to_string())),
    }
}

fn record_from_value(raw: &Value, cfg: &WorkspaceConfig) -> Result<Record> {
    normalize(raw, Mode::Partial, cfg)
}

fn batch_document(name: &str, decls: &[String], fields: &[String]) -> String {
    format!(
        "mutation {name}({}) {{ {} }} {BEAN_FIELDS}",
        decls.join(", "),
        fields.join(" ")
    )
}

/// Map an aliased batch response (`m0`, `m1`, ...) to per-item results.
///
/// A send failure fails every item with the same error; an error whose path
/// names an alias fails that item only.
fn split_batch<T>(
    sent: Result<GraphQlResponse>,
    len: usize,
    convert: impl Fn(&Value) -> Result<T>,
) -> Vec<BatchItem<T>> {
    let resp = match sent {
        Ok(resp) => resp,
        Err(err) => {
            return (0..len)
                .map(|index| BatchItem {
                    index,
                    result: Err(err.clone()),
                })
                .collect()
        }
    };
    let unscoped: Vec<_> = resp
        .errors
        .iter()
        .filter(|e| e.root_field().is_none())
        .cloned()
        .collect();
    let data = resp.data.unwrap_or(Value::Null);

    (0..len)
        .map(|index| {
            let alias = format!("m{index}");
            let scoped: Vec<_> = resp
                .errors
                .iter()
                .filter(|e| e.root_field() == Some(alias.as_str()))
                .cloned()
                .collect();
            let result = if !scoped.is_empty() {
                Err(BeansError::Backend(join_messages(&scoped)))
            } else {
                match data.get(&alias) {
                    Some(value) if !value.is_null() => convert(value),
                    _ if !unscoped.is_empty() => Err(BeansError::Backend(join_messages(&unscoped))),
                    _ => Err(BeansError::parse(format!("missing `{alias}` in response"), data.to_string())),
                }
            };
            BatchItem { index, result }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordType;

    #[test]
    fn list_variables_omit_empty_filters() {
        assert_eq!(list_variables(&RecordFilter::default()), json!({}));
        let f = RecordFilter {
            status: vec![Status::Todo],
            kind: vec![RecordType::Bug],
            search: Some(" login ".into()),
            parent: Some("app-1".into()),
        };
        assert_eq!(
            list_variables(&f),
            json!({ "filter": { "status": ["todo"], "type": ["bug"], "search": "login", "parentId": "app-1" } })
        );
    }

    #[test]
    fn new_records_get_defaults_and_validation() {
        let cfg = WorkspaceConfig::default();
        let new = prepare_new(
            NewRecord {
                title: "T".into(),
                ..Default::default()
            },
            &cfg,
        )
        .unwrap();
        assert_eq!(new.status, Some(Status::Todo));
        assert_eq!(new.kind, Some(RecordType::Task));

        let err = prepare_new(NewRecord::default(), &cfg).unwrap_err();
        assert!(matches!(err, BeansError::Validation(_)));

        let err = prepare_new(
            NewRecord {
                title: "T".into(),
                status: Some(Status::from("wip")),
                ..Default::default()
            },
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, BeansError::Validation(m) if m.contains("wip")));
    }

    #[test]
    fn batch_errors_are_scoped_to_their_alias() {
        let resp: GraphQlResponse = serde_json::from_value(json!({
            "data": { "m0": true, "m1": null },
            "errors": [{ "message": "bean not found", "path": ["m1"] }]
        }))
        .unwrap();
        let items = split_batch(Ok(resp), 2, |_| Ok(()));
        assert!(items[0].result.is_ok());
        assert!(matches!(&items[1].result, Err(BeansError::Backend(m)) if m == "bean not found"));
    }

    #[test]
    fn send_failure_fails_every_item() {
        let err = BeansError::Timeout {
            after: Duration::from_secs(30),
        };
        let items = split_batch::<()>(Err(err), 3, |_| Ok(()));
        assert_eq!(items.len(), 3);
        assert!(items
            .iter()
            .all(|i| matches!(i.result, Err(BeansError::Timeout { .. }))));
    }

    #[test]
    fn unscoped_errors_fail_items_without_data() {
        let resp: GraphQlResponse = serde_json::from_value(json!({
            "data": null,
            "errors": [{ "message": "syntax error" }]
        }))
        .unwrap();
        let items = split_batch(Ok(resp), 1, |_| Ok(()));
        assert!(matches!(&items[0].result, Err(BeansError::Backend(m)) if m == "syntax error"));
    }
}
