//! Cascades a status change down the parent/child tree, one level at a time.
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::model::Status;
use crate::store::RecordStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Apply `status` to every non-terminal descendant of `root_id`.
///
/// Children already at `status` or in one of the `terminal` statuses are left
/// alone and their subtrees are not visited. Failures are logged and never abort the
/// walk.
pub async fn propagate_status(
    store: &dyn RecordStore,
    root_id: &str,
    status: &Status,
    terminal: &[Status],
) -> PropagationReport {
    let mut report = PropagationReport::default();
    let mut visited: HashSet<String> = HashSet::from([root_id.to_string()]);
    let mut frontier = vec![root_id.to_string()];

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for parent in frontier {
            let children = match store.children_of(&parent).await {
                Ok(children) => children,
                Err(err) => {
                    warn!(parent = %parent, %err, "failed to load children for status propagation");
                    continue;
                }
            };
            for child in children {
                if !visited.insert(child.id.clone()) {
                    continue;
                }
                if child.status == *status || terminal.contains(&child.status) {
                    debug!(child = %child.id, status = %child.status, "propagation stops here");
                    report.skipped.push(child.id);
                    continue;
                }
                match store.apply_status(&child.id, status).await {
                    Ok(()) => {
                        debug!(child = %child.id, parent = %parent, %status, "status propagated");
                        report.updated.push(child.id.clone());
                        next.push(child.id);
                    }
                    Err(err) => {
                        warn!(child = %child.id, %err, "failed to propagate status");
                        report.failed.push(child.id);
                    }
                }
            }
        }
        frontier = next;
    }
    report
}
