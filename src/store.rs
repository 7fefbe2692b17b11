use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Record, Status};

/// The record operations the integrity and propagation passes need.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Direct children of `parent_id`.
    async fn children_of(&self, parent_id: &str) -> Result<Vec<Record>>;

    /// Set a record's status without triggering further propagation.
    async fn apply_status(&self, id: &str, status: &Status) -> Result<()>;

    /// Remove a record's parent link.
    async fn clear_parent(&self, id: &str) -> Result<()>;
}
