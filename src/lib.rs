//! Resilient access layer over the `beans` command-line tracker.
pub mod config;
pub mod dedup;
pub mod error;
pub mod frontmatter;
pub mod gateway;
pub mod integrity;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod propagate;
pub mod repair;
pub mod retry;
pub mod service;
pub mod store;
pub mod workspace;

pub use error::{BeansError, Result};
pub use model::{BatchItem, NewRecord, Priority, Record, RecordFilter, RecordType, RecordUpdate, Status};
pub use service::BeansService;
