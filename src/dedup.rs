//! Collapses identical concurrent requests into one shared execution.
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;

type SharedCall = Shared<BoxFuture<'static, Result<String>>>;

/// Bounded fingerprint of a request's semantic content.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// In-flight request table owned by one gateway instance.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<Table>>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    calls: HashMap<String, (u64, SharedCall)>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently executing.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|t| t.calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the in-flight call for `key`, or start one with `start`.
    ///
    /// The entry is dropped as soon as the call settles, so a later request
    /// with the same key executes again.
    pub async fn run<F, Fut>(&self, key: String, start: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let shared = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, call)) = table.calls.get(&key) {
                debug!(fingerprint = %key, "joining in-flight beans request");
                call.clone()
            } else {
                table.next_id += 1;
                let id = table.next_id;
                let inner = self.inner.clone();
                let cleanup_key = key.clone();
                let fut = start();
                let call = async move {
                    let out = fut.await;
                    let mut table = inner.lock().unwrap_or_else(|e| e.into_inner());
                    if table.calls.get(&cleanup_key).map(|(owner, _)| *owner) == Some(id) {
                        table.calls.remove(&cleanup_key);
                    }
                    out
                }
                .boxed()
                .shared();
                table.calls.insert(key, (id, call.clone()));
                call
            }
        };
        shared.await
    }
}
