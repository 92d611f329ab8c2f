use crate::entry::{EntryMeta, Generation};
use crate::error::StorageError;
use crate::store::CacheStore;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one generation sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Entries seen during enumeration.
    pub scanned: usize,
    /// Generation tags found in the store other than the current one.
    pub stale_generations: BTreeSet<Generation>,
    pub removed: usize,
    /// Entries that could not be read or deleted. They are not retried.
    pub failed: usize,
}

/// Removes every entry not written under the current generation.
///
/// Single best-effort pass: enumeration and deletion failures are logged and
/// skipped per entry, and a failing backend never blocks the caller.
pub struct GarbageCollector {
    store: Arc<dyn CacheStore>,
    current: Generation,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn CacheStore>, current: Generation) -> Self {
        Self { store, current }
    }

    pub async fn run(&self) -> GcReport {
        let start = Instant::now();
        let mut report = GcReport::default();

        let mut keys = self.store.keys();
        while let Some(item) = keys.next().await {
            match item {
                Ok(meta) => {
                    report.scanned += 1;
                    if meta.generation != self.current {
                        report.stale_generations.insert(meta.generation);
                    }
                }
                // Removed by the delete pass below, not a failure.
                Err(StorageError::Corrupt { path, reason }) => {
                    tracing::debug!(path = %path.display(), reason = %reason, "corrupt entry found during sweep");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(error = %e, "failed to read cache entry during sweep, skipping");
                }
            }
        }
        drop(keys);

        let current = &self.current;
        let is_stale = |meta: &EntryMeta| &meta.generation != current;
        match self.store.delete_where(&is_stale).await {
            Ok(summary) => {
                report.removed = summary.removed;
                report.failed += summary.failed;
            }
            Err(e) => {
                tracing::warn!(error = %e, store = self.store.name(), "generation sweep failed");
            }
        }

        tracing::info!(
            store = self.store.name(),
            generation = %self.current,
            scanned = report.scanned,
            removed = report.removed,
            failed = report.failed,
            stale = ?report.stale_generations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation sweep complete"
        );
        report
    }
}
