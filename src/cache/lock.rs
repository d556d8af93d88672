use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Shared-read access to the page store, recovering from a panicked writer.
pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        report_poisoned(source, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        report_poisoned(source, op, "rwlock.write");
        poisoned.into_inner()
    })
}

fn report_poisoned(source: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        source,
        lock_kind,
        result = "poisoned_recovered",
        "recovered page store lock after a panic in another task"
    );
}
