//! Concurrent module registry.
//!
//! Each entry is a [`ModuleSlot`]: an `ArcSwap` snapshot that the proxy reads without
//! taking any lock, plus a per-record async mutex that serializes writers (lifecycle,
//! handshake, supervisor). Writers clone the current record, modify the clone and
//! publish it atomically, so readers always see a complete record.
use std::sync::Arc;

use arc_swap::ArcSwap;
use scc::HashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::module::ModuleRecord;

pub struct ModuleSlot {
    current: ArcSwap<ModuleRecord>,
    write: Arc<Mutex<()>>,
}

impl ModuleSlot {
    fn new(record: ModuleRecord) -> Self {
        Self {
            current: ArcSwap::from_pointee(record),
            write: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> Arc<ModuleRecord> {
        self.current.load_full()
    }
}

/// Exclusive write access to one record.
pub struct RecordGuard {
    slot: Arc<ModuleSlot>,
    _lock: OwnedMutexGuard<()>,
}

impl RecordGuard {
    /// The record as of now; stable while the guard is held.
    pub fn record(&self) -> Arc<ModuleRecord> {
        self.slot.snapshot()
    }

    /// Modify a copy of the record and publish it. Returns the closure's result and
    /// the published record.
    pub fn update<R>(&self, f: impl FnOnce(&mut ModuleRecord) -> R) -> (R, Arc<ModuleRecord>) {
        let mut next = ModuleRecord::clone(&self.slot.snapshot());
        let result = f(&mut next);
        let next = Arc::new(next);
        self.slot.current.store(next.clone());
        (result, next)
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    records: HashMap<String, Arc<ModuleSlot>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless one with the same name exists. Returns whether it was added.
    pub async fn insert(&self, record: ModuleRecord) -> bool {
        let name = record.name.clone();
        self.records
            .insert_async(name, Arc::new(ModuleSlot::new(record)))
            .await
            .is_ok()
    }

    /// Lock-free snapshot of a record.
    pub async fn get(&self, name: &str) -> Option<Arc<ModuleRecord>> {
        self.records
            .get_async(name)
            .await
            .map(|entry| entry.get().snapshot())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.records.get_async(name).await.is_some()
    }

    async fn slot(&self, name: &str) -> Option<Arc<ModuleSlot>> {
        self.records
            .get_async(name)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Wait for exclusive write access to an existing record.
    pub async fn lock(&self, name: &str) -> Option<RecordGuard> {
        let slot = self.slot(name).await?;
        let lock = slot.write.clone().lock_owned().await;
        Some(RecordGuard { slot, _lock: lock })
    }

    /// Like [`lock`](Self::lock), creating the record with `init` if it does not exist.
    pub async fn lock_or_insert_with(
        &self,
        name: &str,
        init: impl FnOnce() -> ModuleRecord,
    ) -> RecordGuard {
        let slot = self
            .records
            .entry_async(name.to_string())
            .await
            .or_insert_with(|| Arc::new(ModuleSlot::new(init())))
            .get()
            .clone();
        let lock = slot.write.clone().lock_owned().await;
        RecordGuard { slot, _lock: lock }
    }

    /// Snapshots of every record, sorted by name.
    pub async fn snapshot_all(&self) -> Vec<Arc<ModuleRecord>> {
        let mut records = Vec::with_capacity(self.records.len());
        let out = &mut records;
        self.records
            .retain_async(|_, slot| {
                out.push(slot.snapshot());
                true
            })
            .await;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{config::models::ModuleConfig, core::state::ModuleState};

    fn record(name: &str) -> ModuleRecord {
        ModuleRecord::from_config(name, &ModuleConfig::default())
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_name() {
        let registry = ModuleRegistry::new();
        assert!(registry.insert(record("alpha")).await);
        assert!(!registry.insert(record("alpha")).await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_update_publishes_new_snapshot() {
        let registry = ModuleRegistry::new();
        registry.insert(record("alpha")).await;

        let before = registry.get("alpha").await.unwrap();
        let guard = registry.lock("alpha").await.unwrap();
        guard.update(|r| r.begin_start(Utc::now()));
        drop(guard);

        assert_eq!(before.state(), ModuleState::Unknown);
        assert_eq!(
            registry.get("alpha").await.unwrap().state(),
            ModuleState::Loading
        );
    }

    #[tokio::test]
    async fn test_lock_or_insert_creates_once() {
        let registry = ModuleRegistry::new();
        {
            let guard = registry.lock_or_insert_with("beta", || record("beta")).await;
            guard.update(|r| r.version = 3);
        }
        let guard = registry
            .lock_or_insert_with("beta", || panic!("record already exists"))
            .await;
        assert_eq!(guard.record().version, 3);
    }

    #[tokio::test]
    async fn test_writers_on_same_record_are_serialized() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.insert(record("alpha")).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let guard = registry.lock("alpha").await.unwrap();
                tokio::task::yield_now().await;
                guard.update(|r| r.version += 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.get("alpha").await.unwrap().version, 32);
    }

    #[tokio::test]
    async fn test_snapshot_all_sorted() {
        let registry = ModuleRegistry::new();
        registry.insert(record("gamma")).await;
        registry.insert(record("alpha")).await;
        let names: Vec<_> = registry
            .snapshot_all()
            .await
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }
}
