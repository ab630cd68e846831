use std::{collections::BTreeMap, path::PathBuf};

use eyre::{Result, WrapErr};
use tokio::sync::mpsc;

use crate::{core::ModuleRecord, ports::persistence::PersistenceHook};

/// Default hook: every published record is logged and nothing is stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPersistence;

impl PersistenceHook for LogPersistence {
    fn persist(&self, record: &ModuleRecord) {
        tracing::debug!(
            module = %record.name,
            state = %record.state(),
            pid = ?record.pid(),
            port = record.binding.port,
            "Module record updated"
        );
    }
}

/// Keeps a JSON snapshot of all records on disk.
///
/// `persist` only queues the record; a background task owns the snapshot and
/// rewrites the file (tmp file + rename) after each update.
pub struct JsonFilePersistence {
    tx: mpsc::UnboundedSender<ModuleRecord>,
}

impl JsonFilePersistence {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<ModuleRecord>();

        tokio::spawn(async move {
            let mut snapshot: BTreeMap<String, ModuleRecord> = BTreeMap::new();
            while let Some(record) = rx.recv().await {
                snapshot.insert(record.name.clone(), record);
                // fold whatever queued up meanwhile into one write
                while let Ok(record) = rx.try_recv() {
                    snapshot.insert(record.name.clone(), record);
                }
                if let Err(e) = write_snapshot(&path, &snapshot).await {
                    tracing::error!("Failed to persist module records: {:#}", e);
                }
            }
            tracing::debug!("Persistence writer for {} stopped", path.display());
        });

        Self { tx }
    }
}

impl PersistenceHook for JsonFilePersistence {
    fn persist(&self, record: &ModuleRecord) {
        if self.tx.send(record.clone()).is_err() {
            tracing::warn!("Persistence writer is gone, dropping update for '{}'", record.name);
        }
    }
}

async fn write_snapshot(path: &PathBuf, snapshot: &BTreeMap<String, ModuleRecord>) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).wrap_err("Failed to serialize records")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .wrap_err_with(|| format!("Failed to move snapshot into {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::config::models::ModuleConfig;

    #[tokio::test]
    async fn test_json_snapshot_keeps_latest_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let hook = JsonFilePersistence::spawn(&path);

        let mut alpha = ModuleRecord::from_config("alpha", &ModuleConfig::default());
        hook.persist(&alpha);
        alpha.begin_start(Utc::now());
        hook.persist(&alpha);
        hook.persist(&ModuleRecord::from_config("beta", &ModuleConfig::default()));

        let mut stored = serde_json::Value::Null;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(bytes) = tokio::fs::read(&path).await {
                stored = serde_json::from_slice(&bytes).unwrap();
                if stored.as_object().is_some_and(|m| m.len() == 2) {
                    break;
                }
            }
        }

        assert_eq!(stored["alpha"]["state"], "LOADING");
        assert_eq!(stored["beta"]["state"], "UNKNOWN");
        // the identity token never reaches disk
        assert!(stored["alpha"].get("secret_hash").is_none());
    }
}
