use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use super::{ProcessRecord, ProcessStatus};
use crate::error::{ControlError, Result};

const REGISTRY_FILE: &str = ".processes.json";

/// The process registry file of one workspace.
///
/// Records are only appended or updated in place, never deleted. Each
/// mutation rewrites the whole file under the store's lock.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RegistryStore {
    /// Registry for the workspace rooted at `workspace`.
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join(REGISTRY_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record, in start order.
    pub async fn load(&self) -> Result<Vec<ProcessRecord>> {
        let _guard = self.lock.lock().await;
        Ok(read_entries(&self.path)
            .await?
            .into_iter()
            .filter_map(Entry::into_record)
            .collect())
    }

    /// Most recent record with the given pid.
    pub async fn find(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        Ok(self.load().await?.into_iter().rev().find(|record| record.pid == pid))
    }

    /// Appends a record.
    pub async fn append(&self, record: ProcessRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = read_entries(&self.path).await?;
        entries.push(Entry::Record(record));
        write_entries(&self.path, &entries).await
    }

    /// Marks every running record with `pid` as stopped. Returns how many
    /// records changed.
    pub async fn mark_stopped(&self, pid: u32) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut entries = read_entries(&self.path).await?;
        let now = Utc::now();
        let mut changed = 0;
        let running = entries.iter_mut().filter_map(|entry| match entry {
            Entry::Record(record) if record.pid == pid && record.is_running() => Some(record),
            _ => None,
        });
        for record in running {
            record.status = ProcessStatus::Stopped;
            record.ended = Some(now);
            changed += 1;
        }
        if changed > 0 {
            write_entries(&self.path, &entries).await?;
        }
        Ok(changed)
    }
}

/// One element of the registry array. Elements that do not parse are kept
/// as raw JSON so rewrites carry them through unchanged.
enum Entry {
    Record(ProcessRecord),
    Raw(Value),
}

impl Entry {
    fn into_record(self) -> Option<ProcessRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Raw(_) => None,
        }
    }
}

async fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ControlError::store(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<Value> = serde_json::from_str(&content).map_err(|e| ControlError::store(path, e))?;
    Ok(raw
        .into_iter()
        .map(|value| match serde_json::from_value(value.clone()) {
            Ok(record) => Entry::Record(record),
            Err(e) => {
                warn!("Skipping unreadable process record in {}: {}", path.display(), e);
                Entry::Raw(value)
            }
        })
        .collect())
}

async fn write_entries(path: &Path, entries: &[Entry]) -> Result<()> {
    let values = entries
        .iter()
        .map(|entry| match entry {
            Entry::Record(record) => serde_json::to_value(record),
            Entry::Raw(value) => Ok(value.clone()),
        })
        .collect::<std::result::Result<Vec<Value>, _>>()
        .map_err(|e| ControlError::store(path, e))?;
    let content = serde_json::to_string_pretty(&values).map_err(|e| ControlError::store(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| ControlError::store(path, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ControlError::store(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(pid: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            cmd: "sleep 100".to_string(),
            log: format!(".agent_logs/{pid}.log"),
            started: Utc::now(),
            status: ProcessStatus::Running,
            ended: None,
        }
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        assert!(store.load().await.unwrap().is_empty());
        assert!(store.find(1).await.unwrap().is_none());
        assert!(store.path().ends_with(".processes.json"));
    }

    #[tokio::test]
    async fn test_append_keeps_order() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.append(record(10)).await.unwrap();
        store.append(record(20)).await.unwrap();

        let pids: Vec<u32> = store.load().await.unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_mark_stopped_only_touches_running_matches() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.append(record(10)).await.unwrap();
        store.append(record(10)).await.unwrap();
        store.append(record(20)).await.unwrap();

        assert_eq!(store.mark_stopped(10).await.unwrap(), 2);
        // Already stopped records keep their first end time
        assert_eq!(store.mark_stopped(10).await.unwrap(), 0);
        assert_eq!(store.mark_stopped(999).await.unwrap(), 0);

        let records = store.load().await.unwrap();
        assert!(records[..2]
            .iter()
            .all(|r| r.status == ProcessStatus::Stopped && r.ended.is_some()));
        assert!(records[2].is_running());
        assert!(records[2].ended.is_none());
    }

    #[tokio::test]
    async fn test_reads_registry_written_elsewhere() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".processes.json"),
            r#"[{"pid": 42, "cmd": "python3 -m http.server 8000", "log": ".agent_logs/a.log",
                 "started": "2026-01-01T00:00:00Z", "status": "running"},
                {"pid": "garbage"}]"#,
        )
        .unwrap();

        let store = RegistryStore::new(dir.path());
        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 42);
    }

    #[tokio::test]
    async fn test_unreadable_entries_survive_rewrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".processes.json");
        std::fs::write(
            &path,
            r#"[{"pid": "garbage"},
                {"pid": 42, "cmd": "sleep 100", "log": ".agent_logs/a.log",
                 "started": "2026-01-01T00:00:00Z", "status": "running"}]"#,
        )
        .unwrap();

        let store = RegistryStore::new(dir.path());
        store.append(record(7)).await.unwrap();
        assert_eq!(store.mark_stopped(42).await.unwrap(), 1);

        let on_disk: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 3);
        assert_eq!(on_disk[0], serde_json::json!({"pid": "garbage"}));
        assert_eq!(on_disk[1]["status"], "stopped");
        assert_eq!(on_disk[2]["pid"], 7);

        let pids: Vec<u32> = store.load().await.unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![42, 7]);
    }
}
