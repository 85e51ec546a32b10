//! Job history: run records in the brain, run logs in a history provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::HistoryError;

// ── Brain ────────────────────────────────────────────────────────────

/// Minimal key/value store for robot state that outlives a pipeline.
#[async_trait]
pub trait Brain: Send + Sync {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), HistoryError>;
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, HistoryError>;
}

/// In-memory brain; forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemBrain {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemBrain {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Brain for MemBrain {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), HistoryError> {
        self.data.write().await.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, HistoryError> {
        Ok(self.data.read().await.get(key).cloned())
    }
}

/// Brain backed by one file per key.
#[derive(Debug)]
pub struct FileBrain {
    dir: PathBuf,
}

impl FileBrain {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_safe(key))
    }
}

#[async_trait]
impl Brain for FileBrain {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), HistoryError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, HistoryError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_safe(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Job history records ──────────────────────────────────────────────

/// Time format for `CreateTime`.
pub const CREATE_TIME_FORMAT: &str = "%a %b %-d %H:%M:%S %Z %Y";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryEntry {
    pub log_index: u64,
    pub create_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobHistory {
    pub next_index: u64,
    #[serde(default)]
    pub histories: Vec<HistoryEntry>,
}

fn history_key(job: &str) -> String {
    format!("histories:{job}")
}

/// Allocates run numbers. Checkout, update and store happen under one lock
/// so concurrent starts of the same job never share a run number.
pub struct JobHistoryRecorder {
    brain: Arc<dyn Brain>,
    lock: Mutex<()>,
}

impl JobHistoryRecorder {
    pub fn new(brain: Arc<dyn Brain>) -> Self {
        Self {
            brain,
            lock: Mutex::new(()),
        }
    }

    /// Record a new run of `job`, keeping at most `keep` entries (minimum 1).
    /// Returns the run's index.
    pub async fn start_run(&self, job: &str, keep: usize) -> Result<u64, HistoryError> {
        let _guard = self.lock.lock().await;
        let key = history_key(job);
        let mut history = self.load(&key).await?.unwrap_or_default();

        let index = history.next_index;
        history.histories.push(HistoryEntry {
            log_index: index,
            create_time: Utc::now().format(CREATE_TIME_FORMAT).to_string(),
        });
        history.next_index += 1;
        let keep = keep.max(1);
        if history.histories.len() > keep {
            let excess = history.histories.len() - keep;
            history.histories.drain(..excess);
        }

        self.brain
            .store(&key, &serde_json::to_vec(&history)?)
            .await?;
        Ok(index)
    }

    pub async fn get(&self, job: &str) -> Result<Option<JobHistory>, HistoryError> {
        self.load(&history_key(job)).await
    }

    async fn load(&self, key: &str) -> Result<Option<JobHistory>, HistoryError> {
        match self.brain.retrieve(key).await? {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }
}

// ── Run logs ─────────────────────────────────────────────────────────

/// A single run's log.
#[async_trait]
pub trait HistoryLogger: Send + Sync {
    async fn log(&self, line: &str);
    /// Start a named section of the log.
    async fn section(&self, name: &str, info: &str);
    async fn close(&self);
}

/// Creates and reads run logs.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Open the log for `job` run `index`, discarding logs older than the
    /// last `keep` runs.
    async fn new_log(
        &self,
        job: &str,
        index: u64,
        keep: usize,
    ) -> Result<Arc<dyn HistoryLogger>, HistoryError>;

    async fn get_log(&self, job: &str, index: u64) -> Result<String, HistoryError>;
}

fn section_line(name: &str, info: &str) -> String {
    format!("*** {name}: {info}")
}

fn stamped(line: &str) -> String {
    format!("{} {line}", Utc::now().format("%Y/%m/%d %H:%M:%S"))
}

type LogMap = Arc<RwLock<HashMap<(String, u64), String>>>;

/// In-memory run logs.
#[derive(Default)]
pub struct MemHistory {
    logs: LogMap,
}

impl MemHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemLog {
    key: (String, u64),
    logs: LogMap,
}

impl MemLog {
    async fn append(&self, line: String) {
        let mut logs = self.logs.write().await;
        let log = logs.entry(self.key.clone()).or_default();
        log.push_str(&line);
        log.push('\n');
    }
}

#[async_trait]
impl HistoryLogger for MemLog {
    async fn log(&self, line: &str) {
        self.append(stamped(line)).await;
    }

    async fn section(&self, name: &str, info: &str) {
        self.append(section_line(name, info)).await;
    }

    async fn close(&self) {}
}

#[async_trait]
impl HistoryProvider for MemHistory {
    async fn new_log(
        &self,
        job: &str,
        index: u64,
        keep: usize,
    ) -> Result<Arc<dyn HistoryLogger>, HistoryError> {
        let keep = keep.max(1) as u64;
        let mut logs = self.logs.write().await;
        logs.retain(|(j, i), _| j != job || i + keep > index);
        logs.insert((job.to_string(), index), String::new());
        Ok(Arc::new(MemLog {
            key: (job.to_string(), index),
            logs: Arc::clone(&self.logs),
        }))
    }

    async fn get_log(&self, job: &str, index: u64) -> Result<String, HistoryError> {
        self.logs
            .read()
            .await
            .get(&(job.to_string(), index))
            .cloned()
            .ok_or_else(|| HistoryError::NotFound {
                job: job.to_string(),
                index,
            })
    }
}

/// Run logs as files: `<dir>/<job>/run-<index>.log`.
pub struct FileHistory {
    dir: PathBuf,
}

impl FileHistory {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn job_dir(&self, job: &str) -> PathBuf {
        self.dir.join(file_safe(job))
    }

    fn log_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("run-{index}.log"))
    }
}

struct FileLog {
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileLog {
    async fn write_line(&self, line: String) {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
            tracing::warn!("Failed writing run log: {}", e);
        }
    }
}

#[async_trait]
impl HistoryLogger for FileLog {
    async fn log(&self, line: &str) {
        self.write_line(stamped(line)).await;
    }

    async fn section(&self, name: &str, info: &str) {
        self.write_line(section_line(name, info)).await;
    }

    async fn close(&self) {
        if let Some(mut file) = self.file.lock().await.take()
            && let Err(e) = file.flush().await
        {
            tracing::warn!("Failed flushing run log: {}", e);
        }
    }
}

#[async_trait]
impl HistoryProvider for FileHistory {
    async fn new_log(
        &self,
        job: &str,
        index: u64,
        keep: usize,
    ) -> Result<Arc<dyn HistoryLogger>, HistoryError> {
        let dir = self.job_dir(job);
        tokio::fs::create_dir_all(&dir).await?;
        let keep = keep.max(1) as u64;
        if index >= keep {
            let stale = Self::log_path(&dir, index - keep);
            if let Err(e) = tokio::fs::remove_file(&stale).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %stale.display(), "Failed removing old run log: {}", e);
            }
        }
        let file = tokio::fs::File::create(Self::log_path(&dir, index)).await?;
        Ok(Arc::new(FileLog {
            file: Mutex::new(Some(file)),
        }))
    }

    async fn get_log(&self, job: &str, index: u64) -> Result<String, HistoryError> {
        match tokio::fs::read_to_string(Self::log_path(&self.job_dir(job), index)).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HistoryError::NotFound {
                job: job.to_string(),
                index,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_numbers_increase_and_history_is_bounded() {
        let recorder = JobHistoryRecorder::new(Arc::new(MemBrain::new()));
        for expected in 0..5 {
            assert_eq!(recorder.start_run("build", 3).await.unwrap(), expected);
        }
        let h = recorder.get("build").await.unwrap().unwrap();
        assert_eq!(h.next_index, 5);
        let indexes: Vec<_> = h.histories.iter().map(|e| e.log_index).collect();
        assert_eq!(indexes, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn zero_history_logs_still_keeps_one() {
        let recorder = JobHistoryRecorder::new(Arc::new(MemBrain::new()));
        recorder.start_run("j", 0).await.unwrap();
        recorder.start_run("j", 0).await.unwrap();
        let h = recorder.get("j").await.unwrap().unwrap();
        assert_eq!(h.next_index, 2);
        assert_eq!(h.histories.len(), 1);
        assert_eq!(h.histories[0].log_index, 1);
    }

    #[tokio::test]
    async fn concurrent_starts_get_distinct_indexes() {
        let recorder = Arc::new(JobHistoryRecorder::new(Arc::new(MemBrain::new())));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let r = Arc::clone(&recorder);
                tokio::spawn(async move { r.start_run("ci", 20).await.unwrap() })
            })
            .collect();
        let mut got = Vec::new();
        for h in handles {
            got.push(h.await.unwrap());
        }
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn stored_json_uses_wire_field_names() {
        let h = JobHistory {
            next_index: 1,
            histories: vec![HistoryEntry {
                log_index: 0,
                create_time: "Mon Jan 2 15:04:05 UTC 2006".to_string(),
            }],
        };
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"NextIndex\":1"));
        assert!(json.contains("\"LogIndex\":0"));
        assert!(json.contains("\"CreateTime\""));
    }

    #[tokio::test]
    async fn file_brain_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let recorder = JobHistoryRecorder::new(Arc::new(FileBrain::new(dir.path()).await.unwrap()));
            recorder.start_run("deploy", 5).await.unwrap();
        }
        let recorder = JobHistoryRecorder::new(Arc::new(FileBrain::new(dir.path()).await.unwrap()));
        assert_eq!(recorder.start_run("deploy", 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mem_history_logs_and_rotates() {
        let hist = MemHistory::new();
        let log = hist.new_log("build", 0, 1).await.unwrap();
        log.section("start", "task build").await;
        log.log("compiling").await;
        let text = hist.get_log("build", 0).await.unwrap();
        assert!(text.contains("*** start: task build"));
        assert!(text.contains("compiling"));

        hist.new_log("build", 1, 1).await.unwrap();
        assert!(matches!(
            hist.get_log("build", 0).await,
            Err(HistoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn file_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hist = FileHistory::new(dir.path()).await.unwrap();
        let log = hist.new_log("build", 0, 2).await.unwrap();
        log.log("hello").await;
        log.close().await;
        assert!(hist.get_log("build", 0).await.unwrap().contains("hello"));
        assert!(hist.get_log("build", 9).await.is_err());
    }
}
