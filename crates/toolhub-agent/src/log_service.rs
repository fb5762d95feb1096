use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::{ToolError, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub subject_id: String,
    pub message: String,
}

impl LogEntry {
    /// File form of the entry, without the trailing newline.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.message
        )
    }
}

fn validate_subject(id: &str) -> ToolResult<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(ToolError::Validation(format!("invalid log subject id: {id:?}")))
    }
}

#[derive(Debug)]
struct LogBuffer {
    max_lines: usize,
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_lines {
            self.entries.pop_front();
        }
    }

    fn tail(&self, n: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }
}

/// Free archive name `<file>.<YYYYmmdd-HHMMSS>`, suffixed `-N` on collision.
async fn rotated_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let base = format!("{}.{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1u32;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = PathBuf::from(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

async fn rename_to_archive(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let to = rotated_path(path).await;
    tokio::fs::rename(path, &to).await?;
    Ok(Some(to))
}

#[derive(Debug)]
struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<Option<PathBuf>> {
        self.file.flush().await?;
        let archived = rename_to_archive(&self.path).await?;

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(archived)
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0
            && self.bytes > 0
            && self.bytes.saturating_add(write_len) > self.max_bytes
        {
            self.rotate().await?;
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

/// Closed subjects whose buffers stay readable before eviction.
pub const DEFAULT_RETAINED_CLOSED: usize = 256;

#[derive(Debug)]
struct SubjectLog {
    buffer: LogBuffer,
    writer: Option<FileLogWriter>,
}

/// Per-subject (instance or configuration) logs: a bounded in-memory tail
/// plus an append-only file under the log directory.
#[derive(Debug)]
pub struct LogService {
    dir: PathBuf,
    max_lines: usize,
    max_file_bytes: u64,
    subjects: Mutex<HashMap<String, Arc<Mutex<SubjectLog>>>>,
    /// Closed subject ids, oldest first.
    closed: Mutex<VecDeque<String>>,
    retained_closed: usize,
}

impl LogService {
    pub fn new(dir: impl Into<PathBuf>, max_lines: usize, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_lines,
            max_file_bytes,
            subjects: Mutex::new(HashMap::new()),
            closed: Mutex::new(VecDeque::new()),
            retained_closed: DEFAULT_RETAINED_CLOSED,
        }
    }

    /// Number of closed subjects kept in memory. Older ones are dropped
    /// along with their buffers; their files stay on disk.
    pub fn with_retained_closed(mut self, n: usize) -> Self {
        self.retained_closed = n;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    async fn subject(&self, id: &str) -> Arc<Mutex<SubjectLog>> {
        self.subjects
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SubjectLog {
                    buffer: LogBuffer::new(self.max_lines),
                    writer: None,
                }))
            })
            .clone()
    }

    pub async fn write_log(&self, id: &str, level: LogLevel, message: impl Into<String>) -> ToolResult<()> {
        validate_subject(id)?;
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            subject_id: id.to_string(),
            message: message.into(),
        };
        let line = entry.render();

        let subject = self.subject(id).await;
        let mut s = subject.lock().await;
        s.buffer.push(entry);

        let path = self.log_file_path(id);
        if s.writer.is_none() {
            let w = FileLogWriter::open(path.clone(), self.max_file_bytes)
                .await
                .map_err(|e| ToolError::io(format!("open log file {}", path.display()), e))?;
            s.writer = Some(w);
        }
        if let Some(w) = s.writer.as_mut() {
            w.write_line(&line)
                .await
                .map_err(|e| ToolError::io(format!("write log file {}", path.display()), e))?;
        }
        Ok(())
    }

    /// Last `n` buffered entries, oldest first. Never reads the file.
    pub async fn read_logs(&self, id: &str, n: usize) -> Vec<LogEntry> {
        let subject = self.subjects.lock().await.get(id).cloned();
        match subject {
            Some(s) => s.lock().await.buffer.tail(n),
            None => Vec::new(),
        }
    }

    /// Archives the current file and starts a fresh one. The buffer is kept.
    /// Returns the archive path, or `None` when there was no file.
    pub async fn rotate_logs(&self, id: &str) -> ToolResult<Option<PathBuf>> {
        validate_subject(id)?;
        let path = self.log_file_path(id);
        let ctx = || format!("rotate log file {}", path.display());

        let subject = self.subjects.lock().await.get(id).cloned();
        if let Some(subject) = subject {
            let mut s = subject.lock().await;
            if let Some(w) = s.writer.as_mut() {
                return w.rotate().await.map_err(|e| ToolError::io(ctx(), e));
            }
        }
        rename_to_archive(&path)
            .await
            .map_err(|e| ToolError::io(ctx(), e))
    }

    /// Releases the subject's open file. Later writes reopen it. The buffer
    /// stays readable until enough newer subjects have been closed.
    pub async fn close(&self, id: &str) {
        let subject = self.subjects.lock().await.get(id).cloned();
        let Some(subject) = subject else {
            return;
        };
        {
            let mut s = subject.lock().await;
            if let Some(mut w) = s.writer.take() {
                let _ = w.file.flush().await;
            }
        }

        let mut closed = self.closed.lock().await;
        closed.retain(|c| c != id);
        closed.push_back(id.to_string());
        while closed.len() > self.retained_closed {
            let Some(oldest) = closed.pop_front() else {
                break;
            };
            self.evict_if_closed(&oldest).await;
        }
    }

    /// Drops a subject unless it has been written to since it was closed.
    async fn evict_if_closed(&self, id: &str) {
        let mut subjects = self.subjects.lock().await;
        let reopened = match subjects.get(id) {
            Some(s) => s.lock().await.writer.is_some(),
            None => return,
        };
        if !reopened {
            subjects.remove(id);
        }
    }

    pub async fn subject_count(&self) -> usize {
        self.subjects.lock().await.len()
    }

    async fn active_files(&self) -> HashSet<PathBuf> {
        let subjects: Vec<(String, Arc<Mutex<SubjectLog>>)> = self
            .subjects
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = HashSet::new();
        for (id, s) in subjects {
            if s.lock().await.writer.is_some() {
                out.insert(self.log_file_path(&id));
            }
        }
        out
    }

    /// Deletes files under the log directory last modified at or before
    /// `now - older_than_days`. Files held open by this service are skipped.
    pub async fn cleanup_logs(&self, older_than_days: u32) -> ToolResult<usize> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let age = Duration::from_secs(u64::from(older_than_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let active = self.active_files().await;

        let mut removed = 0usize;
        let mut pending = vec![self.dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut rd = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| ToolError::io(format!("read log dir {}", dir.display()), e))?;
            while let Some(ent) = rd
                .next_entry()
                .await
                .map_err(|e| ToolError::io(format!("read log dir {}", dir.display()), e))?
            {
                let path = ent.path();
                let Ok(meta) = ent.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !meta.is_file() || active.contains(&path) {
                    continue;
                }
                let Ok(modified) = meta.modified() else {
                    continue;
                };
                if modified <= cutoff {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "failed to delete old log file");
                        }
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, days = older_than_days, "cleaned up old log files");
        }
        Ok(removed)
    }
}
