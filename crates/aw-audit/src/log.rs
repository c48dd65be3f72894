// log.rs — Append-only JSONL audit log.
//
// One JSON object per line. Each record carries the SHA-256 of the previous
// raw line in `previous_hash`, so any inserted, removed or edited line breaks
// the chain and is reported by `verify_chain`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aw_rules::InstanceId;

use crate::error::AuditError;
use crate::hasher;
use crate::record::AuditRecord;

/// An append-only audit log backed by a JSONL file.
pub struct AuditLog {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Hash of the last line written; becomes `previous_hash` of the next record.
    last_hash: Option<String>,
}

impl AuditLog {
    /// Open (or create) an audit log, recovering the chain head from any
    /// existing content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };
        tracing::debug!(path = %path.display(), resumed = last_hash.is_some(), "audit log opened");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            last_hash,
        })
    }

    /// Append a record, linking it to the previous one. Flushes after writing.
    pub fn append(&mut self, record: &mut AuditRecord) -> Result<(), AuditError> {
        record.previous_hash = self.last_hash.clone();
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.last_hash = Some(hasher::hash_str(&json));
        Ok(())
    }

    /// Append records received from elsewhere (e.g., an agent's export).
    ///
    /// The incoming `previous_hash` values are rewritten so the records join
    /// this log's own chain.
    pub fn append_batch(&mut self, records: Vec<AuditRecord>) -> Result<usize, AuditError> {
        let mut count = 0;
        for mut record in records {
            self.append(&mut record)?;
            count += 1;
        }
        Ok(count)
    }

    /// Read all records, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let file = File::open(path.as_ref()).map_err(|source| AuditError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }

        Ok(records)
    }

    /// Read the records matching `query`, oldest first.
    pub fn query(
        path: impl AsRef<Path>,
        query: &AuditQuery,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        if !path.as_ref().exists() {
            return Ok(Vec::new());
        }
        let mut records: Vec<AuditRecord> = Self::read_all(path)?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        if let Some(limit) = query.limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }

    /// Verify the hash chain of a log file.
    ///
    /// Returns the number of records checked, or `IntegrityViolation` naming
    /// the first line whose link does not match.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
        let file = File::open(path.as_ref()).map_err(|source| AuditError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut previous_hash: Option<String> = None;
        let mut checked = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: AuditRecord = serde_json::from_str(&line)?;
            if record.previous_hash != previous_hash {
                return Err(AuditError::IntegrityViolation {
                    line: line_num + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: record.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }

            // Hash the raw line; re-serializing could reorder fields.
            previous_hash = Some(hasher::hash_str(&line));
            checked += 1;
        }

        Ok(checked)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
        let file = File::open(path).map_err(|source| AuditError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut last_line: Option<String> = None;

        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }

        Ok(last_line.map(|line| hasher::hash_str(&line)))
    }
}

/// Filter for reading back audit records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditQuery {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instance: Option<InstanceId>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Keep only the newest `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Time bounds are inclusive.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(instance) = self.instance {
            if record.instance_id() != Some(instance) {
                return false;
            }
        }
        if let Some(endpoint) = &self.endpoint {
            if &record.endpoint_id != endpoint {
                return false;
            }
        }
        true
    }
}

/// Destination for audit records produced by the enforcer.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// A file-backed log shared between tasks.
pub struct SharedAuditLog {
    inner: Mutex<AuditLog>,
}

impl SharedAuditLog {
    pub fn new(log: AuditLog) -> Self {
        Self {
            inner: Mutex::new(log),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Ok(Self::new(AuditLog::open(path)?))
    }

    pub fn path(&self) -> Result<PathBuf, AuditError> {
        let log = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        Ok(log.path().to_path_buf())
    }

    pub fn append_batch(&self, records: Vec<AuditRecord>) -> Result<usize, AuditError> {
        let mut log = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        log.append_batch(records)
    }
}

impl AuditSink for SharedAuditLog {
    fn emit(&self, mut record: AuditRecord) -> Result<(), AuditError> {
        let mut log = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        log.append(&mut record)
    }
}

/// In-memory sink, used by tests and by agents running without a log file.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|_| AuditError::Poisoned)?
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuditDecision, Enforcement, FlowMetadata};
    use aw_rules::{Action, ApplicationIdentity, ApplicationInstance, Protocol};
    use tempfile::tempdir;

    fn record(action: Action) -> AuditRecord {
        let flow = FlowMetadata::new("10.1.2.3".parse().unwrap(), 443, Protocol::Tcp);
        let enforcement = match action {
            Action::Allow => Enforcement::Permitted,
            Action::Deny => Enforcement::Terminated,
        };
        AuditRecord::decision("endpoint-1", action, enforcement, flow)
    }

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");

        {
            let mut log = AuditLog::open(&log_path).unwrap();
            log.append(&mut record(Action::Allow)).unwrap();
            log.append(&mut record(Action::Deny)).unwrap();
        }

        let records = AuditLog::read_all(&log_path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision, AuditDecision::Allow);
        assert_eq!(records[1].decision, AuditDecision::Deny);
        assert!(records[0].previous_hash.is_none());
        assert!(records[1].previous_hash.is_some());
    }

    #[test]
    fn hash_chain_is_valid_across_reopen() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("nested").join("audit.jsonl");

        {
            let mut log = AuditLog::open(&log_path).unwrap();
            for _ in 0..3 {
                log.append(&mut record(Action::Allow)).unwrap();
            }
        }
        {
            let mut log = AuditLog::open(&log_path).unwrap();
            log.append(&mut record(Action::Deny)).unwrap();
        }

        assert_eq!(AuditLog::verify_chain(&log_path).unwrap(), 4);
    }

    #[test]
    fn removed_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&log_path).unwrap();
            for _ in 0..3 {
                log.append(&mut record(Action::Allow)).unwrap();
            }
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        let kept: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| l)
            .collect();
        std::fs::write(&log_path, kept.join("\n")).unwrap();

        let err = AuditLog::verify_chain(&log_path).unwrap_err();
        assert!(matches!(err, AuditError::IntegrityViolation { line: 2, .. }));
    }

    #[test]
    fn edited_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&log_path).unwrap();
            log.append(&mut record(Action::Deny)).unwrap();
            log.append(&mut record(Action::Deny)).unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        let tampered = content.replacen("\"deny\"", "\"allow\"", 1);
        std::fs::write(&log_path, tampered).unwrap();

        assert!(AuditLog::verify_chain(&log_path).is_err());
    }

    #[test]
    fn batch_records_are_rechained() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let mut incoming = record(Action::Allow);
        incoming.previous_hash = Some("foreign".into());

        let mut log = AuditLog::open(&log_path).unwrap();
        log.append(&mut record(Action::Deny)).unwrap();
        assert_eq!(log.append_batch(vec![incoming]).unwrap(), 1);

        assert_eq!(AuditLog::verify_chain(&log_path).unwrap(), 2);
    }

    #[test]
    fn query_filters_by_instance_and_time() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let instance = ApplicationInstance::new(
            ApplicationIdentity::new("curl"),
            "endpoint-1",
            "/usr/bin/curl",
            None,
        );

        let mut old = record(Action::Allow);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        let attributed = record(Action::Deny).with_instance(&instance);

        {
            let mut log = AuditLog::open(&log_path).unwrap();
            log.append(&mut old).unwrap();
            log.append(&mut attributed.clone()).unwrap();
            log.append(&mut record(Action::Allow)).unwrap();
        }

        let by_instance = AuditLog::query(
            &log_path,
            &AuditQuery {
                instance: Some(instance.instance_id),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_instance.len(), 1);
        assert_eq!(by_instance[0].record_id, attributed.record_id);

        let recent = AuditLog::query(
            &log_path,
            &AuditQuery {
                since: Some(Utc::now() - chrono::Duration::hours(1)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(recent.len(), 2);

        let newest = AuditLog::query(
            &log_path,
            &AuditQuery {
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].decision, AuditDecision::Allow);
    }

    #[test]
    fn query_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let records = AuditLog::query(dir.path().join("none.jsonl"), &AuditQuery::default());
        assert!(records.unwrap().is_empty());
    }

    #[test]
    fn shared_log_emits_through_sink_trait() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let shared = SharedAuditLog::open(&log_path).unwrap();
        let sink: &dyn AuditSink = &shared;
        sink.emit(record(Action::Allow)).unwrap();
        sink.emit(record(Action::Deny)).unwrap();
        assert_eq!(AuditLog::verify_chain(&log_path).unwrap(), 2);
    }

    #[test]
    fn memory_sink_drains() {
        let sink = MemorySink::new();
        sink.emit(record(Action::Allow)).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }
}
