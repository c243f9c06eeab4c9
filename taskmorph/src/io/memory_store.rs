//! Append-only memory of attempts, failures and learned facts.
//!
//! Stores assign a global, strictly increasing sequence number to every
//! record; reads return a lineage's records in that order. Nothing is ever
//! rewritten: a newer `learned-fact` with the same key supersedes the old one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{MemoryKind, MemoryRecord, TaskId};

/// A record before the store has ordered it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub lineage: TaskId,
    pub source: TaskId,
    pub kind: MemoryKind,
    pub payload: Value,
}

impl NewRecord {
    pub fn new(lineage: &TaskId, source: &TaskId, kind: MemoryKind, payload: Value) -> Self {
        Self {
            lineage: lineage.clone(),
            source: source.clone(),
            kind,
            payload,
        }
    }
}

/// Durable, append-only record storage shared by every task in a run.
pub trait MemoryStore: Send + Sync {
    /// Append a record and return it with its assigned sequence number.
    ///
    /// The record is durable once this returns.
    fn append(&self, record: NewRecord) -> Result<MemoryRecord>;

    /// All records of one lineage in sequence order.
    fn lineage(&self, lineage: &TaskId) -> Result<Vec<MemoryRecord>>;
}

/// The most recent `learned-fact` record per key; older ones are superseded.
///
/// Fact payloads are `{"key": <string>, "value": <any>}`. Facts without a
/// string key are ignored.
pub fn current_facts(records: &[MemoryRecord]) -> BTreeMap<&str, &MemoryRecord> {
    let mut current: BTreeMap<&str, &MemoryRecord> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|record| record.kind == MemoryKind::LearnedFact)
    {
        let Some(key) = record.payload.get("key").and_then(Value::as_str) else {
            continue;
        };
        match current.get(key) {
            Some(existing) if existing.seq > record.seq => {}
            _ => {
                current.insert(key, record);
            }
        }
    }
    current
}

/// Latest value per key among `learned-fact` records.
pub fn resolve_facts(records: &[MemoryRecord]) -> BTreeMap<String, Value> {
    current_facts(records)
        .into_iter()
        .map(|(key, record)| {
            let value = record.payload.get("value").cloned().unwrap_or(Value::Null);
            (key.to_string(), value)
        })
        .collect()
}

/// Records produced by `source` of the given kind, in order.
pub fn records_from<'a>(
    records: &'a [MemoryRecord],
    source: &TaskId,
    kind: MemoryKind,
) -> Vec<&'a MemoryRecord> {
    records
        .iter()
        .filter(|record| &record.source == source && record.kind == kind)
        .collect()
}

#[derive(Debug, Default)]
struct InMemoryInner {
    next_seq: u64,
    lineages: HashMap<TaskId, Vec<MemoryRecord>>,
}

/// Process-local store, used for scratch memory during morph dry runs and in
/// tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryStore for InMemoryStore {
    fn append(&self, record: NewRecord) -> Result<MemoryRecord> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        inner.next_seq += 1;
        let stored = MemoryRecord {
            seq: inner.next_seq,
            lineage: record.lineage,
            source: record.source,
            kind: record.kind,
            payload: record.payload,
            recorded_at: Utc::now(),
        };
        inner
            .lineages
            .entry(stored.lineage.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    fn lineage(&self, lineage: &TaskId) -> Result<Vec<MemoryRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(inner.lineages.get(lineage).cloned().unwrap_or_default())
    }
}

/// One JSON-lines file per lineage under a directory.
///
/// Every append is flushed and fsynced before it returns. The next sequence
/// number is recovered from existing files on open. A record cut short by a
/// crash mid-append is the last line of its file and has no newline; `open`
/// truncates it away. An unparseable line before that is an error.
#[derive(Debug)]
pub struct JsonlMemoryStore {
    dir: PathBuf,
    next_seq: Mutex<u64>,
}

impl JsonlMemoryStore {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let mut max_seq = 0;
        for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
            let path = entry.context("read directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let parsed = read_records(&path)?;
            if let Some(offset) = parsed.torn_at {
                warn!(path = %path.display(), offset, "dropping torn trailing record");
                OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|file| {
                        file.set_len(offset)?;
                        file.sync_all()
                    })
                    .with_context(|| format!("truncate {}", path.display()))?;
            }
            for record in parsed.records {
                max_seq = max_seq.max(record.seq);
            }
        }
        debug!(max_seq, "opened memory store");
        Ok(Self {
            dir: dir.to_path_buf(),
            next_seq: Mutex::new(max_seq),
        })
    }

    fn lineage_path(&self, lineage: &TaskId) -> Result<PathBuf> {
        let name = lineage.as_str();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            || name.starts_with('.')
        {
            return Err(anyhow!("lineage id '{name}' is not a safe file name"));
        }
        Ok(self.dir.join(format!("{name}.jsonl")))
    }
}

impl MemoryStore for JsonlMemoryStore {
    fn append(&self, record: NewRecord) -> Result<MemoryRecord> {
        let path = self.lineage_path(&record.lineage)?;
        // Holding the sequence lock across the write keeps file order equal to seq order.
        let mut next_seq = self
            .next_seq
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let stored = MemoryRecord {
            seq: *next_seq + 1,
            lineage: record.lineage,
            source: record.source,
            kind: record.kind,
            payload: record.payload,
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&stored).context("serialize memory record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", path.display()))?;

        *next_seq = stored.seq;
        Ok(stored)
    }

    fn lineage(&self, lineage: &TaskId) -> Result<Vec<MemoryRecord>> {
        let path = self.lineage_path(lineage)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut records = read_records(&path)?.records;
        records.sort_by_key(|record| record.seq);
        Ok(records)
    }
}

struct ParsedFile {
    records: Vec<MemoryRecord>,
    /// Byte offset of an unterminated final line.
    torn_at: Option<u64>,
}

fn read_records(path: &Path) -> Result<ParsedFile> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut records = Vec::new();
    let mut offset = 0;
    for (idx, line) in bytes.split_inclusive(|byte| *byte == b'\n').enumerate() {
        let start = offset;
        offset += line.len();
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        // Appends end with a newline; without one the append never returned.
        if !line.ends_with(b"\n") {
            return Ok(ParsedFile {
                records,
                torn_at: Some(start as u64),
            });
        }
        let record: MemoryRecord = serde_json::from_slice(line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(ParsedFile {
        records,
        torn_at: None,
    })
}
