//! Reference tracker: names that point at root addresses.
//!
//! References are the GC root set. Every mutation gets the next sequence
//! number under one lock, so concurrent repoints of a name resolve
//! last-writer-wins in a total order. Each mutation is appended to a history
//! log before it is applied, which lets callers ask what a name pointed at
//! at any earlier time.
//!
//! Layout:
//! ```text
//! {base_path}/refs/
//! ├── table.json      # latest name -> address snapshot
//! └── history.jsonl   # one RefEvent per line, append-only
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::ContentAddress;
use crate::error::{CasError, IoContext, Result};
use crate::staging::StagingArea;

/// Current target of a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub address: ContentAddress,
    /// Sequence number of the mutation that set this entry.
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// One logged mutation. `old`/`new` are `None` for creation/deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEvent {
    pub seq: u64,
    pub name: String,
    pub old: Option<ContentAddress>,
    pub new: Option<ContentAddress>,
    pub at: DateTime<Utc>,
}

/// What a mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    pub previous: Option<ContentAddress>,
    pub current: Option<ContentAddress>,
    pub seq: u64,
}

/// Point-in-time copy of the table, used as the GC root set.
#[derive(Debug, Clone)]
pub struct RefSnapshot {
    pub generation: u64,
    pub entries: Vec<(String, ContentAddress)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RefTable {
    seq: u64,
    entries: BTreeMap<String, RefEntry>,
}

#[derive(Debug, Default)]
struct RefState {
    table: RefTable,
    history: Vec<RefEvent>,
    last_at: Option<DateTime<Utc>>,
}

impl RefState {
    fn apply(&mut self, event: &RefEvent) {
        match event.new {
            Some(address) => {
                self.table.entries.insert(
                    event.name.clone(),
                    RefEntry {
                        address,
                        seq: event.seq,
                        updated_at: event.at,
                    },
                );
            }
            None => {
                self.table.entries.remove(&event.name);
            }
        }
        self.table.seq = self.table.seq.max(event.seq);
        self.last_at = Some(self.last_at.map_or(event.at, |t| t.max(event.at)));
        self.history.push(event.clone());
    }

    /// Timestamps never go backwards, even if the wall clock does.
    fn next_at(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_at.map_or(now, |last| now.max(last))
    }
}

#[derive(Debug)]
struct RefFiles {
    dir: PathBuf,
    staging: StagingArea,
}

impl RefFiles {
    fn table_path(&self) -> PathBuf {
        self.dir.join("table.json")
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    fn append(&self, event: &RefEvent) -> Result<()> {
        let path = self.history_path();
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .io_context(|| format!("open {}", path.display()))?;
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .io_context(|| format!("append {}", path.display()))
    }

    fn snapshot(&self, table: &RefTable) -> Result<()> {
        let json = serde_json::to_vec_pretty(table)?;
        self.staging.stage(&json)?.replace(&self.table_path())
    }

    fn load(&self, read_only: bool) -> Result<RefState> {
        let mut state = RefState::default();

        match fs::read(self.table_path()) {
            Ok(json) => state.table = serde_json::from_slice(&json)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).io_context(|| format!("read {}", self.table_path().display())),
        }
        let snapshot_seq = state.table.seq;

        let path = self.history_path();
        let mut log = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).io_context(|| format!("read {}", path.display())),
        };

        // A crash mid-append leaves a partial last line. Cut it off so the
        // next append starts on a line of its own.
        let complete = log.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        if complete < log.len() {
            warn!(
                path = %path.display(),
                torn_bytes = log.len() - complete,
                "dropping torn reference history line"
            );
            log.truncate(complete);
            if !read_only {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .io_context(|| format!("open {}", path.display()))?;
                file.set_len(complete as u64)
                    .and_then(|_| file.sync_all())
                    .io_context(|| format!("truncate {}", path.display()))?;
            }
        }

        let mut replayed = 0;
        for line in log.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let event: RefEvent = match serde_json::from_slice(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable reference history line");
                    continue;
                }
            };
            if event.seq > snapshot_seq {
                state.apply(&event);
                replayed += 1;
            } else {
                state.last_at = Some(state.last_at.map_or(event.at, |t| t.max(event.at)));
                state.history.push(event);
            }
        }

        if replayed > 0 {
            info!(replayed, "replayed reference history past the last snapshot");
        }
        Ok(state)
    }
}

/// The reference table.
#[derive(Debug)]
pub struct ReferenceTracker {
    state: Mutex<RefState>,
    files: Option<RefFiles>,
    read_only: bool,
}

impl ReferenceTracker {
    /// A tracker that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(RefState::default()),
            files: None,
            read_only: false,
        }
    }

    /// Open (or create) a persistent tracker in `dir`.
    pub fn open(dir: impl Into<PathBuf>, staging: StagingArea, read_only: bool) -> Result<Self> {
        let dir = dir.into();
        if !read_only {
            fs::create_dir_all(&dir)
                .io_context(|| format!("create refs directory {}", dir.display()))?;
        }
        let files = RefFiles { dir, staging };
        let state = files.load(read_only)?;
        debug!(
            references = state.table.entries.len(),
            generation = state.table.seq,
            "reference tracker opened"
        );
        Ok(Self {
            state: Mutex::new(state),
            files: Some(files),
            read_only,
        })
    }

    /// Point `name` at `address`, replacing any previous target.
    pub fn set_reference(&self, name: &str, address: &ContentAddress) -> Result<RefUpdate> {
        self.mutate(name, |_| Ok(Some(*address)))
    }

    /// Point `name` at `address` only if it currently points at `expected`.
    pub fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&ContentAddress>,
        address: &ContentAddress,
    ) -> Result<RefUpdate> {
        self.mutate(name, |current| {
            if current != expected.copied() {
                return Err(CasError::ReferenceConflict {
                    name: name.to_string(),
                    expected: expected.copied(),
                    actual: current,
                });
            }
            Ok(Some(*address))
        })
    }

    pub fn get_reference(&self, name: &str) -> Result<ContentAddress> {
        self.state
            .lock()
            .table
            .entries
            .get(name)
            .map(|e| e.address)
            .ok_or_else(|| CasError::ReferenceNotFound(name.to_string()))
    }

    pub fn entry(&self, name: &str) -> Option<RefEntry> {
        self.state.lock().table.entries.get(name).cloned()
    }

    /// Remove `name`. Fails with `ReferenceNotFound` if it is not set.
    pub fn delete_reference(&self, name: &str) -> Result<RefUpdate> {
        self.mutate(name, |current| match current {
            Some(_) => Ok(None),
            None => Err(CasError::ReferenceNotFound(name.to_string())),
        })
    }

    /// All current references, sorted by name.
    pub fn list_references(&self) -> Vec<(String, ContentAddress)> {
        self.snapshot().entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the latest mutation. Changes on every mutation.
    pub fn generation(&self) -> u64 {
        self.state.lock().table.seq
    }

    pub fn snapshot(&self) -> RefSnapshot {
        let state = self.state.lock();
        RefSnapshot {
            generation: state.table.seq,
            entries: state
                .table
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.address))
                .collect(),
        }
    }

    /// Every logged mutation of `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<RefEvent> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Every logged mutation, oldest first.
    pub fn all_history(&self) -> Vec<RefEvent> {
        self.state.lock().history.clone()
    }

    /// What `name` pointed at, at time `at`.
    pub fn resolve_at(&self, name: &str, at: DateTime<Utc>) -> Option<ContentAddress> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|e| e.name == name && e.at <= at)
            .last()
            .and_then(|e| e.new)
    }

    fn mutate<F>(&self, name: &str, decide: F) -> Result<RefUpdate>
    where
        F: FnOnce(Option<ContentAddress>) -> Result<Option<ContentAddress>>,
    {
        if self.read_only {
            return Err(CasError::ReadOnly);
        }
        if name.is_empty() {
            return Err(CasError::ReferenceNotFound(String::new()));
        }

        let mut state = self.state.lock();
        let old = state.table.entries.get(name).map(|e| e.address);
        let new = decide(old)?;

        let event = RefEvent {
            seq: state.table.seq + 1,
            name: name.to_string(),
            old,
            new,
            at: state.next_at(),
        };

        if let Some(files) = &self.files {
            files.append(&event)?;
        }
        state.apply(&event);

        if let Some(files) = &self.files {
            // The history log is authoritative; a stale snapshot is replayed on open.
            if let Err(e) = files.snapshot(&state.table) {
                warn!(error = %e, "failed to snapshot reference table");
            }
        }

        if old.is_some() && new.is_some() && old != new {
            info!(name, old = ?old, new = ?new, seq = event.seq, "reference repointed");
        } else {
            debug!(name, old = ?old, new = ?new, seq = event.seq, "reference updated");
        }

        Ok(RefUpdate {
            name: event.name,
            previous: old,
            current: new,
            seq: event.seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> Result<ReferenceTracker> {
        ReferenceTracker::open(
            temp_dir.path().join("refs"),
            StagingArea::new(temp_dir.path().join("staging")),
            false,
        )
    }

    #[test]
    fn test_set_get_delete() -> Result<()> {
        let refs = ReferenceTracker::in_memory();
        let a = hash(b"a");

        let update = refs.set_reference("latest", &a)?;
        assert_eq!(update.previous, None);
        assert_eq!(update.seq, 1);
        assert_eq!(refs.get_reference("latest")?, a);

        refs.delete_reference("latest")?;
        assert!(matches!(refs.get_reference("latest"), Err(CasError::ReferenceNotFound(_))));
        assert!(matches!(refs.delete_reference("latest"), Err(CasError::ReferenceNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_repoint_is_logged() -> Result<()> {
        let refs = ReferenceTracker::in_memory();
        let (a, b) = (hash(b"a"), hash(b"b"));

        refs.set_reference("v1", &a)?;
        let update = refs.set_reference("v1", &b)?;
        assert_eq!(update.previous, Some(a));
        assert_eq!(update.current, Some(b));

        let history = refs.history("v1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].old, Some(a));
        assert_eq!(history[1].new, Some(b));
        assert!(history[0].at <= history[1].at);
        assert!(history[0].seq < history[1].seq);
        Ok(())
    }

    #[test]
    fn test_resolve_at_time() -> Result<()> {
        let refs = ReferenceTracker::in_memory();
        let (a, b) = (hash(b"a"), hash(b"b"));

        refs.set_reference("tag", &a)?;
        let between = refs.history("tag")[0].at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        refs.set_reference("tag", &b)?;

        assert_eq!(refs.resolve_at("tag", between), Some(a));
        assert_eq!(refs.resolve_at("tag", Utc::now()), Some(b));
        assert_eq!(refs.resolve_at("tag", between - chrono::Duration::seconds(1)), None);
        Ok(())
    }

    #[test]
    fn test_compare_and_set_conflict() -> Result<()> {
        let refs = ReferenceTracker::in_memory();
        let (a, b, c) = (hash(b"a"), hash(b"b"), hash(b"c"));

        refs.compare_and_set("main", None, &a)?;
        refs.compare_and_set("main", Some(&a), &b)?;

        let err = refs.compare_and_set("main", Some(&a), &c).unwrap_err();
        assert!(matches!(
            err,
            CasError::ReferenceConflict { ref name, actual, .. } if name == "main" && actual == Some(b)
        ));
        assert_eq!(refs.get_reference("main")?, b);
        Ok(())
    }

    #[test]
    fn test_generation_advances() -> Result<()> {
        let refs = ReferenceTracker::in_memory();
        assert_eq!(refs.generation(), 0);
        refs.set_reference("x", &hash(b"x"))?;
        refs.set_reference("y", &hash(b"y"))?;
        assert_eq!(refs.generation(), 2);
        assert_eq!(refs.snapshot().entries.len(), 2);
        Ok(())
    }

    #[test]
    fn test_persistence_roundtrip() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let (a, b) = (hash(b"a"), hash(b"b"));
        {
            let refs = open(&temp_dir)?;
            refs.set_reference("v1", &a)?;
            refs.set_reference("v2", &a)?;
            refs.set_reference("v1", &b)?;
            refs.delete_reference("v2")?;
        }

        let refs = open(&temp_dir)?;
        assert_eq!(refs.list_references(), vec![("v1".to_string(), b)]);
        assert_eq!(refs.generation(), 4);
        assert_eq!(refs.history("v1").len(), 2);
        assert_eq!(refs.all_history().len(), 4);
        Ok(())
    }

    #[test]
    fn test_history_replays_over_stale_snapshot() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let (a, b) = (hash(b"a"), hash(b"b"));
        let table_path = temp_dir.path().join("refs").join("table.json");
        {
            let refs = open(&temp_dir)?;
            refs.set_reference("v1", &a)?;
            let stale = fs::read(&table_path)?;
            refs.set_reference("v1", &b)?;
            // Simulate a crash between log append and snapshot.
            fs::write(&table_path, stale)?;
        }

        let refs = open(&temp_dir)?;
        assert_eq!(refs.get_reference("v1")?, b);
        assert_eq!(refs.generation(), 2);
        Ok(())
    }

    #[test]
    fn test_torn_history_line_does_not_swallow_next_event() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let (a, b) = (hash(b"a"), hash(b"b"));
        let history_path = temp_dir.path().join("refs").join("history.jsonl");

        open(&temp_dir)?.set_reference("n", &a)?;
        // Crash mid-append: half an event, no newline.
        OpenOptions::new()
            .append(true)
            .open(&history_path)?
            .write_all(br#"{"seq":2,"na"#)?;

        open(&temp_dir)?.set_reference("n", &b)?;

        let refs = open(&temp_dir)?;
        let history = refs.history("n");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].old, Some(a));
        assert_eq!(history[1].new, Some(b));
        assert_eq!(refs.get_reference("n")?, b);
        assert!(fs::read(&history_path)?.ends_with(b"\n"));
        Ok(())
    }

    #[test]
    fn test_read_only_open_leaves_torn_history_alone() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let history_path = temp_dir.path().join("refs").join("history.jsonl");
        open(&temp_dir)?.set_reference("n", &hash(b"a"))?;
        OpenOptions::new().append(true).open(&history_path)?.write_all(b"{\"se")?;
        let before = fs::read(&history_path)?;

        let refs = ReferenceTracker::open(
            temp_dir.path().join("refs"),
            StagingArea::new(temp_dir.path().join("staging")),
            true,
        )?;
        assert_eq!(refs.history("n").len(), 1);
        assert_eq!(fs::read(&history_path)?, before);
        Ok(())
    }

    #[test]
    fn test_concurrent_repoints_are_totally_ordered() -> Result<()> {
        let refs = Arc::new(ReferenceTracker::in_memory());

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let refs = refs.clone();
                thread::spawn(move || {
                    for j in 0..25u8 {
                        refs.set_reference("hot", &hash(&[i, j])).expect("set failed");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = refs.history("hot");
        assert_eq!(history.len(), 200);
        for pair in history.windows(2) {
            assert_eq!(pair[0].seq + 1, pair[1].seq);
            assert_eq!(pair[0].new, pair[1].old);
        }
        assert_eq!(Some(refs.get_reference("hot")?), history[199].new);
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_mutation() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        open(&temp_dir)?.set_reference("v1", &hash(b"a"))?;

        let refs = ReferenceTracker::open(
            temp_dir.path().join("refs"),
            StagingArea::new(temp_dir.path().join("staging")),
            true,
        )?;
        assert_eq!(refs.get_reference("v1")?, hash(b"a"));
        assert!(matches!(refs.set_reference("v1", &hash(b"b")), Err(CasError::ReadOnly)));
        Ok(())
    }
}
