use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::mining::stats::MiningStats;
use crate::withdrawals::History;

/// Minimal string key-value persistence.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// One JSON file per key inside a data directory:
///   <dir>/<namespace>_stats_<account>.json
///   <dir>/<namespace>_history_<account>.json
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref();
        fs::create_dir_all(root).with_context(|| format!("creating data dir {}", root.display()))?;
        Ok(Self { root: root.to_path_buf() })
    }

    /// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct keys
    /// always map to distinct files.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                name.push(b as char);
            } else {
                name.push('%');
                name.push_str(&hex::encode_upper([b]));
            }
        }
        self.root.join(format!("{name}.json"))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let txt = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(txt))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// In-process store, handy for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.map.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<S: KvStore> KvStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Stats,
    History,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Stats => "stats",
            RecordKind::History => "history",
        }
    }
}

/// Both records of one account, as loaded from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedAccount {
    pub stats: MiningStats,
    pub history: History,
}

/// Account-scoped view over a [`KvStore`].
pub struct AccountRepository<S: KvStore> {
    store: S,
    namespace: String,
}

impl<S: KvStore> AccountRepository<S> {
    pub fn new(store: S, namespace: impl Into<String>) -> Self {
        Self { store, namespace: namespace.into() }
    }

    pub fn key(&self, record: RecordKind, account: Option<&str>) -> String {
        match account {
            Some(a) => format!("{}_{}_{}", self.namespace, record.as_str(), a),
            None => format!("{}_{}", self.namespace, record.as_str()),
        }
    }

    /// Load both records; missing keys become zero-valued defaults.
    pub fn load(&self, account: Option<&str>) -> Result<LoadedAccount> {
        let stats = match self.store.get(&self.key(RecordKind::Stats, account))? {
            Some(txt) => serde_json::from_str(&txt).context("malformed stats record")?,
            None => MiningStats::default(),
        };
        let history = match self.store.get(&self.key(RecordKind::History, account))? {
            Some(txt) => serde_json::from_str(&txt).context("malformed history record")?,
            None => History::default(),
        };
        Ok(LoadedAccount { stats, history })
    }

    pub fn save_stats(&self, account: Option<&str>, stats: &MiningStats) -> Result<()> {
        let txt = serde_json::to_string(stats)?;
        self.store.set(&self.key(RecordKind::Stats, account), &txt)
    }

    pub fn save_history(&self, account: Option<&str>, history: &History) -> Result<()> {
        let txt = serde_json::to_string(history)?;
        self.store.set(&self.key(RecordKind::History, account), &txt)
    }
}

/// Generation-based write guard. Every account switch bumps the current
/// generation; a generation becomes writable only once its load succeeded.
/// Guarded writes and switches are serialized, so no write tagged with an
/// old generation can land after a switch has started, and a switch flush
/// is never followed by an older queued write for the same generation.
#[derive(Debug, Default)]
pub struct AccountGuard {
    state: Mutex<GuardState>,
}

#[derive(Debug, Default)]
struct GuardState {
    current: u64,
    loaded: u64,
}

impl GuardState {
    fn accepts(&self, generation: u64) -> bool {
        generation != 0 && generation == self.current && generation == self.loaded
    }
}

impl AccountGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a switch. Writes tagged with older generations are dropped from now on.
    pub fn begin_switch(&self) -> u64 {
        let mut st = self.lock();
        st.current += 1;
        st.current
    }

    /// Run `flush` for the outgoing generation (when it is still writable) and
    /// start the next one inside the same critical section. Queued writes of
    /// the outgoing generation are dropped afterwards, so they cannot land on
    /// top of the flushed state.
    pub fn switch_with(&self, outgoing: u64, flush: impl FnOnce() -> Result<()>) -> (u64, Result<()>) {
        let mut st = self.lock();
        let flushed = if st.accepts(outgoing) { flush() } else { Ok(()) };
        st.current += 1;
        (st.current, flushed)
    }

    pub fn mark_loaded(&self, generation: u64) {
        let mut st = self.lock();
        if st.current == generation {
            st.loaded = generation;
        }
    }

    pub fn accepts(&self, generation: u64) -> bool {
        self.lock().accepts(generation)
    }

    /// Run `write` only while `generation` is writable.
    pub fn write_if_current<T>(&self, generation: u64, write: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
        let st = self.lock();
        if !st.accepts(generation) {
            return Ok(None);
        }
        let out = write()?;
        drop(st);
        Ok(Some(out))
    }
}

#[derive(Debug, Clone)]
pub enum PersistPayload {
    Stats(MiningStats),
    History(History),
}

/// A write-back request, tagged with the account and generation that
/// produced it.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub generation: u64,
    pub account: String,
    pub payload: PersistPayload,
}

/// Apply one job. Returns Ok(false) when the guard rejected it.
pub fn apply_job<S: KvStore>(repo: &AccountRepository<S>, guard: &AccountGuard, job: &PersistJob) -> Result<bool> {
    let written = guard.write_if_current(job.generation, || match &job.payload {
        PersistPayload::Stats(s) => repo.save_stats(Some(&job.account), s),
        PersistPayload::History(h) => repo.save_history(Some(&job.account), h),
    })?;
    Ok(written.is_some())
}

/// Background writer: drains persistence jobs in order until every sender is gone.
pub async fn run_writer<S: KvStore>(
    repo: Arc<AccountRepository<S>>,
    guard: Arc<AccountGuard>,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = rx.recv().await {
        match apply_job(&repo, &guard, &job) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(account=%job.account, generation=job.generation, "dropping stale write"),
            Err(e) => tracing::warn!(account=%job.account, "persisting account record failed: {e:#}"),
        }
    }
}
