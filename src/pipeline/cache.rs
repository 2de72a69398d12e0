//! Persistent processing cache: fingerprint → decision and output file.
//!
//! The index is one JSON document stored next to the outputs:
//!
//! ```json
//! {"version": 1, "entries": {"meta-…": {"source": "p1.jpg", "decision": {"kind": "opening_term"},
//!   "output": "TERMO DE ABERTURA.pdf", "recorded_at": 1760000000}}}
//! ```
//!
//! Lookups read a shared in-memory copy. Every record rewrites the whole file
//! through a temp file and a rename, one writer at a time, so a crash never
//! leaves a truncated index behind.
//!
//! A source file name has at most one entry. Recording a new fingerprint for
//! `p1.jpg` drops the older one; [`ProcessingCache::entries_for`] lets the
//! caller clean up the older output first.

use crate::output::PageDecision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// File name of the index inside the output directory.
pub const CACHE_FILE_NAME: &str = ".image2doc-cache.json";

const CACHE_VERSION: u32 = 1;

/// What a previous run did with an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Source file name at the time it was processed.
    pub source: String,
    pub decision: PageDecision,
    /// Output file name inside the output directory.
    pub output: String,
    /// Unix seconds.
    pub recorded_at: u64,
    /// Output written without a final decision (the run was cancelled while
    /// a reviewer was being asked). Never served as a hit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
}

impl CacheEntry {
    pub fn new(source: impl Into<String>, decision: PageDecision, output: impl Into<String>) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            source: source.into(),
            decision,
            output: output.into(),
            recorded_at,
            provisional: false,
        }
    }

    /// Same entry, marked as not to be reused.
    pub fn provisional(mut self) -> Self {
        self.provisional = true;
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// JSON-file-backed fingerprint index.
#[derive(Debug)]
pub struct ProcessingCache {
    path: PathBuf,
    index: RwLock<BTreeMap<String, CacheEntry>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ProcessingCache {
    /// Open the index at `path`.
    ///
    /// A missing file is an empty cache. An unreadable or corrupt file is
    /// logged and also treated as empty; it is overwritten on the next record.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) if index.version == CACHE_VERSION => index.entries,
                Ok(index) => {
                    warn!(
                        "Ignoring cache {} with unsupported version {}",
                        path.display(),
                        index.version
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!("Ignoring corrupt cache {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Cannot read cache {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        debug!("Cache {} holds {} entries", path.display(), entries.len());
        Self {
            path,
            index: RwLock::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the default index inside `output_dir`.
    pub fn for_output_dir(output_dir: &Path) -> Self {
        Self::open(output_dir.join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `fingerprint`, only if its output still exists in `output_dir`.
    pub fn lookup(&self, fingerprint: &str, output_dir: &Path) -> Option<CacheEntry> {
        let entry = self.index.read().ok()?.get(fingerprint).cloned()?;
        if entry.provisional {
            debug!("{} was left undecided, processing again", entry.source);
            None
        } else if output_dir.join(&entry.output).is_file() {
            Some(entry)
        } else {
            debug!("Cache entry for {} is stale: {} is gone", entry.source, entry.output);
            None
        }
    }

    /// Entries recorded for the source file `source`, whatever its fingerprint was.
    pub fn entries_for(&self, source: &str) -> Vec<CacheEntry> {
        let Ok(index) = self.index.read() else {
            return Vec::new();
        };
        index
            .values()
            .filter(|entry| entry.source == source)
            .cloned()
            .collect()
    }

    /// Store `entry` under `fingerprint`, drop older entries for the same
    /// source, and persist the index.
    pub async fn record(&self, fingerprint: &str, entry: CacheEntry) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let mut index = self
                .index
                .write()
                .map_err(|_| io::Error::other("cache index lock poisoned"))?;
            index.retain(|fp, old| fp == fingerprint || old.source != entry.source);
            index.insert(fingerprint.to_string(), entry);
            CacheIndex {
                version: CACHE_VERSION,
                entries: index.clone(),
            }
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || persist(&path, &snapshot))
            .await
            .map_err(|e| io::Error::other(format!("cache write task panicked: {e}")))?
    }
}

fn persist(path: &Path, index: &CacheIndex) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(index).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
