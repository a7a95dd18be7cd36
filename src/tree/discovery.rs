//! Discovery index over a folder of instrument YAML files.
//!
//! Maps each `type` tag to the files declaring it. The index is persisted as JSON
//! next to a fingerprint of the folder (latest modification time and YAML file
//! count) and rebuilt only when the fingerprint changes. An index is an explicit
//! value owned by its caller; nothing is cached process-wide.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Folder state the index was built from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Latest modification time, milliseconds since the epoch.
    pub latest_mtime_ms: u64,
    /// YAML files seen
    pub file_count: usize,
}

/// Persisted index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexCache {
    /// Directory state the index was built from
    pub fingerprint: Fingerprint,
    /// Instrument type to the files declaring it
    pub kinds: BTreeMap<String, Vec<PathBuf>>,
}

/// Type-tag index of a config folder, with an on-disk cache.
#[derive(Debug)]
pub struct ConfigIndex {
    dir: PathBuf,
    cache_path: PathBuf,
    current: Option<IndexCache>,
    rebuilds: usize,
}

impl ConfigIndex {
    /// Index `dir`, caching at `dir/.labwire-index.json`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let cache_path = dir.join(".labwire-index.json");
        Self::with_cache(dir, cache_path)
    }

    /// Index with its cache at `cache_path`.
    pub fn with_cache(dir: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache_path: cache_path.into(),
            current: None,
            rebuilds: 0,
        }
    }

    /// Directory being indexed.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of full rescans performed by this value.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// Drop the in-memory and on-disk index.
    pub fn invalidate(&mut self) -> AppResult<()> {
        self.current = None;
        if self.cache_path.exists() {
            fs::remove_file(&self.cache_path)?;
        }
        Ok(())
    }

    /// Current fingerprint of the folder.
    pub fn fingerprint(&self) -> AppResult<Fingerprint> {
        let mut fingerprint = Fingerprint::default();
        for path in yaml_files(&self.dir)? {
            let modified = fs::metadata(&path)?.modified()?;
            let ms = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            fingerprint.latest_mtime_ms = fingerprint.latest_mtime_ms.max(ms);
            fingerprint.file_count += 1;
        }
        Ok(fingerprint)
    }

    /// The index, rebuilt only if the folder changed.
    pub fn load(&mut self) -> AppResult<&IndexCache> {
        let fingerprint = self.fingerprint()?;
        let fresh = self
            .current
            .as_ref()
            .is_some_and(|index| index.fingerprint == fingerprint);
        if !fresh {
            let index = match self.read_cache() {
                Some(index) if index.fingerprint == fingerprint => {
                    debug!(cache = %self.cache_path.display(), "config index cache hit");
                    index
                }
                _ => self.rebuild(fingerprint)?,
            };
            self.current = Some(index);
        }
        Ok(self.current.get_or_insert_with(IndexCache::default))
    }

    /// Files declaring `kind`.
    pub fn files_for(&mut self, kind: &str) -> AppResult<Vec<PathBuf>> {
        Ok(self.load()?.kinds.get(kind).cloned().unwrap_or_default())
    }

    fn read_cache(&self) -> Option<IndexCache> {
        let text = fs::read_to_string(&self.cache_path).ok()?;
        match serde_json::from_str(&text) {
            Ok(index) => Some(index),
            Err(err) => {
                warn!(cache = %self.cache_path.display(), error = %err, "ignoring unreadable config index");
                None
            }
        }
    }

    fn rebuild(&mut self, fingerprint: Fingerprint) -> AppResult<IndexCache> {
        let mut kinds: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in yaml_files(&self.dir)? {
            match declared_type(&path) {
                Some(kind) => kinds.entry(kind).or_default().push(path),
                None => warn!(file = %path.display(), "no type tag, skipping"),
            }
        }
        let index = IndexCache { fingerprint, kinds };
        fs::write(&self.cache_path, serde_json::to_string_pretty(&index)?)?;
        self.rebuilds += 1;
        info!(
            dir = %self.dir.display(),
            files = fingerprint.file_count,
            kinds = index.kinds.len(),
            "config index rebuilt"
        );
        Ok(index)
    }
}

/// `*.yaml` and `*.yml` files below `dir`, sorted.
fn yaml_files(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            ) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn declared_type(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
