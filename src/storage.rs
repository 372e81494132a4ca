// src/storage.rs

//! Local state: installed repositories, installed packages, and the
//! derived package index.
//!
//! Three maps persist as JSON files under a base directory:
//!
//! | map   | file         | key                   |
//! |-------|--------------|-----------------------|
//! | store | `store.json` | repository identifier |
//! | index | `index.json` | `name@repository`     |
//! | pool  | `pool.json`  | `name@repository`     |
//!
//! A fourth map caches remotely fetched repository indexes in memory only,
//! bounded by [`CACHE_TTL`]. Corrupt state files are renamed aside as
//! `<file>.backup.<epoch-millis>` and replaced with the empty map; state is
//! deterministically rebuildable from the remotes, so losing it is
//! recoverable.
//!
//! The storage owns these maps, the install root, and the trash area.
//! Orchestrators mutate the maps only from inside transaction actions,
//! bracketed by a load in the open hook and a flush in the close hook.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// How long a fetched remote index may be reused, in seconds.
pub const CACHE_TTL: i64 = 300;

/// How long a loaded state snapshot is trusted without re-reading, in
/// seconds.
pub const STORAGE_TTL: i64 = 5;

/// Seconds since the epoch.
pub fn epoch() -> i64 {
    Utc::now().timestamp()
}

fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Build the global identifier of a package within a repository.
pub fn package_id(name: &str, repository: &str) -> String {
    format!("{name}@{repository}")
}

/// Split a `name@repository` identifier at the first `@`.
pub fn split_package_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('@')
}

/// A package as published by a repository index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Install path relative to the file root, mapped to the expected
    /// lowercase hex SHA-256 of the file bytes.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Opaque manifest metadata carried through untouched.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A repository index as fetched from a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryIndex {
    pub name: String,
    /// Higher priority wins when several repositories publish the same
    /// package name.
    #[serde(default)]
    pub priority: i64,
    /// Repositories this one depends on; installed transitively.
    #[serde(default)]
    pub companions: Vec<String>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageManifest>,
    /// Name of the driver that fetched this index.
    #[serde(default)]
    pub driver: String,
    /// Seconds since the epoch at fetch time.
    #[serde(default)]
    pub update_timestamp: i64,
}

/// A repository promoted into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub identifier: String,
    #[serde(default)]
    pub user_installed: bool,
    #[serde(flatten)]
    pub index: RepositoryIndex,
}

impl RepositoryEntry {
    /// Promote a fetched index to a local entry. Copies only the defined
    /// fields; never aliases the remote map.
    pub fn from_index(identifier: &str, index: &RepositoryIndex) -> Self {
        Self {
            identifier: identifier.to_string(),
            user_installed: false,
            index: index.clone(),
        }
    }
}

/// A package manifest bound to the repository it came from; the element
/// type of both the pool and the derived index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageEntry {
    pub repository: String,
    #[serde(default)]
    pub user_installed: bool,
    #[serde(flatten)]
    pub manifest: PackageManifest,
}

impl PackageEntry {
    pub fn id(&self) -> String {
        package_id(&self.manifest.name, &self.repository)
    }
}

/// Durable store/index/pool plus the in-memory remote index cache.
pub struct Storage {
    base_dir: PathBuf,
    root_dir: PathBuf,
    pub store: BTreeMap<String, RepositoryEntry>,
    pub index: BTreeMap<String, PackageEntry>,
    pub pool: BTreeMap<String, PackageEntry>,
    pub(crate) cache: HashMap<String, RepositoryIndex>,
    load_timestamp: Option<i64>,
}

impl Storage {
    /// Open storage rooted at `base_dir` for state, installing files under
    /// `root_dir`.
    pub fn open(base_dir: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            root_dir: root_dir.into(),
            store: BTreeMap::new(),
            index: BTreeMap::new(),
            pool: BTreeMap::new(),
            cache: HashMap::new(),
            load_timestamp: None,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn store_path(&self) -> PathBuf {
        self.base_dir.join("store.json")
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    fn pool_path(&self) -> PathBuf {
        self.base_dir.join("pool.json")
    }

    /// Where removed files wait so a rollback can restore them without
    /// re-downloading.
    pub fn trash_dir(&self) -> PathBuf {
        self.base_dir.join("trash")
    }

    /// Resolve a manifest install path against the file root. Leading
    /// separators and relative components are stripped so a manifest
    /// cannot escape the root.
    pub fn install_path(&self, rel: &str) -> PathBuf {
        join_sanitized(&self.root_dir, rel)
    }

    /// The trash location keyed by the same install path.
    pub fn trash_path(&self, rel: &str) -> PathBuf {
        join_sanitized(&self.trash_dir(), rel)
    }

    /// Read all three state files, substituting the empty map (and moving
    /// the damaged file aside) wherever one cannot be parsed. Returns the
    /// per-file errors keyed by map name.
    pub fn load(&mut self) -> BTreeMap<String, Error> {
        let mut errors = BTreeMap::new();

        let (store, err) = read_map(&self.store_path());
        if let Some(e) = err {
            errors.insert("store".to_string(), e);
        }
        self.store = store;

        let (index, err) = read_map(&self.index_path());
        if let Some(e) = err {
            errors.insert("index".to_string(), e);
        }
        self.index = index;

        let (pool, err) = read_map(&self.pool_path());
        if let Some(e) = err {
            errors.insert("pool".to_string(), e);
        }
        self.pool = pool;

        self.load_timestamp = Some(epoch());
        debug!(
            "loaded state: {} repositories, {} indexed, {} installed",
            self.store.len(),
            self.index.len(),
            self.pool.len()
        );
        errors
    }

    /// [`load`](Self::load), raising a concatenated message on any
    /// per-file error.
    pub fn load_strict(&mut self) -> Result<()> {
        let errors = self.load();
        if errors.is_empty() {
            return Ok(());
        }
        let message = errors
            .iter()
            .map(|(name, e)| format!("{name}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::Io(message))
    }

    /// Reload only when the last load is older than [`STORAGE_TTL`].
    pub fn load_if_expired(&mut self) -> BTreeMap<String, Error> {
        if let Some(ts) = self.load_timestamp {
            if epoch() - ts <= STORAGE_TTL {
                return BTreeMap::new();
            }
        }
        self.load()
    }

    /// Write all three maps to disk. On full success the load timestamp is
    /// refreshed; a failed file keeps its previous on-disk snapshot.
    pub fn flush(&mut self) -> BTreeMap<String, Error> {
        let mut errors = BTreeMap::new();
        if let Err(e) = write_map(&self.store_path(), &self.store) {
            errors.insert("store".to_string(), e);
        }
        if let Err(e) = write_map(&self.index_path(), &self.index) {
            errors.insert("index".to_string(), e);
        }
        if let Err(e) = write_map(&self.pool_path(), &self.pool) {
            errors.insert("pool".to_string(), e);
        }
        if errors.is_empty() {
            self.load_timestamp = Some(epoch());
        } else {
            warn!("state flush failed for {} files", errors.len());
        }
        errors
    }

    /// True iff a cache stamp is too old to reuse.
    pub fn cache_is_expired(timestamp: i64) -> bool {
        epoch() - timestamp > CACHE_TTL
    }

    /// A cached remote index, unless it has expired.
    pub fn cached(&self, identifier: &str) -> Option<&RepositoryIndex> {
        let entry = self.cache.get(identifier)?;
        if Self::cache_is_expired(entry.update_timestamp) {
            None
        } else {
            Some(entry)
        }
    }

    /// Record a fetched index, stamping its fetch time.
    pub fn cache_insert(&mut self, identifier: &str, mut index: RepositoryIndex) {
        index.update_timestamp = epoch();
        self.cache.insert(identifier.to_string(), index);
    }

    /// Drop a cached index, forcing the next fetch to go remote.
    pub fn cache_remove(&mut self, identifier: &str) {
        self.cache.remove(identifier);
    }

    /// Best-effort removal of everything left in the trash area.
    pub fn purge_trash(&self) -> Result<()> {
        let trash = self.trash_dir();
        if trash.exists() {
            fs::remove_dir_all(&trash)?;
        }
        Ok(())
    }
}

/// Fold a per-file error map into a single result, concatenating the
/// messages. Transaction hooks use this to report load/flush problems.
pub(crate) fn collect_file_errors(errors: BTreeMap<String, Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let message = errors
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::Io(message))
}

/// Join a manifest path onto a base, keeping only normal components.
fn join_sanitized(base: &Path, rel: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in Path::new(rel).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

fn read_map<T: DeserializeOwned>(path: &Path) -> (BTreeMap<String, T>, Option<Error>) {
    if !path.exists() {
        return (BTreeMap::new(), None);
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => return (BTreeMap::new(), Some(e.into())),
    };
    match serde_json::from_str(&text) {
        Ok(map) => (map, None),
        Err(e) => {
            // Move the damaged file aside so the next flush starts clean.
            let backup = backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "could not move corrupt {} aside: {rename_err}",
                    path.display()
                );
            } else {
                warn!("moved corrupt {} to {}", path.display(), backup.display());
            }
            (
                BTreeMap::new(),
                Some(Error::Io(format!(
                    "corrupt state file {}: {e}",
                    path.display()
                ))),
            )
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!("{name}.backup.{}", epoch_millis()))
}

fn write_map<T: Serialize>(path: &Path, map: &BTreeMap<String, T>) -> Result<()> {
    let text = serde_json::to_string_pretty(map)?;
    let tmp = path.with_file_name(format!(
        "{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string())
    ));
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
