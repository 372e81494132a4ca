// src/package.rs

//! Package orchestration: the global package index, package add/remove,
//! and the file materialization actions behind them.
//!
//! Packages are identified as `name@repository`; a bare name resolves
//! through the precomputed index in repository-priority order. Installing
//! a package downloads each manifest file, verifies its digest, and writes
//! it under the file root; removal moves files to the trash area so a
//! rollback can restore them without re-downloading.

use crate::deptree;
use crate::digest;
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Error, Result};
use crate::future::{self, Future, Step};
use crate::storage::{
    collect_file_errors, package_id, split_package_id, PackageEntry, PackageManifest, Storage,
};
use crate::transaction::{Action, ActionData, ActionKind, Transaction};
use crate::wildcard::Wildcard;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, warn};

/// Sublists at or below this length are sorted in one step during the
/// index rebuild.
const SORT_STEP_LIMIT: usize = 32;

/// Append `@*` to a bare pattern so wildcards in the name half cannot
/// cross into the repository half.
fn package_pattern(pattern: &str) -> String {
    if pattern.contains('@') {
        pattern.to_string()
    } else {
        format!("{pattern}@*")
    }
}

/// Orchestrates package-level operations against shared storage.
#[derive(Clone)]
pub struct PackageManager {
    storage: Rc<RefCell<Storage>>,
    drivers: Rc<DriverRegistry>,
}

impl PackageManager {
    pub fn new(storage: Rc<RefCell<Storage>>, drivers: Rc<DriverRegistry>) -> Self {
        Self { storage, drivers }
    }

    pub fn storage(&self) -> &Rc<RefCell<Storage>> {
        &self.storage
    }

    /// Search the catalogs of every stored repository.
    ///
    /// The pattern has the form `name[@repository]`; a missing repository
    /// half means `@*`. Returns shallow manifest copies grouped by
    /// repository identifier.
    pub fn find(&self, pattern: &str) -> Result<BTreeMap<String, Vec<PackageManifest>>> {
        let wildcard = Wildcard::compile(&package_pattern(pattern), Some('@'))?;
        let storage = self.storage.borrow();
        let mut out: BTreeMap<String, Vec<PackageManifest>> = BTreeMap::new();
        for (identifier, entry) in &storage.store {
            for (name, manifest) in &entry.index.packages {
                if wildcard.matches(&package_id(name, identifier)) {
                    out.entry(identifier.clone())
                        .or_default()
                        .push(manifest.clone());
                }
            }
        }
        Ok(out)
    }

    /// Installed package identifiers matching a pattern.
    pub fn installed(&self, pattern: &str) -> Result<Vec<String>> {
        let wildcard = Wildcard::compile(&package_pattern(pattern), Some('@'))?;
        Ok(self
            .storage
            .borrow()
            .pool
            .keys()
            .filter(|id| wildcard.matches(id))
            .cloned()
            .collect())
    }

    /// Package identifiers in the index matching a pattern, ordered by
    /// repository priority (highest first, identifier ascending on ties).
    fn resolve_ids(&self, pattern: &str) -> Result<Vec<String>> {
        let wildcard = Wildcard::compile(&package_pattern(pattern), Some('@'))?;
        let storage = self.storage.borrow();
        let mut matches: Vec<(i64, String)> = storage
            .index
            .keys()
            .filter(|id| wildcard.matches_exact(id))
            .map(|id| {
                let priority = split_package_id(id)
                    .and_then(|(_, repo)| storage.store.get(repo))
                    .map(|e| e.index.priority)
                    .unwrap_or(0);
                (priority, id.clone())
            })
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(matches.into_iter().map(|(_, id)| id).collect())
    }

    /// The winning index entry for a bare name, or the exact entries for a
    /// qualified pattern.
    fn resolve_requested(&self, name: &str) -> Result<Vec<String>> {
        let mut ids = self.resolve_ids(name)?;
        if !name.contains('@') {
            ids.truncate(1);
        }
        Ok(ids)
    }

    /// Rebuild the global package index from the store.
    ///
    /// The store is walked highest-priority first so callers iterating the
    /// result see the priority winner for each name before its shadows.
    /// Resolves to the deduplicated package names.
    pub fn build_index(&self) -> Future<Vec<String>> {
        let mgr = self.clone();
        let mut sorting: Option<Future<Vec<(i64, String)>>> = None;

        Future::new(move || {
            let Some(fut) = sorting.as_mut() else {
                let keys: Vec<(i64, String)> = {
                    let mut storage = mgr.storage.borrow_mut();
                    for (file, e) in storage.load_if_expired() {
                        warn!("state load ({file}): {e}");
                    }
                    storage
                        .store
                        .values()
                        .map(|e| (e.index.priority, e.identifier.clone()))
                        .collect()
                };
                sorting = Some(future::sort(
                    keys,
                    |a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)),
                    SORT_STEP_LIMIT,
                ));
                return Step::Pending;
            };

            if !fut.poll() {
                return Step::Pending;
            }
            let ordered = fut.try_take().unwrap_or_default();

            let mut packs: Vec<String> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            let mut index: BTreeMap<String, PackageEntry> = BTreeMap::new();
            {
                let storage = mgr.storage.borrow();
                for (_priority, identifier) in &ordered {
                    let Some(entry) = storage.store.get(identifier) else {
                        continue;
                    };
                    for (name, manifest) in &entry.index.packages {
                        if seen.insert(name.clone()) {
                            packs.push(name.clone());
                        }
                        index.insert(
                            package_id(name, identifier),
                            PackageEntry {
                                repository: identifier.clone(),
                                user_installed: false,
                                manifest: manifest.clone(),
                            },
                        );
                    }
                }
            }
            {
                let mut storage = mgr.storage.borrow_mut();
                storage.index = index;
                for (file, e) in storage.flush() {
                    warn!("state flush ({file}): {e}");
                }
            }
            debug!("indexed {} package names", packs.len());
            Step::Done(packs)
        })
    }

    /// Install packages and their transitive dependencies.
    ///
    /// Bare names resolve to the highest-priority index entry; qualified
    /// `name@repository` requests resolve exactly. Dependency actions come
    /// first, then the user-requested roots flagged `user_installed`.
    pub fn add(&self, names: Vec<String>) -> Future<(Option<Transaction>, Vec<Error>)> {
        let mgr = self.clone();
        let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
        let mut roots: Vec<String> = Vec::new();
        let mut expansion: Option<Future<Vec<String>>> = None;

        Future::new(move || {
            let Some(fut) = expansion.as_mut() else {
                {
                    let mut storage = mgr.storage.borrow_mut();
                    for (file, e) in storage.load_if_expired() {
                        warn!("state load ({file}): {e}");
                    }
                }
                // Resolve requests through the index, dedup by identifier.
                let mut requested: Vec<String> = Vec::new();
                for name in &names {
                    match mgr.resolve_requested(name) {
                        Ok(ids) if ids.is_empty() => errors
                            .borrow_mut()
                            .push(Error::NotFound(format!("package {name}"))),
                        Ok(ids) => {
                            for id in ids {
                                if !requested.contains(&id) {
                                    requested.push(id);
                                }
                            }
                        }
                        Err(e) => errors.borrow_mut().push(e),
                    }
                }

                let mut pool: Vec<String> = mgr.storage.borrow().pool.keys().cloned().collect();
                for id in requested {
                    if pool.contains(&id) {
                        errors
                            .borrow_mut()
                            .push(Error::AlreadyPresent(format!("package {id}")));
                    } else {
                        roots.push(id.clone());
                        pool.push(id);
                    }
                }

                let getter = {
                    let mgr = mgr.clone();
                    let errors = errors.clone();
                    move |pid: &str| {
                        let deps = mgr
                            .storage
                            .borrow()
                            .index
                            .get(pid)
                            .map(|e| e.manifest.dependencies.clone())
                            .unwrap_or_default();
                        let mut resolved = Vec::new();
                        for dep in deps {
                            match mgr.resolve_dep(&dep) {
                                Ok(ids) if ids.is_empty() => errors
                                    .borrow_mut()
                                    .push(Error::NotFound(format!("dependency {dep} of {pid}"))),
                                Ok(ids) => resolved.extend(ids),
                                Err(e) => errors.borrow_mut().push(e),
                            }
                        }
                        Some(resolved)
                    }
                };
                expansion = Some(deptree::expand(pool, getter));
                return Step::Pending;
            };

            if !fut.poll() {
                return Step::Pending;
            }
            let additions = fut.try_take().unwrap_or_default();

            let mut actions = Vec::new();
            for pid in additions.iter().chain(roots.iter()) {
                let entry = mgr.storage.borrow().index.get(pid).cloned();
                match entry {
                    Some(mut entry) => {
                        entry.user_installed = roots.contains(pid);
                        actions.push(mgr.install_action(entry));
                    }
                    None => errors
                        .borrow_mut()
                        .push(Error::NotFound(format!("package {pid}"))),
                }
            }

            let errs = std::mem::take(&mut *errors.borrow_mut());
            if actions.is_empty() && !errs.is_empty() {
                return Step::Done((None, errs));
            }
            Step::Done((Some(mgr.transaction(actions)), errs))
        })
    }

    /// Remove packages, pruning dependencies that become orphaned.
    ///
    /// `user_installed` entries stay pinned unless they are removal roots.
    /// Files transit through the trash area so the rollback can restore
    /// them without re-downloading.
    pub fn remove(&self, names: Vec<String>) -> Future<(Option<Transaction>, Vec<Error>)> {
        let mgr = self.clone();
        let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
        let mut shrinking: Option<Future<Vec<String>>> = None;

        Future::new(move || {
            let Some(fut) = shrinking.as_mut() else {
                {
                    let mut storage = mgr.storage.borrow_mut();
                    for (file, e) in storage.load_if_expired() {
                        warn!("state load ({file}): {e}");
                    }
                }
                let pool: Vec<String> = mgr.storage.borrow().pool.keys().cloned().collect();
                let mut roots: Vec<String> = Vec::new();
                for name in &names {
                    match mgr.match_installed(name) {
                        Ok(ids) if ids.is_empty() => errors
                            .borrow_mut()
                            .push(Error::NotPresent(format!("package {name}"))),
                        Ok(ids) => roots.extend(ids),
                        Err(e) => errors.borrow_mut().push(e),
                    }
                }

                let get_deps = {
                    let mgr = mgr.clone();
                    move |pid: &str| {
                        let deps = mgr
                            .storage
                            .borrow()
                            .pool
                            .get(pid)
                            .map(|e| e.manifest.dependencies.clone())
                            .unwrap_or_default();
                        let mut resolved = Vec::new();
                        for dep in deps {
                            // Dependencies count only against what is
                            // actually installed.
                            if let Ok(ids) = mgr.match_installed(&dep) {
                                resolved.extend(ids);
                            }
                        }
                        Some(resolved)
                    }
                };
                let is_pinned = {
                    let storage = mgr.storage.clone();
                    move |pid: &str| {
                        if roots.iter().any(|r| r == pid) {
                            return false;
                        }
                        storage
                            .borrow()
                            .pool
                            .get(pid)
                            .map(|e| e.user_installed)
                            .unwrap_or(false)
                    }
                };
                shrinking = Some(deptree::shrink(pool, get_deps, is_pinned));
                return Step::Pending;
            };

            if !fut.poll() {
                return Step::Pending;
            }
            let deletions = fut.try_take().unwrap_or_default();

            let mut actions = Vec::new();
            for pid in &deletions {
                let entry = mgr.storage.borrow().pool.get(pid).cloned();
                match entry {
                    Some(entry) => actions.push(mgr.remove_action(entry)),
                    None => errors
                        .borrow_mut()
                        .push(Error::NotPresent(format!("package {pid}"))),
                }
            }

            let errs = std::mem::take(&mut *errors.borrow_mut());
            if actions.is_empty() && !errs.is_empty() {
                return Step::Done((None, errs));
            }
            Step::Done((Some(mgr.transaction(actions)), errs))
        })
    }

    /// Resolve a dependency name: installed copies win, otherwise the
    /// highest-priority index entry.
    fn resolve_dep(&self, dep: &str) -> Result<Vec<String>> {
        let installed = self.match_installed(dep)?;
        if !installed.is_empty() {
            return Ok(installed);
        }
        self.resolve_requested(dep)
    }

    /// Installed identifiers a `name[@repository]` pattern selects.
    fn match_installed(&self, pattern: &str) -> Result<Vec<String>> {
        let wildcard = Wildcard::compile(&package_pattern(pattern), Some('@'))?;
        Ok(self
            .storage
            .borrow()
            .pool
            .keys()
            .filter(|id| wildcard.matches_exact(id))
            .cloned()
            .collect())
    }

    fn transaction(&self, actions: Vec<Action>) -> Transaction {
        let open_storage = self.storage.clone();
        let close_storage = self.storage.clone();
        Transaction::new(actions).with_hooks(
            move || {
                let errors = open_storage.borrow_mut().load_if_expired();
                collect_file_errors(errors)
            },
            move || {
                let errors = close_storage.borrow_mut().flush();
                collect_file_errors(errors)
            },
        )
    }

    fn install_action(&self, entry: PackageEntry) -> Action {
        let data = ActionData::new(ActionKind::InstallPackage, entry.id());
        let apply_mgr = self.clone();
        let apply_entry = entry.clone();
        let rollback_mgr = self.clone();
        Action::new(data)
            .with_apply(move || apply_mgr.download_files(&apply_entry))
            .with_rollback(move || rollback_mgr.delete_files(&entry))
    }

    fn remove_action(&self, entry: PackageEntry) -> Action {
        let data = ActionData::new(ActionKind::RemovePackage, entry.id());
        let apply_mgr = self.clone();
        let apply_entry = entry.clone();
        let rollback_mgr = self.clone();
        Action::new(data)
            .with_apply(move || apply_mgr.move_to_trash(&apply_entry))
            .with_rollback(move || rollback_mgr.restore_from_trash(&entry))
    }

    /// The driver responsible for a repository, preferring the one stamped
    /// into its stored index.
    fn driver_for(&self, repository: &str) -> Result<Rc<dyn Driver>> {
        let stamped = self
            .storage
            .borrow()
            .store
            .get(repository)
            .map(|e| e.index.driver.clone());
        if let Some(driver) = stamped.and_then(|name| self.drivers.get(&name)) {
            return Ok(driver);
        }
        self.drivers
            .select_for(repository)
            .ok_or_else(|| Error::NoDriver(repository.to_string()))
    }

    /// Download, verify, and write every file of a manifest, then record
    /// the entry in the pool. The pool is untouched if any file fails.
    fn download_files(&self, entry: &PackageEntry) -> Result<()> {
        let driver = self.driver_for(&entry.repository)?;
        for (path, expected) in &entry.manifest.files {
            let bytes =
                driver.fetch_package_file(&entry.repository, &entry.manifest.name, path)?;
            digest::verify(path, &bytes, expected)?;
            let target = self.storage.borrow().install_path(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &bytes)?;
            debug!("installed {}", target.display());
        }
        self.storage
            .borrow_mut()
            .pool
            .insert(entry.id(), entry.clone());
        Ok(())
    }

    /// Delete a manifest's files and prune emptied directories. Missing
    /// files are tolerated so this can undo a partial download.
    fn delete_files(&self, entry: &PackageEntry) -> Result<()> {
        let root = self.storage.borrow().root_dir().to_path_buf();
        for path in entry.manifest.files.keys() {
            let target = self.storage.borrow().install_path(path);
            if target.exists() {
                fs::remove_file(&target)?;
                debug!("deleted {}", target.display());
            }
            prune_empty_parents(&target, &root);
        }
        self.storage.borrow_mut().pool.remove(&entry.id());
        Ok(())
    }

    /// Move a manifest's files into the trash area, keyed by install path,
    /// overwriting whatever a previous removal left there.
    fn move_to_trash(&self, entry: &PackageEntry) -> Result<()> {
        let root = self.storage.borrow().root_dir().to_path_buf();
        for path in entry.manifest.files.keys() {
            let (source, dest) = {
                let storage = self.storage.borrow();
                (storage.install_path(path), storage.trash_path(path))
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            if dest.exists() {
                fs::remove_file(&dest)?;
            }
            move_file(&source, &dest)?;
            prune_empty_parents(&source, &root);
        }
        self.storage.borrow_mut().pool.remove(&entry.id());
        Ok(())
    }

    /// Bring trashed files back, verifying each against its manifest
    /// digest. Missing trash entries are skipped so a partially applied
    /// removal can still be undone.
    fn restore_from_trash(&self, entry: &PackageEntry) -> Result<()> {
        for (path, expected) in &entry.manifest.files {
            let (trashed, target) = {
                let storage = self.storage.borrow();
                (storage.trash_path(path), storage.install_path(path))
            };
            if !trashed.exists() {
                continue;
            }
            let bytes = fs::read(&trashed)?;
            digest::verify(path, &bytes, expected)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            move_file(&trashed, &target)?;
            debug!("restored {}", target.display());
        }
        self.storage
            .borrow_mut()
            .pool
            .insert(entry.id(), entry.clone());
        Ok(())
    }
}

/// Rename, falling back to copy-and-delete for cross-filesystem moves.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
    }
}

/// Climb from a deleted file towards the root, removing directories as
/// they empty out. Stops at the first non-empty directory or at the root.
fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == stop || !d.starts_with(stop) {
            break;
        }
        match fs::read_dir(d) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RepositoryIndex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Serves indexes and file bytes from fixed maps.
    struct ScriptedDriver {
        indexes: HashMap<String, RepositoryIndex>,
        files: HashMap<(String, String, String), Vec<u8>>,
    }

    impl Driver for ScriptedDriver {
        fn name(&self) -> &str {
            "scripted"
        }
        fn compatible(&self, _identifier: &str) -> bool {
            true
        }
        fn exists(&self, identifier: &str) -> bool {
            self.indexes.contains_key(identifier)
        }
        fn fetch_index(&self, identifier: &str) -> Result<RepositoryIndex> {
            self.indexes
                .get(identifier)
                .cloned()
                .ok_or_else(|| Error::NotFound(identifier.to_string()))
        }
        fn fetch_package_file(
            &self,
            identifier: &str,
            package: &str,
            path: &str,
        ) -> Result<Vec<u8>> {
            self.files
                .get(&(
                    identifier.to_string(),
                    package.to_string(),
                    path.to_string(),
                ))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("{identifier}:{package}:{path}")))
        }
    }

    struct Fixture {
        _dir: TempDir,
        packages: PackageManager,
        repositories: crate::repository::RepositoryManager,
    }

    fn manifest(name: &str, deps: &[&str], files: &[(&str, &str)]) -> PackageManifest {
        PackageManifest {
            name: name.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            files: files
                .iter()
                .map(|(p, d)| (p.to_string(), d.to_string()))
                .collect(),
            metadata: BTreeMap::new(),
        }
    }

    fn repo_index(name: &str, priority: i64, packages: Vec<PackageManifest>) -> RepositoryIndex {
        RepositoryIndex {
            name: name.to_string(),
            priority,
            companions: Vec::new(),
            packages: packages
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
            driver: String::new(),
            update_timestamp: 0,
        }
    }

    fn fixture(
        indexes: Vec<(&str, RepositoryIndex)>,
        files: Vec<(&str, &str, &str, &[u8])>,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Rc::new(RefCell::new(
            Storage::open(dir.path().join("state"), dir.path().join("root")).unwrap(),
        ));
        let driver = ScriptedDriver {
            indexes: indexes
                .into_iter()
                .map(|(id, idx)| (id.to_string(), idx))
                .collect(),
            files: files
                .into_iter()
                .map(|(r, p, f, b)| ((r.to_string(), p.to_string(), f.to_string()), b.to_vec()))
                .collect(),
        };
        let mut registry = DriverRegistry::new();
        registry.register(Rc::new(driver));
        let drivers = Rc::new(registry);
        Fixture {
            _dir: dir,
            packages: PackageManager::new(storage.clone(), drivers.clone()),
            repositories: crate::repository::RepositoryManager::new(storage, drivers),
        }
    }

    /// Install the given repositories and rebuild the index.
    fn install_repos(fx: &Fixture, ids: &[&str]) {
        let (tx, errors) = fx
            .repositories
            .add(ids.iter().map(|s| s.to_string()).collect())
            .wait();
        assert!(errors.is_empty(), "{errors:?}");
        tx.unwrap().apply().unwrap();
        fx.packages.build_index().wait();
    }

    #[test]
    fn test_find_groups_by_repository() {
        let fx = fixture(
            vec![
                ("r1", repo_index("r1", 0, vec![manifest("align", &[], &[])])),
                ("r2", repo_index("r2", 0, vec![manifest("align", &[], &[])])),
            ],
            Vec::new(),
        );
        install_repos(&fx, &["r1", "r2"]);
        let found = fx.packages.find("align").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["r1"][0].name, "align");

        let found = fx.packages.find("align@r2").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("r2"));
    }

    #[test]
    fn test_build_index_priority_tie_break() {
        let fx = fixture(
            vec![
                ("R1", repo_index("R1", 10, vec![manifest("X", &[], &[])])),
                ("R2", repo_index("R2", 10, vec![manifest("X", &[], &[])])),
                ("R3", repo_index("R3", 5, vec![manifest("X", &[], &[])])),
            ],
            Vec::new(),
        );
        install_repos(&fx, &["R1", "R2", "R3"]);

        let storage = fx.packages.storage().borrow();
        assert!(storage.index.contains_key("X@R1"));
        assert!(storage.index.contains_key("X@R2"));
        assert!(storage.index.contains_key("X@R3"));
        drop(storage);

        // Equal priority breaks alphabetically; R3 can never win.
        let ordered = fx.packages.resolve_ids("X").unwrap();
        assert_eq!(ordered, vec!["X@R1", "X@R2", "X@R3"]);
    }

    #[test]
    fn test_build_index_resolves_to_packs() {
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest("a", &[], &[]), manifest("b", &[], &[])],
                ),
            )],
            Vec::new(),
        );
        install_repos(&fx, &["r1"]);
        let packs = fx.packages.build_index().wait();
        assert_eq!(packs, vec!["a", "b"]);
    }

    #[test]
    fn test_add_installs_files_and_dependencies() {
        let lib = b"return {}";
        let dep = b"dep bytes";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![
                        manifest(
                            "align",
                            &["base"],
                            &[("lib/align/init.txt", &digest::digest(lib))],
                        ),
                        manifest("base", &[], &[("lib/base/init.txt", &digest::digest(dep))]),
                    ],
                ),
            )],
            vec![
                ("r1", "align", "lib/align/init.txt", lib),
                ("r1", "base", "lib/base/init.txt", dep),
            ],
        );
        install_repos(&fx, &["r1"]);

        let (tx, errors) = fx.packages.add(vec!["align".to_string()]).wait();
        assert!(errors.is_empty(), "{errors:?}");
        let mut tx = tx.unwrap();
        let subjects: Vec<String> = tx.actions().iter().map(|d| d.subject.clone()).collect();
        // Dependency first, then the requested root.
        assert_eq!(subjects, vec!["base@r1", "align@r1"]);
        assert!(tx.apply().is_ok());

        let storage = fx.packages.storage().borrow();
        assert!(storage.pool["align@r1"].user_installed);
        assert!(!storage.pool["base@r1"].user_installed);
        let on_disk = fs::read(storage.install_path("lib/align/init.txt")).unwrap();
        assert_eq!(on_disk, lib);
    }

    #[test]
    fn test_add_unknown_package() {
        let fx = fixture(
            vec![("r1", repo_index("r1", 0, Vec::new()))],
            Vec::new(),
        );
        install_repos(&fx, &["r1"]);
        let (tx, errors) = fx.packages.add(vec!["ghost".to_string()]).wait();
        assert!(tx.is_none());
        assert!(matches!(errors[0], Error::NotFound(_)));
    }

    #[test]
    fn test_add_already_installed() {
        let bytes = b"x";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest("a", &[], &[("lib/a.txt", &digest::digest(bytes))])],
                ),
            )],
            vec![("r1", "a", "lib/a.txt", bytes)],
        );
        install_repos(&fx, &["r1"]);
        let (tx, _) = fx.packages.add(vec!["a".to_string()]).wait();
        tx.unwrap().apply().unwrap();

        let (tx, errors) = fx.packages.add(vec!["a".to_string()]).wait();
        assert!(tx.is_none());
        assert!(matches!(errors[0], Error::AlreadyPresent(_)));
    }

    #[test]
    fn test_digest_mismatch_rolls_back() {
        let good = b"expected bytes";
        let served = b"tampered bytes";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest(
                        "p",
                        &[],
                        &[("lib/p/init.txt", &digest::digest(good))],
                    )],
                ),
            )],
            vec![("r1", "p", "lib/p/init.txt", served)],
        );
        install_repos(&fx, &["r1"]);

        let (tx, errors) = fx.packages.add(vec!["p".to_string()]).wait();
        assert!(errors.is_empty());
        let failures = tx.unwrap().apply().unwrap_err();
        let mismatch = failures
            .iter()
            .find(|f| matches!(f.error, Error::DigestMismatch { .. }))
            .expect("digest mismatch reported");
        // The error names the digest that was actually computed.
        assert!(mismatch
            .error
            .to_string()
            .contains(&digest::digest(served)));

        let storage = fx.packages.storage().borrow();
        assert!(!storage.pool.contains_key("p@r1"));
        assert!(!storage.install_path("lib/p/init.txt").exists());
    }

    #[test]
    fn test_remove_moves_to_trash_and_prunes() {
        let bytes = b"bytes";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest(
                        "p",
                        &[],
                        &[("lib/p/init.txt", &digest::digest(bytes))],
                    )],
                ),
            )],
            vec![("r1", "p", "lib/p/init.txt", bytes)],
        );
        install_repos(&fx, &["r1"]);
        let (tx, _) = fx.packages.add(vec!["p".to_string()]).wait();
        tx.unwrap().apply().unwrap();

        let (tx, errors) = fx.packages.remove(vec!["p".to_string()]).wait();
        assert!(errors.is_empty(), "{errors:?}");
        assert!(tx.unwrap().apply().is_ok());

        let storage = fx.packages.storage().borrow();
        assert!(!storage.pool.contains_key("p@r1"));
        assert!(!storage.install_path("lib/p/init.txt").exists());
        // Emptied directories were pruned, trash holds the bytes.
        assert!(!storage.install_path("lib/p").exists());
        assert_eq!(fs::read(storage.trash_path("lib/p/init.txt")).unwrap(), bytes);
    }

    #[test]
    fn test_remove_keeps_shared_dependency() {
        let a = b"a";
        let b = b"b";
        let c = b"c";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![
                        manifest("a", &["c"], &[("lib/a.txt", &digest::digest(a))]),
                        manifest("b", &["c"], &[("lib/b.txt", &digest::digest(b))]),
                        manifest("c", &[], &[("lib/c.txt", &digest::digest(c))]),
                    ],
                ),
            )],
            vec![
                ("r1", "a", "lib/a.txt", a),
                ("r1", "b", "lib/b.txt", b),
                ("r1", "c", "lib/c.txt", c),
            ],
        );
        install_repos(&fx, &["r1"]);
        let (tx, _) = fx
            .packages
            .add(vec!["a".to_string(), "b".to_string()])
            .wait();
        tx.unwrap().apply().unwrap();

        // Removing a leaves c alone: b still depends on it.
        let (tx, _) = fx.packages.remove(vec!["a".to_string()]).wait();
        tx.unwrap().apply().unwrap();
        let storage = fx.packages.storage().borrow();
        assert!(!storage.pool.contains_key("a@r1"));
        assert!(storage.pool.contains_key("b@r1"));
        assert!(storage.pool.contains_key("c@r1"));
        drop(storage);

        // Removing b now drops the orphaned c too.
        let (tx, _) = fx.packages.remove(vec!["b".to_string()]).wait();
        tx.unwrap().apply().unwrap();
        let storage = fx.packages.storage().borrow();
        assert!(storage.pool.is_empty());
    }

    #[test]
    fn test_restore_from_trash_round_trip() {
        let bytes = b"precious";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest(
                        "p",
                        &[],
                        &[("lib/p/init.txt", &digest::digest(bytes))],
                    )],
                ),
            )],
            vec![("r1", "p", "lib/p/init.txt", bytes)],
        );
        install_repos(&fx, &["r1"]);
        let (tx, _) = fx.packages.add(vec!["p".to_string()]).wait();
        tx.unwrap().apply().unwrap();

        let entry = fx.packages.storage().borrow().pool["p@r1"].clone();
        fx.packages.move_to_trash(&entry).unwrap();
        assert!(!fx
            .packages
            .storage()
            .borrow()
            .install_path("lib/p/init.txt")
            .exists());

        fx.packages.restore_from_trash(&entry).unwrap();
        let storage = fx.packages.storage().borrow();
        assert!(storage.pool.contains_key("p@r1"));
        assert_eq!(
            fs::read(storage.install_path("lib/p/init.txt")).unwrap(),
            bytes
        );
    }

    #[test]
    fn test_installed_listing() {
        let bytes = b"x";
        let fx = fixture(
            vec![(
                "r1",
                repo_index(
                    "r1",
                    0,
                    vec![manifest("a", &[], &[("lib/a.txt", &digest::digest(bytes))])],
                ),
            )],
            vec![("r1", "a", "lib/a.txt", bytes)],
        );
        install_repos(&fx, &["r1"]);
        assert!(fx.packages.installed("").unwrap().is_empty());
        let (tx, _) = fx.packages.add(vec!["a".to_string()]).wait();
        tx.unwrap().apply().unwrap();
        assert_eq!(fx.packages.installed("").unwrap(), vec!["a@r1"]);
        assert_eq!(fx.packages.installed("a").unwrap(), vec!["a@r1"]);
        assert!(fx.packages.installed("z*").unwrap().is_empty());
    }
}
