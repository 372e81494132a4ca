// tests/common/mod.rs

//! Shared test fixtures: a scripted in-memory driver and a fresh storage
//! per scenario.

#![allow(dead_code)]

use capstan::digest;
use capstan::{
    Driver, DriverRegistry, Error, PackageManager, PackageManifest, RepositoryIndex,
    RepositoryManager, Result, Storage,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tempfile::TempDir;

/// A driver serving indexes and file bytes from fixed maps, counting index
/// fetches per identifier.
pub struct ScriptedDriver {
    indexes: HashMap<String, RepositoryIndex>,
    files: HashMap<(String, String, String), Vec<u8>>,
    fetches: Rc<RefCell<HashMap<String, u32>>>,
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
        *self
            .fetches
            .borrow_mut()
            .entry(identifier.to_string())
            .or_insert(0) += 1;
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
            .ok_or_else(|| {
                Error::Fetch {
                    identifier: identifier.to_string(),
                    message: format!("no such file {package}/{path}"),
                }
            })
    }
}

/// A full test world: storage on a temp dir, one scripted driver, both
/// orchestrators. Keep the `TempDir` alive to prevent cleanup.
pub struct Fixture {
    pub dir: TempDir,
    pub storage: Rc<RefCell<Storage>>,
    pub repositories: RepositoryManager,
    pub packages: PackageManager,
    pub fetches: Rc<RefCell<HashMap<String, u32>>>,
}

impl Fixture {
    /// How many times the driver fetched an identifier's index.
    pub fn fetch_count(&self, identifier: &str) -> u32 {
        self.fetches.borrow().get(identifier).copied().unwrap_or(0)
    }

    /// Install repositories and rebuild the package index.
    pub fn install_repos(&self, identifiers: &[&str]) {
        let (tx, errors) = self
            .repositories
            .add(identifiers.iter().map(|s| s.to_string()).collect())
            .wait();
        assert!(errors.is_empty(), "repository add errors: {errors:?}");
        tx.expect("repository add transaction")
            .apply()
            .expect("repository add apply");
        self.packages.build_index().wait();
    }

    /// Install packages, asserting clean resolution and apply.
    pub fn install_packages(&self, names: &[&str]) {
        let (tx, errors) = self
            .packages
            .add(names.iter().map(|s| s.to_string()).collect())
            .wait();
        assert!(errors.is_empty(), "package add errors: {errors:?}");
        tx.expect("package add transaction")
            .apply()
            .expect("package add apply");
    }
}

/// Declarative fixture input: one repository with its manifests and the
/// bytes its files serve.
pub struct RepoSpec {
    pub identifier: &'static str,
    pub priority: i64,
    pub companions: Vec<&'static str>,
    pub packages: Vec<PackageSpec>,
}

pub struct PackageSpec {
    pub name: &'static str,
    pub dependencies: Vec<&'static str>,
    /// (install path, served bytes); the expected digest is computed from
    /// the bytes unless overridden by `bad_digest`.
    pub files: Vec<(&'static str, &'static [u8])>,
    /// Record a wrong expected digest for every file, to provoke
    /// digest-mismatch failures.
    pub bad_digest: bool,
}

impl PackageSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            dependencies: Vec::new(),
            files: Vec::new(),
            bad_digest: false,
        }
    }

    pub fn depends(mut self, deps: &[&'static str]) -> Self {
        self.dependencies = deps.to_vec();
        self
    }

    pub fn file(mut self, path: &'static str, bytes: &'static [u8]) -> Self {
        self.files.push((path, bytes));
        self
    }

    pub fn corrupt(mut self) -> Self {
        self.bad_digest = true;
        self
    }
}

impl RepoSpec {
    pub fn new(identifier: &'static str) -> Self {
        Self {
            identifier,
            priority: 0,
            companions: Vec::new(),
            packages: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn companions(mut self, companions: &[&'static str]) -> Self {
        self.companions = companions.to_vec();
        self
    }

    pub fn package(mut self, package: PackageSpec) -> Self {
        self.packages.push(package);
        self
    }
}

/// Build a world from repository specs.
pub fn fixture(repos: Vec<RepoSpec>) -> Fixture {
    let mut indexes = HashMap::new();
    let mut files = HashMap::new();

    for repo in &repos {
        let mut packages = BTreeMap::new();
        for pkg in &repo.packages {
            let mut file_digests = BTreeMap::new();
            for (path, bytes) in &pkg.files {
                let expected = if pkg.bad_digest {
                    digest::digest(b"something else entirely")
                } else {
                    digest::digest(bytes)
                };
                file_digests.insert(path.to_string(), expected);
                files.insert(
                    (
                        repo.identifier.to_string(),
                        pkg.name.to_string(),
                        path.to_string(),
                    ),
                    bytes.to_vec(),
                );
            }
            packages.insert(
                pkg.name.to_string(),
                PackageManifest {
                    name: pkg.name.to_string(),
                    dependencies: pkg.dependencies.iter().map(|s| s.to_string()).collect(),
                    files: file_digests,
                    metadata: BTreeMap::new(),
                },
            );
        }
        indexes.insert(
            repo.identifier.to_string(),
            RepositoryIndex {
                name: repo.identifier.to_string(),
                priority: repo.priority,
                companions: repo.companions.iter().map(|s| s.to_string()).collect(),
                packages,
                driver: String::new(),
                update_timestamp: 0,
            },
        );
    }

    let dir = TempDir::new().expect("temp dir");
    let storage = Rc::new(RefCell::new(
        Storage::open(dir.path().join("state"), dir.path().join("root")).expect("storage"),
    ));
    let fetches = Rc::new(RefCell::new(HashMap::new()));
    let mut registry = DriverRegistry::new();
    registry.register(Rc::new(ScriptedDriver {
        indexes,
        files,
        fetches: fetches.clone(),
    }));
    let drivers = Rc::new(registry);

    Fixture {
        dir,
        repositories: RepositoryManager::new(storage.clone(), drivers.clone()),
        packages: PackageManager::new(storage.clone(), drivers),
        storage,
        fetches,
    }
}
