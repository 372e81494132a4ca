// src/driver/mod.rs

//! Pluggable repository drivers.
//!
//! A driver turns a repository identifier into an index and turns
//! `(repository, package, path)` into file bytes. Drivers are read-only;
//! all local mutation happens in the orchestrators.
//!
//! The registry is populated at startup from the known implementations and
//! keeps registration order; [`DriverRegistry::select_for`] returns the
//! first driver claiming compatibility with an identifier. A registry
//! built with no drivers at all falls back to the built-in `github`
//! driver.

pub mod github;

pub use github::GithubDriver;

use crate::error::Result;
use crate::storage::RepositoryIndex;
use std::rc::Rc;
use tracing::debug;

/// A pluggable fetcher for a family of repository identifiers.
pub trait Driver {
    /// The registry key, also stamped into fetched indexes.
    fn name(&self) -> &str;

    /// Whether this driver understands the identifier at all.
    fn compatible(&self, identifier: &str) -> bool;

    /// Whether the identifier points at an actual repository.
    fn exists(&self, identifier: &str) -> bool;

    /// Fetch and decode the repository index.
    fn fetch_index(&self, identifier: &str) -> Result<RepositoryIndex>;

    /// Fetch one package file's bytes.
    fn fetch_package_file(&self, identifier: &str, package: &str, path: &str)
        -> Result<Vec<u8>>;
}

/// Registration-ordered driver collection.
pub struct DriverRegistry {
    drivers: Vec<Rc<dyn Driver>>,
}

impl DriverRegistry {
    /// An empty registry. Most callers want
    /// [`with_defaults`](Self::with_defaults) instead; an empty registry
    /// selects nothing.
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    /// The standard startup registry: every built-in driver, currently
    /// just `github`.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Rc::new(GithubDriver::new()?));
        Ok(registry)
    }

    pub fn register(&mut self, driver: Rc<dyn Driver>) {
        debug!("registered driver {}", driver.name());
        self.drivers.push(driver);
    }

    /// First registered driver compatible with the identifier.
    pub fn select_for(&self, identifier: &str) -> Option<Rc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|d| d.compatible(identifier))
            .cloned()
    }

    /// Look a driver up by name (as stamped into a cached index).
    pub fn get(&self, name: &str) -> Option<Rc<dyn Driver>> {
        self.drivers.iter().find(|d| d.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
