// src/repository.rs

//! Repository orchestration: fetching remote indexes and adding/removing
//! repositories with companion expansion.
//!
//! Repositories declare *companions*, other repositories they depend on.
//! Adding a repository therefore closes over companion edges, and removing
//! one shrinks the store back to what the remaining user-installed roots
//! reach. Both operations resolve to a [`Transaction`] whose actions
//! mutate the store; nothing is written until the caller applies it.

use crate::deptree;
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Error, Result};
use crate::future::{self, Future, Step};
use crate::storage::{collect_file_errors, RepositoryEntry, RepositoryIndex, Storage};
use crate::transaction::{Action, ActionData, ActionKind, Transaction};
use crate::wildcard::Wildcard;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, warn};

/// Orchestrates repository-level operations against shared storage.
#[derive(Clone)]
pub struct RepositoryManager {
    storage: Rc<RefCell<Storage>>,
    drivers: Rc<DriverRegistry>,
}

impl RepositoryManager {
    pub fn new(storage: Rc<RefCell<Storage>>, drivers: Rc<DriverRegistry>) -> Self {
        Self { storage, drivers }
    }

    pub fn storage(&self) -> &Rc<RefCell<Storage>> {
        &self.storage
    }

    pub fn drivers(&self) -> &Rc<DriverRegistry> {
        &self.drivers
    }

    /// Fetch a repository index, reusing the cache inside its TTL.
    ///
    /// Returns the driver that owns the identifier together with the
    /// index, stamped with the driver name and fetch time.
    pub fn fetch(&self, identifier: &str) -> Result<(Rc<dyn Driver>, RepositoryIndex)> {
        {
            let storage = self.storage.borrow();
            if let Some(index) = storage.cached(identifier) {
                if let Some(driver) = self.drivers.get(&index.driver) {
                    debug!("cache hit for {identifier}");
                    return Ok((driver, index.clone()));
                }
            }
        }

        let driver = self
            .drivers
            .select_for(identifier)
            .ok_or_else(|| Error::NoDriver(identifier.to_string()))?;
        if !driver.exists(identifier) {
            return Err(Error::NotFound(format!(
                "repository does not exist: {identifier}"
            )));
        }
        let mut index = driver.fetch_index(identifier)?;
        index.driver = driver.name().to_string();
        index.update_timestamp = crate::storage::epoch();
        self.storage
            .borrow_mut()
            .cache_insert(identifier, index.clone());
        debug!("fetched index for {identifier} via {}", index.driver);
        Ok((driver, index))
    }

    /// Fetch bypassing the cache, for explicit refreshes.
    fn fetch_fresh(&self, identifier: &str) -> Result<(Rc<dyn Driver>, RepositoryIndex)> {
        self.storage.borrow_mut().cache_remove(identifier);
        self.fetch(identifier)
    }

    /// The stored entry for an identifier, or a freshly promoted one.
    ///
    /// A promoted entry is not inserted into the store; insertion is the
    /// job of the transaction action.
    pub fn fetch_entry(&self, identifier: &str) -> Result<RepositoryEntry> {
        if let Some(entry) = self.storage.borrow().store.get(identifier) {
            return Ok(entry.clone());
        }
        let (_driver, index) = self.fetch(identifier)?;
        Ok(RepositoryEntry::from_index(identifier, &index))
    }

    /// Store identifiers matching a wildcard pattern; the empty pattern
    /// matches everything.
    pub fn find(&self, pattern: &str) -> Result<Vec<String>> {
        let wildcard = Wildcard::compile(pattern, None)?;
        Ok(self
            .storage
            .borrow()
            .store
            .keys()
            .filter(|k| wildcard.matches(k))
            .cloned()
            .collect())
    }

    /// Add repositories and their transitive companions.
    ///
    /// Resolves to the transaction (companion actions first, then the
    /// user-requested roots flagged `user_installed`) alongside the
    /// accumulated errors; resolves to no transaction when errors left
    /// nothing to do.
    pub fn add(&self, identifiers: Vec<String>) -> Future<(Option<Transaction>, Vec<Error>)> {
        let mgr = self.clone();
        let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
        let failed: Rc<RefCell<HashSet<String>>> = Rc::new(RefCell::new(HashSet::new()));
        let mut roots: Vec<String> = Vec::new();
        let mut expansion: Option<Future<Vec<String>>> = None;

        Future::new(move || {
            let Some(fut) = expansion.as_mut() else {
                // First step: load state and seed the working pool with
                // everything already installed.
                let mut pool: Vec<String> = {
                    let mut storage = mgr.storage.borrow_mut();
                    for (file, e) in storage.load_if_expired() {
                        warn!("state load ({file}): {e}");
                    }
                    storage.store.keys().cloned().collect()
                };
                for id in &identifiers {
                    if pool.contains(id) {
                        errors
                            .borrow_mut()
                            .push(Error::AlreadyPresent(format!("repository {id}")));
                    } else {
                        roots.push(id.clone());
                        pool.push(id.clone());
                    }
                }
                let getter = {
                    let mgr = mgr.clone();
                    let errors = errors.clone();
                    let failed = failed.clone();
                    move |name: &str| match mgr.fetch(name) {
                        Ok((_driver, index)) => Some(index.companions),
                        Err(e) => {
                            errors.borrow_mut().push(e);
                            failed.borrow_mut().insert(name.to_string());
                            Some(Vec::new())
                        }
                    }
                };
                expansion = Some(deptree::expand(pool, getter));
                return Step::Pending;
            };

            if !fut.poll() {
                return Step::Pending;
            }
            let companions = fut.try_take().unwrap_or_default();

            // Identifiers whose fetch already failed were reported during
            // expansion; skip them here instead of failing twice.
            let mut actions = Vec::new();
            for companion in &companions {
                if failed.borrow().contains(companion)
                    || mgr.storage.borrow().store.contains_key(companion)
                {
                    continue;
                }
                match mgr.fetch_entry(companion) {
                    Ok(entry) => actions.push(mgr.add_action(entry)),
                    Err(e) => errors.borrow_mut().push(e),
                }
            }
            for id in &roots {
                if failed.borrow().contains(id) {
                    continue;
                }
                match mgr.fetch_entry(id) {
                    Ok(mut entry) => {
                        entry.user_installed = true;
                        actions.push(mgr.add_action(entry));
                    }
                    Err(e) => errors.borrow_mut().push(e),
                }
            }

            let errs = std::mem::take(&mut *errors.borrow_mut());
            if actions.is_empty() && !errs.is_empty() {
                return Step::Done((None, errs));
            }
            Step::Done((Some(mgr.transaction(actions)), errs))
        })
    }

    /// Remove repositories, pruning companions that become orphaned.
    ///
    /// `user_installed` entries stay pinned unless they are removal roots
    /// themselves.
    pub fn remove(&self, identifiers: Vec<String>) -> Future<(Option<Transaction>, Vec<Error>)> {
        let mgr = self.clone();
        let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
        let mut shrinking: Option<Future<Vec<String>>> = None;

        Future::new(move || {
            let Some(fut) = shrinking.as_mut() else {
                let pool: Vec<String> = {
                    let mut storage = mgr.storage.borrow_mut();
                    for (file, e) in storage.load_if_expired() {
                        warn!("state load ({file}): {e}");
                    }
                    storage.store.keys().cloned().collect()
                };
                let mut roots: Vec<String> = Vec::new();
                for id in &identifiers {
                    if pool.contains(id) {
                        roots.push(id.clone());
                    } else {
                        errors
                            .borrow_mut()
                            .push(Error::NotPresent(format!("repository {id}")));
                    }
                }
                let get_companions = {
                    let storage = mgr.storage.clone();
                    move |name: &str| {
                        Some(
                            storage
                                .borrow()
                                .store
                                .get(name)
                                .map(|e| e.index.companions.clone())
                                .unwrap_or_default(),
                        )
                    }
                };
                // Removal roots stay in the pool; only their pin is lifted,
                // so a root still referenced by someone else survives.
                let is_pinned = {
                    let storage = mgr.storage.clone();
                    move |name: &str| {
                        if roots.iter().any(|r| r == name) {
                            return false;
                        }
                        storage
                            .borrow()
                            .store
                            .get(name)
                            .map(|e| e.user_installed)
                            .unwrap_or(false)
                    }
                };
                shrinking = Some(deptree::shrink(pool, get_companions, is_pinned));
                return Step::Pending;
            };

            if !fut.poll() {
                return Step::Pending;
            }
            let deletions = fut.try_take().unwrap_or_default();

            let mut actions = Vec::new();
            for id in &deletions {
                let entry = mgr.storage.borrow().store.get(id).cloned();
                match entry {
                    Some(entry) => actions.push(mgr.remove_action(entry)),
                    None => errors
                        .borrow_mut()
                        .push(Error::NotPresent(format!("repository {id}"))),
                }
            }

            let errs = std::mem::take(&mut *errors.borrow_mut());
            if actions.is_empty() && !errs.is_empty() {
                return Step::Done((None, errs));
            }
            Step::Done((Some(mgr.transaction(actions)), errs))
        })
    }

    /// Refresh the stored indexes of installed repositories, bypassing the
    /// cache. With no identifiers, every installed repository is
    /// refreshed. `user_installed` flags are preserved.
    pub fn update(&self, identifiers: Vec<String>) -> Future<(Option<Transaction>, Vec<Error>)> {
        let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
        let targets: Vec<String> = {
            let mut storage = self.storage.borrow_mut();
            for (file, e) in storage.load_if_expired() {
                warn!("state load ({file}): {e}");
            }
            if identifiers.is_empty() {
                storage.store.keys().cloned().collect()
            } else {
                let mut targets = Vec::new();
                for id in identifiers {
                    if storage.store.contains_key(&id) {
                        targets.push(id);
                    } else {
                        errors
                            .borrow_mut()
                            .push(Error::NotPresent(format!("repository {id}")));
                    }
                }
                targets
            }
        };

        let mgr = self.clone();
        let fetch_errors = errors.clone();
        let items: Vec<(String, ())> = targets.into_iter().map(|t| (t, ())).collect();
        let refreshed = future::foreach(items, move |id: &String, ()| -> Option<Action> {
            let old = mgr.storage.borrow().store.get(id).cloned()?;
            match mgr.fetch_fresh(id) {
                Ok((_driver, index)) => {
                    let mut entry = RepositoryEntry::from_index(id, &index);
                    entry.user_installed = old.user_installed;
                    Some(mgr.update_action(old, entry))
                }
                Err(e) => {
                    fetch_errors.borrow_mut().push(e);
                    None
                }
            }
        });

        let mgr = self.clone();
        refreshed.map(move |results| {
            let actions: Vec<Action> = results.into_iter().filter_map(|(_, a)| a).collect();
            let errs = std::mem::take(&mut *errors.borrow_mut());
            if actions.is_empty() && !errs.is_empty() {
                return (None, errs);
            }
            (Some(mgr.transaction(actions)), errs)
        })
    }

    /// Wrap actions with the load/flush hooks every repository transaction
    /// carries.
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

    fn add_action(&self, entry: RepositoryEntry) -> Action {
        let data = ActionData::new(ActionKind::AddRepository, &entry.identifier);
        let apply_storage = self.storage.clone();
        let rollback_storage = self.storage.clone();
        let identifier = entry.identifier.clone();
        Action::new(data)
            .with_apply(move || {
                apply_storage
                    .borrow_mut()
                    .store
                    .insert(entry.identifier.clone(), entry.clone());
                Ok(())
            })
            .with_rollback(move || {
                rollback_storage.borrow_mut().store.remove(&identifier);
                Ok(())
            })
    }

    fn remove_action(&self, entry: RepositoryEntry) -> Action {
        let data = ActionData::new(ActionKind::RemoveRepository, &entry.identifier);
        let apply_storage = self.storage.clone();
        let rollback_storage = self.storage.clone();
        let identifier = entry.identifier.clone();
        Action::new(data)
            .with_apply(move || {
                apply_storage.borrow_mut().store.remove(&identifier);
                Ok(())
            })
            .with_rollback(move || {
                rollback_storage
                    .borrow_mut()
                    .store
                    .insert(entry.identifier.clone(), entry.clone());
                Ok(())
            })
    }

    fn update_action(&self, old: RepositoryEntry, new: RepositoryEntry) -> Action {
        let data = ActionData::new(ActionKind::UpdateRepository, &new.identifier);
        let apply_storage = self.storage.clone();
        let rollback_storage = self.storage.clone();
        Action::new(data)
            .with_apply(move || {
                apply_storage
                    .borrow_mut()
                    .store
                    .insert(new.identifier.clone(), new.clone());
                Ok(())
            })
            .with_rollback(move || {
                rollback_storage
                    .borrow_mut()
                    .store
                    .insert(old.identifier.clone(), old.clone());
                Ok(())
            })
    }
}
