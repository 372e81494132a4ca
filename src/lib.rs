// src/lib.rs

//! Capstan Package Manager Core
//!
//! Engine for resolving repositories and packages against remote indexes
//! and materializing the result on disk atomically, with rollback on
//! partial failure.
//!
//! # Architecture
//!
//! - Cooperative: long operations are futures polled to completion, one
//!   bounded step at a time; dropping a future cancels it
//! - Transactional: every mutation is an ordered (apply, rollback) action
//!   list; a failed apply pass is undone by a mirror rollback pass
//! - Two-tier state: a durable store/pool/index persisted as JSON, plus a
//!   TTL-bounded in-memory cache of remote repository indexes
//! - Content-verified: every materialized file is checked against the
//!   SHA-256 digest its manifest declares
//! - Pluggable fetching: drivers turn repository identifiers into indexes
//!   and package files; selection is by compatibility, in registration
//!   order

pub mod deptree;
pub mod digest;
pub mod driver;
mod error;
pub mod future;
pub mod package;
pub mod repository;
pub mod storage;
pub mod transaction;
pub mod wildcard;

pub use driver::{Driver, DriverRegistry, GithubDriver};
pub use error::{Error, Result};
pub use future::{Future, Step};
pub use package::PackageManager;
pub use repository::RepositoryManager;
pub use storage::{
    package_id, split_package_id, PackageEntry, PackageManifest, RepositoryEntry,
    RepositoryIndex, Storage, CACHE_TTL, STORAGE_TTL,
};
pub use transaction::{
    Action, ActionData, ActionError, ActionKind, LogEvents, SilentEvents, Transaction,
    TransactionEvents,
};
pub use wildcard::Wildcard;
