// src/transaction.rs

//! Transactional actuator for ordered (apply, rollback) action lists.
//!
//! A [`Transaction`] executes its actions in list order with at-most-once
//! semantics per pass and best-effort rollback: the apply pass never
//! short-circuits on a failed action, so the rollback pass sees exactly the
//! intermediate state apply produced, and walks the same list in the same
//! order undoing it.
//!
//! Two lifecycle layers bracket a run. The `open`/`close` hooks are fixed
//! at construction and are where the orchestrators load and flush
//! persistent state. The [`TransactionEvents`] handlers are user-replaceable
//! and exist for progress reporting; errors they produce are logged and
//! never alter the run.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// What an action operates on; used for reporting and error rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    AddRepository,
    RemoveRepository,
    UpdateRepository,
    InstallPackage,
    RemovePackage,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddRepository => write!(f, "add repository"),
            Self::RemoveRepository => write!(f, "remove repository"),
            Self::UpdateRepository => write!(f, "update repository"),
            Self::InstallPackage => write!(f, "install package"),
            Self::RemovePackage => write!(f, "remove package"),
        }
    }
}

/// Serializable description of an action's subject.
#[derive(Debug, Clone, Serialize)]
pub struct ActionData {
    pub kind: ActionKind,
    /// Repository identifier or package identifier the action touches.
    pub subject: String,
}

impl ActionData {
    pub fn new(kind: ActionKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
        }
    }
}

impl fmt::Display for ActionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.subject)
    }
}

type ActionFn = Box<dyn FnMut() -> Result<()>>;
type HookFn = Box<dyn FnMut() -> Result<()>>;

/// One unit of a transaction: a subject plus apply/rollback closures.
///
/// Both closures default to no-ops.
pub struct Action {
    data: ActionData,
    apply: Option<ActionFn>,
    rollback: Option<ActionFn>,
}

impl Action {
    pub fn new(data: ActionData) -> Self {
        Self {
            data,
            apply: None,
            rollback: None,
        }
    }

    pub fn with_apply<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.apply = Some(Box::new(f));
        self
    }

    pub fn with_rollback<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.rollback = Some(Box::new(f));
        self
    }

    pub fn data(&self) -> &ActionData {
        &self.data
    }

    fn run(&mut self, rollback: bool) -> Result<()> {
        let f = if rollback {
            self.rollback.as_mut()
        } else {
            self.apply.as_mut()
        };
        match f {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("data", &self.data).finish()
    }
}

/// An action that raised, with the data it was running over.
#[derive(Debug)]
pub struct ActionError {
    pub data: ActionData,
    pub error: Error,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.data, self.error)
    }
}

/// Replaceable progress handlers fired around each pass and each action.
///
/// `rollback` is true when the event belongs to the rollback pass. `index`
/// is 1-based. Implementations must not assume they can alter the action
/// list; they only observe.
pub trait TransactionEvents {
    fn before_all(&mut self, _rollback: bool, _total: usize) {}
    fn after_all(&mut self, _rollback: bool, _total: usize, _had_error: bool) {}
    fn before(&mut self, _rollback: bool, _index: usize, _data: &ActionData) {}
    fn after(&mut self, _rollback: bool, _index: usize, _data: &ActionData, _is_error: bool) {}
}

/// Default events: observe nothing.
pub struct SilentEvents;

impl TransactionEvents for SilentEvents {}

/// Events reported through `tracing`, for embedders that want progress
/// lines without wiring their own handler.
pub struct LogEvents;

impl TransactionEvents for LogEvents {
    fn before_all(&mut self, rollback: bool, total: usize) {
        let pass = if rollback { "rollback" } else { "apply" };
        info!("{pass} pass over {total} actions");
    }

    fn after_all(&mut self, rollback: bool, total: usize, had_error: bool) {
        let pass = if rollback { "rollback" } else { "apply" };
        if had_error {
            warn!("{pass} pass over {total} actions finished with errors");
        } else {
            info!("{pass} pass over {total} actions finished");
        }
    }

    fn before(&mut self, _rollback: bool, index: usize, data: &ActionData) {
        debug!("[{index}] {data}");
    }

    fn after(&mut self, _rollback: bool, index: usize, data: &ActionData, is_error: bool) {
        if is_error {
            warn!("[{index}] {data} failed");
        }
    }
}

/// An ordered action list executed atomically with best-effort rollback.
pub struct Transaction {
    actions: Vec<Action>,
    on_open: Option<HookFn>,
    on_close: Option<HookFn>,
    events: Box<dyn TransactionEvents>,
}

impl Transaction {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            on_open: None,
            on_close: None,
            events: Box::new(SilentEvents),
        }
    }

    /// Install the open/close hooks. The orchestrators use these to load
    /// persistent state before the first action and flush it after the
    /// last; they are fixed for the lifetime of the transaction.
    pub fn with_hooks<O, C>(mut self, open: O, close: C) -> Self
    where
        O: FnMut() -> Result<()> + 'static,
        C: FnMut() -> Result<()> + 'static,
    {
        self.on_open = Some(Box::new(open));
        self.on_close = Some(Box::new(close));
        self
    }

    /// Replace the progress handlers.
    pub fn set_events(&mut self, events: Box<dyn TransactionEvents>) {
        self.events = events;
    }

    /// The data of every action, in execution order.
    pub fn actions(&self) -> Vec<&ActionData> {
        self.actions.iter().map(|a| a.data()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Execute the transaction.
    ///
    /// Runs the apply pass over every action, collecting failures without
    /// short-circuiting. If anything failed, runs the rollback pass over
    /// the same list in the same order, appending any rollback failures,
    /// and returns the accumulated errors. The close hook runs in every
    /// outcome.
    pub fn apply(&mut self) -> std::result::Result<(), Vec<ActionError>> {
        let mut errors: Vec<ActionError> = Vec::new();

        if let Some(open) = self.on_open.as_mut() {
            if let Err(e) = open() {
                warn!("transaction open hook failed: {e}");
            }
        }

        self.pass(false, &mut errors);
        if !errors.is_empty() {
            info!("apply failed with {} errors, rolling back", errors.len());
            self.pass(true, &mut errors);
        }

        if let Some(close) = self.on_close.as_mut() {
            if let Err(e) = close() {
                warn!("transaction close hook failed: {e}");
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn pass(&mut self, rollback: bool, errors: &mut Vec<ActionError>) {
        let total = self.actions.len();
        self.events.before_all(rollback, total);
        for (i, action) in self.actions.iter_mut().enumerate() {
            self.events.before(rollback, i + 1, action.data());
            let result = action.run(rollback);
            let is_error = result.is_err();
            if let Err(error) = result {
                errors.push(ActionError {
                    data: action.data().clone(),
                    error,
                });
            }
            self.events.after(rollback, i + 1, action.data(), is_error);
        }
        self.events.after_all(rollback, total, !errors.is_empty());
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("actions", &self.actions)
            .finish()
    }
}
