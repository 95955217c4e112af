//! Ordered record of execution steps.
//!
//! The ledger is the canonical account of what the orchestrator did and in
//! which order. Entries are keyed; re-adding a key updates the entry in place
//! without moving it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// Kind of operation a step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Sandbox acquisition.
    Init,
    /// Initial file mount.
    Mount,
    /// Incremental file re-sync.
    Sync,
    /// Dependency install.
    Install,
    /// Dev server start.
    Start,
    /// Dev server stop.
    Stop,
    /// Failure while reading dev server output.
    Output,
}

impl StepKind {
    /// Key prefix used for steps of this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            StepKind::Init => "init",
            StepKind::Mount => "mount",
            StepKind::Sync => "update-files",
            StepKind::Install => "install",
            StepKind::Start => "dev",
            StepKind::Stop => "stop",
            StepKind::Output => "output",
        }
    }

    fn matches(self, key: &str) -> bool {
        key == self.prefix()
            || key
                .strip_prefix(self.prefix())
                .is_some_and(|rest| rest.starts_with('-'))
    }
}

/// One user-visible unit of orchestration work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Stable key, unique within the ledger.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Captured output, if any.
    pub output: Option<String>,
    /// Time of the last transition.
    pub timestamp: DateTime<Utc>,
}

/// Append/update log of execution steps.
#[derive(Debug, Clone, Default)]
pub struct StepLedger {
    steps: Vec<ExecutionStep>,
    next_seq: u64,
}

impl StepLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a key for `kind` that has never been handed out before.
    pub fn next_key(&mut self, kind: StepKind) -> String {
        self.next_seq += 1;
        format!("{}-{}", kind.prefix(), self.next_seq)
    }

    /// Inserts a step, or replaces the fields of an existing one in place.
    pub fn add_or_update(
        &mut self,
        key: impl Into<String>,
        name: impl Into<String>,
        status: StepStatus,
        output: Option<String>,
    ) {
        let key = key.into();
        let name = name.into();
        tracing::debug!(step = %key, status = ?status, "step recorded");

        match self.steps.iter_mut().find(|s| s.key == key) {
            Some(step) => {
                step.name = name;
                step.status = status;
                step.output = output;
                step.timestamp = next_timestamp(step.timestamp);
            }
            None => self.steps.push(ExecutionStep {
                key,
                name,
                status,
                output,
                timestamp: Utc::now(),
            }),
        }
    }

    /// Updates an existing step. Unknown keys are ignored.
    pub fn transition(&mut self, key: &str, status: StepStatus, output: Option<String>) {
        let Some(step) = self.steps.iter_mut().find(|s| s.key == key) else {
            tracing::debug!(step = %key, "transition for unknown step ignored");
            return;
        };

        tracing::debug!(step = %key, from = ?step.status, to = ?status, "step transition");
        step.status = status;
        if output.is_some() {
            step.output = output;
        }
        step.timestamp = next_timestamp(step.timestamp);
    }

    /// Returns the step with the given key.
    pub fn get(&self, key: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Returns all steps in first-occurrence order.
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps have been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns true if any step of `kind` has `status`.
    pub fn any_with(&self, kind: StepKind, status: StepStatus) -> bool {
        self.steps
            .iter()
            .any(|s| kind.matches(&s.key) && s.status == status)
    }

    /// Returns the most recently added step of `kind`.
    pub fn latest(&self, kind: StepKind) -> Option<&ExecutionStep> {
        self.steps.iter().rev().find(|s| kind.matches(&s.key))
    }
}

/// Cloneable handle to a ledger that background tasks also write to.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<StepLedger>>,
}

impl SharedLedger {
    /// Creates an empty shared ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the ledger.
    pub fn with<R>(&self, f: impl FnOnce(&mut StepLedger) -> R) -> R {
        // Ledger updates cannot leave it half-written, so a poisoned lock is still usable.
        let mut ledger = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ledger)
    }

    /// Returns a copy of the current ledger.
    pub fn snapshot(&self) -> StepLedger {
        self.with(|ledger| ledger.clone())
    }

    /// Records a running step under a fresh key for `kind`.
    pub fn begin(&self, kind: StepKind, name: impl Into<String>) -> PendingStep {
        let key = self.with(|ledger| ledger.next_key(kind));
        self.begin_keyed(key, name)
    }

    /// Records a running step under a fixed key.
    pub fn begin_keyed(&self, key: impl Into<String>, name: impl Into<String>) -> PendingStep {
        let key = key.into();
        self.with(|ledger| ledger.add_or_update(key.clone(), name, StepStatus::Running, None));
        PendingStep {
            ledger: self.clone(),
            key,
            settled: false,
        }
    }

    /// Appends a finished step under a fresh key for `kind`.
    pub fn record(
        &self,
        kind: StepKind,
        name: impl Into<String>,
        status: StepStatus,
        output: Option<String>,
    ) -> String {
        self.with(|ledger| {
            let key = ledger.next_key(kind);
            ledger.add_or_update(key.clone(), name, status, output);
            key
        })
    }
}

/// A running step that must be settled.
///
/// Dropping it unsettled, for example when the operation's future is
/// cancelled, marks the step as failed with `cancelled` output.
#[must_use = "an unsettled step is marked cancelled when dropped"]
#[derive(Debug)]
pub struct PendingStep {
    ledger: SharedLedger,
    key: String,
    settled: bool,
}

impl PendingStep {
    /// Returns the step key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Moves the step to its final status.
    pub fn finish(mut self, status: StepStatus, output: Option<String>) {
        self.settled = true;
        self.ledger
            .with(|ledger| ledger.transition(&self.key, status, output));
    }
}

impl Drop for PendingStep {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(step = %self.key, "step cancelled before completion");
        self.ledger.with(|ledger| {
            ledger.transition(&self.key, StepStatus::Error, Some("cancelled".to_string()))
        });
    }
}

/// Wall-clock time, clamped so a step never moves backwards.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}
