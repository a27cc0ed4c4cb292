//! Typed facade over the tracker.
//!
//! The [`Tracker`] trait is the only way the inventory loader and the
//! execution engine reach the outside world. [`xray::XrayClient`] speaks the
//! Xray GraphQL + Jira REST wire protocol; [`memory::MemoryTracker`] keeps the
//! same contract in process for rehearsals and tests.

pub mod auth;
pub mod memory;
pub mod retry;
pub mod wire;
pub mod xray;

use crate::catalog::Step;
use crate::error::Result;
use crate::types::{Priority, TestType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use memory::MemoryTracker;
pub use xray::XrayClient;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Mutation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub summary: String,
    pub description: String,
    pub test_type: TestType,
    pub priority: Priority,
    pub labels: Vec<String>,
    /// Present when the tracker files the test in one call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionSpec {
    pub summary: String,
    pub definition: String,
    pub labels: Vec<String>,
}

/// Jira field changes. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl FieldPatch {
    pub fn labels(labels: Vec<String>) -> Self {
        Self {
            labels: Some(labels),
            ..Self::default()
        }
    }

    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSnapshot {
    pub key: String,
    pub summary: String,
    #[serde(default)]
    pub status: Option<String>,
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub test_type: Option<TestType>,
    pub folder_path: String,
    pub precondition_keys: BTreeSet<String>,
    pub step_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionSnapshot {
    pub key: String,
    pub summary: String,
    pub definition: String,
    #[serde(default)]
    pub status: Option<String>,
    pub labels: BTreeSet<String>,
}

/// What the tracker can do in a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerCapabilities {
    /// `create_test` accepts steps and a folder path.
    pub combined_create: bool,
    /// Several tests can be filed into one folder in one call.
    pub bulk_folder_moves: bool,
    /// Creation calls honor a caller-supplied idempotency key.
    pub idempotency_keys: bool,
}

impl Default for TrackerCapabilities {
    fn default() -> Self {
        Self {
            combined_create: true,
            bulk_folder_moves: true,
            idempotency_keys: false,
        }
    }
}

/// Outcome of a bulk call, one entry per target in input order.
pub type BatchOutcome = Vec<(String, Result<()>)>;

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Operations consumed by the inventory loader and the execution engine.
///
/// Implementations translate every transport or server fault into the
/// [`crate::error::ErrorKind`] taxonomy and retry the retriable kinds
/// themselves; callers only ever see the final outcome.
pub trait Tracker {
    fn capabilities(&self) -> TrackerCapabilities;

    fn authenticate(&mut self) -> Result<Token>;

    /// Lazily paged search. Restartable only by calling again.
    fn search_tests<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<TestSnapshot>> + 'a>;

    fn search_preconditions<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<PreconditionSnapshot>> + 'a>;

    fn list_folders(&mut self, project: &str) -> Result<BTreeSet<String>>;

    /// Full step list of one test, fetched on demand.
    fn get_steps(&mut self, test_key: &str) -> Result<Vec<Step>>;

    fn create_test(&mut self, spec: &TestSpec, idempotency_key: Option<&str>) -> Result<String>;

    fn create_precondition(
        &mut self,
        spec: &PreconditionSpec,
        idempotency_key: Option<&str>,
    ) -> Result<String>;

    fn update_issue(&mut self, key: &str, patch: &FieldPatch) -> Result<()>;

    /// Replace the whole step list.
    fn set_steps(&mut self, test_key: &str, steps: &[Step]) -> Result<()>;

    fn add_precondition_link(&mut self, test_key: &str, precondition_key: &str) -> Result<()>;

    fn remove_precondition_link(&mut self, test_key: &str, precondition_key: &str)
        -> Result<()>;

    fn move_test_to_folder(&mut self, test_key: &str, path: &str) -> Result<()>;

    /// File several tests into one folder. The default issues one call per
    /// test; trackers with a bulk mutation override it.
    fn move_tests_to_folder(&mut self, path: &str, test_keys: &[String]) -> BatchOutcome {
        test_keys
            .iter()
            .map(|key| (key.clone(), self.move_test_to_folder(key, path)))
            .collect()
    }

    /// Idempotent: an existing folder is success.
    fn create_folder(&mut self, path: &str) -> Result<()>;

    fn transition_issue(&mut self, key: &str, target_status: &str) -> Result<()>;

    /// Attempts spent on the most recent logical call (1 when it succeeded
    /// first time). Reading resets the counter.
    fn take_attempts(&mut self) -> u32 {
        1
    }
}

/// JQL selecting every test of a project.
pub fn tests_jql(project: &str) -> String {
    format!("project = \"{project}\" AND issuetype = Test")
}

/// JQL selecting every precondition of a project.
pub fn preconditions_jql(project: &str) -> String {
    format!("project = \"{project}\" AND issuetype = Precondition")
}

/// Quote a value for use inside a JQL string literal.
pub fn jql_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
