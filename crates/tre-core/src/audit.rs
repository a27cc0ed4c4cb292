//! Append-only JSONL journal of operation attempts and the end-of-run summary.

use crate::error::{ErrorKind, Result, TreError};
use crate::paths;
use crate::plan::{Operation, Plan};
use crate::types::{OpKind, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditStatus {
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "skipped(dry_run)")]
    SkippedDryRun,
    #[serde(rename = "skipped(missing_dependency)")]
    SkippedMissingDependency,
    #[serde(rename = "skipped(already_done)")]
    SkippedAlreadyDone,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Succeeded => "succeeded",
            AuditStatus::Failed => "failed",
            AuditStatus::SkippedDryRun => "skipped(dry_run)",
            AuditStatus::SkippedMissingDependency => "skipped(missing_dependency)",
            AuditStatus::SkippedAlreadyDone => "skipped(already_done)",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub phase: Phase,
    pub op_id: String,
    pub op_kind: OpKind,
    pub target_external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tracker_key: Option<String>,
    pub status: AuditStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl AuditEvent {
    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.target_tracker_key = key;
        self
    }

    pub fn with_error(mut self, error: &TreError) -> Self {
        self.error_kind = Some(error.kind());
        self.message = Some(error.to_string());
        self
    }

    pub fn with_change(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

/// Read a journal back, one event per non-empty line.
pub fn read_journal(path: &Path) -> Result<Vec<AuditEvent>> {
    let data = std::fs::read_to_string(path)?;
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(TreError::from))
        .collect()
}

/// `20261017T101500Z-1a2b3c4d`: sortable, unique enough for one operator.
pub fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &id[..8])
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub op_id: String,
    pub target_external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tracker_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: String,
    pub project: String,
    pub plan_hash: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// phase -> status -> count
    pub per_phase: BTreeMap<String, BTreeMap<String, usize>>,
    pub per_status: BTreeMap<String, usize>,
    pub failures: BTreeMap<ErrorKind, Vec<FailureEntry>>,
    pub warnings: Vec<String>,
    pub standalone_preconditions: Vec<String>,
    /// The run stopped early (cancelled, deadline, failure cap or fatal error).
    #[serde(default)]
    pub interrupted: bool,
}

impl Summary {
    pub fn failure_count(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

pub struct AuditLog {
    run_id: String,
    dir: PathBuf,
    journal: PathBuf,
    project: String,
    plan_hash: String,
    dry_run: bool,
    started_at: DateTime<Utc>,
    events: Vec<AuditEvent>,
    warnings: Vec<String>,
    standalone_preconditions: Vec<String>,
}

impl AuditLog {
    /// Open `audit/<run_id>.jsonl` for `plan`. Planner warnings are carried
    /// into the summary.
    pub fn create(dir: &Path, run_id: &str, plan: &Plan, dry_run: bool) -> Result<Self> {
        crate::io::ensure_dir(dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir: dir.to_path_buf(),
            journal: paths::journal_path(dir, run_id),
            project: plan.project.clone(),
            plan_hash: plan.hash()?,
            dry_run,
            started_at: Utc::now(),
            events: Vec::new(),
            warnings: plan.warnings.clone(),
            standalone_preconditions: plan.standalone_preconditions.clone(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// A blank event for `op`, ready to be decorated and recorded.
    pub fn event(&self, op: &Operation, status: AuditStatus, attempt: u32) -> AuditEvent {
        AuditEvent {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            phase: op.phase,
            op_id: op.id.clone(),
            op_kind: op.kind(),
            target_external_id: op.external_id.clone(),
            target_tracker_key: None,
            status,
            attempt,
            error_kind: None,
            message: None,
            before: None,
            after: None,
        }
    }

    pub fn record(&mut self, event: AuditEvent) -> Result<()> {
        let line = serde_json::to_string(&event)?;
        crate::io::append_line(&self.journal, &line)?;
        self.events.push(event);
        Ok(())
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Fold the journal into a summary and write `audit/<run_id>.summary.json`.
    pub fn finish(&self, interrupted: bool) -> Result<Summary> {
        let mut per_phase: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut per_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut failures: BTreeMap<ErrorKind, Vec<FailureEntry>> = BTreeMap::new();

        for e in &self.events {
            *per_phase
                .entry(e.phase.as_str().to_string())
                .or_default()
                .entry(e.status.as_str().to_string())
                .or_default() += 1;
            *per_status.entry(e.status.as_str().to_string()).or_default() += 1;
            if e.status == AuditStatus::Failed {
                failures
                    .entry(e.error_kind.unwrap_or(ErrorKind::InternalError))
                    .or_default()
                    .push(FailureEntry {
                        op_id: e.op_id.clone(),
                        target_external_id: e.target_external_id.clone(),
                        target_tracker_key: e.target_tracker_key.clone(),
                        message: e.message.clone().unwrap_or_default(),
                    });
            }
        }

        let summary = Summary {
            run_id: self.run_id.clone(),
            project: self.project.clone(),
            plan_hash: self.plan_hash.clone(),
            dry_run: self.dry_run,
            started_at: self.started_at,
            finished_at: Utc::now(),
            per_phase,
            per_status,
            failures,
            warnings: self.warnings.clone(),
            standalone_preconditions: self.standalone_preconditions.clone(),
            interrupted,
        };
        let path = paths::summary_path(&self.dir, &self.run_id);
        crate::io::write_json(&path, &summary)?;
        info!(
            run_id = %self.run_id,
            events = self.events.len(),
            failures = summary.failure_count(),
            "run summary written"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
