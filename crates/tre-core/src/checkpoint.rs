//! Durable per-operation progress, keyed by plan hash.
//!
//! A checkpoint lives at `checkpoints/<project>_<plan_hash>.json` next to the
//! plan it tracks. Re-running the same plan skips every operation already
//! recorded as succeeded and resolves symbols from keys minted earlier.

use crate::error::{ErrorKind, Result, TreError};
use crate::paths;
use crate::plan::Plan;
use crate::types::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl OpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Succeeded => "succeeded",
            OpStatus::Failed => "failed",
            OpStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TreError> for OpError {
    fn from(e: &TreError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRecord {
    pub status: OpStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OpError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_key: Option<String>,
    /// Why a skipped operation did not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Default for OpRecord {
    fn default() -> Self {
        Self {
            status: OpStatus::Pending,
            attempts: 0,
            error: None,
            tracker_key: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub plan_hash: String,
    pub project: String,
    /// Last phase the engine finished walking.
    #[serde(default)]
    pub phase_cursor: Option<Phase>,
    pub operations: BTreeMap<String, OpRecord>,
    /// Symbol (`test:<id>`, `precondition:<id>`) -> tracker key.
    #[serde(default)]
    pub symbolic_refs: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(plan: &Plan) -> Result<Self> {
        Ok(Self {
            plan_hash: plan.hash()?,
            project: plan.project.clone(),
            phase_cursor: None,
            operations: plan
                .operations
                .iter()
                .map(|op| (op.id.clone(), OpRecord::default()))
                .collect(),
            symbolic_refs: BTreeMap::new(),
            updated_at: Utc::now(),
        })
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        paths::checkpoint_file(dir, &self.project, &self.plan_hash)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TreError::Config(format!("cannot read checkpoint {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            TreError::Config(format!("malformed checkpoint {}: {e}", path.display()))
        })
    }

    /// Resume the checkpoint for `plan` from `dir`, or start a fresh one.
    /// A file whose recorded hash disagrees with the plan is refused.
    pub fn load_or_new(dir: &Path, plan: &Plan) -> Result<Self> {
        let hash = plan.hash()?;
        let path = paths::checkpoint_file(dir, &plan.project, &hash);
        if !path.exists() {
            return Self::new(plan);
        }
        let mut cp = Self::load(&path)?;
        if cp.plan_hash != hash || cp.project != plan.project {
            return Err(TreError::Config(format!(
                "checkpoint {} belongs to plan {} of {}, not {hash}",
                path.display(),
                cp.plan_hash,
                cp.project
            )));
        }
        for op in &plan.operations {
            cp.operations.entry(op.id.clone()).or_default();
        }
        Ok(cp)
    }

    pub fn save(&mut self, dir: &Path) -> Result<PathBuf> {
        self.updated_at = Utc::now();
        let path = self.path(dir);
        crate::io::write_json(&path, &*self)?;
        Ok(path)
    }

    /// Store the plan beside its checkpoint so a later resume can replay it.
    pub fn save_plan(dir: &Path, plan: &Plan) -> Result<PathBuf> {
        let path = paths::plan_file(dir, &plan.project, &plan.hash()?);
        crate::io::atomic_write(&path, plan.to_json()?.as_bytes())?;
        Ok(path)
    }

    /// The plan stored next to the checkpoint at `checkpoint_path`.
    pub fn load_plan(checkpoint_path: &Path) -> Result<Plan> {
        let cp = Self::load(checkpoint_path)?;
        let dir = checkpoint_path.parent().unwrap_or(Path::new("."));
        let path = paths::plan_file(dir, &cp.project, &cp.plan_hash);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            TreError::Config(format!("cannot read stored plan {}: {e}", path.display()))
        })?;
        let plan = Plan::from_json(&data)?;
        if plan.hash()? != cp.plan_hash {
            return Err(TreError::Config(format!(
                "stored plan {} does not hash to {}",
                path.display(),
                cp.plan_hash
            )));
        }
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn is_done(&self, op_id: &str) -> bool {
        self.status(op_id) == OpStatus::Succeeded
    }

    pub fn status(&self, op_id: &str) -> OpStatus {
        self.operations
            .get(op_id)
            .map(|r| r.status)
            .unwrap_or(OpStatus::Pending)
    }

    pub fn record_success(&mut self, op_id: &str, attempts: u32, tracker_key: Option<String>) {
        let record = self.operations.entry(op_id.to_string()).or_default();
        record.status = OpStatus::Succeeded;
        record.attempts += attempts;
        record.error = None;
        record.reason = None;
        if tracker_key.is_some() {
            record.tracker_key = tracker_key;
        }
    }

    pub fn record_failure(&mut self, op_id: &str, attempts: u32, error: &TreError) {
        let record = self.operations.entry(op_id.to_string()).or_default();
        record.status = OpStatus::Failed;
        record.attempts += attempts;
        record.error = Some(error.into());
        record.reason = None;
    }

    pub fn record_skip(&mut self, op_id: &str, reason: &str) {
        let record = self.operations.entry(op_id.to_string()).or_default();
        record.status = OpStatus::Skipped;
        record.reason = Some(reason.to_string());
    }

    pub fn bind(&mut self, symbol: &str, key: &str) {
        self.symbolic_refs
            .insert(symbol.to_string(), key.to_string());
    }

    pub fn counts(&self) -> BTreeMap<OpStatus, usize> {
        let mut out = BTreeMap::new();
        for record in self.operations.values() {
            *out.entry(record.status).or_default() += 1;
        }
        out
    }

    pub fn count(&self, status: OpStatus) -> usize {
        self.operations
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
