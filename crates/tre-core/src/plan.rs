//! Diff planner: `(catalog, snapshot) -> Plan`.
//!
//! Planning is pure. Every decision depends only on the two inputs and the
//! [`PlanOptions`], and the resulting operation list is sorted so the same
//! inputs always serialize to the same bytes.

use crate::catalog::{
    precondition_symbol, steps_equal_normalized, test_symbol, Catalog, Step, Test,
    PRECONDITION_LABEL,
};
use crate::error::Result;
use crate::inventory::{LiveSnapshot, LiveTest};
use crate::text::{self, is_test_id_label};
use crate::tracker::{PreconditionSpec, TestSpec, TrackerCapabilities};
use crate::types::{OpKind, Phase, Priority};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ---------------------------------------------------------------------------
// KeyRef
// ---------------------------------------------------------------------------

/// A tracker key known at planning time, or a symbol the engine resolves
/// from keys minted earlier in the same run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRef {
    Key(String),
    Symbol(String),
}

impl KeyRef {
    pub fn resolve(&self, symbols: &BTreeMap<String, String>) -> Option<String> {
        match self {
            KeyRef::Key(k) => Some(k.clone()),
            KeyRef::Symbol(s) => symbols.get(s).cloned(),
        }
    }

    pub fn known(&self) -> Option<&str> {
        match self {
            KeyRef::Key(k) => Some(k),
            KeyRef::Symbol(_) => None,
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRef::Key(k) => f.write_str(k),
            KeyRef::Symbol(s) => write!(f, "<{s}>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Action / Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    CreateFolder {
        path: String,
    },
    CreatePrecondition {
        symbol: String,
        spec: PreconditionSpec,
    },
    CreateTest {
        symbol: String,
        spec: TestSpec,
    },
    UpdateLabels {
        target: KeyRef,
        labels: Vec<String>,
        before: Vec<String>,
    },
    UpdatePriority {
        target: KeyRef,
        priority: Priority,
        #[serde(default)]
        before: Option<Priority>,
    },
    SetSteps {
        target: KeyRef,
        steps: Vec<Step>,
    },
    MoveTestToFolder {
        target: KeyRef,
        path: String,
        #[serde(default)]
        before: Option<String>,
    },
    AddPreconditionLink {
        test: KeyRef,
        precondition: KeyRef,
    },
    RemovePreconditionLink {
        test: KeyRef,
        precondition: KeyRef,
    },
    TransitionIssue {
        target: KeyRef,
        status: String,
        #[serde(default)]
        before: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> OpKind {
        match self {
            Action::CreateFolder { .. } => OpKind::CreateFolder,
            Action::CreatePrecondition { .. } => OpKind::CreatePrecondition,
            Action::CreateTest { .. } => OpKind::CreateTest,
            Action::UpdateLabels { .. } => OpKind::UpdateLabels,
            Action::UpdatePriority { .. } => OpKind::UpdatePriority,
            Action::SetSteps { .. } => OpKind::SetSteps,
            Action::MoveTestToFolder { .. } => OpKind::MoveTestToFolder,
            Action::AddPreconditionLink { .. } => OpKind::AddPreconditionLink,
            Action::RemovePreconditionLink { .. } => OpKind::RemovePreconditionLink,
            Action::TransitionIssue { .. } => OpKind::TransitionIssue,
        }
    }

    /// References that must resolve before the action can run.
    pub fn dependencies(&self) -> Vec<&KeyRef> {
        match self {
            Action::CreateFolder { .. }
            | Action::CreatePrecondition { .. }
            | Action::CreateTest { .. } => Vec::new(),
            Action::UpdateLabels { target, .. }
            | Action::UpdatePriority { target, .. }
            | Action::SetSteps { target, .. }
            | Action::MoveTestToFolder { target, .. }
            | Action::TransitionIssue { target, .. } => vec![target],
            Action::AddPreconditionLink { test, precondition }
            | Action::RemovePreconditionLink { test, precondition } => vec![test, precondition],
        }
    }

    /// The symbol a create action binds on success.
    pub fn produces(&self) -> Option<&str> {
        match self {
            Action::CreatePrecondition { symbol, .. } | Action::CreateTest { symbol, .. } => {
                Some(symbol)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique within the plan, stable across identical inputs.
    pub id: String,
    pub phase: Phase,
    /// Catalog id of the entity, the folder path for P1, or the issue key
    /// for P6.
    pub external_id: String,
    #[serde(flatten)]
    pub action: Action,
}

impl Operation {
    fn new(phase: Phase, external_id: &str, detail: Option<&str>, action: Action) -> Self {
        let mut id = format!("{}:{}:{external_id}", phase.code(), action.kind());
        if let Some(detail) = detail {
            id.push(':');
            id.push_str(detail);
        }
        Self {
            id,
            phase,
            external_id: external_id.to_string(),
            action,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.action.kind()
    }

    fn sort_key(&self) -> (usize, usize, &str, OpKind, &str) {
        let depth = match &self.action {
            Action::CreateFolder { path } => text::folder_depth(path),
            _ => 0,
        };
        (self.phase.index(), depth, &self.external_id, self.kind(), &self.id)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub project: String,
    pub closure_enabled: bool,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Live preconditions with no catalog counterpart and no incoming links.
    /// Reported, never deleted.
    #[serde(default)]
    pub standalone_preconditions: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Hex SHA-256 over the project, the closure flag and the operations.
    /// Warnings do not change what the plan does, so they are left out.
    pub fn hash(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Hashed<'a> {
            project: &'a str,
            closure_enabled: bool,
            operations: &'a [Operation],
        }
        let bytes = serde_json::to_vec(&Hashed {
            project: &self.project,
            closure_enabled: self.closure_enabled,
            operations: &self.operations,
        })?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.phase == phase)
    }

    /// Operation counts keyed by phase name, then by kind.
    pub fn counts(&self) -> BTreeMap<&'static str, BTreeMap<&'static str, usize>> {
        let mut out: BTreeMap<&'static str, BTreeMap<&'static str, usize>> = BTreeMap::new();
        for op in &self.operations {
            *out.entry(op.phase.as_str())
                .or_default()
                .entry(op.kind().as_str())
                .or_default() += 1;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Emit P6 transitions for the catalog's closure list.
    pub enable_closure: bool,
    pub capabilities: TrackerCapabilities,
}

pub fn plan(catalog: &Catalog, snapshot: &LiveSnapshot) -> Plan {
    plan_with(catalog, snapshot, &PlanOptions::default())
}

pub fn plan_with(catalog: &Catalog, snapshot: &LiveSnapshot, options: &PlanOptions) -> Plan {
    let mut planner = Planner {
        catalog,
        snapshot,
        options,
        ops: Vec::new(),
        warnings: catalog.warnings.iter().map(|w| w.message()).collect(),
        test_keys: BTreeMap::new(),
        precondition_keys: BTreeMap::new(),
    };
    planner.bind();
    planner.folders();
    planner.preconditions();
    planner.create_tests();
    planner.reconcile_tests();
    planner.links();
    let closure_enabled = planner.closure();

    let mut ops = planner.ops;
    ops.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    Plan {
        project: snapshot.project.clone(),
        closure_enabled,
        operations: ops,
        warnings: planner.warnings,
        standalone_preconditions: standalone(catalog, snapshot),
    }
}

struct Planner<'a> {
    catalog: &'a Catalog,
    snapshot: &'a LiveSnapshot,
    options: &'a PlanOptions,
    ops: Vec<Operation>,
    warnings: Vec<String>,
    /// external_id -> matched live key, for catalog entities that matched.
    test_keys: BTreeMap<String, String>,
    precondition_keys: BTreeMap<String, String>,
}

impl Planner<'_> {
    fn push(&mut self, phase: Phase, external_id: &str, detail: Option<&str>, action: Action) {
        self.ops
            .push(Operation::new(phase, external_id, detail, action));
    }

    /// Bind catalog entities to live ones. A live entity binds at most once;
    /// later claimants are treated as new and reported.
    fn bind(&mut self) {
        let mut claimed = BTreeSet::new();
        for p in self.catalog.preconditions.values() {
            if let Some(key) = &p.tracker_key {
                if !self.snapshot.preconditions.contains_key(key) {
                    self.warnings.push(format!(
                        "precondition '{}': tracker key {key} not found, matching by summary",
                        p.external_id
                    ));
                }
            }
            let Some(live) = self.snapshot.match_precondition(p) else {
                continue;
            };
            if self.snapshot.preconditions_with_summary(&p.summary).len() > 1
                && p.tracker_key.as_deref() != Some(live.key.as_str())
            {
                self.warnings.push(format!(
                    "precondition '{}': several live issues share its summary, using {}",
                    p.external_id, live.key
                ));
            }
            if claimed.insert(live.key.clone()) {
                self.precondition_keys
                    .insert(p.external_id.clone(), live.key.clone());
            } else {
                self.warnings.push(format!(
                    "precondition '{}': {} is already bound to another entry, creating a new issue",
                    p.external_id, live.key
                ));
            }
        }

        let mut claimed = BTreeSet::new();
        for t in self.catalog.tests.values() {
            if let Some(key) = &t.tracker_key {
                if !self.snapshot.tests.contains_key(key) {
                    self.warnings.push(format!(
                        "test '{}': tracker key {key} not found, matching by summary",
                        t.external_id
                    ));
                }
            }
            let Some(live) = self.snapshot.match_test(t) else {
                continue;
            };
            if self.snapshot.tests_with_summary(&t.summary).len() > 1
                && t.tracker_key.as_deref() != Some(live.key.as_str())
            {
                self.warnings.push(format!(
                    "test '{}': several live issues share its summary, using {}",
                    t.external_id, live.key
                ));
            }
            if claimed.insert(live.key.clone()) {
                self.test_keys.insert(t.external_id.clone(), live.key.clone());
            } else {
                self.warnings.push(format!(
                    "test '{}': {} is already bound to another entry, creating a new issue",
                    t.external_id, live.key
                ));
            }
        }
    }

    fn test_ref(&self, external_id: &str) -> KeyRef {
        match self.test_keys.get(external_id) {
            Some(k) => KeyRef::Key(k.clone()),
            None => KeyRef::Symbol(test_symbol(external_id)),
        }
    }

    fn precondition_ref(&self, external_id: &str) -> KeyRef {
        match self.precondition_keys.get(external_id) {
            Some(k) => KeyRef::Key(k.clone()),
            None => KeyRef::Symbol(precondition_symbol(external_id)),
        }
    }

    // P1
    fn folders(&mut self) {
        let missing: Vec<String> = self
            .catalog
            .folders
            .iter()
            .filter(|path| path.as_str() != "/" && !self.snapshot.folders.contains(*path))
            .cloned()
            .collect();
        for path in missing {
            self.push(
                Phase::Folders,
                &path,
                None,
                Action::CreateFolder { path: path.clone() },
            );
        }
    }

    // P2
    fn preconditions(&mut self) {
        let allowlist = &self.catalog.precondition_label_allowlist;
        let mut ops = Vec::new();
        for p in self.catalog.preconditions.values() {
            match self.precondition_keys.get(&p.external_id) {
                None => ops.push((
                    p.external_id.clone(),
                    Action::CreatePrecondition {
                        symbol: precondition_symbol(&p.external_id),
                        spec: PreconditionSpec {
                            summary: p.summary.clone(),
                            definition: p.definition.clone(),
                            labels: p.labels.iter().cloned().collect(),
                        },
                    },
                )),
                Some(key) => {
                    let live = &self.snapshot.preconditions[key];
                    let target: BTreeSet<String> = live
                        .labels
                        .iter()
                        .filter(|l| allowlist.contains(*l))
                        .cloned()
                        .chain(std::iter::once(PRECONDITION_LABEL.to_string()))
                        .collect();
                    if target != live.labels {
                        ops.push((
                            p.external_id.clone(),
                            Action::UpdateLabels {
                                target: KeyRef::Key(key.clone()),
                                labels: target.into_iter().collect(),
                                before: live.labels.iter().cloned().collect(),
                            },
                        ));
                    }
                }
            }
        }
        for (id, action) in ops {
            self.push(Phase::Preconditions, &id, None, action);
        }
    }

    // P3
    fn create_tests(&mut self) {
        let combined = self.options.capabilities.combined_create;
        let mut ops = Vec::new();
        for t in self.catalog.tests.values() {
            if self.test_keys.contains_key(&t.external_id) {
                continue;
            }
            let symbol = test_symbol(&t.external_id);
            let filed = t.folder_path != "/";
            let spec = TestSpec {
                summary: t.summary.clone(),
                description: t.description.clone(),
                test_type: t.test_type,
                priority: t.priority,
                labels: target_labels(t).into_iter().collect(),
                folder_path: (combined && filed).then(|| t.folder_path.clone()),
                steps: if combined { t.steps.clone() } else { Vec::new() },
            };
            ops.push((
                t.external_id.clone(),
                Action::CreateTest {
                    symbol: symbol.clone(),
                    spec,
                },
            ));
            if !combined {
                if !t.steps.is_empty() {
                    ops.push((
                        t.external_id.clone(),
                        Action::SetSteps {
                            target: KeyRef::Symbol(symbol.clone()),
                            steps: t.steps.clone(),
                        },
                    ));
                }
                if filed {
                    ops.push((
                        t.external_id.clone(),
                        Action::MoveTestToFolder {
                            target: KeyRef::Symbol(symbol),
                            path: t.folder_path.clone(),
                            before: None,
                        },
                    ));
                }
            }
        }
        for (id, action) in ops {
            self.push(Phase::TestCreation, &id, None, action);
        }
    }

    // P4
    fn reconcile_tests(&mut self) {
        let mut ops = Vec::new();
        for t in self.catalog.tests.values() {
            let Some(key) = self.test_keys.get(&t.external_id) else {
                continue;
            };
            let live = &self.snapshot.tests[key];
            let target = KeyRef::Key(key.clone());

            let labels = target_labels(t);
            if labels != live.labels {
                ops.push((
                    t.external_id.clone(),
                    Action::UpdateLabels {
                        target: target.clone(),
                        labels: labels.into_iter().collect(),
                        before: live.labels.iter().cloned().collect(),
                    },
                ));
            }
            if live.priority != Some(t.priority) {
                ops.push((
                    t.external_id.clone(),
                    Action::UpdatePriority {
                        target: target.clone(),
                        priority: t.priority,
                        before: live.priority,
                    },
                ));
            }
            if steps_differ(t, live) {
                ops.push((
                    t.external_id.clone(),
                    Action::SetSteps {
                        target: target.clone(),
                        steps: t.steps.clone(),
                    },
                ));
            }
            if live.folder_path != t.folder_path {
                ops.push((
                    t.external_id.clone(),
                    Action::MoveTestToFolder {
                        target,
                        path: t.folder_path.clone(),
                        before: Some(live.folder_path.clone()),
                    },
                ));
            }
        }
        for (id, action) in ops {
            self.push(Phase::TestFields, &id, None, action);
        }
    }

    // P5
    fn links(&mut self) {
        let mut ops = Vec::new();
        for t in self.catalog.tests.values() {
            let test = self.test_ref(&t.external_id);
            let live_refs: BTreeSet<String> = test
                .known()
                .and_then(|k| self.snapshot.tests.get(k))
                .map(|live| live.precondition_keys.clone())
                .unwrap_or_default();

            let mut desired_keys = BTreeSet::new();
            for pre_id in &t.precondition_refs {
                let precondition = self.precondition_ref(pre_id);
                if let Some(k) = precondition.known() {
                    desired_keys.insert(k.to_string());
                    if live_refs.contains(k) {
                        continue;
                    }
                }
                ops.push((
                    t.external_id.clone(),
                    pre_id.clone(),
                    Action::AddPreconditionLink {
                        test: test.clone(),
                        precondition,
                    },
                ));
            }
            for stale in live_refs.difference(&desired_keys) {
                ops.push((
                    t.external_id.clone(),
                    stale.clone(),
                    Action::RemovePreconditionLink {
                        test: test.clone(),
                        precondition: KeyRef::Key(stale.clone()),
                    },
                ));
            }
        }
        for (id, detail, action) in ops {
            self.push(Phase::Links, &id, Some(&detail), action);
        }
    }

    // P6
    fn closure(&mut self) -> bool {
        let Some(closure) = &self.catalog.closure else {
            return false;
        };
        if !self.options.enable_closure {
            if !closure.issues.is_empty() {
                self.warnings.push(format!(
                    "closure of {} issue(s) requested but not enabled",
                    closure.issues.len()
                ));
            }
            return false;
        }
        let mut ops = Vec::new();
        for key in &closure.issues {
            let before = self.snapshot.issue_status(key);
            if before.is_some_and(|s| s.eq_ignore_ascii_case(&closure.target_status)) {
                continue;
            }
            ops.push((
                key.clone(),
                Action::TransitionIssue {
                    target: KeyRef::Key(key.clone()),
                    status: closure.target_status.clone(),
                    before: before.map(String::from),
                },
            ));
        }
        for (key, action) in ops {
            self.push(Phase::Closure, &key, None, action);
        }
        true
    }
}

/// Replace-set target for a test: the catalog labels, with test-id shaped
/// labels removed if any slipped through.
fn target_labels(t: &Test) -> BTreeSet<String> {
    t.labels
        .iter()
        .filter(|l| !is_test_id_label(l))
        .cloned()
        .collect()
}

/// Counts decide when they differ. With equal counts, fetched steps are
/// compared after normalization; unfetched steps are taken as equal.
fn steps_differ(t: &Test, live: &LiveTest) -> bool {
    if live.step_count != t.steps.len() {
        return true;
    }
    match &live.steps {
        Some(steps) => !steps_equal_normalized(steps, &t.steps),
        None => false,
    }
}

fn standalone(catalog: &Catalog, snapshot: &LiveSnapshot) -> Vec<String> {
    let linked = snapshot.linked_preconditions();
    let matched: BTreeSet<&str> = catalog
        .preconditions
        .values()
        .filter_map(|p| snapshot.match_precondition(p))
        .map(|live| live.key.as_str())
        .collect();
    snapshot
        .preconditions
        .keys()
        .filter(|k| !linked.contains(k.as_str()) && !matched.contains(k.as_str()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
