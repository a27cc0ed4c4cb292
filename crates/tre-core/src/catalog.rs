//! Desired state: tests, preconditions and folders loaded from catalog JSON.
//!
//! Loading is the only place where input is checked. Every violation is
//! collected and reported at once as [`TreError::Validation`]; a catalog that
//! loads is frozen and safe to hand to the planner.

use crate::error::{Result, TreError, ValidationIssue};
use crate::text::{self, is_test_id_label};
use crate::types::{Priority, TestType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The one label every managed precondition carries.
pub const PRECONDITION_LABEL: &str = "precondition";

pub const DEFAULT_CLOSURE_STATUS: &str = "Closed";

// ---------------------------------------------------------------------------
// Input documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub tests: Vec<TestObject>,
    #[serde(default)]
    pub preconditions: Vec<PreconditionObject>,
    /// Extra labels a precondition may keep besides `precondition`.
    #[serde(default)]
    pub precondition_label_allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<ClosureObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestObject {
    pub external_id: String,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    pub test_type: String,
    pub priority: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub folder_path: String,
    #[serde(default)]
    pub steps: Vec<StepObject>,
    #[serde(default)]
    pub precondition_refs: Vec<String>,
    #[serde(default)]
    pub tracker_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepObject {
    /// Ignored: steps are re-indexed densely in input order.
    #[serde(default)]
    pub index: Option<u32>,
    pub action: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreconditionObject {
    pub external_id: String,
    pub summary: String,
    pub definition: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub tracker_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureObject {
    #[serde(default)]
    pub target_status: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Validated entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub action: String,
    #[serde(default)]
    pub data: String,
    pub result: String,
}

impl Step {
    pub fn new(index: u32, action: impl Into<String>, data: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            index,
            action: action.into(),
            data: data.into(),
            result: result.into(),
        }
    }

    fn normalized(&self) -> (String, String, String) {
        (
            text::normalize_step_text(&self.action),
            text::normalize_step_text(&self.data),
            text::normalize_step_text(&self.result),
        )
    }
}

/// Step sequences are equal when every field matches after whitespace and
/// entity normalization. Indices are not compared; order is.
pub fn steps_equal_normalized(a: &[Step], b: &[Step]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.normalized() == y.normalized())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub external_id: String,
    pub tracker_key: Option<String>,
    pub summary: String,
    pub description: String,
    pub test_type: TestType,
    pub priority: Priority,
    pub labels: BTreeSet<String>,
    pub folder_path: String,
    pub steps: Vec<Step>,
    pub precondition_refs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub external_id: String,
    pub tracker_key: Option<String>,
    pub summary: String,
    pub definition: String,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub target_status: String,
    pub issues: BTreeSet<String>,
}

/// Emitted once per precondition folded into an equivalent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeWarning {
    pub merged: String,
    pub canonical: String,
    pub rewritten_tests: Vec<String>,
}

impl MergeWarning {
    pub fn message(&self) -> String {
        format!(
            "precondition '{}' has the same definition as '{}'; merged ({} referring test(s) rewritten)",
            self.merged,
            self.canonical,
            self.rewritten_tests.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Symbolic names
// ---------------------------------------------------------------------------

/// Checkpoint symbol for the tracker key of a catalog test.
pub fn test_symbol(external_id: &str) -> String {
    format!("test:{external_id}")
}

/// Checkpoint symbol for the tracker key of a catalog precondition.
pub fn precondition_symbol(external_id: &str) -> String {
    format!("precondition:{external_id}")
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub tests: BTreeMap<String, Test>,
    pub preconditions: BTreeMap<String, Precondition>,
    /// Every referenced folder plus all of its ancestors.
    pub folders: BTreeSet<String>,
    pub precondition_label_allowlist: BTreeSet<String>,
    pub closure: Option<Closure>,
    pub warnings: Vec<MergeWarning>,
}

impl Catalog {
    /// Read and validate one or more catalog JSON files.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(TreError::Config("no catalog files given".into()));
        }
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(read_file(path)?);
        }
        Self::from_files(files)
    }

    /// Validate, normalize and canonicalize parsed catalog documents.
    pub fn from_files(files: Vec<CatalogFile>) -> Result<Self> {
        let mut issues = Vec::new();
        let mut catalog = Catalog::default();

        let mut raw_tests = Vec::new();
        let mut raw_preconditions = Vec::new();
        for file in files {
            raw_tests.extend(file.tests);
            raw_preconditions.extend(file.preconditions);
            catalog
                .precondition_label_allowlist
                .extend(file.precondition_label_allowlist.into_iter().map(|l| l.trim().to_string()));
            if let Some(closure) = file.closure {
                merge_closure(&mut catalog.closure, closure, &mut issues);
            }
        }

        for raw in raw_preconditions {
            let id = raw.external_id.trim().to_string();
            if id.is_empty() {
                issue(&mut issues, "<precondition>", "external_id is empty");
                continue;
            }
            if catalog.preconditions.contains_key(&id) {
                issue(&mut issues, &id, "duplicate precondition external_id");
                continue;
            }
            if raw.summary.trim().is_empty() {
                issue(&mut issues, &id, "precondition summary is empty");
            }
            let labels = precondition_labels(&raw.labels, &catalog.precondition_label_allowlist);
            catalog.preconditions.insert(
                id.clone(),
                Precondition {
                    external_id: id,
                    tracker_key: clean_key(raw.tracker_key),
                    summary: raw.summary.trim().to_string(),
                    definition: raw.definition.trim().to_string(),
                    labels,
                },
            );
        }

        for raw in raw_tests {
            if let Some(test) = validate_test(raw, &catalog.preconditions, &mut issues) {
                if catalog.tests.contains_key(&test.external_id) {
                    issue(&mut issues, &test.external_id, "duplicate test external_id");
                    continue;
                }
                catalog.tests.insert(test.external_id.clone(), test);
            }
        }

        if !issues.is_empty() {
            return Err(TreError::Validation(issues));
        }

        catalog.canonicalize_preconditions();
        catalog.folders = catalog
            .tests
            .values()
            .flat_map(|t| text::folder_lineage(&t.folder_path))
            .collect();
        Ok(catalog)
    }

    /// Collapse preconditions whose folded definitions coincide and rewrite
    /// referring tests to the surviving `external_id`.
    fn canonicalize_preconditions(&mut self) {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for p in self.preconditions.values() {
            let key = if p.definition.is_empty() {
                text::fold(&p.summary)
            } else {
                text::fold(&p.definition)
            };
            groups.entry(key).or_default().push(p.external_id.clone());
        }

        for ids in groups.into_values().filter(|ids| ids.len() > 1) {
            // A member already bound to the tracker wins; otherwise the
            // smallest external_id, which keeps the choice deterministic.
            let canonical = ids
                .iter()
                .find(|id| self.preconditions[*id].tracker_key.is_some())
                .unwrap_or(&ids[0])
                .clone();

            for merged in ids.iter().filter(|id| **id != canonical) {
                let Some(removed) = self.preconditions.remove(merged) else {
                    continue;
                };
                if let Some(kept) = self.preconditions.get_mut(&canonical) {
                    if kept.tracker_key.is_none() {
                        kept.tracker_key = removed.tracker_key;
                    }
                }
                let mut rewritten = Vec::new();
                for test in self.tests.values_mut() {
                    if test.precondition_refs.remove(merged) {
                        test.precondition_refs.insert(canonical.clone());
                        rewritten.push(test.external_id.clone());
                    }
                }
                let warning = MergeWarning {
                    merged: merged.clone(),
                    canonical: canonical.clone(),
                    rewritten_tests: rewritten,
                };
                warn!("{}", warning.message());
                self.warnings.push(warning);
            }
        }
    }

    /// Bind catalog entities to tracker keys recorded by an earlier run.
    /// Keys already present in the catalog input are left untouched.
    pub fn adopt_keys(mut self, symbols: &BTreeMap<String, String>) -> Self {
        for test in self.tests.values_mut() {
            if test.tracker_key.is_none() {
                test.tracker_key = symbols.get(&test_symbol(&test.external_id)).cloned();
            }
        }
        for p in self.preconditions.values_mut() {
            if p.tracker_key.is_none() {
                p.tracker_key = symbols.get(&precondition_symbol(&p.external_id)).cloned();
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<CatalogFile> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| TreError::Config(format!("cannot read catalog {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| TreError::Config(format!("malformed catalog {}: {e}", path.display())))
}

fn issue(issues: &mut Vec<ValidationIssue>, external_id: &str, message: impl Into<String>) {
    issues.push(ValidationIssue {
        external_id: external_id.to_string(),
        message: message.into(),
    });
}

fn clean_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

fn precondition_labels(input: &[String], allowlist: &BTreeSet<String>) -> BTreeSet<String> {
    let mut labels: BTreeSet<String> = input
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| allowlist.contains(l))
        .collect();
    labels.insert(PRECONDITION_LABEL.to_string());
    labels
}

fn merge_closure(
    current: &mut Option<Closure>,
    incoming: ClosureObject,
    issues: &mut Vec<ValidationIssue>,
) {
    let status = incoming
        .target_status
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CLOSURE_STATUS.to_string());
    let keys = incoming
        .issues
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    if let Some(existing) = current {
        if existing.target_status == status {
            existing.issues.extend(keys);
        } else {
            issue(
                issues,
                "<closure>",
                format!(
                    "conflicting closure target status '{}' vs '{status}'",
                    existing.target_status
                ),
            );
        }
        return;
    }
    *current = Some(Closure {
        target_status: status,
        issues: keys.collect(),
    });
}

fn validate_test(
    raw: TestObject,
    preconditions: &BTreeMap<String, Precondition>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Test> {
    let id = raw.external_id.trim().to_string();
    if id.is_empty() {
        issue(issues, "<test>", "external_id is empty");
        return None;
    }
    let before = issues.len();

    if raw.summary.trim().is_empty() {
        issue(issues, &id, "summary is empty");
    }

    let mut labels = BTreeSet::new();
    for label in &raw.labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if is_test_id_label(label) {
            issue(
                issues,
                &id,
                format!("label '{label}' looks like a test id; move it out of labels"),
            );
        }
        labels.insert(label.to_string());
    }

    let priority = Priority::parse(&raw.priority);
    if priority.is_none() {
        issue(issues, &id, format!("unknown priority '{}'", raw.priority));
    }
    let test_type = raw.test_type.parse::<TestType>().ok();
    if test_type.is_none() {
        issue(issues, &id, format!("unknown test_type '{}'", raw.test_type));
    }

    let mut refs = BTreeSet::new();
    for r in &raw.precondition_refs {
        let r = r.trim();
        if !preconditions.contains_key(r) {
            issue(issues, &id, format!("precondition_ref '{r}' is not in the catalog"));
        }
        refs.insert(r.to_string());
    }

    let steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| Step {
            index: i as u32 + 1,
            action: s.action,
            data: s.data.unwrap_or_default(),
            result: s.result,
        })
        .collect();

    if issues.len() > before {
        return None;
    }

    Some(Test {
        external_id: id,
        tracker_key: clean_key(raw.tracker_key),
        summary: raw.summary.trim().to_string(),
        description: raw.description.unwrap_or_default(),
        test_type: test_type?,
        priority: priority?,
        labels,
        folder_path: text::normalize_folder_path(&raw.folder_path),
        steps,
        precondition_refs: refs,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
