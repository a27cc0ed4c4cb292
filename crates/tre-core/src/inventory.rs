//! Read-only projection of the tracker's current state.

use crate::catalog::{Catalog, Precondition, Step, Test};
use crate::error::{Result, TreError};
use crate::text;
use crate::tracker::{self, PreconditionSnapshot, TestSnapshot, Tracker};
use crate::types::{Priority, TestType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Live entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTest {
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
    /// Filled only for tests whose steps need a step-level comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
}

impl From<TestSnapshot> for LiveTest {
    fn from(s: TestSnapshot) -> Self {
        Self {
            key: s.key,
            summary: s.summary,
            status: s.status,
            labels: s.labels,
            priority: s.priority,
            test_type: s.test_type,
            folder_path: s.folder_path,
            precondition_keys: s.precondition_keys,
            step_count: s.step_count,
            steps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePrecondition {
    pub key: String,
    pub summary: String,
    pub definition: String,
    #[serde(default)]
    pub status: Option<String>,
    pub labels: BTreeSet<String>,
}

impl From<PreconditionSnapshot> for LivePrecondition {
    fn from(s: PreconditionSnapshot) -> Self {
        Self {
            key: s.key,
            summary: s.summary,
            definition: s.definition,
            status: s.status,
            labels: s.labels,
        }
    }
}

// ---------------------------------------------------------------------------
// LiveSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub project: String,
    pub tests: BTreeMap<String, LiveTest>,
    pub preconditions: BTreeMap<String, LivePrecondition>,
    pub folders: BTreeSet<String>,
    #[serde(skip)]
    tests_by_summary: BTreeMap<String, Vec<String>>,
    #[serde(skip)]
    preconditions_by_summary: BTreeMap<String, Vec<String>>,
    #[serde(skip)]
    by_label: BTreeMap<String, BTreeSet<String>>,
}

impl LiveSnapshot {
    pub fn empty(project: &str) -> Self {
        Self::build(project, Vec::new(), Vec::new(), BTreeSet::new())
    }

    /// Assemble a snapshot and its indexes. Folder paths are normalized and
    /// ancestors of every listed or referenced folder are included.
    pub fn build(
        project: &str,
        tests: Vec<LiveTest>,
        preconditions: Vec<LivePrecondition>,
        folders: BTreeSet<String>,
    ) -> Self {
        let mut snap = LiveSnapshot {
            project: project.to_string(),
            ..LiveSnapshot::default()
        };
        for f in folders.iter().chain(tests.iter().map(|t| &t.folder_path)) {
            snap.folders.extend(text::folder_lineage(f));
        }
        for t in tests {
            snap.tests.insert(t.key.clone(), t);
        }
        for p in preconditions {
            snap.preconditions.insert(p.key.clone(), p);
        }
        snap.reindex();
        snap
    }

    /// Read a snapshot captured with [`LiveSnapshot::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TreError::Config(format!("cannot read snapshot {}: {e}", path.display()))
        })?;
        let mut snap: LiveSnapshot = serde_json::from_str(&data)?;
        snap.reindex();
        Ok(snap)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::io::write_json(path, self)
    }

    fn reindex(&mut self) {
        self.tests_by_summary.clear();
        self.preconditions_by_summary.clear();
        self.by_label.clear();
        for (key, t) in &self.tests {
            self.tests_by_summary
                .entry(text::fold(&t.summary))
                .or_default()
                .push(key.clone());
            for label in &t.labels {
                self.by_label
                    .entry(label.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        for (key, p) in &self.preconditions {
            self.preconditions_by_summary
                .entry(text::fold(&p.summary))
                .or_default()
                .push(key.clone());
            for label in &p.labels {
                self.by_label
                    .entry(label.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
    }

    /// Test keys whose normalized summary equals `summary`'s, ascending.
    pub fn tests_with_summary(&self, summary: &str) -> &[String] {
        self.tests_by_summary
            .get(&text::fold(summary))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn preconditions_with_summary(&self, summary: &str) -> &[String] {
        self.preconditions_by_summary
            .get(&text::fold(summary))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Keys of tests and preconditions carrying `label`.
    pub fn with_label(&self, label: &str) -> impl Iterator<Item = &str> {
        self.by_label
            .get(label)
            .into_iter()
            .flat_map(|keys| keys.iter().map(String::as_str))
    }

    pub fn issue_status(&self, key: &str) -> Option<&str> {
        self.tests
            .get(key)
            .and_then(|t| t.status.as_deref())
            .or_else(|| {
                self.preconditions
                    .get(key)
                    .and_then(|p| p.status.as_deref())
            })
    }

    /// Precondition keys linked from at least one live test.
    pub fn linked_preconditions(&self) -> BTreeSet<&str> {
        self.tests
            .values()
            .flat_map(|t| t.precondition_keys.iter().map(String::as_str))
            .collect()
    }

    /// Matching rules 1 and 2: an explicit tracker key present in the
    /// snapshot, else the first test with the same normalized summary.
    pub fn match_test(&self, test: &Test) -> Option<&LiveTest> {
        if let Some(key) = &test.tracker_key {
            if let Some(live) = self.tests.get(key) {
                return Some(live);
            }
        }
        self.tests_with_summary(&test.summary)
            .first()
            .and_then(|k| self.tests.get(k))
    }

    pub fn match_precondition(&self, precondition: &Precondition) -> Option<&LivePrecondition> {
        if let Some(key) = &precondition.tracker_key {
            if let Some(live) = self.preconditions.get(key) {
                return Some(live);
            }
        }
        self.preconditions_with_summary(&precondition.summary)
            .first()
            .and_then(|k| self.preconditions.get(k))
    }
}

// ---------------------------------------------------------------------------
// InventoryLoader
// ---------------------------------------------------------------------------

pub struct InventoryLoader<'a, T: Tracker + ?Sized> {
    tracker: &'a mut T,
    project: String,
    page_size: u32,
}

impl<'a, T: Tracker + ?Sized> InventoryLoader<'a, T> {
    pub fn new(tracker: &'a mut T, project: &str, page_size: u32) -> Self {
        Self {
            tracker,
            project: project.to_string(),
            page_size,
        }
    }

    /// Fetch every test, precondition and folder of the project. When a
    /// catalog is given, steps are fetched for the matched tests whose step
    /// counts agree with the catalog, since only those need a step-level
    /// comparison.
    pub fn load(&mut self, catalog: Option<&Catalog>) -> Result<LiveSnapshot> {
        let tests: Vec<LiveTest> = self
            .tracker
            .search_tests(&tracker::tests_jql(&self.project), self.page_size)
            .map(|r| r.map(LiveTest::from))
            .collect::<Result<_>>()?;
        let preconditions: Vec<LivePrecondition> = self
            .tracker
            .search_preconditions(&tracker::preconditions_jql(&self.project), self.page_size)
            .map(|r| r.map(LivePrecondition::from))
            .collect::<Result<_>>()?;
        let folders = self.tracker.list_folders(&self.project)?;

        let mut snapshot = LiveSnapshot::build(&self.project, tests, preconditions, folders);
        let hydrated = match catalog {
            Some(catalog) => self.hydrate_steps(&mut snapshot, catalog)?,
            None => 0,
        };
        info!(
            project = %self.project,
            tests = snapshot.tests.len(),
            preconditions = snapshot.preconditions.len(),
            folders = snapshot.folders.len(),
            hydrated,
            "inventory loaded"
        );
        Ok(snapshot)
    }

    fn hydrate_steps(&mut self, snapshot: &mut LiveSnapshot, catalog: &Catalog) -> Result<usize> {
        let wanted: Vec<String> = catalog
            .tests
            .values()
            .filter_map(|test| {
                snapshot
                    .match_test(test)
                    .filter(|live| live.step_count == test.steps.len() && live.step_count > 0)
                    .map(|live| live.key.clone())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for key in &wanted {
            debug!(key, "fetching steps");
            let steps = self.tracker.get_steps(key)?;
            if let Some(live) = snapshot.tests.get_mut(key) {
                live.steps = Some(steps);
            }
        }
        Ok(wanted.len())
    }
}
