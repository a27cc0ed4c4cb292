use super::Exit;
use crate::output::{print_json, print_table};
use crate::setup::{self, Globals};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tre_core::inventory::InventoryLoader;
use tre_core::plan;

#[derive(Serialize)]
struct InventoryOutput<'a> {
    project: &'a str,
    tests: usize,
    preconditions: usize,
    folders: Vec<&'a str>,
    steps_fetched: usize,
    standalone_preconditions: Vec<String>,
}

pub fn run(
    globals: &Globals,
    catalogs: &[PathBuf],
    out: Option<&Path>,
    json: bool,
) -> anyhow::Result<Exit> {
    let config = globals.config()?;
    let catalog = if catalogs.is_empty() {
        None
    } else {
        Some(setup::load_catalog(catalogs, None)?)
    };

    let mut client = setup::connect(&config)?;
    let snapshot = InventoryLoader::new(&mut client, &config.project_key, config.page_size)
        .load(catalog.as_ref())
        .context("failed to load tracker inventory")?;

    if let Some(path) = out {
        snapshot
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let standalone = match &catalog {
        Some(catalog) => plan::plan(catalog, &snapshot).standalone_preconditions,
        None => {
            let linked = snapshot.linked_preconditions();
            snapshot
                .preconditions
                .keys()
                .filter(|k| !linked.contains(k.as_str()))
                .cloned()
                .collect()
        }
    };

    let report = InventoryOutput {
        project: &snapshot.project,
        tests: snapshot.tests.len(),
        preconditions: snapshot.preconditions.len(),
        folders: snapshot.folders.iter().map(String::as_str).collect(),
        steps_fetched: snapshot.tests.values().filter(|t| t.steps.is_some()).count(),
        standalone_preconditions: standalone,
    };

    if json {
        print_json(&report)?;
        return Ok(Exit::Clean);
    }

    print_table(
        &["PROJECT", "TESTS", "PRECONDITIONS", "FOLDERS"],
        vec![vec![
            report.project.to_string(),
            report.tests.to_string(),
            report.preconditions.to_string(),
            report.folders.len().to_string(),
        ]],
    );
    if !report.standalone_preconditions.is_empty() {
        println!();
        println!(
            "Standalone preconditions (reported only): {}",
            report.standalone_preconditions.join(", ")
        );
    }
    if let Some(path) = out {
        println!();
        println!("snapshot written to {}", path.display());
    }
    Ok(Exit::Clean)
}
