use super::Exit;
use crate::output::print_json;
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use tre_core::catalog::Catalog;

#[derive(Serialize)]
struct ValidateOutput<'a> {
    tests: usize,
    preconditions: usize,
    folders: usize,
    closure_issues: usize,
    warnings: Vec<String>,
    files: &'a [PathBuf],
}

pub fn run(catalogs: &[PathBuf], json: bool) -> anyhow::Result<Exit> {
    let catalog = Catalog::load(catalogs).context("catalog is invalid")?;
    let out = ValidateOutput {
        tests: catalog.tests.len(),
        preconditions: catalog.preconditions.len(),
        folders: catalog.folders.len(),
        closure_issues: catalog.closure.as_ref().map_or(0, |c| c.issues.len()),
        warnings: catalog.warnings.iter().map(|w| w.message()).collect(),
        files: catalogs,
    };

    if json {
        print_json(&out)?;
    } else {
        println!(
            "Catalog OK: {} test(s), {} precondition(s), {} folder(s)",
            out.tests, out.preconditions, out.folders
        );
        for w in &out.warnings {
            println!("  warning: {w}");
        }
    }
    Ok(Exit::Clean)
}
