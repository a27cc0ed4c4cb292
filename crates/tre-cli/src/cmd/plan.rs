use super::{Exit, PlanSource};
use crate::output::{print_json, print_plan};
use crate::setup::{self, Globals};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tre_core::io::atomic_write;

pub fn run(
    globals: &Globals,
    catalogs: &[PathBuf],
    source: &PlanSource,
    out: Option<&Path>,
    json: bool,
) -> anyhow::Result<Exit> {
    let mut config = globals.config()?;
    let catalog = setup::load_catalog(catalogs, source.keys_from.as_deref())?;
    let (snapshot, mut backend) = setup::snapshot(&mut config, source, Some(&catalog))?;
    let plan = setup::build_plan(&catalog, &snapshot, &mut backend, source.close);

    if let Some(path) = out {
        atomic_write(path, plan.to_json()?.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
        println!();
        println!("plan {} ({} operation(s))", plan.hash()?, plan.operations.len());
        if let Some(path) = out {
            println!("written to {}", path.display());
        }
    }
    Ok(Exit::Clean)
}
