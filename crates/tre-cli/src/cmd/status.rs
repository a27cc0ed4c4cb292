use super::Exit;
use crate::output::{print_json, print_table};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tre_core::checkpoint::{Checkpoint, OpRecord, OpStatus};

#[derive(Serialize)]
struct StatusOutput<'a> {
    project: &'a str,
    plan_hash: &'a str,
    phase_cursor: Option<&'static str>,
    counts: BTreeMap<&'static str, usize>,
    unfinished: BTreeMap<&'a str, &'a OpRecord>,
    symbolic_refs: &'a BTreeMap<String, String>,
}

pub fn run(path: &Path, json: bool) -> anyhow::Result<Exit> {
    let cp = Checkpoint::load(path).context("failed to load checkpoint")?;
    let out = StatusOutput {
        project: &cp.project,
        plan_hash: &cp.plan_hash,
        phase_cursor: cp.phase_cursor.map(|p| p.as_str()),
        counts: cp
            .counts()
            .into_iter()
            .map(|(status, n)| (status.as_str(), n))
            .collect(),
        unfinished: cp
            .operations
            .iter()
            .filter(|(_, r)| r.status != OpStatus::Succeeded)
            .map(|(id, r)| (id.as_str(), r))
            .collect(),
        symbolic_refs: &cp.symbolic_refs,
    };

    if json {
        print_json(&out)?;
        return Ok(Exit::Clean);
    }

    println!("Project:  {}", out.project);
    println!("Plan:     {}", out.plan_hash);
    println!("Cursor:   {}", out.phase_cursor.unwrap_or("-"));
    println!("Updated:  {}", cp.updated_at.to_rfc3339());
    let counts: Vec<String> = out
        .counts
        .iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!("Counts:   {}", counts.join(" "));

    if !out.unfinished.is_empty() {
        println!();
        let rows = out
            .unfinished
            .iter()
            .map(|(id, r)| {
                let detail = match (&r.error, &r.reason) {
                    (Some(e), _) => format!("{}: {}", e.kind, e.message),
                    (None, Some(reason)) => reason.clone(),
                    (None, None) => String::new(),
                };
                vec![
                    id.to_string(),
                    r.status.to_string(),
                    r.attempts.to_string(),
                    detail,
                ]
            })
            .collect();
        print_table(&["OPERATION", "STATUS", "ATTEMPTS", "DETAIL"], rows);
    }
    Ok(Exit::Clean)
}
