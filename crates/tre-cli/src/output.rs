use serde::Serialize;
use std::io::Write;
use tre_core::audit::Summary;
use tre_core::plan::Plan;

/// Pretty JSON on stdout, newline-terminated, for `--json` consumers.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    print!("{}", render_table(headers, &rows));
}

/// Columns whose cells are all counts are right-aligned under their header.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let numeric: Vec<bool> = (0..headers.len())
        .map(|i| {
            !rows.is_empty()
                && rows
                    .iter()
                    .all(|r| r.get(i).is_some_and(|c| c.parse::<u64>().is_ok()))
        })
        .collect();

    let mut table = render_row(headers.iter().copied(), &widths, &numeric);
    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    table.push_str(&sep.join("  "));
    table.push('\n');
    for row in rows {
        table.push_str(&render_row(row.iter().map(String::as_str), &widths, &numeric));
    }
    table
}

fn render_row<'a>(
    cells: impl Iterator<Item = &'a str>,
    widths: &[usize],
    numeric: &[bool],
) -> String {
    let padded: Vec<String> = cells
        .zip(widths.iter().zip(numeric))
        .map(|(cell, (&w, &right))| {
            if right {
                format!("{cell:>w$}")
            } else {
                format!("{cell:<w$}")
            }
        })
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

/// One row per operation, in execution order.
pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("Nothing to do: {} is already converged.", plan.project);
    } else {
        let rows = plan
            .operations
            .iter()
            .map(|op| {
                vec![
                    op.phase.code().to_string(),
                    op.kind().to_string(),
                    op.external_id.clone(),
                ]
            })
            .collect();
        print_table(&["PHASE", "OPERATION", "TARGET"], rows);
    }
    print_notes(&plan.warnings, &plan.standalone_preconditions);
}

pub fn print_summary(summary: &Summary) {
    let rows = summary
        .per_phase
        .iter()
        .flat_map(|(phase, statuses)| {
            statuses
                .iter()
                .map(move |(status, n)| vec![phase.clone(), status.clone(), n.to_string()])
        })
        .collect();
    print_table(&["PHASE", "STATUS", "COUNT"], rows);

    for (kind, failures) in &summary.failures {
        println!();
        println!("{kind} ({})", failures.len());
        for f in failures {
            let target = f.target_tracker_key.as_deref().unwrap_or(&f.target_external_id);
            println!("  {}  {target}  {}", f.op_id, f.message);
        }
    }
    print_notes(&summary.warnings, &summary.standalone_preconditions);
    if summary.interrupted {
        println!();
        println!("Run stopped early; rerun the same plan to continue.");
    }
}

fn print_notes(warnings: &[String], standalone: &[String]) {
    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in warnings {
            println!("  {w}");
        }
    }
    if !standalone.is_empty() {
        println!();
        println!("Standalone preconditions (reported only): {}", standalone.join(", "));
    }
}
