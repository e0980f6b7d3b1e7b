//! Past runs from the audit directory (`crewforge history`).

use anyhow::Result;
use console::style;
use std::path::Path;

use crewforge::audit::AuditLogger;
use crewforge::config::CONFIG_DIR;

pub fn cmd_history(project_dir: &Path, limit: usize) -> Result<()> {
    let audit = AuditLogger::new(&project_dir.join(CONFIG_DIR).join("audit"));
    let runs = audit.list_runs()?;

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!();
    for path in runs.iter().take(limit) {
        let run = match audit.load_run(path) {
            Ok(run) => run,
            Err(e) => {
                println!("  {} {}: {:#}", style("?").yellow(), path.display(), e);
                continue;
            }
        };
        let result = &run.result;
        let marker = if result.succeeded() {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let title = run.manifesto.lines().next().unwrap_or_default();
        println!(
            "  {} {}  {}  {} phases, {} tokens  {}",
            marker,
            style(&run.run_id.simple().to_string()[..8]).dim(),
            run.started_at.format("%Y-%m-%d %H:%M"),
            result.phase_results.len(),
            result.token_totals.total(),
            title
        );
        if let Some(halt) = &result.halt {
            println!("      halted in {}: {}", halt.phase, halt.reason);
        }
    }
    println!();
    Ok(())
}
