//! Read-only inspection — `drover list` and `drover status`.

use super::super::Cli;
use anyhow::Result;
use chrono::Utc;
use console::style;
use drover::config::Config;
use drover::detect::{self, EpicPaths};
use drover::epic::scan_epics;
use drover::status::StatusFile;
use std::path::{Path, PathBuf};

pub fn cmd_list(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose, cli.yes)?;
    let epics = scan_epics(&config.epics_dir)?;
    if epics.is_empty() {
        println!("No epics in {}", config.epics_dir.display());
        return Ok(());
    }

    println!(
        "{:<5} {:<10} {:<28} {:<15} {}",
        style("id").bold(),
        style("status").bold(),
        style("branch").bold(),
        style("phase").bold(),
        style("title").bold()
    );
    for epic in epics {
        let branch = epic
            .branch_name
            .clone()
            .unwrap_or_else(|| epic.expected_branch_name());
        let paths = EpicPaths::new(&config.project_dir, &branch);
        let phase = detect::detect(&paths, epic.is_merged());
        println!(
            "{:<5} {:<10} {:<28} {:<15} {}",
            epic.id,
            epic.status,
            branch,
            phase,
            epic.title
        );
    }
    Ok(())
}

pub fn cmd_status(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose, cli.yes)?;
    let Some(snapshot) = StatusFile::new(config.status_file.clone()).read() else {
        println!("idle (no status snapshot)");
        return Ok(());
    };

    let alive = snapshot.worker_pid.map(pid_alive).unwrap_or(false);
    if snapshot.is_idle(alive, Utc::now()) {
        println!("idle (last run: epic {:03}, {})", snapshot.epic, snapshot.phase);
        return Ok(());
    }

    println!(
        "{} epic {:03}  phase {}",
        style("running").green().bold(),
        snapshot.epic,
        style(&snapshot.phase).bold()
    );
    if let Some(tool) = &snapshot.last_tool {
        println!("  last tool:  {}", tool);
    }
    if let Some(tasks) = snapshot.tasks {
        println!("  tasks:      {}/{}", tasks.checked, tasks.checked + tasks.unchecked);
    }
    println!(
        "  tokens:     {} in / {} out / {} cached",
        snapshot.input_tokens, snapshot.output_tokens, snapshot.cached_tokens
    );
    println!("  cost:       ${:.4}", snapshot.cost_usd);
    println!("  last event: {}", snapshot.last_activity.to_rfc3339());
    Ok(())
}

/// Liveness by procfs. On platforms without /proc the check degrades to
/// "assume alive", which only delays the idle verdict by the grace window.
fn pid_alive(pid: u32) -> bool {
    if !Path::new("/proc").exists() {
        return true;
    }
    Path::new(&format!("/proc/{}", pid)).exists()
}
