//! Orchestration entry points — `drover run`, `drover epic <id>`,
//! `drover finalize`.

use super::super::Cli;
use anyhow::Result;
use drover::config::Config;
use drover::scheduler::Scheduler;
use drover::status::StatusFile;
use drover::worker;
use std::path::PathBuf;

fn build_config(cli: &Cli, project_dir: PathBuf) -> Result<Config> {
    let config = Config::new(project_dir, cli.verbose, cli.yes)?;
    config.ensure_directories()?;
    config.preflight()?;
    Ok(config)
}

pub async fn run_all(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = build_config(cli, project_dir)?;
    let scheduler = Scheduler::new(config.clone())?;

    tokio::select! {
        result = scheduler.run() => {
            let report = result?;
            println!(
                "\nDone: {} merged, {} skipped.",
                report.merged.len(),
                report.skipped.len()
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            interrupted(&config);
            Ok(())
        }
    }
}

pub async fn run_epic(cli: &Cli, project_dir: PathBuf, id: u32) -> Result<()> {
    let config = build_config(cli, project_dir)?;
    let scheduler = Scheduler::new(config.clone())?;

    tokio::select! {
        result = scheduler.run_one(id) => result,
        _ = tokio::signal::ctrl_c() => {
            interrupted(&config);
            Ok(())
        }
    }
}

pub async fn run_finalize(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = build_config(cli, project_dir)?;
    let scheduler = Scheduler::new(config)?;
    scheduler.finalize().await
}

/// Graceful interrupt: all progress lives on disk, so cleanup is just
/// removing in-flight payload files and the now-stale snapshot. The next
/// run re-detects every epic's phase and resumes.
fn interrupted(config: &Config) {
    worker::cleanup_payload_files(config);
    StatusFile::new(config.status_file.clone()).clear();
    println!("\nInterrupted. Progress is saved; re-run `drover run` to resume.");
}
