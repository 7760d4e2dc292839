//! Terminal output for interactive runs.
//!
//! Everything here is presentation; the durable record lives in the event
//! log. Output degrades to plain text when stdout is not a terminal.

use crate::epic::Epic;
use crate::phase::Phase;
use console::style;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ui;

impl Ui {
    pub fn banner(&self, text: &str) {
        println!("\n{}", style(text).bold().cyan());
    }

    pub fn epic_start(&self, epic: &Epic, phase: Phase) {
        println!(
            "\n{} {} {}  {}",
            style("▶").green(),
            style(format!("epic {:03}", epic.id)).bold(),
            style(&epic.title).bold(),
            style(format!("(resuming at {})", phase)).dim()
        );
    }

    pub fn phase_advance(&self, from: Phase, to: Phase) {
        println!("  {} {} → {}", style("✓").green(), from, style(to).bold());
    }

    pub fn force_advance(&self, phase: Phase) {
        println!(
            "  {} {} force-advanced with findings remaining",
            style("⚠").yellow(),
            phase
        );
    }

    pub fn integrating(&self, epic: &Epic) {
        println!(
            "  {} integrating {}",
            style("⇅").cyan(),
            style(epic.branch_name.as_deref().unwrap_or("?")).bold()
        );
    }

    pub fn merged(&self, epic: &Epic, cost_usd: f64) {
        println!(
            "  {} epic {:03} merged  {}",
            style("✔").green().bold(),
            epic.id,
            style(format!("${:.2}", cost_usd)).dim()
        );
    }

    pub fn skipped(&self, epic: &Epic) {
        println!(
            "  {} epic {:03} already merged, skipping",
            style("·").dim(),
            epic.id
        );
    }

    pub fn warn(&self, text: &str) {
        eprintln!("  {} {}", style("⚠").yellow(), text);
    }

    pub fn note(&self, text: &str) {
        println!("  {}", style(text).dim());
    }
}
