//! Instruction payload construction.
//!
//! The engine treats instruction text as opaque: it builds a payload through
//! this provider, hands the file path to the worker, and never inspects the
//! worker's source changes afterwards (only filesystem markers).

use crate::detect::EpicPaths;
use crate::epic::Epic;
use crate::phase::Phase;
use std::fs;

pub trait PromptProvider: Send + Sync {
    fn instruction(&self, phase: Phase, epic: &Epic, paths: &EpicPaths) -> String;

    /// Instruction for a one-off fix invocation in the integration pipeline.
    fn fix_instruction(&self, epic: &Epic, findings: &str) -> String {
        format!(
            "Address the following review findings on branch work for epic {} ({}). \
             Fix each finding, then re-run the project's checks.\n\n{}",
            epic.id, epic.title, findings
        )
    }

    /// Instruction for resolving rebase conflicts in the named paths.
    fn conflict_instruction(&self, epic: &Epic, conflicted: &[String]) -> String {
        format!(
            "A rebase for epic {} ({}) stopped with conflicts. Resolve the conflict \
             markers in these files, preserving both the epic's changes and the \
             upstream intent, then stage the results:\n{}",
            epic.id,
            epic.title,
            conflicted.join("\n")
        )
    }
}

/// Default provider: a short task preamble plus the epic document and the
/// artifact paths the phase operates on.
pub struct DefaultPrompts;

impl PromptProvider for DefaultPrompts {
    fn instruction(&self, phase: Phase, epic: &Epic, paths: &EpicPaths) -> String {
        let epic_doc = fs::read_to_string(&epic.source_file)
            .unwrap_or_else(|e| format!("[ERROR: could not read epic document: {}]", e));

        format!(
            "## EPIC\n{}\n\n## PHASE\nRun the `{}` stage for this epic.\n\n\
             ## ARTIFACTS\nWork under {} (spec.md, plan.md, tasks.md).\n",
            epic_doc,
            phase.slug(),
            paths.dir.display(),
        )
    }
}
