//! Phase detection from on-disk artifacts.
//!
//! The current lifecycle phase is never stored anywhere; it is a pure function
//! of one epic's artifact directory. Killing the orchestrator at any point and
//! restarting re-derives the correct resume point with no recovery procedure.

use crate::phase::Phase;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Marker appended to `spec.md` when the clarify loop reaches zero findings.
pub const CLARIFY_COMPLETE: &str = "CLARIFY_COMPLETE";
/// Marker appended to `spec.md` when the independent clarify check passes.
pub const CLARIFY_VERIFIED: &str = "CLARIFY_VERIFIED";
/// Marker appended to `tasks.md` when the analyze loop reaches zero findings.
pub const ANALYZED: &str = "ANALYZED";
/// Marker appended to `tasks.md` when the independent analyze check passes.
pub const ANALYZE_VERIFIED: &str = "ANALYZE_VERIFIED";

/// Token the clarify phase leaves in `spec.md` for each open question.
pub const NEEDS_CLARIFICATION: &str = "[NEEDS CLARIFICATION";

/// Artifact locations for one epic, rooted at `specs/<branchName>/`.
#[derive(Debug, Clone)]
pub struct EpicPaths {
    pub dir: PathBuf,
    pub spec: PathBuf,
    pub plan: PathBuf,
    pub tasks: PathBuf,
    /// Optional design source the plan phase may consume.
    pub design: PathBuf,
    /// Derived design-context document produced by the design-read phase.
    pub design_notes: PathBuf,
    /// Findings list maintained by the analyze phase.
    pub analysis: PathBuf,
}

impl EpicPaths {
    pub fn new(project_dir: &Path, branch_name: &str) -> Self {
        let dir = project_dir.join("specs").join(branch_name);
        Self {
            spec: dir.join("spec.md"),
            plan: dir.join("plan.md"),
            tasks: dir.join("tasks.md"),
            design: dir.join("design.md"),
            design_notes: dir.join("design-notes.md"),
            analysis: dir.join("analysis.md"),
            dir,
        }
    }
}

/// Derive the current phase from filesystem evidence. Total and
/// side-effect-free; first matching rule wins.
pub fn detect(paths: &EpicPaths, merged: bool) -> Phase {
    if !paths.dir.exists() || !paths.spec.exists() {
        return Phase::Specify;
    }

    let spec = read_or_empty(&paths.spec);
    if !has_marker(&spec, CLARIFY_COMPLETE) {
        return Phase::Clarify;
    }
    if !has_marker(&spec, CLARIFY_VERIFIED) {
        return Phase::ClarifyVerify;
    }

    if !paths.plan.exists() {
        return Phase::Plan;
    }

    if !paths.tasks.exists() {
        if design_needs_reading(paths) {
            return Phase::DesignRead;
        }
        return Phase::Tasks;
    }

    let tasks = read_or_empty(&paths.tasks);
    if !has_marker(&tasks, ANALYZED) {
        return Phase::Analyze;
    }
    if !has_marker(&tasks, ANALYZE_VERIFIED) {
        return Phase::AnalyzeVerify;
    }

    let (checked, unchecked) = count_checkboxes(&tasks);
    if checked == 0 && unchecked == 0 {
        // Degenerate tasks file with no task lines at all: regenerate it.
        return Phase::Tasks;
    }
    if unchecked > 0 {
        return Phase::Implement;
    }

    if merged { Phase::Done } else { Phase::Review }
}

/// Live findings count for an iterative phase, fed to the convergence
/// tracker after each round.
pub fn open_findings(paths: &EpicPaths, phase: Phase) -> u32 {
    match phase {
        Phase::Clarify => read_or_empty(&paths.spec)
            .matches(NEEDS_CLARIFICATION)
            .count() as u32,
        Phase::Analyze => {
            let (_, unchecked) = count_checkboxes(&read_or_empty(&paths.analysis));
            unchecked
        }
        _ => 0,
    }
}

/// Completion marker an iterative phase converges on, and the artifact it
/// lives in. Used by force-advance and by verify-phase retraction.
pub fn completion_marker(phase: Phase) -> Option<(&'static str, ArtifactKind)> {
    match phase {
        Phase::Clarify => Some((CLARIFY_COMPLETE, ArtifactKind::Spec)),
        Phase::ClarifyVerify => Some((CLARIFY_VERIFIED, ArtifactKind::Spec)),
        Phase::Analyze => Some((ANALYZED, ArtifactKind::Tasks)),
        Phase::AnalyzeVerify => Some((ANALYZE_VERIFIED, ArtifactKind::Tasks)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Spec,
    Tasks,
}

impl ArtifactKind {
    pub fn path<'a>(&self, paths: &'a EpicPaths) -> &'a Path {
        match self {
            ArtifactKind::Spec => &paths.spec,
            ArtifactKind::Tasks => &paths.tasks,
        }
    }
}

/// Append a marker line to an artifact exactly once. Returns true when the
/// marker was written, false when it was already present.
pub fn inject_marker(path: &Path, marker: &str) -> std::io::Result<bool> {
    let content = fs::read_to_string(path).unwrap_or_default();
    if has_marker(&content, marker) {
        return Ok(false);
    }
    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(marker);
    updated.push('\n');
    fs::write(path, updated)?;
    Ok(true)
}

/// Remove every line carrying the marker. Verify phases retract both their
/// own marker and the completion marker they guard when they reject.
pub fn retract_marker(path: &Path, marker: &str) -> std::io::Result<bool> {
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(false);
    };
    if !has_marker(&content, marker) {
        return Ok(false);
    }
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| !line_has_marker(line, marker))
        .collect();
    fs::write(path, format!("{}\n", kept.join("\n")))?;
    Ok(true)
}

fn has_marker(content: &str, marker: &str) -> bool {
    content.lines().any(|line| line_has_marker(line, marker))
}

fn line_has_marker(line: &str, marker: &str) -> bool {
    // Match the marker as a standalone token so CLARIFY_COMPLETE never
    // matches inside CLARIFY_COMPLETE_PENDING or prose mentioning it in
    // backticks.
    line.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|tok| tok == marker)
}

fn design_needs_reading(paths: &EpicPaths) -> bool {
    if !paths.design.exists() {
        return false;
    }
    if !paths.design_notes.exists() {
        return true;
    }
    match (mtime(&paths.design), mtime(&paths.design_notes)) {
        (Some(design), Some(notes)) => design > notes,
        _ => false,
    }
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*]\s+\[( |x|X)\]").expect("checkbox regex"))
}

/// Count `(checked, unchecked)` checkbox-style task lines.
pub fn count_checkboxes(content: &str) -> (u32, u32) {
    let mut checked = 0;
    let mut unchecked = 0;
    for line in content.lines() {
        if let Some(caps) = checkbox_re().captures(line) {
            if &caps[1] == " " {
                unchecked += 1;
            } else {
                checked += 1;
            }
        }
    }
    (checked, unchecked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths_in(dir: &Path) -> EpicPaths {
        EpicPaths::new(dir, "001-test-epic")
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_no_artifacts_means_specify() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        assert_eq!(detect(&paths, false), Phase::Specify);
    }

    #[test]
    fn test_spec_without_clarify_marker() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\n\nSome requirement.\n");
        assert_eq!(detect(&paths, false), Phase::Clarify);
    }

    #[test]
    fn test_clarify_complete_awaits_verification() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\nCLARIFY_COMPLETE\n");
        assert_eq!(detect(&paths, false), Phase::ClarifyVerify);
    }

    #[test]
    fn test_verified_spec_without_plan() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\nCLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        assert_eq!(detect(&paths, false), Phase::Plan);
    }

    #[test]
    fn test_design_read_when_design_newer_than_notes() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(&paths.design, "# Design source\n");
        assert_eq!(detect(&paths, false), Phase::DesignRead);

        // Notes newer than design source: proceed to tasks.
        write(&paths.design_notes, "# Notes\n");
        assert_eq!(detect(&paths, false), Phase::Tasks);
    }

    #[test]
    fn test_no_design_goes_straight_to_tasks() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        assert_eq!(detect(&paths, false), Phase::Tasks);
    }

    #[test]
    fn test_tasks_without_analyzed_marker() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(&paths.tasks, "- [ ] build it\n");
        assert_eq!(detect(&paths, false), Phase::Analyze);
    }

    #[test]
    fn test_analyzed_awaits_verification() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(&paths.tasks, "- [ ] build it\nANALYZED\n");
        assert_eq!(detect(&paths, false), Phase::AnalyzeVerify);
    }

    fn analyzed_tasks(task_lines: &str) -> String {
        format!("{}\nANALYZED\nANALYZE_VERIFIED\n", task_lines)
    }

    #[test]
    fn test_unchecked_tasks_mean_implement() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(
            &paths.tasks,
            &analyzed_tasks("- [x] one\n- [x] two\n- [x] three\n- [ ] four\n- [ ] five"),
        );
        assert_eq!(detect(&paths, false), Phase::Implement);
    }

    #[test]
    fn test_all_checked_review_or_done() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(&paths.tasks, &analyzed_tasks("- [x] one\n- [x] two"));
        assert_eq!(detect(&paths, false), Phase::Review);
        assert_eq!(detect(&paths, true), Phase::Done);
    }

    #[test]
    fn test_degenerate_tasks_file_falls_back_to_tasks() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "CLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");
        write(&paths.plan, "# Plan\n");
        write(&paths.tasks, &analyzed_tasks("No checkboxes here."));
        assert_eq!(detect(&paths, false), Phase::Tasks);
    }

    #[test]
    fn test_detection_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\nCLARIFY_COMPLETE\n");
        let first = detect(&paths, false);
        let second = detect(&paths, false);
        assert_eq!(first, second);
        assert_eq!(first, Phase::ClarifyVerify);
    }

    #[test]
    fn test_end_to_end_specify_then_clarify() {
        // Scenario: empty directory detects specify; a simulated successful
        // specify run creates the spec document; detection moves to clarify.
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        assert_eq!(detect(&paths, false), Phase::Specify);
        write(&paths.spec, "# Spec\n\n[NEEDS CLARIFICATION: scope?]\n");
        assert_eq!(detect(&paths, false), Phase::Clarify);
    }

    #[test]
    fn test_marker_must_be_standalone_token() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(
            &paths.spec,
            "The CLARIFY_COMPLETE_PENDING flag is unrelated.\n",
        );
        assert_eq!(detect(&paths, false), Phase::Clarify);
    }

    #[test]
    fn test_open_findings_clarify() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(
            &paths.spec,
            "# Spec\n[NEEDS CLARIFICATION: a]\ntext\n[NEEDS CLARIFICATION: b]\n",
        );
        assert_eq!(open_findings(&paths, Phase::Clarify), 2);
    }

    #[test]
    fn test_open_findings_analyze() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.analysis, "- [x] resolved\n- [ ] open\n- [ ] open too\n");
        assert_eq!(open_findings(&paths, Phase::Analyze), 2);
        assert_eq!(open_findings(&paths, Phase::Implement), 0);
    }

    #[test]
    fn test_inject_marker_exactly_once() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\n");

        assert!(inject_marker(&paths.spec, CLARIFY_COMPLETE).unwrap());
        assert!(!inject_marker(&paths.spec, CLARIFY_COMPLETE).unwrap());

        let content = fs::read_to_string(&paths.spec).unwrap();
        assert_eq!(content.matches(CLARIFY_COMPLETE).count(), 1);
    }

    #[test]
    fn test_retract_marker_removes_line() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());
        write(&paths.spec, "# Spec\nCLARIFY_COMPLETE\nCLARIFY_VERIFIED\n");

        assert!(retract_marker(&paths.spec, CLARIFY_VERIFIED).unwrap());
        assert!(retract_marker(&paths.spec, CLARIFY_COMPLETE).unwrap());
        assert!(!retract_marker(&paths.spec, CLARIFY_COMPLETE).unwrap());

        assert_eq!(detect(&paths, false), Phase::Clarify);
    }

    #[test]
    fn test_count_checkboxes() {
        let (checked, unchecked) =
            count_checkboxes("- [x] a\n- [X] b\n- [ ] c\n* [ ] d\nnot a box [ ]\n");
        assert_eq!(checked, 2);
        assert_eq!(unchecked, 2);
    }
}
