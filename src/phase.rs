//! Lifecycle phase definitions for the drover orchestrator.
//!
//! This module provides:
//! - `Phase` enum representing one stage of an epic's lifecycle
//! - `PhaseSettings` describing how a phase's worker invocation is configured
//! - Default settings tables, overridable from `drover.toml`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One stage of an epic's lifecycle, ordered from first to terminal.
///
/// The engine never stores the current phase anywhere; it is re-derived from
/// on-disk artifacts by the detector before and after every worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Specify,
    Clarify,
    ClarifyVerify,
    Plan,
    DesignRead,
    Tasks,
    Analyze,
    AnalyzeVerify,
    Implement,
    Review,
    Done,
}

impl Phase {
    /// All phases in lifecycle order.
    pub const ALL: [Phase; 11] = [
        Phase::Specify,
        Phase::Clarify,
        Phase::ClarifyVerify,
        Phase::Plan,
        Phase::DesignRead,
        Phase::Tasks,
        Phase::Analyze,
        Phase::AnalyzeVerify,
        Phase::Implement,
        Phase::Review,
        Phase::Done,
    ];

    /// Iterative phases are re-entered across rounds until their findings
    /// count reaches zero (or the round budget is exhausted).
    pub fn is_iterative(&self) -> bool {
        matches!(self, Phase::Clarify | Phase::Analyze)
    }

    /// Single-pass check phases guarding an iterative phase's output.
    pub fn is_verify(&self) -> bool {
        matches!(self, Phase::ClarifyVerify | Phase::AnalyzeVerify)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }

    /// Stable identifier used in event payloads, transcript filenames and
    /// the status snapshot.
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::Specify => "specify",
            Phase::Clarify => "clarify",
            Phase::ClarifyVerify => "clarify-verify",
            Phase::Plan => "plan",
            Phase::DesignRead => "design-read",
            Phase::Tasks => "tasks",
            Phase::Analyze => "analyze",
            Phase::AnalyzeVerify => "analyze-verify",
            Phase::Implement => "implement",
            Phase::Review => "review",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Model tier requested from the worker for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap model for mechanical phases (marker checks, bookkeeping).
    Fast,
    /// Default tier for most phases.
    #[default]
    Standard,
    /// Strongest tier for design-heavy phases.
    Deep,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Standard => "standard",
            ModelTier::Deep => "deep",
        }
    }
}

/// How a single phase's worker invocation is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// Model tier passed to the worker.
    #[serde(default)]
    pub model: ModelTier,
    /// Explicit capability allow-list the worker may use during this phase.
    pub allowed_tools: Vec<String>,
    /// Maximum attempts (rounds for iterative phases) before the exhaustion
    /// policy kicks in.
    pub max_attempts: u32,
    /// Convergence window for iterative phases; ignored otherwise.
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    2
}

const READ_TOOLS: &[&str] = &["Read", "Grep", "Glob"];
const WRITE_TOOLS: &[&str] = &["Read", "Grep", "Glob", "Write", "Edit"];
const FULL_TOOLS: &[&str] = &["Read", "Grep", "Glob", "Write", "Edit", "Bash"];

fn tools(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl PhaseSettings {
    /// Default settings for a phase. Verify phases run on the fast tier with
    /// read capabilities plus Edit (they may retract markers); implement gets
    /// the full allow-list and the largest round budget.
    pub fn defaults_for(phase: Phase) -> Self {
        match phase {
            Phase::Specify | Phase::Plan => Self {
                model: ModelTier::Deep,
                allowed_tools: tools(WRITE_TOOLS),
                max_attempts: 3,
                window: 2,
            },
            Phase::Clarify | Phase::Analyze => Self {
                model: ModelTier::Standard,
                allowed_tools: tools(WRITE_TOOLS),
                max_attempts: 5,
                window: 2,
            },
            Phase::ClarifyVerify | Phase::AnalyzeVerify => Self {
                model: ModelTier::Fast,
                allowed_tools: tools(&["Read", "Grep", "Glob", "Edit"]),
                max_attempts: 2,
                window: 2,
            },
            Phase::DesignRead => Self {
                model: ModelTier::Standard,
                allowed_tools: tools(WRITE_TOOLS),
                max_attempts: 2,
                window: 2,
            },
            Phase::Tasks => Self {
                model: ModelTier::Standard,
                allowed_tools: tools(WRITE_TOOLS),
                max_attempts: 3,
                window: 2,
            },
            Phase::Implement => Self {
                model: ModelTier::Deep,
                allowed_tools: tools(FULL_TOOLS),
                max_attempts: 10,
                window: 3,
            },
            Phase::Review => Self {
                model: ModelTier::Standard,
                allowed_tools: tools(FULL_TOOLS),
                max_attempts: 3,
                window: 2,
            },
            Phase::Done => Self {
                model: ModelTier::Fast,
                allowed_tools: tools(READ_TOOLS),
                max_attempts: 1,
                window: 2,
            },
        }
    }
}

/// Fixed backoff applied between attempts after a rate-limited failure.
pub fn rate_limit_backoff(attempt: u32) -> Duration {
    Duration::from_secs(30) * attempt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_matches_lifecycle() {
        assert!(Phase::Specify < Phase::Clarify);
        assert!(Phase::Clarify < Phase::ClarifyVerify);
        assert!(Phase::Implement < Phase::Review);
        assert!(Phase::Review < Phase::Done);
        assert_eq!(Phase::ALL.len(), 11);
        assert_eq!(Phase::ALL[0], Phase::Specify);
        assert_eq!(Phase::ALL[10], Phase::Done);
    }

    #[test]
    fn test_iterative_phases() {
        assert!(Phase::Clarify.is_iterative());
        assert!(Phase::Analyze.is_iterative());
        assert!(!Phase::Specify.is_iterative());
        assert!(!Phase::ClarifyVerify.is_iterative());
        assert!(!Phase::Implement.is_iterative());
    }

    #[test]
    fn test_verify_phases() {
        assert!(Phase::ClarifyVerify.is_verify());
        assert!(Phase::AnalyzeVerify.is_verify());
        assert!(!Phase::Clarify.is_verify());
    }

    #[test]
    fn test_slug_round_trips_through_serde() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.slug()));
            let parsed: Phase = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, phase);
        }
    }

    #[test]
    fn test_default_settings_sanity() {
        let implement = PhaseSettings::defaults_for(Phase::Implement);
        assert_eq!(implement.model, ModelTier::Deep);
        assert!(implement.allowed_tools.contains(&"Bash".to_string()));
        assert_eq!(implement.max_attempts, 10);

        let verify = PhaseSettings::defaults_for(Phase::ClarifyVerify);
        assert_eq!(verify.model, ModelTier::Fast);
        // Verify phases may retract markers, so Edit is allowed but Bash is not.
        assert!(verify.allowed_tools.contains(&"Edit".to_string()));
        assert!(!verify.allowed_tools.contains(&"Bash".to_string()));
    }

    #[test]
    fn test_rate_limit_backoff_scales_linearly() {
        assert_eq!(rate_limit_backoff(1), Duration::from_secs(30));
        assert_eq!(rate_limit_backoff(3), Duration::from_secs(90));
    }
}
