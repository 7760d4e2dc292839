//! Convergence tracking for iterative phases.
//!
//! Every iterative phase collects a findings count per round. The tracker
//! decides whether that series has plateaued without reaching zero; what to do
//! about a stall is the caller's policy, never this module's.

/// Ordered findings counts collected across the rounds of one iterative phase
/// for one epic. Held in memory for the duration of the phase's retry loop,
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceSeries {
    counts: Vec<u32>,
}

impl ConvergenceSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, count: u32) {
        self.counts.push(count);
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn latest(&self) -> Option<u32> {
        self.counts.last().copied()
    }

    pub fn rounds(&self) -> usize {
        self.counts.len()
    }

    /// True when the series has plateaued at a non-zero count over `window`
    /// rounds. See [`is_stalled`].
    pub fn is_stalled(&self, window: usize) -> bool {
        is_stalled(&self.counts, window)
    }
}

/// Decide whether a findings series has stalled.
///
/// - fewer than `window` rounds: not enough evidence, `false`
/// - most recent count is zero: converged, `false` (zero never stalls)
/// - otherwise `true` iff the final `window` entries are pairwise equal and
///   non-zero
pub fn is_stalled(counts: &[u32], window: usize) -> bool {
    if window == 0 || counts.len() < window {
        return false;
    }
    let tail = &counts[counts.len() - window..];
    let last = tail[tail.len() - 1];
    if last == 0 {
        return false;
    }
    tail.iter().all(|&c| c == last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_plateau() {
        assert!(is_stalled(&[5, 3, 3], 2));
        assert!(is_stalled(&[4, 4], 2));
        assert!(is_stalled(&[7, 7, 7], 3));
    }

    #[test]
    fn test_not_stalled_while_decreasing() {
        assert!(!is_stalled(&[5, 3, 2], 2));
        assert!(!is_stalled(&[9, 8, 7], 3));
    }

    #[test]
    fn test_not_enough_evidence() {
        assert!(!is_stalled(&[5], 2));
        assert!(!is_stalled(&[], 2));
        assert!(!is_stalled(&[3, 3], 3));
    }

    #[test]
    fn test_zero_always_means_converged() {
        assert!(!is_stalled(&[0, 0], 2));
        assert!(!is_stalled(&[5, 0], 2));
        assert!(!is_stalled(&[0], 1));
    }

    #[test]
    fn test_zero_window_never_stalls() {
        assert!(!is_stalled(&[3, 3, 3], 0));
    }

    #[test]
    fn test_plateau_must_cover_whole_window() {
        // Last two equal but window of 3 reaches back to a different count.
        assert!(!is_stalled(&[5, 3, 3], 3));
    }

    #[test]
    fn test_series_accumulates_rounds() {
        let mut series = ConvergenceSeries::new();
        assert_eq!(series.rounds(), 0);
        assert!(series.latest().is_none());

        series.push(4);
        series.push(4);
        assert_eq!(series.rounds(), 2);
        assert_eq!(series.latest(), Some(4));
        assert!(series.is_stalled(2));

        series.push(0);
        assert!(!series.is_stalled(2));
    }
}
