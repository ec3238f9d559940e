//! Run scoring.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const BASE_SCORE: u32 = 100;
pub const SPEED_BONUS: u32 = 10;
/// Runs finishing strictly under this earn the speed bonus.
pub const SPEED_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Commits allowed before the efficiency penalty starts.
pub const FREE_COMMITS: u32 = 20;
pub const PENALTY_PER_COMMIT: u32 = 2;

/// Score derived from a terminal Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub base: u32,
    pub speed_bonus: u32,
    pub efficiency_penalty: u32,
    pub total: u32,
}

/// Score a Run from its elapsed time and commit count.
#[must_use]
pub fn score(elapsed: Duration, total_commits: u32) -> ScoreResult {
    let speed_bonus = if elapsed < SPEED_THRESHOLD { SPEED_BONUS } else { 0 };
    let efficiency_penalty =
        PENALTY_PER_COMMIT.saturating_mul(total_commits.saturating_sub(FREE_COMMITS));
    ScoreResult {
        base: BASE_SCORE,
        speed_bonus,
        efficiency_penalty,
        total: (BASE_SCORE + speed_bonus).saturating_sub(efficiency_penalty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_run_gets_bonus() {
        let s = score(Duration::from_secs(42), 1);
        assert_eq!(s.total, 110);
        assert_eq!(s.efficiency_penalty, 0);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert_eq!(score(Duration::from_secs(300), 0).speed_bonus, 0);
        assert_eq!(score(Duration::from_millis(299_999), 0).speed_bonus, 10);
    }

    #[test]
    fn test_penalty_above_twenty_commits() {
        let s = score(Duration::from_secs(60), 25);
        assert_eq!(s.efficiency_penalty, 10);
        assert_eq!(s.total, 100);
        assert_eq!(score(Duration::from_secs(60), 20).total, 110);
    }

    #[test]
    fn test_total_never_negative() {
        assert_eq!(score(Duration::from_secs(900), 500).total, 0);
    }
}
