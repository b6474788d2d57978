//! Hot / warm / cold peer classification.

use serde::{Deserialize, Serialize};

use crate::activity::ActivityEntry;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub(crate) fn index(self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }
}

/// Recency thresholds, in milliseconds of age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub hot_interest_ms: u64,
    pub hot_seen_ms: u64,
    pub warm_interest_ms: u64,
    pub warm_seen_ms: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            hot_interest_ms: 15 * MINUTE_MS,
            hot_seen_ms: DAY_MS,
            warm_interest_ms: DAY_MS,
            warm_seen_ms: 30 * DAY_MS,
        }
    }
}

impl TierThresholds {
    /// Classify a peer. A field of zero means "never" and matches no tier.
    pub fn classify(&self, entry: &ActivityEntry, now: u64) -> Tier {
        let interest_age = age(entry.last_interest, now);
        let seen_age = age(entry.last_seen, now);
        let within = |age: Option<u64>, limit: u64| age.is_some_and(|a| a <= limit);

        if within(interest_age, self.hot_interest_ms) || within(seen_age, self.hot_seen_ms) {
            Tier::Hot
        } else if within(interest_age, self.warm_interest_ms)
            || within(seen_age, self.warm_seen_ms)
        {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }
}

fn age(at: u64, now: u64) -> Option<u64> {
    (at > 0).then(|| now.saturating_sub(at))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn entry(last_seen: u64, last_interest: u64) -> ActivityEntry {
        ActivityEntry {
            last_seen,
            last_interest,
            last_requested: 0,
        }
    }

    #[test]
    fn test_no_activity_is_cold() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&ActivityEntry::default(), NOW), Tier::Cold);
    }

    #[test]
    fn test_fresh_interest_is_hot_regardless_of_seen() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&entry(0, NOW), NOW), Tier::Hot);
        assert_eq!(t.classify(&entry(NOW - 365 * DAY_MS, NOW), NOW), Tier::Hot);
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&entry(0, NOW - 15 * MINUTE_MS), NOW), Tier::Hot);
        assert_eq!(t.classify(&entry(0, NOW - 15 * MINUTE_MS - 1), NOW), Tier::Warm);
        assert_eq!(t.classify(&entry(NOW - DAY_MS, 0), NOW), Tier::Hot);
        assert_eq!(t.classify(&entry(NOW - DAY_MS - 1, 0), NOW), Tier::Warm);
    }

    #[test]
    fn test_warm_and_cold_by_seen_age() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&entry(NOW - 10 * DAY_MS, 0), NOW), Tier::Warm);
        assert_eq!(t.classify(&entry(NOW - 30 * DAY_MS, 0), NOW), Tier::Warm);
        assert_eq!(t.classify(&entry(NOW - 31 * DAY_MS, 0), NOW), Tier::Cold);
    }

    #[test]
    fn test_interest_within_a_day_is_warm() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&entry(0, NOW - 2 * HOUR_MS), NOW), Tier::Warm);
        assert_eq!(t.classify(&entry(0, NOW - 2 * DAY_MS), NOW), Tier::Cold);
    }

    #[test]
    fn test_future_timestamps_count_as_fresh() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&entry(NOW + 1000, 0), NOW), Tier::Hot);
    }
}
