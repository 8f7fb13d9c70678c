//! Group priority scoring.

use chrono::{DateTime, Utc};

/// Age boost accrued per minute the oldest member job has waited.
pub const AGE_BOOST_PER_MIN: f64 = 0.1;

/// Boost ceiling. Once every contender has saturated it (30 min of waiting)
/// strictly higher declared priority always outranks, so age can delay a
/// higher-priority group only for a bounded window.
pub const AGE_BOOST_CAP: f64 = 3.0;

/// Composite score for a group: average declared priority of its jobs,
/// boosted by the age of the oldest one. Non-decreasing in both inputs.
pub fn priority_score(
    avg_priority: f64,
    oldest_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let age_minutes = (now - oldest_created_at).num_seconds().max(0) as f64 / 60.0;
    avg_priority + (age_minutes * AGE_BOOST_PER_MIN).min(AGE_BOOST_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_group_scores_its_average_priority() {
        let now = Utc::now();
        let score = priority_score(6.0, now, now);
        assert!((score - 6.0).abs() < 1e-9);
    }

    #[test]
    fn older_groups_score_higher() {
        let now = Utc::now();
        let young = priority_score(5.0, now - Duration::minutes(1), now);
        let old = priority_score(5.0, now - Duration::minutes(10), now);
        assert!(old > young);
    }

    #[test]
    fn age_boost_saturates() {
        let now = Utc::now();
        let old = priority_score(5.0, now - Duration::minutes(30), now);
        let ancient = priority_score(5.0, now - Duration::days(2), now);
        assert!((old - ancient).abs() < 1e-9);
        // A saturated low-priority group still loses to a saturated
        // strictly-higher one.
        assert!(priority_score(9.0, now - Duration::days(2), now) > ancient);
    }
}
