use chrono::Days;

use crate::model::PlanType;

/// Engine-wide tunables. Immutable after construction — pass a fresh value to
/// `Engine::new` instead of mutating shared state, so tests can vary limits
/// without process-wide side effects.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Schedule changes allowed per (student, plan) pair.
    pub change_limit: u32,
    /// Widest allowed materialization/query window in days.
    pub max_range_days: i64,
    /// Hard cap on booking rows held by a single slot.
    pub max_bookings_per_slot: usize,
    pub max_name_len: usize,
    pub max_reason_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            change_limit: 1,
            max_range_days: 366,
            max_bookings_per_slot: 50_000,
            max_name_len: 256,
            max_reason_len: 512,
        }
    }
}

impl EngineConfig {
    /// Default validity period for a plan type. The engine itself always takes
    /// explicit start/end dates; this is a convenience for callers computing an
    /// expiration date from a purchase date.
    pub fn plan_period(&self, plan_type: PlanType) -> Days {
        match plan_type {
            PlanType::Weekly => Days::new(7),
            PlanType::Monthly => Days::new(31),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn plan_period_by_type() {
        let cfg = EngineConfig::default();
        let start = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert_eq!(
            start + cfg.plan_period(PlanType::Weekly),
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
        );
        assert_eq!(
            start + cfg.plan_period(PlanType::Monthly),
            NaiveDate::from_ymd_opt(2024, 7, 4).unwrap()
        );
    }

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.change_limit, 1);
        assert!(cfg.max_range_days >= 366);
    }
}
