use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::schedule::weekday_dates;
use super::{Engine, EngineError, validate_range};

/// First weekday-matching date in `[start, end]` where the slot is already at
/// capacity, if any. Runs against whatever booking state the caller holds a
/// lock on — mutating paths re-run this under the slot's write lock, which is
/// what closes the check-then-act race.
pub(super) fn range_conflict(
    rs: &SlotState,
    capacity: u32,
    start: NaiveDate,
    end: NaiveDate,
) -> Option<NaiveDate> {
    weekday_dates(start, end, rs.slot.weekday).find(|d| rs.occupied_on(*d) >= capacity)
}

impl Engine {
    /// Seat availability for one slot on one calendar date.
    pub async fn check_availability(
        &self,
        slot_id: Ulid,
        date: NaiveDate,
    ) -> Result<SlotAvailability, EngineError> {
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        let capacity = self.class_capacity(&guard.slot.class_id)?;
        let occupied = guard.occupied_on(date);
        Ok(SlotAvailability {
            available: occupied < capacity,
            occupied,
            capacity,
        })
    }

    /// Walk every date in `[start, end]` matching the slot's weekday and fail
    /// fast on the first one already at capacity. Advisory outside a write
    /// lock; allocation paths re-validate under the lock before committing.
    pub async fn check_range_availability(
        &self,
        slot_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RangeAvailability, EngineError> {
        validate_range(start, end, self.config.max_range_days)?;
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        let capacity = self.class_capacity(&guard.slot.class_id)?;
        let first_conflicting_date = range_conflict(&guard, capacity, start, end);
        Ok(RangeAvailability {
            available: first_conflicting_date.is_none(),
            first_conflicting_date,
        })
    }
}
