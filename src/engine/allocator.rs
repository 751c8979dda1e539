use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::schedule::materialize;
use super::{Engine, EngineError, apply_assignment, apply_booking, today, validate_range};

impl Engine {
    /// Bind a purchased plan to its fixed slots and generate every future
    /// booking in `[start, end]` in one atomic step. Either all assignment rows
    /// and all bookings commit, or none do. Dates where the student already
    /// holds a live booking are kept as-is and skipped, not errors.
    ///
    /// All involved slots are write-locked in ascending id order before any
    /// capacity check, so a concurrent allocation cannot slip a booking in
    /// between validation and commit.
    pub async fn assign_fixed_slots(
        &self,
        student_id: Ulid,
        plan_ref: Ulid,
        plan_type: PlanType,
        slot_ids: &[Ulid],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FixedAssignment>, EngineError> {
        validate_range(start, end, self.config.max_range_days)?;
        if slot_ids.len() != plan_type.required_slots() {
            return Err(EngineError::Validation(format!(
                "{:?} plan requires exactly {} slot(s), got {}",
                plan_type,
                plan_type.required_slots(),
                slot_ids.len()
            )));
        }

        let mut sorted_ids = slot_ids.to_vec();
        sorted_ids.sort();
        if sorted_ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Validation(
                "slot ids must be distinct".into(),
            ));
        }

        // Advisory: one plan_ref binds at most one set of assignments.
        if self.plan_is_assigned(plan_ref).await {
            return Err(EngineError::Validation(format!(
                "plan {plan_ref} is already assigned"
            )));
        }

        // Lock every slot in ascending id order.
        let mut guards: Vec<(Ulid, OwnedRwLockWriteGuard<SlotState>)> =
            Vec::with_capacity(sorted_ids.len());
        for id in &sorted_ids {
            let rs = self.get_slot(id).ok_or(EngineError::NotFound(*id))?;
            guards.push((*id, rs.write_owned().await));
        }

        // Validate each slot and reject weekday/time collisions within the set.
        for (id, guard) in &guards {
            if !guard.slot.active {
                return Err(EngineError::Validation(format!("slot {id} is inactive")));
            }
            let class = self
                .get_class(&guard.slot.class_id)
                .ok_or(EngineError::NotFound(guard.slot.class_id))?;
            if !class.active {
                return Err(EngineError::Validation(format!(
                    "class {} is inactive",
                    class.id
                )));
            }
            if guard.active_assignment_for(student_id).is_some() {
                return Err(EngineError::Conflict {
                    slot_id: *id,
                    weekday: guard.slot.weekday,
                    start_time: guard.slot.start_time,
                });
            }
        }
        for (i, (_, a)) in guards.iter().enumerate() {
            for (_, b) in guards.iter().skip(i + 1) {
                if a.slot.weekday == b.slot.weekday
                    && a.slot.start_time < b.slot.end_time
                    && b.slot.start_time < a.slot.end_time
                {
                    return Err(EngineError::Conflict {
                        slot_id: b.slot.id,
                        weekday: b.slot.weekday,
                        start_time: b.slot.start_time,
                    });
                }
            }
        }

        let weekday_of = |slot_id: Ulid| {
            guards
                .iter()
                .find(|(id, _)| *id == slot_id)
                .map(|(_, g)| g.slot.weekday)
                .expect("slot was locked above")
        };
        let tagged: Vec<(Ulid, chrono::Weekday)> =
            sorted_ids.iter().map(|id| (*id, weekday_of(*id))).collect();
        let pairs = materialize(&tagged, start, end, today());

        // Capacity and uniqueness re-check under the locks. Any failure aborts
        // the whole call before a single byte reaches the WAL.
        let assignments: Vec<FixedAssignment> = sorted_ids
            .iter()
            .map(|slot_id| FixedAssignment {
                id: Ulid::new(),
                student_id,
                plan_ref,
                plan_type,
                slot_id: *slot_id,
                start,
                end,
                active: true,
            })
            .collect();
        let assignment_for = |slot_id: Ulid| {
            assignments
                .iter()
                .find(|a| a.slot_id == slot_id)
                .map(|a| a.id)
                .expect("one assignment per slot id")
        };

        let mut bookings = Vec::with_capacity(pairs.len());
        for (slot_id, date) in &pairs {
            let (_, guard) = guards
                .iter()
                .find(|(id, _)| id == slot_id)
                .expect("pair came from the locked set");
            let capacity = self.class_capacity(&guard.slot.class_id)?;
            if guard.active_booking_for(student_id, *date).is_some() {
                // Already satisfied, e.g. a manual booking made before the
                // plan purchase — keep it and skip the date.
                continue;
            }
            if guard.occupied_on(*date) >= capacity {
                metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::CapacityExceeded {
                    slot_id: *slot_id,
                    date: *date,
                });
            }
            bookings.push(Booking {
                id: Ulid::new(),
                student_id,
                slot_id: *slot_id,
                date: *date,
                status: BookingStatus::Confirmed,
                origin: BookingOrigin::Auto,
                assignment_id: Some(assignment_for(*slot_id)),
            });
        }

        let event = Event::PlanAssigned {
            assignments: assignments.clone(),
            bookings: bookings.clone(),
        };
        self.wal_append(&event).await?;

        for (slot_id, guard) in guards.iter_mut() {
            for a in assignments.iter().filter(|a| a.slot_id == *slot_id) {
                apply_assignment(guard, a, &self.assignment_slot);
            }
            for b in bookings.iter().filter(|b| b.slot_id == *slot_id) {
                apply_booking(guard, b, &self.booking_slot);
            }
            self.notify.send(*slot_id, &event);
        }
        metrics::counter!(observability::ASSIGNMENTS_CREATED_TOTAL)
            .increment(assignments.len() as u64);
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        info!(
            "assigned plan {plan_ref} for student {student_id}: {} slot(s), {} booking(s)",
            assignments.len(),
            bookings.len()
        );
        Ok(assignments)
    }

    /// Re-run booking generation for one active assignment, filling only the
    /// dates the student does not already hold a live booking for. Running it
    /// twice in a row is a no-op; an empty fill set skips the WAL entirely.
    pub async fn rematerialize_assignment(
        &self,
        assignment_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        let slot_id = *self
            .assignment_slot
            .get(&assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?
            .value();
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;

        let assignment = guard
            .assignment(assignment_id)
            .filter(|a| a.active)
            .cloned()
            .ok_or(EngineError::NotFound(assignment_id))?;
        let capacity = self.class_capacity(&guard.slot.class_id)?;

        let pairs = materialize(
            &[(slot_id, guard.slot.weekday)],
            assignment.start,
            assignment.end,
            today(),
        );
        let mut bookings = Vec::new();
        for (_, date) in &pairs {
            if guard
                .active_booking_for(assignment.student_id, *date)
                .is_some()
            {
                continue;
            }
            if guard.occupied_on(*date) >= capacity {
                metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::CapacityExceeded { slot_id, date: *date });
            }
            bookings.push(Booking {
                id: Ulid::new(),
                student_id: assignment.student_id,
                slot_id,
                date: *date,
                status: BookingStatus::Confirmed,
                origin: BookingOrigin::Auto,
                assignment_id: Some(assignment_id),
            });
        }
        if bookings.is_empty() {
            return Ok(bookings);
        }

        let event = Event::BookingsMaterialized {
            assignment_id,
            slot_id,
            bookings: bookings.clone(),
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        Ok(bookings)
    }

    /// Look up an assignment row by id.
    pub async fn get_assignment(&self, assignment_id: Ulid) -> Option<FixedAssignment> {
        let slot_id = *self.assignment_slot.get(&assignment_id)?.value();
        let rs = self.get_slot(&slot_id)?;
        let guard = rs.read().await;
        guard.assignment(assignment_id).cloned()
    }

    /// A student's fixed assignments, active ones first, newest first within
    /// each group.
    pub async fn list_assignments(&self, student_id: Ulid) -> Vec<FixedAssignment> {
        let ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.get_slot(&id) else { continue };
            let guard = rs.read().await;
            out.extend(
                guard
                    .assignments
                    .iter()
                    .filter(|a| a.student_id == student_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.active.cmp(&a.active).then(b.id.cmp(&a.id)));
        out
    }

    async fn plan_is_assigned(&self, plan_ref: Ulid) -> bool {
        let ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(rs) = self.get_slot(&id) else { continue };
            let guard = rs.read().await;
            if guard.assignments.iter().any(|a| a.plan_ref == plan_ref && a.active) {
                return true;
            }
        }
        false
    }
}
