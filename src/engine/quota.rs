use chrono::Utc;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::schedule::materialize;
use super::{
    Engine, EngineError, apply_assignment, apply_booking, apply_cancel, apply_retire, today,
};

impl Engine {
    /// How many schedule changes the plan has consumed. The count only grows;
    /// cancelling bookings never refunds a change.
    pub async fn get_quota(&self, student_id: Ulid, plan_ref: Ulid) -> ChangeQuota {
        let changes = self.changes.lock().await;
        let used = changes
            .get(&(student_id, plan_ref))
            .map_or(0, |v| v.len()) as u32;
        let limit = self.config.change_limit;
        ChangeQuota {
            used,
            remaining: limit.saturating_sub(used),
            can_change: used < limit,
        }
    }

    /// Change history for one plan, oldest first.
    pub async fn list_changes(
        &self,
        student_id: Ulid,
        plan_ref: Ulid,
    ) -> Vec<ScheduleChangeRecord> {
        let changes = self.changes.lock().await;
        changes
            .get(&(student_id, plan_ref))
            .cloned()
            .unwrap_or_default()
    }

    /// Move one fixed assignment to a different slot: retire the old
    /// assignment, cancel its future bookings, create the replacement and its
    /// bookings, and burn one quota unit — all as a single WAL record.
    ///
    /// The change ledger mutex is held from the quota check through the commit,
    /// so two concurrent changes against the same plan cannot both pass the
    /// check. Slot locks are taken in ascending id order under it.
    pub async fn register_change(
        &self,
        student_id: Ulid,
        plan_ref: Ulid,
        assignment_id: Ulid,
        new_slot_id: Ulid,
        reason: Option<String>,
    ) -> Result<ScheduleChangeRecord, EngineError> {
        if let Some(ref r) = reason
            && r.len() > self.config.max_reason_len {
                return Err(EngineError::LimitExceeded("change reason too long"));
            }

        let mut changes = self.changes.lock().await;
        let used = changes
            .get(&(student_id, plan_ref))
            .map_or(0, |v| v.len()) as u32;
        if used >= self.config.change_limit {
            return Err(EngineError::QuotaExceeded {
                used,
                limit: self.config.change_limit,
            });
        }

        let old_slot_id = *self
            .assignment_slot
            .get(&assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?
            .value();
        if old_slot_id == new_slot_id {
            return Err(EngineError::Validation(
                "replacement slot must differ from the current one".into(),
            ));
        }

        // Both slots, ascending id order.
        let old_rs = self
            .get_slot(&old_slot_id)
            .ok_or(EngineError::NotFound(old_slot_id))?;
        let new_rs = self
            .get_slot(&new_slot_id)
            .ok_or(EngineError::NotFound(new_slot_id))?;
        let (mut old_guard, mut new_guard) = if old_slot_id < new_slot_id {
            let o = old_rs.write_owned().await;
            let n = new_rs.write_owned().await;
            (o, n)
        } else {
            let n = new_rs.write_owned().await;
            let o = old_rs.write_owned().await;
            (o, n)
        };

        let assignment = old_guard
            .assignment(assignment_id)
            .filter(|a| a.student_id == student_id && a.plan_ref == plan_ref && a.active)
            .cloned()
            .ok_or(EngineError::NotFound(assignment_id))?;

        if !new_guard.slot.active {
            return Err(EngineError::Validation(format!(
                "slot {new_slot_id} is inactive"
            )));
        }
        let new_class = self
            .get_class(&new_guard.slot.class_id)
            .ok_or(EngineError::NotFound(new_guard.slot.class_id))?;
        if !new_class.active {
            return Err(EngineError::Validation(format!(
                "class {} is inactive",
                new_class.id
            )));
        }
        if new_guard.active_assignment_for(student_id).is_some() {
            return Err(EngineError::Conflict {
                slot_id: new_slot_id,
                weekday: new_guard.slot.weekday,
                start_time: new_guard.slot.start_time,
            });
        }

        // Future bookings spawned by the old assignment get cancelled; today's
        // and past ones stand.
        let cancelled: Vec<Ulid> = old_guard
            .bookings
            .iter()
            .filter(|b| {
                b.assignment_id == Some(assignment_id)
                    && b.status == BookingStatus::Confirmed
                    && b.date >= today()
            })
            .map(|b| b.id)
            .collect();

        let replacement = FixedAssignment {
            id: Ulid::new(),
            student_id,
            plan_ref,
            plan_type: assignment.plan_type,
            slot_id: new_slot_id,
            start: assignment.start,
            end: assignment.end,
            active: true,
        };

        let pairs = materialize(
            &[(new_slot_id, new_guard.slot.weekday)],
            assignment.start,
            assignment.end,
            today(),
        );
        let mut bookings = Vec::with_capacity(pairs.len());
        for (_, date) in &pairs {
            if new_guard.active_booking_for(student_id, *date).is_some() {
                // Already satisfied on the target slot — keep it, skip the date
                continue;
            }
            if new_guard.occupied_on(*date) >= new_class.capacity {
                metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::CapacityExceeded {
                    slot_id: new_slot_id,
                    date: *date,
                });
            }
            bookings.push(Booking {
                id: Ulid::new(),
                student_id,
                slot_id: new_slot_id,
                date: *date,
                status: BookingStatus::Confirmed,
                origin: BookingOrigin::Auto,
                assignment_id: Some(replacement.id),
            });
        }

        let record = ScheduleChangeRecord {
            id: Ulid::new(),
            student_id,
            plan_ref,
            old_slot_id,
            new_slot_id,
            changed_at: Utc::now(),
            reason,
        };
        let event = Event::ScheduleChanged {
            record: record.clone(),
            retired_assignment: assignment_id,
            replacement: replacement.clone(),
            cancelled_bookings: cancelled.clone(),
            bookings: bookings.clone(),
        };
        self.wal_append(&event).await?;

        apply_retire(&mut old_guard, assignment_id);
        for id in &cancelled {
            apply_cancel(&mut old_guard, *id);
        }
        apply_assignment(&mut new_guard, &replacement, &self.assignment_slot);
        for b in &bookings {
            apply_booking(&mut new_guard, b, &self.booking_slot);
        }
        changes
            .entry((student_id, plan_ref))
            .or_default()
            .push(record.clone());

        self.notify.send(old_slot_id, &event);
        self.notify.send(new_slot_id, &event);
        metrics::counter!(observability::SCHEDULE_CHANGES_TOTAL).increment(1);
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL)
            .increment(cancelled.len() as u64);
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        info!(
            "plan {plan_ref}: moved student {student_id} from slot {old_slot_id} to {new_slot_id} \
             ({} cancelled, {} created)",
            cancelled.len(),
            bookings.len()
        );
        Ok(record)
    }
}
