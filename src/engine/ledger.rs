use chrono::{Datelike, NaiveDate};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, today};

impl Engine {
    /// Book one seat on one slot-date. Capacity and uniqueness are validated
    /// under the slot's write lock, immediately before the WAL commit.
    pub async fn create_booking(
        &self,
        student_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        origin: BookingOrigin,
    ) -> Result<Booking, EngineError> {
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;

        if !guard.slot.active {
            return Err(EngineError::Validation(format!("slot {slot_id} is inactive")));
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
        if date.weekday() != guard.slot.weekday {
            return Err(EngineError::Validation(format!(
                "{date} does not fall on {}",
                guard.slot.weekday
            )));
        }
        if date < today() {
            return Err(EngineError::PastDate(date));
        }
        if guard.active_booking_for(student_id, date).is_some() {
            return Err(EngineError::AlreadyBooked { slot_id, date });
        }
        if guard.bookings.len() >= self.config.max_bookings_per_slot {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }
        if guard.occupied_on(date) >= class.capacity {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::CapacityExceeded { slot_id, date });
        }

        let booking = Booking {
            id: Ulid::new(),
            student_id,
            slot_id,
            date,
            status: BookingStatus::Confirmed,
            origin,
            assignment_id: None,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Cancel a confirmed booking owned by the student. Past dates are
    /// immutable; a booking dated today may still be cancelled. Cancellation
    /// never frees a credit — access is plan-based, not credit-based.
    pub async fn cancel_booking(
        &self,
        student_id: Ulid,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let slot_id = *self
            .booking_slot
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .value();
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;

        let booking = guard
            .booking(booking_id)
            .filter(|b| b.student_id == student_id && b.status == BookingStatus::Confirmed)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.date < today() {
            return Err(EngineError::PastDate(booking.date));
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("cancelled booking {booking_id} on slot {slot_id}");
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    /// Seam for the attendance process: mark a confirmed booking completed or
    /// no-show. Both are terminal.
    pub async fn record_attendance(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<(), EngineError> {
        if !matches!(status, BookingStatus::Completed | BookingStatus::NoShow) {
            return Err(EngineError::Validation(
                "attendance status must be completed or no-show".into(),
            ));
        }
        let slot_id = *self
            .booking_slot
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .value();
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;

        match guard.booking(booking_id) {
            Some(b) if b.status == BookingStatus::Confirmed => {}
            Some(_) => {
                return Err(EngineError::Validation(
                    "attendance requires a confirmed booking".into(),
                ));
            }
            None => return Err(EngineError::NotFound(booking_id)),
        }

        let event = Event::AttendanceRecorded {
            id: booking_id,
            slot_id,
            status,
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await
    }

    /// All of a student's bookings matching the filter, ordered by date
    /// ascending, then slot start time ascending.
    pub async fn list_bookings(&self, student_id: Ulid, filter: &BookingFilter) -> Vec<Booking> {
        let ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.get_slot(&id) else { continue };
            let guard = rs.read().await;
            let start_time = guard.slot.start_time;
            for b in &guard.bookings {
                if b.student_id == student_id && filter.matches(b) {
                    out.push((b.clone(), start_time));
                }
            }
        }
        out.sort_by(|a, b| {
            a.0.date
                .cmp(&b.0.date)
                .then(a.1.cmp(&b.1))
                .then(a.0.id.cmp(&b.0.id))
        });
        out.into_iter().map(|(b, _)| b).collect()
    }
}
