use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A class offered by the studio. `capacity` bounds concurrent bookings per
/// slot-date across every slot that belongs to this class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTemplate {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub active: bool,
}

/// A recurring weekly class opportunity: weekday + time range, not tied to a
/// specific calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub class_id: Ulid,
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanType {
    Weekly,
    Monthly,
}

impl PlanType {
    /// How many distinct slots a plan of this type binds.
    pub fn required_slots(&self) -> usize {
        match self {
            PlanType::Weekly => 1,
            PlanType::Monthly => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Cancelled/completed/no-show are terminal; only Confirmed may transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingOrigin {
    /// Generated by materializing a fixed assignment.
    Auto,
    /// Requested one-off by the student.
    Manual,
}

/// A single date-stamped reservation against one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub student_id: Ulid,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub status: BookingStatus,
    pub origin: BookingOrigin,
    /// Back-reference to the originating fixed assignment, if auto-generated.
    pub assignment_id: Option<Ulid>,
}

impl Booking {
    /// Everything but Cancelled counts against the class capacity.
    pub fn occupies_seat(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

/// The binding of a student's plan to one slot for a date range. Monthly plans
/// produce two of these, linked by `plan_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedAssignment {
    pub id: Ulid,
    pub student_id: Ulid,
    /// External payment/plan id from the billing collaborator.
    pub plan_ref: Ulid,
    pub plan_type: PlanType,
    pub slot_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub active: bool,
}

/// Additive log entry; the count per (student, plan_ref) drives the quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleChangeRecord {
    pub id: Ulid,
    pub student_id: Ulid,
    pub plan_ref: Ulid,
    pub old_slot_id: Ulid,
    pub new_slot_id: Ulid,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Runtime state of one slot: its metadata plus every booking and fixed
/// assignment it holds. Bookings are kept sorted by (date, id).
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub bookings: Vec<Booking>,
    pub assignments: Vec<FixedAssignment>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
            assignments: Vec::new(),
        }
    }

    /// Insert a booking maintaining (date, id) sort order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.id);
        let pos = self
            .bookings
            .binary_search_by_key(&key, |b| (b.date, b.id))
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Seats taken on a given date: non-cancelled bookings only.
    pub fn occupied_on(&self, date: NaiveDate) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.date == date && b.occupies_seat())
            .count() as u32
    }

    /// The student's non-cancelled booking on a date, if any.
    pub fn active_booking_for(&self, student_id: Ulid, date: NaiveDate) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.date == date && b.student_id == student_id && b.occupies_seat())
    }

    /// The student's active fixed assignment on this slot, if any.
    pub fn active_assignment_for(&self, student_id: Ulid) -> Option<&FixedAssignment> {
        self.assignments
            .iter()
            .find(|a| a.student_id == student_id && a.active)
    }

    pub fn assignment(&self, id: Ulid) -> Option<&FixedAssignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    pub fn assignment_mut(&mut self, id: Ulid) -> Option<&mut FixedAssignment> {
        self.assignments.iter_mut().find(|a| a.id == id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
/// Multi-row operations are single composite records so they commit atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassCreated {
        class: ClassTemplate,
    },
    ClassUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        active: bool,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotActiveSet {
        id: Ulid,
        active: bool,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
    },
    AttendanceRecorded {
        id: Ulid,
        slot_id: Ulid,
        status: BookingStatus,
    },
    /// One record per `assign_fixed_slots` call: every assignment row and every
    /// generated booking, or nothing.
    PlanAssigned {
        assignments: Vec<FixedAssignment>,
        bookings: Vec<Booking>,
    },
    /// Idempotent re-run of the bulk generation path for one assignment.
    BookingsMaterialized {
        assignment_id: Ulid,
        slot_id: Ulid,
        bookings: Vec<Booking>,
    },
    /// One record per `register_change` call: quota entry, retired assignment,
    /// cancelled future bookings, replacement assignment and its bookings.
    ScheduleChanged {
        record: ScheduleChangeRecord,
        retired_assignment: Ulid,
        replacement: FixedAssignment,
        cancelled_bookings: Vec<Ulid>,
        bookings: Vec<Booking>,
    },
    /// Compaction snapshot of one assignment row.
    AssignmentRecorded {
        assignment: FixedAssignment,
    },
    /// Compaction snapshot of one quota ledger entry.
    ChangeRecorded {
        record: ScheduleChangeRecord,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub available: bool,
    pub occupied: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAvailability {
    pub available: bool,
    pub first_conflicting_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedSlot {
    pub slot: Slot,
    pub availability: RangeAvailability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeQuota {
    pub used: u32,
    pub remaining: u32,
    pub can_change: bool,
}

/// Filters for `list_bookings`. `None` means "don't filter".
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub statuses: Option<Vec<BookingStatus>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&booking.status) {
                return false;
            }
        if let Some(from) = self.from
            && booking.date < from {
                return false;
            }
        if let Some(to) = self.to
            && booking.date > to {
                return false;
            }
        true
    }
}
