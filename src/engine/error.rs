use chrono::{NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

/// Domain errors raised synchronously to the caller. All carry enough context
/// to render a user-facing message (which slot/date failed). None are retried
/// by the engine; `Wal` is the generic internal-failure channel, distinct from
/// the domain taxonomy.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed cardinality, inactive slot/class, missing required field.
    Validation(String),
    /// Unknown class/slot/booking/assignment.
    NotFound(Ulid),
    /// Assignment placement conflict: the requested slots overlap in time, or
    /// the student already holds an active assignment on the slot.
    Conflict {
        slot_id: Ulid,
        weekday: Weekday,
        start_time: NaiveTime,
    },
    /// Seat limit reached for a slot-date.
    CapacityExceeded { slot_id: Ulid, date: NaiveDate },
    /// Duplicate active booking for (student, slot, date).
    AlreadyBooked { slot_id: Ulid, date: NaiveDate },
    /// Mutation attempted on a bygone date.
    PastDate(NaiveDate),
    /// Schedule-change limit reached for this plan period.
    QuotaExceeded { used: u32, limit: u32 },
    LimitExceeded(&'static str),
    Wal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict {
                slot_id,
                weekday,
                start_time,
            } => write!(
                f,
                "active fixed assignment already exists on slot {slot_id} ({weekday} {start_time})"
            ),
            EngineError::CapacityExceeded { slot_id, date } => {
                write!(f, "slot {slot_id} is full on {date}")
            }
            EngineError::AlreadyBooked { slot_id, date } => {
                write!(f, "already booked on slot {slot_id} for {date}")
            }
            EngineError::PastDate(date) => write!(f, "date {date} is in the past"),
            EngineError::QuotaExceeded { used, limit } => {
                write!(f, "schedule-change quota exhausted: {used} of {limit} used")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
