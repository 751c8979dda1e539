//! WAL-backed booking engine for recurring fitness-studio schedules: a slot
//! catalog, per-slot-date capacity accounting, plan-to-slot fixed assignments
//! with bulk booking generation, and a once-per-plan schedule-change quota.
//! All state lives in memory and is rebuilt from the write-ahead log on start.

pub mod config;
pub mod engine;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
