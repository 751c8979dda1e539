mod allocator;
mod capacity;
mod catalog;
mod error;
mod ledger;
mod quota;
pub mod schedule;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Calendar date the engine considers "now". Past-date rules compare against
/// this; the materializer takes it as an explicit argument.
pub(super) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(super) fn validate_range(
    start: NaiveDate,
    end: NaiveDate,
    max_days: i64,
) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::Validation(format!(
            "range start {start} is after end {end}"
        )));
    }
    if (end - start).num_days() >= max_days {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Apply helpers ────────────────────────────────────────
// No locking — the caller holds the slot's write lock (or is the sole owner
// during replay).

pub(super) fn apply_booking(rs: &mut SlotState, booking: &Booking, index: &DashMap<Ulid, Ulid>) {
    index.insert(booking.id, booking.slot_id);
    rs.insert_booking(booking.clone());
}

pub(super) fn apply_cancel(rs: &mut SlotState, id: Ulid) {
    if let Some(b) = rs.booking_mut(id) {
        b.status = BookingStatus::Cancelled;
    }
}

pub(super) fn apply_attendance(rs: &mut SlotState, id: Ulid, status: BookingStatus) {
    if let Some(b) = rs.booking_mut(id) {
        b.status = status;
    }
}

pub(super) fn apply_assignment(
    rs: &mut SlotState,
    assignment: &FixedAssignment,
    index: &DashMap<Ulid, Ulid>,
) {
    index.insert(assignment.id, assignment.slot_id);
    rs.assignments.push(assignment.clone());
}

pub(super) fn apply_retire(rs: &mut SlotState, id: Ulid) {
    if let Some(a) = rs.assignment_mut(id) {
        a.active = false;
    }
}

/// Apply a single-slot event to a SlotState. Composite events (PlanAssigned,
/// ScheduleChanged) span slots and are decomposed by their commit sites and by
/// replay instead.
pub(super) fn apply_to_slot(
    rs: &mut SlotState,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
    assignment_index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::SlotActiveSet { active, .. } => {
            rs.slot.active = *active;
        }
        Event::BookingCreated { booking } => apply_booking(rs, booking, booking_index),
        Event::BookingCancelled { id, .. } => apply_cancel(rs, *id),
        Event::AttendanceRecorded { id, status, .. } => apply_attendance(rs, *id, *status),
        Event::BookingsMaterialized { bookings, .. } => {
            for b in bookings {
                apply_booking(rs, b, booking_index);
            }
        }
        Event::AssignmentRecorded { assignment } => {
            apply_assignment(rs, assignment, assignment_index);
        }
        _ => {}
    }
}

/// Extract the slot id from a single-slot event.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotActiveSet { id, .. } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.slot_id),
        Event::BookingCancelled { slot_id, .. }
        | Event::AttendanceRecorded { slot_id, .. }
        | Event::BookingsMaterialized { slot_id, .. } => Some(*slot_id),
        Event::AssignmentRecorded { assignment } => Some(assignment.slot_id),
        _ => None,
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub config: EngineConfig,
    pub(super) classes: DashMap<Ulid, ClassTemplate>,
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    /// Reverse lookup: booking id → slot id.
    pub(super) booking_slot: DashMap<Ulid, Ulid>,
    /// Reverse lookup: assignment id → slot id.
    pub(super) assignment_slot: DashMap<Ulid, Ulid>,
    /// Schedule-change ledger keyed by (student, plan_ref). The mutex also
    /// serializes quota check against commit in `register_change`.
    pub(super) changes: Mutex<HashMap<(Ulid, Ulid), Vec<ScheduleChangeRecord>>>,
    /// Held by class/slot admin mutations and, together with `changes` and
    /// every slot lock, by `compact_wal` — so no append can commit between
    /// the compaction snapshot and the WAL swap.
    pub(super) catalog_gate: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            classes: DashMap::new(),
            slots: DashMap::new(),
            booking_slot: DashMap::new(),
            assignment_slot: DashMap::new(),
            changes: Mutex::new(HashMap::new()),
            catalog_gate: Mutex::new(()),
            wal_tx,
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ClassCreated { class } => {
                self.classes.insert(class.id, class.clone());
            }
            Event::ClassUpdated {
                id,
                name,
                capacity,
                active,
            } => {
                if let Some(mut c) = self.classes.get_mut(id) {
                    c.name = name.clone();
                    c.capacity = *capacity;
                    c.active = *active;
                }
            }
            Event::SlotCreated { slot } => {
                self.slots
                    .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot.clone()))));
            }
            Event::PlanAssigned {
                assignments,
                bookings,
            } => {
                for a in assignments {
                    if let Some(entry) = self.slots.get(&a.slot_id) {
                        let rs = entry.value().clone();
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_assignment(&mut guard, a, &self.assignment_slot);
                    }
                }
                for b in bookings {
                    if let Some(entry) = self.slots.get(&b.slot_id) {
                        let rs = entry.value().clone();
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_booking(&mut guard, b, &self.booking_slot);
                    }
                }
            }
            Event::ScheduleChanged {
                record,
                retired_assignment,
                replacement,
                cancelled_bookings,
                bookings,
            } => {
                if let Some(entry) = self.slots.get(&record.old_slot_id) {
                    let rs = entry.value().clone();
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_retire(&mut guard, *retired_assignment);
                    for id in cancelled_bookings {
                        apply_cancel(&mut guard, *id);
                    }
                }
                if let Some(entry) = self.slots.get(&replacement.slot_id) {
                    let rs = entry.value().clone();
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_assignment(&mut guard, replacement, &self.assignment_slot);
                    for b in bookings {
                        apply_booking(&mut guard, b, &self.booking_slot);
                    }
                }
                self.record_change_in_memory(record.clone());
            }
            Event::ChangeRecorded { record } => {
                self.record_change_in_memory(record.clone());
            }
            other => {
                if let Some(slot_id) = event_slot_id(other)
                    && let Some(entry) = self.slots.get(&slot_id) {
                        let rs = entry.value().clone();
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_to_slot(&mut guard, other, &self.booking_slot, &self.assignment_slot);
                    }
            }
        }
    }

    fn record_change_in_memory(&self, record: ScheduleChangeRecord) {
        let mut changes = self
            .changes
            .try_lock()
            .expect("replay: uncontended change ledger");
        changes
            .entry((record.student_id, record.plan_ref))
            .or_default()
            .push(record);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn class_capacity(&self, class_id: &Ulid) -> Result<u32, EngineError> {
        self.classes
            .get(class_id)
            .map(|c| c.capacity)
            .ok_or(EngineError::NotFound(*class_id))
    }

    /// WAL-append + apply + notify in one call, for single-slot events.
    pub(super) async fn persist_and_apply(
        &self,
        slot_id: Ulid,
        rs: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(rs, event, &self.booking_slot, &self.assignment_slot);
        self.notify.send(slot_id, event);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: class and slot snapshots, then assignment and booking
    /// rows, then the change ledger.
    ///
    /// Every writer is excluded for the duration of snapshot + swap — catalog
    /// mutations via the gate, schedule changes via the ledger mutex, slot
    /// mutations via the slot read locks. An append committing after its slot
    /// was snapshotted would otherwise be erased by the rewrite and lost on
    /// the next restart.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.catalog_gate.lock().await;
        let changes = self.changes.lock().await;

        let mut slot_ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        slot_ids.sort();
        let mut guards = Vec::with_capacity(slot_ids.len());
        for id in &slot_ids {
            if let Some(rs) = self.get_slot(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for entry in self.classes.iter() {
            events.push(Event::ClassCreated {
                class: entry.value().clone(),
            });
        }
        for guard in &guards {
            events.push(Event::SlotCreated {
                slot: guard.slot.clone(),
            });
            for a in &guard.assignments {
                events.push(Event::AssignmentRecorded {
                    assignment: a.clone(),
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingCreated { booking: b.clone() });
            }
        }
        for records in changes.values() {
            for record in records {
                events.push(Event::ChangeRecorded {
                    record: record.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
