use chrono::{NaiveDate, NaiveTime, Weekday};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::capacity::range_conflict;
use super::{Engine, EngineError, validate_range};

impl Engine {
    pub async fn create_class(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if name.len() > self.config.max_name_len {
            return Err(EngineError::LimitExceeded("class name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("class capacity must be at least 1".into()));
        }
        if self.classes.contains_key(&id) {
            return Err(EngineError::Validation(format!("class {id} already exists")));
        }

        let _gate = self.catalog_gate.lock().await;
        let class = ClassTemplate {
            id,
            name,
            capacity,
            active: true,
        };
        let event = Event::ClassCreated {
            class: class.clone(),
        };
        self.wal_append(&event).await?;
        self.classes.insert(id, class);
        info!("created class {id}");
        Ok(())
    }

    pub async fn update_class(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        active: bool,
    ) -> Result<(), EngineError> {
        if name.len() > self.config.max_name_len {
            return Err(EngineError::LimitExceeded("class name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("class capacity must be at least 1".into()));
        }
        if !self.classes.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let _gate = self.catalog_gate.lock().await;
        let event = Event::ClassUpdated {
            id,
            name: name.clone(),
            capacity,
            active,
        };
        self.wal_append(&event).await?;
        if let Some(mut c) = self.classes.get_mut(&id) {
            c.name = name;
            c.capacity = capacity;
            c.active = active;
        }
        Ok(())
    }

    pub async fn create_slot(
        &self,
        id: Ulid,
        class_id: Ulid,
        weekday: Weekday,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<(), EngineError> {
        if !self.classes.contains_key(&class_id) {
            return Err(EngineError::NotFound(class_id));
        }
        if start_time >= end_time {
            return Err(EngineError::Validation(
                "slot start time must be before end time".into(),
            ));
        }
        if self.slots.contains_key(&id) {
            return Err(EngineError::Validation(format!("slot {id} already exists")));
        }

        let _gate = self.catalog_gate.lock().await;
        let slot = Slot {
            id,
            class_id,
            weekday,
            start_time,
            end_time,
            active: true,
        };
        let event = Event::SlotCreated { slot: slot.clone() };
        self.wal_append(&event).await?;
        self.slots
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(SlotState::new(slot))));
        info!("created slot {id} ({weekday} {start_time})");
        Ok(())
    }

    pub async fn set_slot_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let rs = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::SlotActiveSet { id, active };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub fn get_class(&self, id: &Ulid) -> Option<ClassTemplate> {
        self.classes.get(id).map(|c| c.value().clone())
    }

    pub async fn list_slots(&self) -> Vec<Slot> {
        let ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_slot(&id) {
                out.push(rs.read().await.slot.clone());
            }
        }
        out.sort_by_key(|s| (s.weekday.num_days_from_monday(), s.start_time, s.id));
        out
    }

    /// Active slots (of active classes) annotated with range availability for
    /// `[start, end]`. Slot eligibility does not vary by plan type; weekly and
    /// monthly plans pick from the same catalog.
    pub async fn list_available_slots(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AnnotatedSlot>, EngineError> {
        validate_range(start, end, self.config.max_range_days)?;
        let ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.get_slot(&id) else { continue };
            let guard = rs.read().await;
            if !guard.slot.active {
                continue;
            }
            let Some(class) = self.get_class(&guard.slot.class_id) else {
                continue;
            };
            if !class.active {
                continue;
            }
            let first_conflicting_date = range_conflict(&guard, class.capacity, start, end);
            out.push(AnnotatedSlot {
                slot: guard.slot.clone(),
                availability: RangeAvailability {
                    available: first_conflicting_date.is_none(),
                    first_conflicting_date,
                },
            });
        }
        out.sort_by_key(|a| {
            (
                a.slot.weekday.num_days_from_monday(),
                a.slot.start_time,
                a.slot.id,
            )
        });
        Ok(out)
    }
}
