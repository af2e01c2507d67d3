use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::validation::{format_phone, validate_celebrant, validate_location, validate_wedding};

use super::conflict::ConflictEvaluator;
use super::store::Schedule;
use super::{Engine, EngineError};

fn record_conflicts(conflicts: &[ConflictRecord]) {
    for c in conflicts {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => c.kind.code()).increment(1);
    }
}

/// Names are kept upper-case and phones in display form.
fn normalize_couple(couple: &mut CoupleDetails) {
    couple.bride_name = couple.bride_name.trim().to_uppercase();
    couple.groom_name = couple.groom_name.trim().to_uppercase();
    couple.bride_whatsapp = format_phone(&couple.bride_whatsapp);
    couple.groom_whatsapp = format_phone(&couple.groom_whatsapp);
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Engine {
    /// Bookings may only reference active locations and celebrants.
    fn check_references(&self, slot: &BookingInput) -> Result<(), EngineError> {
        let location = self
            .locations
            .get(&slot.location_id)
            .ok_or(EngineError::LocationNotFound(slot.location_id))?;
        if !location.is_active {
            return Err(EngineError::invalid("location", format!("{} is inactive", location.name)));
        }
        let celebrant = self
            .celebrants
            .get(&slot.celebrant_id)
            .ok_or(EngineError::CelebrantNotFound(slot.celebrant_id))?;
        if !celebrant.is_active {
            return Err(EngineError::invalid("celebrant", format!("{} is inactive", celebrant.name)));
        }
        Ok(())
    }

    /// Evaluate against the locked schedule; any conflict aborts.
    async fn ensure_bookable(
        &self,
        schedule: &Schedule,
        slot: &BookingInput,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let conflicts = ConflictEvaluator::new(schedule, &self.config)
            .evaluate(slot, exclude)
            .await?;
        if conflicts.is_empty() {
            Ok(())
        } else {
            record_conflicts(&conflicts);
            let codes: Vec<&str> = conflicts.iter().map(|c| c.kind.code()).collect();
            tracing::debug!(date = %slot.wedding_date, ?codes, "booking rejected");
            Err(EngineError::Conflicts(conflicts))
        }
    }

    /// Validate, evaluate and commit a new booking under one write lock, so
    /// two clients cannot both claim the same slot.
    pub async fn schedule_wedding(&self, mut draft: WeddingDraft, today: NaiveDate) -> Result<Wedding, EngineError> {
        validate_wedding(&draft, today)?;
        normalize_couple(&mut draft.couple);
        self.check_references(&draft.slot)?;

        let mut schedule = self.schedule.write().await;
        self.ensure_bookable(&schedule, &draft.slot, None).await?;

        let wedding = Wedding::from_draft(Ulid::new(), draft, today);
        schedule.check_exclusive(&wedding)?;
        let event = Event::WeddingScheduled { wedding: wedding.clone() };
        self.persist_and_apply(&mut schedule, &event).await?;

        metrics::counter!(crate::observability::WEDDINGS_SCHEDULED_TOTAL).increment(1);
        tracing::info!(
            id = %wedding.id,
            date = %wedding.slot.wedding_date,
            community = wedding.slot.is_community,
            "wedding scheduled"
        );
        Ok(wedding)
    }

    /// Replace a booking's details. The slot is re-evaluated (excluding the
    /// booking itself) when it moves, when the community flag flips, or when
    /// the booking returns to `SCHEDULED`.
    pub async fn update_wedding(
        &self,
        id: Ulid,
        mut draft: WeddingDraft,
        status: Option<WeddingStatus>,
        today: NaiveDate,
    ) -> Result<Wedding, EngineError> {
        let mut schedule = self.schedule.write().await;
        let existing = schedule.get(&id).cloned().ok_or(EngineError::WeddingNotFound(id))?;

        // Dates that are already in the past and left unchanged stay editable.
        let mut floor = today.min(existing.slot.wedding_date);
        if let Some(at) = existing.interview_at {
            floor = floor.min(at.date());
        }
        validate_wedding(&draft, floor)?;
        normalize_couple(&mut draft.couple);
        if draft.slot.wedding_date != existing.slot.wedding_date && draft.slot.wedding_date < today {
            return Err(EngineError::invalid("wedding_date", "wedding date must be in the future"));
        }

        let status = status.unwrap_or(existing.status);
        let slot_changed = draft.slot != existing.slot;
        if slot_changed {
            self.check_references(&draft.slot)?;
        }
        let reentering = status == WeddingStatus::Scheduled && !existing.is_scheduled();
        if status == WeddingStatus::Scheduled && (slot_changed || reentering) {
            self.ensure_bookable(&schedule, &draft.slot, Some(id)).await?;
        }

        let mut wedding = Wedding::from_draft(id, draft, existing.scheduled_on);
        wedding.status = status;
        if wedding == existing {
            return Ok(wedding);
        }
        schedule.check_exclusive(&wedding)?;
        let event = Event::WeddingUpdated { wedding: wedding.clone() };
        self.persist_and_apply(&mut schedule, &event).await?;
        tracing::info!(id = %id, status = %status, "wedding updated");
        Ok(wedding)
    }

    /// Move a booking through its lifecycle. Returning to `SCHEDULED`
    /// re-claims the slot and is evaluated like a new booking.
    pub async fn set_wedding_status(&self, id: Ulid, status: WeddingStatus) -> Result<Wedding, EngineError> {
        let mut schedule = self.schedule.write().await;
        let existing = schedule.get(&id).cloned().ok_or(EngineError::WeddingNotFound(id))?;
        if existing.status == status {
            return Ok(existing);
        }
        if status == WeddingStatus::Scheduled {
            self.check_references(&existing.slot)?;
            self.ensure_bookable(&schedule, &existing.slot, Some(id)).await?;
        }
        let mut wedding = existing;
        wedding.status = status;
        schedule.check_exclusive(&wedding)?;

        let event = Event::WeddingStatusChanged { id, status };
        self.persist_and_apply(&mut schedule, &event).await?;
        tracing::info!(id = %id, status = %status, "wedding status changed");
        Ok(wedding)
    }

    pub async fn delete_wedding(&self, id: Ulid) -> Result<Wedding, EngineError> {
        let mut schedule = self.schedule.write().await;
        let existing = schedule.get(&id).cloned().ok_or(EngineError::WeddingNotFound(id))?;
        let event = Event::WeddingDeleted { id };
        self.persist_and_apply(&mut schedule, &event).await?;
        tracing::info!(id = %id, "wedding deleted");
        Ok(existing)
    }

    // ── Locations ────────────────────────────────────────────────

    pub async fn add_location(
        &self,
        name: String,
        address: Option<String>,
        capacity: Option<u32>,
    ) -> Result<Location, EngineError> {
        validate_location(&name, address.as_deref())?;
        let _admin = self.admin_lock.lock().await;
        if self.locations.len() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        self.ensure_unique_location(&name, None)?;
        let id = self.locations.iter().map(|e| *e.key()).max().unwrap_or(0) + 1;
        let location = Location {
            id,
            name: name.trim().to_string(),
            address: clean(address),
            capacity,
            is_active: true,
        };
        self.persist_admin(&Event::LocationSaved { location: location.clone() }).await?;
        Ok(location)
    }

    pub async fn update_location(
        &self,
        id: LocationId,
        name: String,
        address: Option<String>,
        capacity: Option<u32>,
    ) -> Result<Location, EngineError> {
        validate_location(&name, address.as_deref())?;
        let _admin = self.admin_lock.lock().await;
        let mut location = self
            .locations
            .get(&id)
            .map(|l| l.clone())
            .ok_or(EngineError::LocationNotFound(id))?;
        self.ensure_unique_location(&name, Some(id))?;
        location.name = name.trim().to_string();
        location.address = clean(address);
        location.capacity = capacity;
        self.persist_admin(&Event::LocationSaved { location: location.clone() }).await?;
        Ok(location)
    }

    /// Deactivated locations keep their bookings but accept no new ones.
    pub async fn set_location_active(&self, id: LocationId, active: bool) -> Result<Location, EngineError> {
        let _admin = self.admin_lock.lock().await;
        let mut location = self
            .locations
            .get(&id)
            .map(|l| l.clone())
            .ok_or(EngineError::LocationNotFound(id))?;
        if location.is_active != active {
            location.is_active = active;
            self.persist_admin(&Event::LocationSaved { location: location.clone() }).await?;
        }
        Ok(location)
    }

    fn ensure_unique_location(&self, name: &str, except: Option<LocationId>) -> Result<(), EngineError> {
        let taken = self
            .locations
            .iter()
            .any(|l| Some(l.id) != except && same_name(&l.name, name));
        if taken {
            return Err(EngineError::AlreadyExists(format!("location {}", name.trim())));
        }
        Ok(())
    }

    // ── Celebrants ───────────────────────────────────────────────

    pub async fn add_celebrant(
        &self,
        name: String,
        title: String,
        phone: Option<String>,
    ) -> Result<Celebrant, EngineError> {
        validate_celebrant(&name, &title)?;
        let _admin = self.admin_lock.lock().await;
        if self.celebrants.len() >= MAX_CELEBRANTS {
            return Err(EngineError::LimitExceeded("too many celebrants"));
        }
        self.ensure_unique_celebrant(&name, None)?;
        let id = self.celebrants.iter().map(|e| *e.key()).max().unwrap_or(0) + 1;
        let celebrant = Celebrant {
            id,
            name: name.trim().to_string(),
            title: title.trim().to_string(),
            phone: clean(phone),
            is_active: true,
        };
        self.persist_admin(&Event::CelebrantSaved { celebrant: celebrant.clone() }).await?;
        Ok(celebrant)
    }

    pub async fn update_celebrant(
        &self,
        id: CelebrantId,
        name: String,
        title: String,
        phone: Option<String>,
    ) -> Result<Celebrant, EngineError> {
        validate_celebrant(&name, &title)?;
        let _admin = self.admin_lock.lock().await;
        let mut celebrant = self
            .celebrants
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::CelebrantNotFound(id))?;
        self.ensure_unique_celebrant(&name, Some(id))?;
        celebrant.name = name.trim().to_string();
        celebrant.title = title.trim().to_string();
        celebrant.phone = clean(phone);
        self.persist_admin(&Event::CelebrantSaved { celebrant: celebrant.clone() }).await?;
        Ok(celebrant)
    }

    pub async fn set_celebrant_active(&self, id: CelebrantId, active: bool) -> Result<Celebrant, EngineError> {
        let _admin = self.admin_lock.lock().await;
        let mut celebrant = self
            .celebrants
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::CelebrantNotFound(id))?;
        if celebrant.is_active != active {
            celebrant.is_active = active;
            self.persist_admin(&Event::CelebrantSaved { celebrant: celebrant.clone() }).await?;
        }
        Ok(celebrant)
    }

    fn ensure_unique_celebrant(&self, name: &str, except: Option<CelebrantId>) -> Result<(), EngineError> {
        let taken = self
            .celebrants
            .iter()
            .any(|c| Some(c.id) != except && same_name(&c.name, name));
        if taken {
            return Err(EngineError::AlreadyExists(format!("celebrant {}", name.trim())));
        }
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────

    /// Store a setting. Known integer keys must hold a non-negative integer;
    /// reminder offsets are bounded.
    pub async fn set_config(&self, key: String, value: String) -> Result<ConfigEntry, EngineError> {
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(EngineError::invalid("key", "config key is required"));
        }
        if key.len() > MAX_CONFIG_KEY_LEN {
            return Err(EngineError::LimitExceeded("config key too long"));
        }
        if value.len() > MAX_CONFIG_VALUE_LEN {
            return Err(EngineError::LimitExceeded("config value too long"));
        }
        let kind = ConfigType::of_key(&key);
        let value = match kind {
            ConfigType::Int => {
                let n: u32 = value
                    .trim()
                    .parse()
                    .map_err(|_| EngineError::invalid("value", format!("{key} must be a non-negative integer")))?;
                let is_offset = [
                    REMINDER_INTERVIEW_2D_KEY,
                    REMINDER_INTERVIEW_1D_KEY,
                    REMINDER_INTERVIEW_12H_KEY,
                ]
                .contains(&key.as_str());
                if is_offset && n > MAX_REMINDER_OFFSET_HOURS {
                    return Err(EngineError::invalid(
                        "value",
                        format!("{key} must be at most {MAX_REMINDER_OFFSET_HOURS} hours"),
                    ));
                }
                n.to_string()
            }
            ConfigType::Text => value,
        };

        let _admin = self.admin_lock.lock().await;
        let event = Event::ConfigSet { key: key.clone(), value: value.clone() };
        self.persist_admin(&event).await?;
        tracing::info!(key = %key, value = %value, "config updated");
        Ok(ConfigEntry { key, value, kind })
    }
}
