use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Read access to persisted bookings, as consumed by conflict evaluation.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Every `SCHEDULED` booking on `date`.
    async fn find_scheduled_bookings(&self, date: NaiveDate) -> Result<Vec<Wedding>, EngineError>;
}

/// Read access to the capacity settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn capacity_config(&self) -> Result<CapacityConfig, EngineError>;
}

type LocationSlot = (NaiveDate, NaiveTime, LocationId);
type CelebrantSlot = (NaiveDate, NaiveTime, CelebrantId);

/// In-memory wedding table with a per-day index and a uniqueness index over
/// the slots held by individual `SCHEDULED` bookings.
#[derive(Debug, Default)]
pub struct Schedule {
    weddings: HashMap<Ulid, Wedding>,
    by_date: BTreeMap<NaiveDate, Vec<Ulid>>,
    location_slots: HashMap<LocationSlot, Ulid>,
    celebrant_slots: HashMap<CelebrantSlot, Ulid>,
}

/// Index keys claimed exclusively by `w`, if any.
fn exclusive_slots(w: &Wedding) -> Option<(LocationSlot, CelebrantSlot)> {
    if !w.is_scheduled() || w.slot.is_community {
        return None;
    }
    let s = &w.slot;
    let minute = truncate_to_minute(s.wedding_time);
    Some((
        (s.wedding_date, minute, s.location_id),
        (s.wedding_date, minute, s.celebrant_id),
    ))
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.weddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weddings.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Wedding> {
        self.weddings.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Wedding> {
        self.weddings.values()
    }

    /// Weddings whose date falls in `[from, to]`, in date order.
    pub fn between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Wedding> {
        let range = if from <= to { from..=to } else { to..=to };
        self.by_date
            .range(range)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.weddings.get(id))
    }

    pub fn on(&self, date: NaiveDate) -> impl Iterator<Item = &Wedding> {
        self.between(date, date)
    }

    /// Fails if `wedding` would share an exclusive slot with another
    /// individual booking.
    pub fn check_exclusive(&self, wedding: &Wedding) -> Result<(), EngineError> {
        if let Some((loc, cel)) = exclusive_slots(wedding) {
            for holder in [self.location_slots.get(&loc), self.celebrant_slots.get(&cel)]
                .into_iter()
                .flatten()
            {
                if *holder != wedding.id {
                    return Err(EngineError::SlotTaken(*holder));
                }
            }
        }
        Ok(())
    }

    /// Insert or replace a wedding. Fails without mutating anything if the
    /// new record would share an exclusive slot with another booking.
    pub fn upsert(&mut self, wedding: Wedding) -> Result<Option<Wedding>, EngineError> {
        self.check_exclusive(&wedding)?;
        let previous = self.remove(&wedding.id);
        if let Some((loc, cel)) = exclusive_slots(&wedding) {
            self.location_slots.insert(loc, wedding.id);
            self.celebrant_slots.insert(cel, wedding.id);
        }
        self.by_date
            .entry(wedding.slot.wedding_date)
            .or_default()
            .push(wedding.id);
        self.weddings.insert(wedding.id, wedding);
        Ok(previous)
    }

    pub fn set_status(&mut self, id: &Ulid, status: WeddingStatus) -> Result<Wedding, EngineError> {
        let mut updated = self
            .weddings
            .get(id)
            .cloned()
            .ok_or(EngineError::WeddingNotFound(*id))?;
        updated.status = status;
        self.upsert(updated.clone())?;
        Ok(updated)
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Wedding> {
        let wedding = self.weddings.remove(id)?;
        if let Some((loc, cel)) = exclusive_slots(&wedding) {
            self.location_slots.remove(&loc);
            self.celebrant_slots.remove(&cel);
        }
        let date = wedding.slot.wedding_date;
        if let Some(ids) = self.by_date.get_mut(&date) {
            ids.retain(|w| w != id);
            if ids.is_empty() {
                self.by_date.remove(&date);
            }
        }
        Some(wedding)
    }
}

#[async_trait]
impl BookingStore for Schedule {
    async fn find_scheduled_bookings(&self, date: NaiveDate) -> Result<Vec<Wedding>, EngineError> {
        Ok(self.on(date).filter(|w| w.is_scheduled()).cloned().collect())
    }
}

/// Key-value settings (`system_config`). Unset keys fall back to their
/// defaults.
#[derive(Debug, Default)]
pub struct ConfigTable {
    values: DashMap<String, String>,
}

impl ConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone()).or_else(|| {
            CONFIG_DEFAULTS
                .iter()
                .find(|(k, _, _)| *k == key)
                .map(|(_, _, default)| default.to_string())
        })
    }

    pub fn set(&self, key: String, value: String) {
        self.values.insert(key, value);
    }

    /// Read an integer setting; a stored value that does not parse is an
    /// error, never a silent default.
    pub fn get_u32(&self, key: &str) -> Result<u32, EngineError> {
        let raw = self
            .get(key)
            .ok_or_else(|| EngineError::ConfigUnavailable(format!("{key} is not set")))?;
        raw.trim()
            .parse()
            .map_err(|_| EngineError::ConfigUnavailable(format!("{key} has non-integer value {raw:?}")))
    }

    /// Stored entries plus defaults for unset known keys, ordered by key.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut merged: BTreeMap<String, String> = CONFIG_DEFAULTS
            .iter()
            .map(|(k, _, v)| (k.to_string(), v.to_string()))
            .collect();
        for e in self.values.iter() {
            merged.insert(e.key().clone(), e.value().clone());
        }
        merged
            .into_iter()
            .map(|(key, value)| {
                let kind = ConfigType::of_key(&key);
                ConfigEntry { key, value, kind }
            })
            .collect()
    }

    /// Only explicitly stored values, for WAL snapshots.
    pub fn stored(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }
}

#[async_trait]
impl ConfigStore for ConfigTable {
    async fn capacity_config(&self) -> Result<CapacityConfig, EngineError> {
        Ok(CapacityConfig {
            max_weddings_per_day: self.get_u32(MAX_WEDDINGS_PER_DAY_KEY)?,
            max_community_weddings: self.get_u32(MAX_COMMUNITY_WEDDINGS_KEY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn wedding(day: u32, hour: u32, location: LocationId, celebrant: CelebrantId, community: bool) -> Wedding {
        let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
        Wedding {
            id: Ulid::new(),
            slot: BookingInput::new(date(day), time, location, celebrant, community),
            status: WeddingStatus::Scheduled,
            scheduled_on: date(1),
            interview_at: None,
            couple: CoupleDetails {
                bride_name: "ANA".into(),
                bride_whatsapp: "11987654321".into(),
                groom_name: "RUI".into(),
                groom_whatsapp: "11987654322".into(),
            },
            with_civil_effect: false,
            transfer_type: TransferType::None,
            observations: None,
        }
    }

    #[test]
    fn by_date_index_tracks_moves() {
        let mut s = Schedule::new();
        let mut w = wedding(14, 10, 1, 1, false);
        s.upsert(w.clone()).unwrap();
        assert_eq!(s.on(date(14)).count(), 1);

        w.slot.wedding_date = date(21);
        let previous = s.upsert(w.clone()).unwrap();
        assert_eq!(previous.unwrap().slot.wedding_date, date(14));
        assert_eq!(s.on(date(14)).count(), 0);
        assert_eq!(s.on(date(21)).count(), 1);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn uniqueness_backstop_rejects_second_individual() {
        let mut s = Schedule::new();
        let first = wedding(14, 15, 3, 1, false);
        s.upsert(first.clone()).unwrap();

        let same_location = wedding(14, 15, 3, 9, false);
        assert!(matches!(s.upsert(same_location), Err(EngineError::SlotTaken(id)) if id == first.id));

        let same_celebrant = wedding(14, 15, 8, 1, false);
        assert!(matches!(s.upsert(same_celebrant), Err(EngineError::SlotTaken(_))));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn slot_index_ignores_seconds() {
        let mut s = Schedule::new();
        let first = wedding(14, 15, 3, 1, false);
        s.upsert(first.clone()).unwrap();

        let mut late = wedding(14, 15, 3, 9, false);
        late.slot.wedding_time = NaiveTime::from_hms_opt(15, 0, 30).unwrap();
        assert!(matches!(s.upsert(late), Err(EngineError::SlotTaken(id)) if id == first.id));

        let mut late_celebrant = wedding(14, 15, 8, 1, false);
        late_celebrant.slot.wedding_time = NaiveTime::from_hms_opt(15, 0, 59).unwrap();
        assert!(matches!(s.upsert(late_celebrant), Err(EngineError::SlotTaken(_))));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn community_bookings_share_slots() {
        let mut s = Schedule::new();
        s.upsert(wedding(14, 10, 1, 2, true)).unwrap();
        s.upsert(wedding(14, 10, 1, 2, true)).unwrap();
        assert_eq!(s.on(date(14)).count(), 2);
    }

    #[test]
    fn cancelling_frees_the_slot() {
        let mut s = Schedule::new();
        let first = wedding(14, 15, 3, 1, false);
        s.upsert(first.clone()).unwrap();
        s.set_status(&first.id, WeddingStatus::Cancelled).unwrap();
        s.upsert(wedding(14, 15, 3, 1, false)).unwrap();

        // Re-scheduling the cancelled one now collides.
        assert!(matches!(
            s.set_status(&first.id, WeddingStatus::Scheduled),
            Err(EngineError::SlotTaken(_))
        ));
        assert_eq!(s.get(&first.id).unwrap().status, WeddingStatus::Cancelled);
    }

    #[test]
    fn remove_clears_indexes() {
        let mut s = Schedule::new();
        let w = wedding(14, 15, 3, 1, false);
        s.upsert(w.clone()).unwrap();
        assert!(s.remove(&w.id).is_some());
        assert!(s.remove(&w.id).is_none());
        assert!(s.is_empty());
        s.upsert(wedding(14, 15, 3, 1, false)).unwrap();
    }

    #[tokio::test]
    async fn store_query_returns_only_scheduled() {
        let mut s = Schedule::new();
        let held = wedding(14, 9, 1, 1, false);
        s.upsert(held.clone()).unwrap();
        s.set_status(&held.id, WeddingStatus::Held).unwrap();
        s.upsert(wedding(14, 11, 1, 1, false)).unwrap();
        s.upsert(wedding(15, 11, 1, 1, false)).unwrap();

        let found = s.find_scheduled_bookings(date(14)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].slot.wedding_time, NaiveTime::from_hms_opt(11, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn config_defaults_and_overrides() {
        let cfg = ConfigTable::new();
        assert_eq!(cfg.capacity_config().await.unwrap(), CapacityConfig::default());

        cfg.set(MAX_WEDDINGS_PER_DAY_KEY.into(), "6".into());
        let cap = cfg.capacity_config().await.unwrap();
        assert_eq!(cap.max_weddings_per_day, 6);
        assert_eq!(cap.max_community_weddings, 3);
    }

    #[tokio::test]
    async fn unparsable_config_is_unavailable() {
        let cfg = ConfigTable::new();
        cfg.set(MAX_COMMUNITY_WEDDINGS_KEY.into(), "lots".into());
        assert!(matches!(
            cfg.capacity_config().await,
            Err(EngineError::ConfigUnavailable(_))
        ));
    }

    #[test]
    fn entries_merge_defaults() {
        let cfg = ConfigTable::new();
        cfg.set(SITE_NAME_KEY.into(), "Paróquia".into());
        cfg.set("custom_flag".into(), "on".into());
        let entries = cfg.entries();
        assert_eq!(entries.len(), CONFIG_DEFAULTS.len() + 1);
        let site = entries.iter().find(|e| e.key == SITE_NAME_KEY).unwrap();
        assert_eq!(site.value, "Paróquia");
        let max = entries.iter().find(|e| e.key == MAX_WEDDINGS_PER_DAY_KEY).unwrap();
        assert_eq!((max.value.as_str(), max.kind), ("4", ConfigType::Int));
        assert_eq!(cfg.stored().len(), 2);
    }
}
