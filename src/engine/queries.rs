use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::MAX_SEARCH_RESULTS;
use crate::model::*;

use super::conflict::ConflictEvaluator;
use super::proclamation::proclamation_sundays;
use super::store::ConfigStore;
use super::{Engine, EngineError};

fn by_slot(a: &Wedding, b: &Wedding) -> std::cmp::Ordering {
    a.slot
        .starts_at()
        .cmp(&b.slot.starts_at())
        .then_with(|| a.id.cmp(&b.id))
}

impl WeddingFilter {
    pub fn matches(&self, w: &Wedding) -> bool {
        if let Some(name) = &self.name {
            let needle = name.trim().to_uppercase();
            if !w.couple.bride_name.to_uppercase().contains(&needle)
                && !w.couple.groom_name.to_uppercase().contains(&needle)
            {
                return false;
            }
        }
        self.location_id.is_none_or(|id| w.slot.location_id == id)
            && self.celebrant_id.is_none_or(|id| w.slot.celebrant_id == id)
            && self.is_community.is_none_or(|c| w.slot.is_community == c)
            && self.status.is_none_or(|s| w.status == s)
            && self.date_from.is_none_or(|d| w.slot.wedding_date >= d)
            && self.date_to.is_none_or(|d| w.slot.wedding_date <= d)
    }
}

impl Engine {
    /// Advisory check of a candidate booking. Nothing is reserved; a later
    /// `schedule_wedding` evaluates again under the write lock.
    pub async fn evaluate(
        &self,
        candidate: &BookingInput,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        let schedule = self.schedule.read().await;
        ConflictEvaluator::new(&*schedule, &self.config)
            .evaluate(candidate, exclude)
            .await
    }

    pub async fn wedding(&self, id: Ulid) -> Result<Wedding, EngineError> {
        let schedule = self.schedule.read().await;
        schedule.get(&id).cloned().ok_or(EngineError::WeddingNotFound(id))
    }

    /// Ordered by date, then time.
    pub async fn search_weddings(&self, filter: &WeddingFilter) -> Vec<Wedding> {
        let schedule = self.schedule.read().await;
        let mut found: Vec<Wedding> = match (filter.date_from, filter.date_to) {
            (Some(from), Some(to)) => schedule
                .between(from, to)
                .filter(|w| filter.matches(w))
                .cloned()
                .collect(),
            _ => schedule.iter().filter(|w| filter.matches(w)).cloned().collect(),
        };
        found.sort_by(by_slot);
        found.truncate(MAX_SEARCH_RESULTS);
        found
    }

    pub async fn proclamations(&self, id: Ulid) -> Result<ProclamationDates, EngineError> {
        let wedding = self.wedding(id).await?;
        Ok(proclamation_sundays(wedding.slot.wedding_date))
    }

    /// Days of `month` that have at least one wedding, in order.
    pub async fn month_calendar(&self, month: MonthKey) -> Vec<CalendarDay> {
        let schedule = self.schedule.read().await;
        let mut days: BTreeMap<_, Vec<Wedding>> = BTreeMap::new();
        for w in schedule.between(month.first_day(), month.last_day()) {
            days.entry(w.slot.wedding_date).or_default().push(w.clone());
        }
        days.into_iter()
            .map(|(date, mut weddings)| {
                weddings.sort_by(by_slot);
                CalendarDay { date, weddings }
            })
            .collect()
    }

    pub async fn statistics(&self, month: MonthKey) -> ScheduleStatistics {
        let schedule = self.schedule.read().await;
        let total_scheduled = schedule.iter().filter(|w| w.is_scheduled()).count();
        let in_month: Vec<&Wedding> = schedule
            .between(month.first_day(), month.last_day())
            .filter(|w| w.is_scheduled())
            .collect();
        ScheduleStatistics {
            total_scheduled,
            month_scheduled: in_month.len(),
            month_community: in_month.iter().filter(|w| w.slot.is_community).count(),
            month_civil_effect: in_month.iter().filter(|w| w.with_civil_effect).count(),
        }
    }

    pub fn location(&self, id: LocationId) -> Result<Location, EngineError> {
        self.locations
            .get(&id)
            .map(|l| l.clone())
            .ok_or(EngineError::LocationNotFound(id))
    }

    pub fn celebrant(&self, id: CelebrantId) -> Result<Celebrant, EngineError> {
        self.celebrants
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::CelebrantNotFound(id))
    }

    /// Ordered by name.
    pub fn locations(&self, include_inactive: bool) -> Vec<Location> {
        let mut out: Vec<Location> = self
            .locations
            .iter()
            .filter(|l| include_inactive || l.is_active)
            .map(|l| l.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        out
    }

    /// Ordered by name.
    pub fn celebrants(&self, include_inactive: bool) -> Vec<Celebrant> {
        let mut out: Vec<Celebrant> = self
            .celebrants
            .iter()
            .filter(|c| include_inactive || c.is_active)
            .map(|c| c.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        out
    }

    pub fn config_entries(&self) -> Vec<ConfigEntry> {
        self.config.entries()
    }

    pub async fn capacity_config(&self) -> Result<CapacityConfig, EngineError> {
        self.config.capacity_config().await
    }
}
