use ulid::Ulid;

use crate::model::*;

use super::store::{BookingStore, ConfigStore};
use super::EngineError;

/// Checks a candidate booking against the persisted schedule and the
/// capacity settings. Holds no state of its own; each call reads fresh data
/// from the injected stores.
pub struct ConflictEvaluator<'a, B: ?Sized, C: ?Sized> {
    bookings: &'a B,
    config: &'a C,
}

impl<'a, B, C> ConflictEvaluator<'a, B, C>
where
    B: BookingStore + ?Sized,
    C: ConfigStore + ?Sized,
{
    pub fn new(bookings: &'a B, config: &'a C) -> Self {
        Self { bookings, config }
    }

    /// Every rule the candidate would violate, in check order: daily limit,
    /// community limit, location, celebrant. Empty means the booking is
    /// allowed. `exclude` removes the booking being edited from every count.
    ///
    /// A failed store read aborts with an error; it never yields an empty
    /// list.
    pub async fn evaluate(
        &self,
        candidate: &BookingInput,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        candidate.check_ids()?;
        let candidate = BookingInput::new(
            candidate.wedding_date,
            candidate.wedding_time,
            candidate.location_id,
            candidate.celebrant_id,
            candidate.is_community,
        );

        let capacity = self.config.capacity_config().await?;
        let existing: Vec<Wedding> = self
            .bookings
            .find_scheduled_bookings(candidate.wedding_date)
            .await?
            .into_iter()
            .filter(|w| w.is_scheduled() && Some(w.id) != exclude)
            .collect();

        let mut conflicts = Vec::new();

        let total = existing.len();
        if total >= capacity.max_weddings_per_day as usize {
            conflicts.push(ConflictRecord {
                kind: ConflictKind::DailyLimit,
                message: format!(
                    "{} already has {total} weddings scheduled (limit {})",
                    candidate.wedding_date, capacity.max_weddings_per_day
                ),
                conflicting_wedding: None,
            });
        }

        if candidate.is_community {
            let community = existing.iter().filter(|w| w.slot.is_community).count();
            if community >= capacity.max_community_weddings as usize {
                conflicts.push(ConflictRecord {
                    kind: ConflictKind::CommunityLimit,
                    message: format!(
                        "{} already has {community} community weddings scheduled (limit {})",
                        candidate.wedding_date, capacity.max_community_weddings
                    ),
                    conflicting_wedding: None,
                });
            }
        }

        let clashes = |w: &&Wedding| {
            truncate_to_minute(w.slot.wedding_time) == candidate.wedding_time
                && !(candidate.is_community && w.slot.is_community)
        };

        if let Some(w) = existing
            .iter()
            .filter(clashes)
            .find(|w| w.slot.location_id == candidate.location_id)
        {
            conflicts.push(ConflictRecord {
                kind: ConflictKind::LocationConflict,
                message: format!(
                    "location {} is taken at {} {} by {}",
                    candidate.location_id,
                    candidate.wedding_date,
                    candidate.wedding_time.format("%H:%M"),
                    w.couple_label()
                ),
                conflicting_wedding: Some(w.id),
            });
        }

        if let Some(w) = existing
            .iter()
            .filter(clashes)
            .find(|w| w.slot.celebrant_id == candidate.celebrant_id)
        {
            conflicts.push(ConflictRecord {
                kind: ConflictKind::CelebrantConflict,
                message: format!(
                    "celebrant {} already officiates {} at {} {}",
                    candidate.celebrant_id,
                    w.couple_label(),
                    candidate.wedding_date,
                    candidate.wedding_time.format("%H:%M")
                ),
                conflicting_wedding: Some(w.id),
            });
        }

        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    #[derive(Default)]
    struct Fixture {
        weddings: Mutex<Vec<Wedding>>,
        capacity: Mutex<CapacityConfig>,
        fail_bookings: AtomicBool,
        fail_config: AtomicBool,
    }

    #[async_trait]
    impl BookingStore for Fixture {
        async fn find_scheduled_bookings(&self, date: NaiveDate) -> Result<Vec<Wedding>, EngineError> {
            if self.fail_bookings.load(Ordering::SeqCst) {
                return Err(EngineError::StoreQueryFailed("connection reset".into()));
            }
            Ok(self
                .weddings
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w.slot.wedding_date == date && w.is_scheduled())
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl ConfigStore for Fixture {
        async fn capacity_config(&self) -> Result<CapacityConfig, EngineError> {
            if self.fail_config.load(Ordering::SeqCst) {
                return Err(EngineError::ConfigUnavailable("system_config unreachable".into()));
            }
            Ok(*self.capacity.lock().unwrap())
        }
    }

    impl Fixture {
        fn with(weddings: Vec<Wedding>) -> Self {
            let f = Fixture::default();
            *f.weddings.lock().unwrap() = weddings;
            f
        }

        async fn evaluate(&self, candidate: BookingInput, exclude: Option<Ulid>) -> Vec<ConflictKind> {
            ConflictEvaluator::new(self, self)
                .evaluate(&candidate, exclude)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.kind)
                .collect()
        }
    }

    fn slot(day: u32, hour: u32, minute: u32, location: LocationId, celebrant: CelebrantId, community: bool) -> BookingInput {
        BookingInput::new(
            NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
            NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
            location,
            celebrant,
            community,
        )
    }

    fn booked(slot: BookingInput) -> Wedding {
        Wedding {
            id: Ulid::new(),
            slot,
            status: WeddingStatus::Scheduled,
            scheduled_on: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            interview_at: None,
            couple: CoupleDetails {
                bride_name: "LUCIA".into(),
                bride_whatsapp: "11987654321".into(),
                groom_name: "MARCOS".into(),
                groom_whatsapp: "11987654322".into(),
            },
            with_civil_effect: false,
            transfer_type: TransferType::None,
            observations: None,
        }
    }

    #[tokio::test]
    async fn daily_limit_reached() {
        let existing = (0..4).map(|i| booked(slot(14, 8 + i, 0, 10 + i as i64, 20 + i as i64, false))).collect();
        let f = Fixture::with(existing);
        let kinds = f.evaluate(slot(14, 16, 0, 99, 99, false), None).await;
        assert_eq!(kinds, vec![ConflictKind::DailyLimit]);
    }

    #[tokio::test]
    async fn below_daily_limit_is_clear() {
        let existing = (0..3).map(|i| booked(slot(14, 8 + i, 0, 10 + i as i64, 20 + i as i64, false))).collect();
        let f = Fixture::with(existing);
        assert!(f.evaluate(slot(14, 16, 0, 99, 99, false), None).await.is_empty());
    }

    #[tokio::test]
    async fn location_conflict_for_individuals() {
        let f = Fixture::with(vec![booked(slot(14, 15, 0, 3, 1, false))]);
        let kinds = f.evaluate(slot(14, 15, 0, 3, 7, false), None).await;
        assert_eq!(kinds, vec![ConflictKind::LocationConflict]);
    }

    #[tokio::test]
    async fn community_bookings_coexist() {
        let f = Fixture::with(vec![booked(slot(14, 10, 0, 1, 2, true))]);
        assert!(f.evaluate(slot(14, 10, 0, 1, 2, true), None).await.is_empty());
    }

    #[tokio::test]
    async fn individual_against_community_celebrant() {
        let f = Fixture::with(vec![booked(slot(14, 10, 0, 1, 2, true))]);
        let kinds = f.evaluate(slot(14, 10, 0, 5, 2, false), None).await;
        assert_eq!(kinds, vec![ConflictKind::CelebrantConflict]);
    }

    #[tokio::test]
    async fn community_against_individual_conflicts_both_ways() {
        let f = Fixture::with(vec![booked(slot(14, 10, 0, 1, 2, false))]);
        let kinds = f.evaluate(slot(14, 10, 0, 1, 2, true), None).await;
        assert_eq!(
            kinds,
            vec![ConflictKind::LocationConflict, ConflictKind::CelebrantConflict]
        );
    }

    #[tokio::test]
    async fn edit_excludes_itself() {
        let x = booked(slot(14, 15, 0, 3, 1, false));
        let id = x.id;
        let f = Fixture::with(vec![x]);
        assert!(f.evaluate(slot(14, 15, 0, 3, 1, false), Some(id)).await.is_empty());
        // Without the exclusion the booking collides with itself.
        let kinds = f.evaluate(slot(14, 15, 0, 3, 1, false), None).await;
        assert_eq!(
            kinds,
            vec![ConflictKind::LocationConflict, ConflictKind::CelebrantConflict]
        );
    }

    #[tokio::test]
    async fn seconds_are_ignored() {
        let f = Fixture::with(vec![booked(slot(14, 15, 0, 3, 1, false))]);
        let candidate = BookingInput {
            wedding_time: NaiveTime::from_hms_opt(15, 0, 30).unwrap(),
            ..slot(14, 15, 0, 3, 8, false)
        };
        assert_eq!(f.evaluate(candidate, None).await, vec![ConflictKind::LocationConflict]);
    }

    #[tokio::test]
    async fn different_minute_or_day_is_clear() {
        let f = Fixture::with(vec![booked(slot(14, 15, 0, 3, 1, false))]);
        assert!(f.evaluate(slot(14, 15, 1, 3, 1, false), None).await.is_empty());
        assert!(f.evaluate(slot(15, 15, 0, 3, 1, false), None).await.is_empty());
    }

    #[tokio::test]
    async fn non_scheduled_bookings_do_not_count() {
        let mut held = booked(slot(14, 15, 0, 3, 1, false));
        held.status = WeddingStatus::Held;
        let mut cancelled = booked(slot(14, 15, 0, 3, 1, false));
        cancelled.status = WeddingStatus::Cancelled;
        let f = Fixture::with(vec![held, cancelled]);
        assert!(f.evaluate(slot(14, 15, 0, 3, 1, false), None).await.is_empty());
    }

    #[tokio::test]
    async fn community_limit_only_for_community_candidates() {
        let existing = (0..3).map(|i| booked(slot(14, 10, 0, 1, 2 + i, true))).collect();
        let f = Fixture::with(existing);
        assert_eq!(
            f.evaluate(slot(14, 10, 0, 1, 9, true), None).await,
            vec![ConflictKind::CommunityLimit]
        );
        assert!(f.evaluate(slot(14, 18, 0, 4, 9, false), None).await.is_empty());
    }

    #[tokio::test]
    async fn every_violation_is_reported() {
        let mut existing: Vec<Wedding> = (0..3).map(|_| booked(slot(14, 10, 0, 1, 2, true))).collect();
        existing.push(booked(slot(14, 15, 0, 5, 6, false)));
        let f = Fixture::with(existing);
        *f.capacity.lock().unwrap() = CapacityConfig {
            max_weddings_per_day: 4,
            max_community_weddings: 3,
        };
        let kinds = f.evaluate(slot(14, 15, 0, 5, 6, true), None).await;
        assert_eq!(
            kinds,
            vec![
                ConflictKind::DailyLimit,
                ConflictKind::CommunityLimit,
                ConflictKind::LocationConflict,
                ConflictKind::CelebrantConflict,
            ]
        );
    }

    #[tokio::test]
    async fn conflict_names_the_other_couple() {
        let other = booked(slot(14, 15, 0, 3, 1, false));
        let other_id = other.id;
        let f = Fixture::with(vec![other]);
        let conflicts = ConflictEvaluator::new(&f, &f)
            .evaluate(&slot(14, 15, 0, 3, 9, false), None)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicting_wedding, Some(other_id));
        assert!(conflicts[0].message.contains("LUCIA & MARCOS"));
    }

    #[tokio::test]
    async fn store_failure_is_an_error_not_empty() {
        let f = Fixture::with(vec![]);
        f.fail_bookings.store(true, Ordering::SeqCst);
        let result = ConflictEvaluator::new(&f, &f)
            .evaluate(&slot(14, 15, 0, 3, 1, false), None)
            .await;
        assert!(matches!(result, Err(EngineError::StoreQueryFailed(_))));
    }

    #[tokio::test]
    async fn config_failure_is_an_error() {
        let f = Fixture::with(vec![]);
        f.fail_config.store(true, Ordering::SeqCst);
        let result = ConflictEvaluator::new(&f, &f)
            .evaluate(&slot(14, 15, 0, 3, 1, false), None)
            .await;
        assert!(matches!(result, Err(EngineError::ConfigUnavailable(_))));
    }

    #[tokio::test]
    async fn invalid_ids_rejected() {
        let f = Fixture::with(vec![]);
        let result = ConflictEvaluator::new(&f, &f)
            .evaluate(&slot(14, 15, 0, 0, 1, false), None)
            .await;
        assert!(matches!(result, Err(EngineError::InvalidInput(ref e)) if e[0].field == "location"));
    }

    #[tokio::test]
    async fn evaluation_is_read_only() {
        let f = Fixture::with(vec![booked(slot(14, 15, 0, 3, 1, false))]);
        let first = f.evaluate(slot(14, 15, 0, 3, 1, false), None).await;
        let second = f.evaluate(slot(14, 15, 0, 3, 1, false), None).await;
        assert_eq!(first, second);
        assert_eq!(f.weddings.lock().unwrap().len(), 1);
    }
}
