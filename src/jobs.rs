use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tracing::info;

use crate::engine::{Engine, EngineError, ReminderSink};

/// How often the compactor checks the WAL growth.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Deliver every reminder due at `now`. Returns how many were delivered;
/// failed deliveries stay due and are retried on the next pass.
pub async fn dispatch_due_reminders(
    engine: &Engine,
    sink: &dyn ReminderSink,
    now: NaiveDateTime,
) -> Result<usize, EngineError> {
    let due = engine.due_reminders(now).await?;
    let mut delivered = 0;
    for reminder in &due {
        let message = match engine.render_reminder(reminder).await {
            Ok(message) => message,
            Err(e) => {
                // Deleted between listing and rendering.
                tracing::debug!("reminder skip {}: {e}", reminder.wedding_id);
                continue;
            }
        };
        if let Err(e) = sink.deliver(reminder, &message).await {
            metrics::counter!(crate::observability::REMINDER_FAILURES_TOTAL).increment(1);
            tracing::warn!(
                wedding = %reminder.wedding_id,
                kind = reminder.kind.code(),
                "reminder delivery failed: {e}"
            );
            continue;
        }
        match engine.mark_reminder_sent(reminder, now).await {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!("reminder {} delivered but not recorded: {e}", reminder.wedding_id),
        }
    }
    Ok(delivered)
}

/// Background task that periodically delivers due reminders.
pub async fn run_reminder_dispatcher(engine: Arc<Engine>, sink: Arc<dyn ReminderSink>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = Local::now().naive_local();
        match dispatch_due_reminders(&engine, sink.as_ref(), now).await {
            Ok(0) => {}
            Ok(n) => info!("delivered {n} reminders"),
            Err(e) => tracing::error!("reminder pass failed: {e}"),
        }
    }
}

/// Compact the WAL once `threshold` appends have accumulated.
/// Returns whether it compacted.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    if engine.wal_appends_since_compact().await < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReminderMessage;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("banns_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(ReminderKind, String)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ReminderSink for RecordingSink {
        async fn deliver(&self, reminder: &DueReminder, message: &ReminderMessage) -> Result<(), String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("gateway down".into());
            }
            self.delivered.lock().unwrap().push((reminder.kind, message.title.clone()));
            Ok(())
        }
    }

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2040, m, day).unwrap()
    }

    fn at(m: u32, day: u32, h: u32) -> NaiveDateTime {
        d(m, day).and_hms_opt(h, 0, 0).unwrap()
    }

    async fn engine_with_wedding(name: &str) -> Arc<Engine> {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        engine.add_location("Matriz".into(), None, None).await.unwrap();
        engine.add_celebrant("João".into(), "Pe.".into(), None).await.unwrap();
        let draft = WeddingDraft {
            slot: BookingInput::new(d(6, 16), NaiveTime::from_hms_opt(15, 0, 0).unwrap(), 1, 1, false),
            interview_at: Some(at(5, 2, 19)),
            couple: CoupleDetails {
                bride_name: "Ana".into(),
                bride_whatsapp: "11987654321".into(),
                groom_name: "Rui".into(),
                groom_whatsapp: "11912345678".into(),
            },
            with_civil_effect: false,
            transfer_type: TransferType::None,
            observations: None,
        };
        engine.schedule_wedding(draft, d(1, 1)).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn dispatcher_delivers_once() {
        let engine = engine_with_wedding("dispatch_once.wal").await;
        let sink = RecordingSink::default();

        // Past the 48h mark of the 2 May 19:00 interview, not yet the 24h one.
        let now = at(5, 1, 12);
        assert_eq!(dispatch_due_reminders(&engine, &sink, now).await.unwrap(), 1);
        assert_eq!(sink.delivered.lock().unwrap()[0].0, ReminderKind::Interview2d);

        assert_eq!(dispatch_due_reminders(&engine, &sink, now).await.unwrap(), 0);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried() {
        let engine = engine_with_wedding("dispatch_retry.wal").await;
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);

        let now = at(5, 1, 12);
        assert_eq!(dispatch_due_reminders(&engine, &sink, now).await.unwrap(), 0);
        assert_eq!(engine.due_reminders(now).await.unwrap().len(), 1);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(dispatch_due_reminders(&engine, &sink, now).await.unwrap(), 1);
        assert!(engine.due_reminders(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let engine = engine_with_wedding("compact_threshold.wal").await;
        // Location, celebrant and wedding: three appends so far.
        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert!(compact_if_needed(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.search_weddings(&WeddingFilter::default()).await.len(), 1);
    }
}
