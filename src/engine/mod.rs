mod conflict;
mod error;
mod mutations;
mod proclamation;
mod queries;
mod reminders;
mod store;

pub use conflict::ConflictEvaluator;
pub use error::EngineError;
pub use proclamation::proclamation_sundays;
pub use reminders::{
    LogSink, Recipient, ReminderMessage, ReminderOffsets, ReminderSink, format_reminder, reminder_due_at,
};
pub use store::{BookingStore, ConfigStore, ConfigTable, Schedule};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // The batch is reported failed, so none of it may be replayed.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
        WalCommand::Append { .. } => {}
    }
}

/// The wedding schedule plus its reference data, rebuilt from the WAL on
/// startup.
pub struct Engine {
    pub(super) schedule: RwLock<Schedule>,
    pub(super) locations: DashMap<LocationId, Location>,
    pub(super) celebrants: DashMap<CelebrantId, Celebrant>,
    pub config: ConfigTable,
    /// Last reminder due time delivered per wedding and kind.
    pub(super) sent_reminders: DashMap<(Ulid, ReminderKind), NaiveDateTime>,
    /// Serializes writes to everything outside the schedule.
    pub(super) admin_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a wedding event to the schedule. Returns the months whose calendar
/// changed.
fn apply_to_schedule(schedule: &mut Schedule, event: &Event) -> Vec<MonthKey> {
    match event {
        Event::WeddingScheduled { wedding } | Event::WeddingUpdated { wedding } => {
            let month = wedding.month();
            match schedule.upsert(wedding.clone()) {
                Ok(Some(previous)) if previous.month() != month => vec![previous.month(), month],
                Ok(_) => vec![month],
                Err(e) => {
                    tracing::error!("wedding {} not applied: {e}", wedding.id);
                    Vec::new()
                }
            }
        }
        Event::WeddingStatusChanged { id, status } => match schedule.set_status(id, *status) {
            Ok(w) => vec![w.month()],
            Err(e) => {
                tracing::error!("status change for {id} not applied: {e}");
                Vec::new()
            }
        },
        Event::WeddingDeleted { id } => schedule.remove(id).map(|w| w.month()).into_iter().collect(),
        _ => Vec::new(),
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            schedule: RwLock::new(Schedule::new()),
            locations: DashMap::new(),
            celebrants: DashMap::new(),
            config: ConfigTable::new(),
            sent_reminders: DashMap::new(),
            admin_lock: Mutex::new(()),
            wal_tx,
            notify,
        };

        // Sole owner during replay; the schedule is reached through get_mut.
        let mut schedule = Schedule::new();
        for event in &events {
            apply_to_schedule(&mut schedule, event);
            engine.apply_admin(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            weddings = schedule.len(),
            locations = engine.locations.len(),
            celebrants = engine.celebrants.len(),
            "schedule restored"
        );
        *engine.schedule.get_mut() = schedule;
        Ok(engine)
    }

    /// Apply an event that does not touch the schedule.
    fn apply_admin(&self, event: &Event) {
        match event {
            Event::LocationSaved { location } => {
                self.locations.insert(location.id, location.clone());
            }
            Event::CelebrantSaved { celebrant } => {
                self.celebrants.insert(celebrant.id, celebrant.clone());
            }
            Event::ConfigSet { key, value } => self.config.set(key.clone(), value.clone()),
            Event::ReminderSent { wedding_id, kind, due_at, .. } => {
                self.sent_reminders.insert((*wedding_id, *kind), *due_at);
            }
            Event::WeddingDeleted { id } => {
                self.sent_reminders.retain(|(wedding_id, _), _| wedding_id != id);
            }
            Event::WeddingScheduled { .. }
            | Event::WeddingUpdated { .. }
            | Event::WeddingStatusChanged { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply to the schedule, notify the affected months.
    /// The caller holds the schedule write lock and has already checked the
    /// slot index, so applying cannot fail.
    pub(super) async fn persist_and_apply(
        &self,
        schedule: &mut Schedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_admin(event);
        for month in apply_to_schedule(schedule, event) {
            self.notify.send(month, event);
        }
        Ok(())
    }

    /// WAL-append and apply an event outside the schedule. The caller holds
    /// `admin_lock`.
    pub(super) async fn persist_admin(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_admin(event);
        Ok(())
    }

    /// Events that recreate the current state from an empty log.
    fn snapshot_events(&self, schedule: &Schedule) -> Vec<Event> {
        let mut events = Vec::new();
        for (key, value) in self.config.stored() {
            events.push(Event::ConfigSet { key, value });
        }
        let mut locations: Vec<Location> = self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        events.extend(locations.into_iter().map(|location| Event::LocationSaved { location }));
        let mut celebrants: Vec<Celebrant> = self.celebrants.iter().map(|e| e.value().clone()).collect();
        celebrants.sort_by_key(|c| c.id);
        events.extend(celebrants.into_iter().map(|celebrant| Event::CelebrantSaved { celebrant }));

        let mut weddings: Vec<&Wedding> = schedule.iter().collect();
        weddings.sort_by_key(|w| w.id);
        for wedding in weddings {
            events.push(Event::WeddingScheduled { wedding: wedding.clone() });
        }
        for entry in self.sent_reminders.iter() {
            let (wedding_id, kind) = *entry.key();
            events.push(Event::ReminderSent {
                wedding_id,
                kind,
                due_at: *entry.value(),
                sent_at: *entry.value(),
            });
        }
        events
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Blocks all writers while the snapshot is taken and swapped in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let schedule = self.schedule.write().await;
        let _admin = self.admin_lock.lock().await;
        let events = self.snapshot_events(&schedule);
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
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
