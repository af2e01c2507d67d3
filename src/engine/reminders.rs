use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};

use crate::model::*;

use super::{Engine, EngineError};

/// Hours before the interview at which each interview reminder fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderOffsets {
    pub interview_2d: u32,
    pub interview_1d: u32,
    pub interview_12h: u32,
}

impl Default for ReminderOffsets {
    fn default() -> Self {
        Self {
            interview_2d: 48,
            interview_1d: 24,
            interview_12h: 12,
        }
    }
}

/// When `kind` is due for `wedding`, and the moment it announces.
/// `None` for interview reminders of a wedding without an interview.
pub fn reminder_due_at(
    kind: ReminderKind,
    wedding: &Wedding,
    offsets: &ReminderOffsets,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let before = |target: NaiveDateTime, hours: u32| (target - Duration::hours(i64::from(hours)), target);
    match kind {
        ReminderKind::Interview2d => wedding.interview_at.map(|at| before(at, offsets.interview_2d)),
        ReminderKind::Interview1d => wedding.interview_at.map(|at| before(at, offsets.interview_1d)),
        ReminderKind::Interview12h => wedding.interview_at.map(|at| before(at, offsets.interview_12h)),
        ReminderKind::Wedding => Some(before(wedding.slot.starts_at(), 24)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    /// Digits only, with country code.
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderMessage {
    pub title: String,
    pub body: String,
    pub recipients: Vec<Recipient>,
}

fn whatsapp_number(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.starts_with("55") && digits.len() > 11 {
        digits
    } else {
        format!("55{digits}")
    }
}

/// Render the message for a due reminder. Bride and groom both receive it.
pub fn format_reminder(reminder: &DueReminder, wedding: &Wedding, site_name: &str) -> ReminderMessage {
    let couple = wedding.couple_label();
    let at = reminder.target_at;
    let (title, body) = match reminder.kind {
        ReminderKind::Interview2d => (
            "Interview reminder - 2 days".to_string(),
            format!(
                "Hello! Your marriage interview is scheduled for {}.\n\nCouple: {couple}\n\nPlease confirm your attendance.",
                at.format("%d/%m/%Y %H:%M")
            ),
        ),
        ReminderKind::Interview1d => (
            "Interview reminder - tomorrow".to_string(),
            format!(
                "Hello! Your marriage interview is TOMORROW at {}.\n\nCouple: {couple}\n\nRemember to bring the required documents.",
                at.format("%H:%M")
            ),
        ),
        ReminderKind::Interview12h => (
            "Urgent reminder - interview in 12 hours".to_string(),
            format!(
                "URGENT REMINDER! Your marriage interview is in 12 HOURS.\n\nTime: {}\nCouple: {couple}",
                at.format("%H:%M")
            ),
        ),
        ReminderKind::Wedding => (
            "Your wedding is tomorrow!".to_string(),
            format!(
                "Congratulations! Your wedding is confirmed for tomorrow, {} at {}.\n\nCouple: {couple}\n\nMay God bless this union!",
                at.format("%d/%m/%Y"),
                at.format("%H:%M")
            ),
        ),
    };

    let recipients = [
        (&wedding.couple.bride_name, &wedding.couple.bride_whatsapp),
        (&wedding.couple.groom_name, &wedding.couple.groom_whatsapp),
    ]
    .into_iter()
    .filter(|(_, phone)| !phone.trim().is_empty())
    .map(|(name, phone)| Recipient {
        name: name.clone(),
        phone: whatsapp_number(phone),
    })
    .collect();

    ReminderMessage {
        title,
        body: format!("{body}\n\n{site_name}"),
        recipients,
    }
}

/// Where reminder messages go.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(&self, reminder: &DueReminder, message: &ReminderMessage) -> Result<(), String>;
}

/// Writes each message to the log instead of sending it.
pub struct LogSink;

#[async_trait]
impl ReminderSink for LogSink {
    async fn deliver(&self, reminder: &DueReminder, message: &ReminderMessage) -> Result<(), String> {
        let to: Vec<&str> = message.recipients.iter().map(|r| r.phone.as_str()).collect();
        tracing::info!(
            wedding = %reminder.wedding_id,
            kind = reminder.kind.code(),
            ?to,
            "{}",
            message.title
        );
        Ok(())
    }
}

impl Engine {
    pub fn reminder_offsets(&self) -> Result<ReminderOffsets, EngineError> {
        Ok(ReminderOffsets {
            interview_2d: self.config.get_u32(REMINDER_INTERVIEW_2D_KEY)?,
            interview_1d: self.config.get_u32(REMINDER_INTERVIEW_1D_KEY)?,
            interview_12h: self.config.get_u32(REMINDER_INTERVIEW_12H_KEY)?,
        })
    }

    /// Reminders of `SCHEDULED` weddings that are due at `now`, whose target
    /// has not passed and that were not yet sent for their current due time.
    /// Ordered by due time.
    pub async fn due_reminders(&self, now: NaiveDateTime) -> Result<Vec<DueReminder>, EngineError> {
        let offsets = self.reminder_offsets()?;
        let schedule = self.schedule.read().await;
        let mut due = Vec::new();
        for wedding in schedule.iter().filter(|w| w.is_scheduled()) {
            for kind in ReminderKind::ALL {
                let Some((due_at, target_at)) = reminder_due_at(kind, wedding, &offsets) else {
                    continue;
                };
                if due_at > now || now >= target_at {
                    continue;
                }
                let sent = self
                    .sent_reminders
                    .get(&(wedding.id, kind))
                    .is_some_and(|at| *at == due_at);
                if !sent {
                    due.push(DueReminder {
                        wedding_id: wedding.id,
                        kind,
                        due_at,
                        target_at,
                    });
                }
            }
        }
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.wedding_id.cmp(&b.wedding_id)));
        Ok(due)
    }

    pub async fn mark_reminder_sent(&self, reminder: &DueReminder, sent_at: NaiveDateTime) -> Result<(), EngineError> {
        let schedule = self.schedule.read().await;
        if schedule.get(&reminder.wedding_id).is_none() {
            return Err(EngineError::WeddingNotFound(reminder.wedding_id));
        }
        let _admin = self.admin_lock.lock().await;
        let event = Event::ReminderSent {
            wedding_id: reminder.wedding_id,
            kind: reminder.kind,
            due_at: reminder.due_at,
            sent_at,
        };
        self.persist_admin(&event).await?;
        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL, "kind" => reminder.kind.code())
            .increment(1);
        Ok(())
    }

    /// Render a due reminder with the current wedding details.
    pub async fn render_reminder(&self, reminder: &DueReminder) -> Result<ReminderMessage, EngineError> {
        let wedding = self.wedding(reminder.wedding_id).await?;
        let site = self.config.get(SITE_NAME_KEY).unwrap_or_default();
        Ok(format_reminder(reminder, &wedding, &site))
    }
}
