use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::validation::FieldError;

pub type LocationId = i64;
pub type CelebrantId = i64;

/// Lifecycle of a booking. Only `Scheduled` bookings occupy slots and count
/// toward daily capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeddingStatus {
    Scheduled,
    Held,
    Cancelled,
}

impl WeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeddingStatus::Scheduled => "SCHEDULED",
            WeddingStatus::Held => "HELD",
            WeddingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SCHEDULED" => Ok(WeddingStatus::Scheduled),
            "HELD" => Ok(WeddingStatus::Held),
            "CANCELLED" | "CANCELED" => Ok(WeddingStatus::Cancelled),
            other => Err(format!("unknown wedding status: {other}")),
        }
    }
}

/// Whether the couple is registering a church transfer of their process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferType {
    #[default]
    None,
    Incoming,
    Outgoing,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::None => "none",
            TransferType::Incoming => "incoming",
            TransferType::Outgoing => "outgoing",
        }
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(TransferType::None),
            "incoming" | "in" => Ok(TransferType::Incoming),
            "outgoing" | "out" => Ok(TransferType::Outgoing),
            other => Err(format!("unknown transfer type: {other}")),
        }
    }
}

// ── Time normalization ───────────────────────────────────────────

static TIME_OF_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").expect("valid time regex"));

/// Timestamp layouts whose clock reading is taken as the time of day.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Truncate a time of day to minute precision. Two bookings that differ only
/// in seconds occupy the same slot.
pub fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// Parse `HH:MM`, `HH:MM:SS` or a full timestamp, then drop the seconds.
/// Anything else is rejected.
pub fn normalize_time(raw: &str) -> Result<NaiveTime, FieldError> {
    let invalid = || FieldError::new("wedding_time", format!("invalid time of day: {raw:?}"));
    let trimmed = raw.trim();
    let Some(caps) = TIME_OF_DAY.captures(trimmed) else {
        return timestamp_clock(trimmed)
            .map(truncate_to_minute)
            .ok_or_else(invalid);
    };
    let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
    let minute: u32 = caps[2].parse().map_err(|_| invalid())?;
    if let Some(sec) = caps.get(3) {
        let sec: u32 = sec.as_str().parse().map_err(|_| invalid())?;
        if sec > 59 {
            return Err(invalid());
        }
    }
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// The wall-clock time written in an RFC 3339 or plain ISO timestamp.
fn timestamp_clock(raw: &str) -> Option<NaiveTime> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.naive_local().time());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|at| at.time())
}

pub fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, FieldError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| FieldError::new(field, format!("invalid date: {raw:?}")))
}

/// Accepts `YYYY-MM-DD HH:MM[:SS]` and the `T`-separated form browsers send.
pub fn parse_datetime(field: &'static str, raw: &str) -> Result<NaiveDateTime, FieldError> {
    let raw = raw.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| FieldError::new(field, format!("invalid date-time: {raw:?}")))
}

// ── Booking slot ─────────────────────────────────────────────────

/// The slot a booking claims: the input of conflict evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingInput {
    pub wedding_date: NaiveDate,
    /// Always minute precision.
    pub wedding_time: NaiveTime,
    pub location_id: LocationId,
    pub celebrant_id: CelebrantId,
    pub is_community: bool,
}

impl BookingInput {
    pub fn new(
        wedding_date: NaiveDate,
        wedding_time: NaiveTime,
        location_id: LocationId,
        celebrant_id: CelebrantId,
        is_community: bool,
    ) -> Self {
        Self {
            wedding_date,
            wedding_time: truncate_to_minute(wedding_time),
            location_id,
            celebrant_id,
            is_community,
        }
    }

    /// Build a candidate from raw form values.
    pub fn parse(
        wedding_date: &str,
        wedding_time: &str,
        location_id: LocationId,
        celebrant_id: CelebrantId,
        is_community: bool,
    ) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        let date = parse_date("wedding_date", wedding_date).map_err(|e| errors.push(e)).ok();
        let time = normalize_time(wedding_time).map_err(|e| errors.push(e)).ok();
        let input = match (date, time) {
            (Some(date), Some(time)) => {
                Some(Self::new(date, time, location_id, celebrant_id, is_community))
            }
            _ => None,
        };
        match input {
            Some(input) => {
                input.check_ids()?;
                Ok(input)
            }
            None => Err(errors),
        }
    }

    /// Reference ids are opaque but must be positive.
    pub fn check_ids(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.location_id <= 0 {
            errors.push(FieldError::new("location", format!("invalid location id {}", self.location_id)));
        }
        if self.celebrant_id <= 0 {
            errors.push(FieldError::new("celebrant", format!("invalid celebrant id {}", self.celebrant_id)));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.wedding_date.and_time(self.wedding_time)
    }
}

// ── Weddings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoupleDetails {
    pub bride_name: String,
    pub bride_whatsapp: String,
    pub groom_name: String,
    pub groom_whatsapp: String,
}

/// Everything a user submits when creating or editing a wedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeddingDraft {
    pub slot: BookingInput,
    pub interview_at: Option<NaiveDateTime>,
    pub couple: CoupleDetails,
    pub with_civil_effect: bool,
    pub transfer_type: TransferType,
    pub observations: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wedding {
    pub id: Ulid,
    pub slot: BookingInput,
    pub status: WeddingStatus,
    /// Day the booking was made.
    pub scheduled_on: NaiveDate,
    pub interview_at: Option<NaiveDateTime>,
    pub couple: CoupleDetails,
    pub with_civil_effect: bool,
    pub transfer_type: TransferType,
    pub observations: Option<String>,
}

impl Wedding {
    pub fn from_draft(id: Ulid, draft: WeddingDraft, scheduled_on: NaiveDate) -> Self {
        Self {
            id,
            slot: draft.slot,
            status: WeddingStatus::Scheduled,
            scheduled_on,
            interview_at: draft.interview_at,
            couple: draft.couple,
            with_civil_effect: draft.with_civil_effect,
            transfer_type: draft.transfer_type,
            observations: draft.observations,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == WeddingStatus::Scheduled
    }

    pub fn couple_label(&self) -> String {
        format!("{} & {}", self.couple.bride_name, self.couple.groom_name)
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::of(self.slot.wedding_date)
    }
}

// ── Locations & celebrants ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub address: Option<String>,
    pub capacity: Option<u32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Celebrant {
    pub id: CelebrantId,
    pub name: String,
    pub title: String,
    pub phone: Option<String>,
    pub is_active: bool,
}

// ── Configuration ────────────────────────────────────────────────

pub const MAX_WEDDINGS_PER_DAY_KEY: &str = "max_weddings_per_day";
pub const MAX_COMMUNITY_WEDDINGS_KEY: &str = "max_community_weddings";
pub const MAX_COUPLES_PER_COMMUNITY_KEY: &str = "max_couples_per_community";
pub const REMINDER_INTERVIEW_2D_KEY: &str = "reminder_interview_2d";
pub const REMINDER_INTERVIEW_1D_KEY: &str = "reminder_interview_1d";
pub const REMINDER_INTERVIEW_12H_KEY: &str = "reminder_interview_12h";
pub const SITE_NAME_KEY: &str = "site_name";

/// Known settings with their defaults. Integer-typed keys reject
/// non-numeric values.
pub const CONFIG_DEFAULTS: &[(&str, ConfigType, &str)] = &[
    (MAX_WEDDINGS_PER_DAY_KEY, ConfigType::Int, "4"),
    (MAX_COMMUNITY_WEDDINGS_KEY, ConfigType::Int, "3"),
    (MAX_COUPLES_PER_COMMUNITY_KEY, ConfigType::Int, "20"),
    (REMINDER_INTERVIEW_2D_KEY, ConfigType::Int, "48"),
    (REMINDER_INTERVIEW_1D_KEY, ConfigType::Int, "24"),
    (REMINDER_INTERVIEW_12H_KEY, ConfigType::Int, "12"),
    (SITE_NAME_KEY, ConfigType::Text, "Wedding Scheduler"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigType {
    Int,
    Text,
}

impl ConfigType {
    pub fn of_key(key: &str) -> ConfigType {
        CONFIG_DEFAULTS
            .iter()
            .find(|(k, _, _)| *k == key)
            .map_or(ConfigType::Text, |(_, t, _)| *t)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigType::Int => "int",
            ConfigType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub kind: ConfigType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityConfig {
    pub max_weddings_per_day: u32,
    pub max_community_weddings: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_weddings_per_day: 4,
            max_community_weddings: 3,
        }
    }
}

// ── Conflicts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    DailyLimit,
    CommunityLimit,
    LocationConflict,
    CelebrantConflict,
}

impl ConflictKind {
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::DailyLimit => "DAILY_LIMIT",
            ConflictKind::CommunityLimit => "COMMUNITY_LIMIT",
            ConflictKind::LocationConflict => "LOCATION_CONFLICT",
            ConflictKind::CelebrantConflict => "CELEBRANT_CONFLICT",
        }
    }

    /// Form field a conflict of this kind is reported against.
    pub fn field(&self) -> &'static str {
        match self {
            ConflictKind::DailyLimit | ConflictKind::CommunityLimit => "wedding_date",
            ConflictKind::LocationConflict => "wedding_time",
            ConflictKind::CelebrantConflict => "celebrant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    pub message: String,
    /// Set for pairwise conflicts.
    pub conflicting_wedding: Option<Ulid>,
}

// ── Proclamations ────────────────────────────────────────────────

/// The three Sundays on which the banns are read, earliest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProclamationDates {
    pub first: NaiveDate,
    pub second: NaiveDate,
    pub third: NaiveDate,
}

// ── Reminders ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    Interview2d,
    Interview1d,
    Interview12h,
    Wedding,
}

impl ReminderKind {
    pub const ALL: [ReminderKind; 4] = [
        ReminderKind::Interview2d,
        ReminderKind::Interview1d,
        ReminderKind::Interview12h,
        ReminderKind::Wedding,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ReminderKind::Interview2d => "INTERVIEW_2D",
            ReminderKind::Interview1d => "INTERVIEW_1D",
            ReminderKind::Interview12h => "INTERVIEW_12H",
            ReminderKind::Wedding => "WEDDING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueReminder {
    pub wedding_id: Ulid,
    pub kind: ReminderKind,
    pub due_at: NaiveDateTime,
    /// The interview or ceremony being announced.
    pub target_at: NaiveDateTime,
}

// ── Calendar ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// LISTEN channel name, e.g. `month_2025_06`.
    pub fn channel(&self) -> String {
        format!("month_{:04}_{:02}", self.year, self.month)
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        let rest = channel.strip_prefix("month_")?;
        let (y, m) = rest.split_once('_')?;
        Self::new(y.parse().ok()?, m.parse().ok()?)
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// Flat event records; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WeddingScheduled {
        wedding: Wedding,
    },
    WeddingUpdated {
        wedding: Wedding,
    },
    WeddingStatusChanged {
        id: Ulid,
        status: WeddingStatus,
    },
    WeddingDeleted {
        id: Ulid,
    },
    LocationSaved {
        location: Location,
    },
    CelebrantSaved {
        celebrant: Celebrant,
    },
    ConfigSet {
        key: String,
        value: String,
    },
    ReminderSent {
        wedding_id: Ulid,
        kind: ReminderKind,
        due_at: NaiveDateTime,
        sent_at: NaiveDateTime,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeddingFilter {
    /// Case-insensitive substring of the bride's or groom's name.
    pub name: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub location_id: Option<LocationId>,
    pub celebrant_id: Option<CelebrantId>,
    pub is_community: Option<bool>,
    pub status: Option<WeddingStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStatistics {
    pub total_scheduled: usize,
    pub month_scheduled: usize,
    pub month_community: usize,
    pub month_civil_effect: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub weddings: Vec<Wedding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn normalize_drops_seconds() {
        assert_eq!(normalize_time("15:00").unwrap(), t(15, 0));
        assert_eq!(normalize_time("15:00:59").unwrap(), t(15, 0));
        assert_eq!(normalize_time(" 09:30:00 ").unwrap(), t(9, 30));
    }

    #[test]
    fn normalize_reads_timestamps() {
        assert_eq!(normalize_time("2025-06-14T10:15:22Z").unwrap(), t(10, 15));
        assert_eq!(normalize_time("2025-06-14T10:15:22-03:00").unwrap(), t(10, 15));
        assert_eq!(normalize_time("2025-06-14 18:40").unwrap(), t(18, 40));
    }

    #[test]
    fn normalize_rejects_stray_digits() {
        for raw in ["10:300", "123:45", "7:15pm later 99", "10:30:5x", "at 10:30"] {
            let err = normalize_time(raw).unwrap_err();
            assert_eq!(err.field, "wedding_time", "{raw}");
        }
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert_eq!(normalize_time("noon").unwrap_err().field, "wedding_time");
        assert!(normalize_time("25:00").is_err());
        assert!(normalize_time("10:61").is_err());
        assert!(normalize_time("10:30:75").is_err());
    }

    #[test]
    fn booking_input_truncates_time() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let input = BookingInput::new(date, NaiveTime::from_hms_opt(15, 0, 42).unwrap(), 3, 2, false);
        assert_eq!(input.wedding_time, t(15, 0));
    }

    #[test]
    fn booking_input_parse_collects_errors() {
        let errs = BookingInput::parse("2025-13-01", "xx", 1, 1, false).unwrap_err();
        let fields: Vec<_> = errs.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["wedding_date", "wedding_time"]);

        let errs = BookingInput::parse("2025-06-14", "10:00", 0, -1, false).unwrap_err();
        let fields: Vec<_> = errs.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["location", "celebrant"]);
    }

    #[test]
    fn status_round_trip_through_text() {
        for s in [WeddingStatus::Scheduled, WeddingStatus::Held, WeddingStatus::Cancelled] {
            assert_eq!(s.as_str().parse::<WeddingStatus>().unwrap(), s);
        }
        assert_eq!("canceled".parse::<WeddingStatus>().unwrap(), WeddingStatus::Cancelled);
        assert!("AGENDADO".parse::<WeddingStatus>().is_err());
    }

    #[test]
    fn month_key_bounds() {
        let feb = MonthKey::new(2024, 2).unwrap();
        assert_eq!(feb.first_day(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let dec = MonthKey::new(2025, 12).unwrap();
        assert_eq!(dec.last_day(), NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
        assert!(MonthKey::new(2025, 13).is_none());
    }

    #[test]
    fn month_channel_names() {
        let key = MonthKey::new(2025, 6).unwrap();
        assert_eq!(key.channel(), "month_2025_06");
        assert_eq!(MonthKey::from_channel("month_2025_06"), Some(key));
        assert_eq!(MonthKey::from_channel("resource_2025_06"), None);
        assert_eq!(MonthKey::from_channel("month_2025_13"), None);
    }

    #[test]
    fn conflict_kinds_map_to_fields() {
        assert_eq!(ConflictKind::DailyLimit.field(), "wedding_date");
        assert_eq!(ConflictKind::CommunityLimit.field(), "wedding_date");
        assert_eq!(ConflictKind::LocationConflict.field(), "wedding_time");
        assert_eq!(ConflictKind::CelebrantConflict.field(), "celebrant");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let event = Event::WeddingScheduled {
            wedding: Wedding {
                id: Ulid::new(),
                slot: BookingInput::new(date, t(10, 0), 1, 2, true),
                status: WeddingStatus::Scheduled,
                scheduled_on: date,
                interview_at: Some(date.and_time(t(9, 0))),
                couple: CoupleDetails {
                    bride_name: "ANA".into(),
                    bride_whatsapp: "11987654321".into(),
                    groom_name: "JOAO".into(),
                    groom_whatsapp: "11912345678".into(),
                },
                with_civil_effect: true,
                transfer_type: TransferType::Incoming,
                observations: None,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
