use chrono::{Datelike, Duration, NaiveDate};

use crate::model::ProclamationDates;

/// The three Sundays on which the banns are read before `wedding_date`.
///
/// The last reading falls on the Sunday before the ceremony; a Sunday wedding
/// steps back a full week, so every date is strictly earlier than the
/// wedding itself.
pub fn proclamation_sundays(wedding_date: NaiveDate) -> ProclamationDates {
    let days_back = match wedding_date.weekday().num_days_from_sunday() {
        0 => 7,
        n => n,
    };
    let third = wedding_date - Duration::days(i64::from(days_back));
    ProclamationDates {
        first: third - Duration::days(14),
        second: third - Duration::days(7),
        third,
    }
}
