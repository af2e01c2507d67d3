use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::limits::*;
use crate::model::WeddingDraft;

/// A validation failure attached to a form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

static NON_DIGIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\D").expect("valid regex"));

fn digits(value: &str) -> String {
    NON_DIGIT.replace_all(value, "").into_owned()
}

/// Mobile numbers: area code + 9 digits, the first of which is `9`.
pub fn is_valid_phone(phone: &str) -> bool {
    let cleaned = digits(phone);
    cleaned.len() == 11 && cleaned.as_bytes()[2] == b'9'
}

/// Render an 11-digit number as `(DD) DDDDD-DDDD`; anything else is
/// returned unchanged.
pub fn format_phone(value: &str) -> String {
    let d = digits(value);
    if d.len() == 11 {
        format!("({}) {}-{}", &d[..2], &d[2..7], &d[7..])
    } else {
        value.to_string()
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn check_len(errors: &mut Vec<FieldError>, field: &'static str, value: &str, max: usize) {
    if value.len() > max {
        errors.push(FieldError::new(field, format!("must be at most {max} characters")));
    }
}

/// Validate a wedding form. Both the interview and the ceremony must not lie
/// before `today`.
pub fn validate_wedding(draft: &WeddingDraft, today: NaiveDate) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    match draft.interview_at {
        None => errors.push(FieldError::new("interview_date", "interview date is required")),
        Some(at) if at.date() < today => {
            errors.push(FieldError::new("interview_date", "interview date must be in the future"))
        }
        Some(_) => {}
    }

    let couple = &draft.couple;
    for (field, name, label) in [
        ("bride_name", &couple.bride_name, "bride"),
        ("groom_name", &couple.groom_name, "groom"),
    ] {
        if is_blank(name) {
            errors.push(FieldError::new(field, format!("{label} name is required")));
        } else {
            check_len(&mut errors, field, name, MAX_NAME_LEN);
        }
    }
    for (field, phone, label) in [
        ("bride_whatsapp", &couple.bride_whatsapp, "bride"),
        ("groom_whatsapp", &couple.groom_whatsapp, "groom"),
    ] {
        if is_blank(phone) {
            errors.push(FieldError::new(field, format!("{label} WhatsApp is required")));
        } else if !is_valid_phone(phone) {
            errors.push(FieldError::new(field, "invalid WhatsApp number"));
        }
    }

    if draft.slot.wedding_date < today {
        errors.push(FieldError::new("wedding_date", "wedding date must be in the future"));
    }
    if let Err(mut id_errors) = draft.slot.check_ids() {
        errors.append(&mut id_errors);
    }
    if let Some(obs) = &draft.observations {
        check_len(&mut errors, "observations", obs, MAX_TEXT_LEN);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

pub fn validate_location(name: &str, address: Option<&str>) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    if is_blank(name) {
        errors.push(FieldError::new("name", "location name is required"));
    } else {
        check_len(&mut errors, "name", name, MAX_NAME_LEN);
    }
    if let Some(address) = address {
        check_len(&mut errors, "address", address, MAX_TEXT_LEN);
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

pub fn validate_celebrant(name: &str, title: &str) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    if is_blank(name) {
        errors.push(FieldError::new("name", "name is required"));
    } else {
        check_len(&mut errors, "name", name, MAX_NAME_LEN);
    }
    if is_blank(title) {
        errors.push(FieldError::new("title", "title is required"));
    } else {
        check_len(&mut errors, "title", title, MAX_NAME_LEN);
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveTime;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
    }

    fn draft() -> WeddingDraft {
        let date = NaiveDate::from_ymd_opt(2030, 6, 14).unwrap();
        WeddingDraft {
            slot: BookingInput::new(date, NaiveTime::from_hms_opt(15, 0, 0).unwrap(), 3, 2, false),
            interview_at: Some(
                NaiveDate::from_ymd_opt(2030, 5, 2)
                    .unwrap()
                    .and_hms_opt(19, 0, 0)
                    .unwrap(),
            ),
            couple: CoupleDetails {
                bride_name: "MARIA".into(),
                bride_whatsapp: "(11) 98765-4321".into(),
                groom_name: "PEDRO".into(),
                groom_whatsapp: "11912345678".into(),
            },
            with_civil_effect: false,
            transfer_type: TransferType::None,
            observations: None,
        }
    }

    fn fields(result: Result<(), Vec<FieldError>>) -> Vec<&'static str> {
        result.unwrap_err().into_iter().map(|e| e.field).collect()
    }

    #[test]
    fn phone_rules() {
        assert!(is_valid_phone("11987654321"));
        assert!(is_valid_phone("(11) 98765-4321"));
        assert!(!is_valid_phone("1187654321"));
        assert!(!is_valid_phone("11887654321")); // third digit must be 9
    }

    #[test]
    fn phone_formatting() {
        assert_eq!(format_phone("11987654321"), "(11) 98765-4321");
        assert_eq!(format_phone("123"), "123");
    }

    #[test]
    fn valid_draft_passes() {
        assert!(validate_wedding(&draft(), today()).is_ok());
    }

    #[test]
    fn missing_fields_are_reported_per_field() {
        let mut d = draft();
        d.interview_at = None;
        d.couple.bride_name = "  ".into();
        d.couple.groom_whatsapp = String::new();
        assert_eq!(
            fields(validate_wedding(&d, today())),
            vec!["interview_date", "bride_name", "groom_whatsapp"]
        );
    }

    #[test]
    fn past_dates_rejected() {
        let mut d = draft();
        d.slot.wedding_date = NaiveDate::from_ymd_opt(2029, 12, 31).unwrap();
        d.interview_at = Some(NaiveDate::from_ymd_opt(2029, 12, 1).unwrap().and_hms_opt(9, 0, 0).unwrap());
        assert_eq!(
            fields(validate_wedding(&d, today())),
            vec!["interview_date", "wedding_date"]
        );
    }

    #[test]
    fn wedding_today_is_allowed() {
        let mut d = draft();
        d.slot.wedding_date = today();
        d.interview_at = Some(today().and_hms_opt(8, 0, 0).unwrap());
        assert!(validate_wedding(&d, today()).is_ok());
    }

    #[test]
    fn bad_phone_and_ids() {
        let mut d = draft();
        d.couple.bride_whatsapp = "12345".into();
        d.slot.location_id = 0;
        assert_eq!(fields(validate_wedding(&d, today())), vec!["bride_whatsapp", "location"]);
    }

    #[test]
    fn location_and_celebrant_forms() {
        assert!(validate_location("MATRIZ", None).is_ok());
        assert_eq!(fields(validate_location("", None)), vec!["name"]);
        assert!(validate_celebrant("JOSE", "Pe.").is_ok());
        assert_eq!(fields(validate_celebrant("", "")), vec!["name", "title"]);
    }
}
