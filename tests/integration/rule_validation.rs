use crate::helpers::utc;
use cadence::recurrence::{is_expired, validate, validate_syntax};

#[test]
fn count_and_until_together_are_rejected() {
    let result = validate(
        "FREQ=DAILY;COUNT=5;UNTIL=20250301T000000Z",
        Some(utc("2025-01-01T00:00:00Z")),
        None,
    );
    assert!(!result.valid);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.contains("COUNT") && e.contains("UNTIL"))
    );
}

#[test]
fn plain_rule_is_valid_without_warnings() {
    let result = validate(
        "FREQ=WEEKLY;BYDAY=MO,WE,FR",
        Some(utc("2025-01-01T00:00:00Z")),
        Some("Europe/Paris"),
    );
    assert!(result.valid, "{:?}", result.errors);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
}

#[test]
fn missing_dtstart_is_an_error_unless_embedded() {
    assert!(!validate("FREQ=DAILY", None, None).valid);
    let embedded = validate("DTSTART:20250101T090000Z\nRRULE:FREQ=DAILY", None, None);
    assert!(embedded.valid, "{:?}", embedded.errors);
}

#[test]
fn unknown_timezone_is_reported() {
    let result = validate(
        "FREQ=DAILY",
        Some(utc("2025-01-01T00:00:00Z")),
        Some("Mars/Olympus_Mons"),
    );
    assert!(!result.valid);
    assert!(result.errors[0].contains("Mars/Olympus_Mons"));
}

#[test]
fn impossible_dates_and_busy_rules_warn() {
    let dtstart = Some(utc("2025-01-01T00:00:00Z"));

    let feb30 = validate("FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=30", dtstart, None);
    assert!(feb30.valid);
    assert!(feb30.warnings.iter().any(|w| w.contains("February")));

    let minutely = validate("FREQ=MINUTELY", dtstart, None);
    assert!(minutely.warnings.iter().any(|w| w.contains("MINUTELY")));

    let huge = validate("FREQ=DAILY;COUNT=5000", dtstart, None);
    assert!(huge.warnings.iter().any(|w| w.contains("5000")));

    let every_monday = validate("FREQ=MONTHLY;BYDAY=MO", dtstart, None);
    assert_eq!(every_monday.warnings.len(), 1);
}

#[test]
fn non_positive_values_are_errors() {
    let dtstart = Some(utc("2025-01-01T00:00:00Z"));
    assert!(!validate("FREQ=DAILY;COUNT=0", dtstart, None).valid);
    assert!(!validate("FREQ=DAILY;INTERVAL=0", dtstart, None).valid);
}

#[test]
fn until_before_start_is_an_error() {
    let result = validate(
        "FREQ=DAILY;UNTIL=20240101T000000Z",
        Some(utc("2025-01-01T00:00:00Z")),
        None,
    );
    assert!(result.errors.iter().any(|e| e.contains("after UNTIL")));
}

#[test]
fn syntax_check() {
    assert!(validate_syntax("RRULE:FREQ=HOURLY;INTERVAL=4"));
    assert!(!validate_syntax("INTERVAL=4"));
    assert!(!validate_syntax("FREQ=DAILY;BYHOUR=25"));
}

#[test]
fn expiry_depends_on_the_remaining_series() {
    let dtstart = utc("2025-01-01T09:00:00Z");
    let counted = "FREQ=DAILY;COUNT=3";
    assert!(!is_expired(counted, dtstart, utc("2025-01-03T09:00:00Z")));
    assert!(is_expired(counted, dtstart, utc("2025-01-03T09:00:01Z")));

    let until = "FREQ=DAILY;UNTIL=20250110T000000Z";
    assert!(!is_expired(until, dtstart, utc("2025-01-09T08:00:00Z")));
    assert!(is_expired(until, dtstart, utc("2025-01-10T12:00:00Z")));

    assert!(!is_expired("FREQ=DAILY", dtstart, utc("2100-01-01T00:00:00Z")));
}
