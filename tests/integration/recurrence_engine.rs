use crate::helpers::utc;
use cadence::recurrence::{CompiledRule, Frequency, RecurrenceEngine, RuleCache, TimezoneHandler};
use chrono::{NaiveTime, Timelike};
use std::sync::Arc;

fn engine_in(zone: &str) -> RecurrenceEngine {
    RecurrenceEngine::new(
        TimezoneHandler::from_name(zone).unwrap(),
        Arc::new(RuleCache::new(32).unwrap()),
    )
}

#[test]
fn monthly_on_the_31st_clamps_then_recovers() {
    let engine = engine_in("UTC");
    let frequency = Frequency::monthly(1, Some(31));
    let mut current = utc("2025-01-31T09:00:00Z");
    let mut seen = Vec::new();
    for _ in 0..3 {
        current = engine.calculate_next(current, &frequency).unwrap().unwrap();
        seen.push(current);
    }
    assert_eq!(
        seen,
        vec![
            utc("2025-02-28T09:00:00Z"),
            utc("2025-03-31T09:00:00Z"),
            utc("2025-04-30T09:00:00Z"),
        ]
    );
}

#[test]
fn daily_keeps_local_wall_clock_across_dst() {
    let engine = engine_in("America/New_York");
    // 09:00 EST on the day before the March 2025 transition.
    let next = engine
        .calculate_next(utc("2025-03-08T14:00:00Z"), &Frequency::daily(1))
        .unwrap()
        .unwrap();
    assert_eq!(next, utc("2025-03-09T13:00:00Z"));
}

#[test]
fn weekly_rolls_over_to_the_first_selected_day() {
    let engine = engine_in("UTC");
    // Saturday 2025-06-07; Sunday and Wednesday selected.
    let frequency = Frequency::weekly(1, [0, 3]);
    let next = engine
        .calculate_next(utc("2025-06-07T08:00:00Z"), &frequency)
        .unwrap();
    assert_eq!(next, Some(utc("2025-06-08T08:00:00Z")));
}

#[test]
fn forced_time_is_local_to_the_engine_zone() {
    let engine = engine_in("Europe/Berlin");
    let frequency = Frequency::daily(1).with_time(NaiveTime::from_hms_opt(7, 30, 0).unwrap());
    let next = engine
        .calculate_next(utc("2025-07-01T20:00:00Z"), &frequency)
        .unwrap()
        .unwrap();
    // 07:30 CEST is 05:30 UTC.
    assert_eq!(next, utc("2025-07-02T05:30:00Z"));
    assert_eq!(next.minute(), 30);
}

#[test]
fn custom_rule_follows_rrule_semantics() {
    let engine = engine_in("UTC");
    let frequency = Frequency::custom("FREQ=MONTHLY;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1");
    let next = engine
        .calculate_next_for("payroll", utc("2025-05-30T09:00:00Z"), &frequency)
        .unwrap();
    // Last weekday of June 2025 is Monday the 30th.
    assert_eq!(next, Some(utc("2025-06-30T09:00:00Z")));
    assert!(engine.cache().keys()[0].starts_with("payroll:"));
}

#[test]
fn custom_rule_with_its_own_timezone() {
    let engine = engine_in("UTC");
    let frequency = Frequency::Custom {
        rule: "FREQ=WEEKLY;BYDAY=MO;BYHOUR=9;BYMINUTE=0;BYSECOND=0".to_owned(),
        timezone: Some("Asia/Tokyo".to_owned()),
        at: None,
    };
    let next = engine
        .calculate_next_for("standup", utc("2025-06-01T00:00:00Z"), &frequency)
        .unwrap();
    // Monday 09:00 JST.
    assert_eq!(next, Some(utc("2025-06-02T00:00:00Z")));
}

#[test]
fn invalid_custom_rule_is_an_error() {
    let engine = engine_in("UTC");
    let result = engine.calculate_next(
        utc("2025-06-01T00:00:00Z"),
        &Frequency::custom("FREQ=SOMETIMES"),
    );
    assert!(result.is_err());
    assert!(engine.cache().is_empty());
}

#[test]
fn range_walk_is_capped() {
    let engine = engine_in("UTC");
    let start = utc("2000-01-01T00:00:00Z");
    let occurrences = engine
        .occurrences_in_range(start, utc("2100-01-01T00:00:00Z"), &Frequency::daily(1), start)
        .unwrap();
    assert_eq!(occurrences.len(), 1000);
}

#[test]
fn missed_occurrences_exclude_the_lower_bound() {
    let engine = engine_in("UTC");
    let first = utc("2025-06-01T09:00:00Z");
    let missed = engine
        .missed_occurrences(first, utc("2025-06-03T09:00:00Z"), &Frequency::daily(1), first)
        .unwrap();
    assert_eq!(
        missed,
        vec![utc("2025-06-02T09:00:00Z"), utc("2025-06-03T09:00:00Z")]
    );
}

#[test]
fn compiled_rule_lists_a_finite_series() {
    let rule = CompiledRule::compile(
        "FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=29;COUNT=3",
        utc("2024-02-29T12:00:00Z"),
        None,
    )
    .unwrap();
    assert_eq!(
        rule.all(10),
        vec![
            utc("2024-02-29T12:00:00Z"),
            utc("2028-02-29T12:00:00Z"),
            utc("2032-02-29T12:00:00Z"),
        ]
    );
}
