use crate::helpers::utc;
use cadence::recurrence::RuleCache;
use std::sync::Arc;
use std::time::Duration;

const DAILY: &str = "FREQ=DAILY";

fn start() -> chrono::DateTime<chrono::Utc> {
    utc("2025-01-01T08:00:00Z")
}

#[test]
fn least_recently_used_key_is_evicted() {
    let cache = RuleCache::new(2).unwrap();
    cache.get_or_parse("a", DAILY, start(), None).unwrap();
    cache.get_or_parse("b", DAILY, start(), None).unwrap();
    // Touch "a" so "b" becomes the eviction candidate.
    cache.get_or_parse("a", DAILY, start(), None).unwrap();
    cache.get_or_parse("c", DAILY, start(), None).unwrap();

    assert!(cache.has("a"));
    assert!(!cache.has("b"));
    assert!(cache.has("c"));
    assert_eq!(cache.keys(), vec!["c".to_owned(), "a".to_owned()]);
}

#[test]
fn hit_rate_counts_lookups() {
    let cache = RuleCache::new(8).unwrap();
    cache.get_or_parse("k", DAILY, start(), None).unwrap();
    cache.get_or_parse("k", DAILY, start(), None).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.max_size, 8);
    assert_eq!((stats.total_hits, stats.total_misses), (1, 1));
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(cache.peek("k").unwrap().hits, 1);
}

#[test]
fn cached_rule_is_shared() {
    let cache = RuleCache::new(4).unwrap();
    let first = cache.get_or_parse("k", DAILY, start(), None).unwrap();
    let second = cache.get_or_parse("k", DAILY, start(), None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn owner_invalidation_only_touches_matching_prefix() {
    let cache = RuleCache::new(8).unwrap();
    for key in ["task-1:aa", "task-1:bb", "task-10:aa", "task-2:aa"] {
        cache.get_or_parse(key, DAILY, start(), None).unwrap();
    }
    assert_eq!(cache.invalidate_for_owner("task-1:"), 2);
    assert!(cache.has("task-10:aa"));
    assert!(cache.has("task-2:aa"));
    assert!(!cache.invalidate("task-1:aa"));
}

#[test]
fn prune_removes_only_stale_entries() {
    let cache = RuleCache::new(8).unwrap();
    cache.get_or_parse("old", DAILY, start(), None).unwrap();
    let created = cache.peek("old").unwrap().created_at;

    let later = created + chrono::Duration::hours(2);
    assert_eq!(cache.prune_old_as_of(later, Duration::from_secs(3 * 3600)), 0);
    assert_eq!(cache.prune_old_as_of(later, Duration::from_secs(3600)), 1);
    assert!(cache.is_empty());
}

#[test]
fn compile_failures_are_not_cached() {
    let cache = RuleCache::new(4).unwrap();
    assert!(cache.get_or_parse("bad", "FREQ=DAILY;BYDAY=XX", start(), None).is_err());
    assert!(!cache.has("bad"));
    assert_eq!(cache.stats().total_misses, 0);
}

#[test]
fn zero_capacity_is_rejected() {
    assert!(RuleCache::new(0).is_err());
}

#[test]
fn concurrent_lookups_share_one_entry() {
    let cache = Arc::new(RuleCache::new(4).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    cache.get_or_parse("shared", DAILY, start(), None).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.total_hits + stats.total_misses, 400);
}
