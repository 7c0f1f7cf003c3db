//! LRU cache of compiled recurrence rules.
//!
//! Compiling an RRULE is far more expensive than evaluating it, and the
//! scheduler re-evaluates the same rules on every check. Entries are keyed
//! by a caller-chosen string (typically `"<task id>:<rule hash>"`) so a
//! task's rules can be dropped together via [`RuleCache::invalidate_for_owner`].

use crate::error::{CadenceError, Result};
use crate::recurrence::rule::CompiledRule;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// One cached rule with its access bookkeeping.
#[derive(Debug, Clone)]
pub struct RuleCacheEntry {
    pub key: String,
    pub rule: Arc<CompiledRule>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up yet.
    pub hit_rate: f64,
}

struct CacheState {
    entries: LruCache<String, RuleCacheEntry>,
    total_hits: u64,
    total_misses: u64,
}

/// Thread-safe LRU cache of [`CompiledRule`]s.
pub struct RuleCache {
    state: Mutex<CacheState>,
    max_size: usize,
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache")
            .field("max_size", &self.max_size)
            .field("size", &self.len())
            .finish()
    }
}

impl RuleCache {
    /// Cache holding at most `max_size` compiled rules.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Config`] when `max_size` is zero.
    pub fn new(max_size: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            CadenceError::Config("rule cache size must be a positive integer".to_owned())
        })?;
        Ok(Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                total_hits: 0,
                total_misses: 0,
            }),
            max_size,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the rule cached under `key`, compiling `rule` on a miss.
    ///
    /// A hit returns the cached rule even if `rule` differs; callers encode
    /// the rule text in the key.
    ///
    /// # Errors
    ///
    /// Propagates compile errors; nothing is cached for them.
    pub fn get_or_parse(
        &self,
        key: &str,
        rule: &str,
        dtstart: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<Arc<CompiledRule>> {
        let now = Utc::now();
        {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.hits += 1;
                entry.last_access = now;
                let rule = Arc::clone(&entry.rule);
                state.total_hits += 1;
                return Ok(rule);
            }
        }

        // Compile outside the lock.
        let compiled = Arc::new(CompiledRule::compile(rule, dtstart, timezone)?);

        let mut state = self.lock();
        state.total_misses += 1;
        let entry = RuleCacheEntry {
            key: key.to_owned(),
            rule: Arc::clone(&compiled),
            created_at: now,
            last_access: now,
            hits: 0,
        };
        if let Some((evicted, _)) = state.entries.push(key.to_owned(), entry)
            && evicted != key
        {
            debug!(key = %evicted, "evicted least recently used rule");
        }
        Ok(compiled)
    }

    /// `true` if `key` is cached. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        self.lock().entries.contains(key)
    }

    /// Remove `key`; returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Remove every key starting with `prefix`; returns how many were removed.
    pub fn invalidate_for_owner(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.pop(key);
        }
        doomed.len()
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Cached keys, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Number of cached rules.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry metadata for `key` without touching its LRU position.
    pub fn peek(&self, key: &str) -> Option<RuleCacheEntry> {
        self.lock().entries.peek(key).cloned()
    }

    pub fn stats(&self) -> RuleCacheStats {
        let state = self.lock();
        let lookups = state.total_hits + state.total_misses;
        RuleCacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            total_hits: state.total_hits,
            total_misses: state.total_misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.total_hits as f64 / lookups as f64
            },
        }
    }

    /// Remove entries created more than `max_age` ago.
    pub fn prune_old(&self, max_age: Duration) -> usize {
        self.prune_old_as_of(Utc::now(), max_age)
    }

    /// [`prune_old`](Self::prune_old) against an explicit clock.
    pub fn prune_old_as_of(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return 0;
        };
        let mut state = self.lock();
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            state.entries.pop(key);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "pruned stale compiled rules");
        }
        stale.len()
    }
}
