//! Plan cache keyed by request signature.
//!
//! Lookups try the signature in caller order first, then with each name list
//! sorted so permutations of one request share a plan. Plans are built with
//! no lock held; when two callers race on the same signature the first
//! insertion wins and the other build is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// `feeds->fetches/targets/partial/debug`, each list joined with `,`.
pub fn cache_key(
    feeds: &[String],
    fetches: &[String],
    targets: &[String],
    is_partial_run: bool,
    debug_summary: &str,
) -> String {
    format!(
        "{}->{}/{}/{}/{}",
        feeds.join(","),
        fetches.join(","),
        targets.join(","),
        u8::from(is_partial_run),
        debug_summary
    )
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut v = names.to_vec();
    v.sort();
    v
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Builds that lost the insertion race.
    pub builds_discarded: u64,
}

/// The result of a lookup: the shared plan and the key it was found or stored under.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    pub key: String,
}

pub struct ExecutorCache<V> {
    entries: Mutex<HashMap<String, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl<V> Default for ExecutorCache<V> {
    fn default() -> Self {
        ExecutorCache {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }
}

impl<V> ExecutorCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the plan for the request, building it from the sorted name
    /// lists on a miss.
    pub fn get_or_create<F>(
        &self,
        feeds: &[String],
        fetches: &[String],
        targets: &[String],
        is_partial_run: bool,
        debug_summary: &str,
        build: F,
    ) -> Result<CacheEntry<V>>
    where
        F: FnOnce(&[String], &[String], &[String]) -> Result<V>,
    {
        let key = cache_key(feeds, fetches, targets, is_partial_run, debug_summary);
        if let Some(value) = self.entries.lock().get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheEntry { value, key });
        }

        let (feeds, fetches, targets) = (sorted(feeds), sorted(fetches), sorted(targets));
        let sorted_key = cache_key(&feeds, &fetches, &targets, is_partial_run, debug_summary);
        {
            let mut entries = self.entries.lock();
            if let Some(value) = entries.get(&sorted_key).cloned() {
                entries.insert(key, value.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry {
                    value,
                    key: sorted_key,
                });
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %sorted_key, "plan cache miss");
        let built = Arc::new(build(&feeds, &fetches, &targets)?);

        let mut entries = self.entries.lock();
        let value = match entries.get(&sorted_key) {
            Some(existing) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(key = %sorted_key, "discarding plan built concurrently with another caller");
                existing.clone()
            }
            None => {
                entries.insert(sorted_key.clone(), built.clone());
                built
            }
        };
        entries.entry(key).or_insert_with(|| value.clone());
        Ok(CacheEntry {
            value,
            key: sorted_key,
        })
    }

    /// Looks up an exact key without building.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of keys, counting unsorted aliases.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
