//! Two-tier, content-addressed result cache.
//!
//! Each tier has its own lock, capacity and TTL. Reads check the fast tier
//! first; a slow-tier hit is promoted into the fast tier before returning.
//! No lock is ever held across tiers or outside a single bookkeeping step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cognicode_core::Fingerprint;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{CacheConfig, TierConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Fast,
    Slow,
}

/// A cached result. `tier` is the tier that served it.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: serde_json::Value,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub size_bytes: usize,
    pub tier: TierKind,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TierStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub fast: TierStats,
    pub slow: TierStats,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct TierState {
    slots: HashMap<Fingerprint, Slot>,
    // access tick -> fingerprint; the first key is the least recently used
    recency: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
}

impl TierState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }
}

struct Tier {
    kind: TierKind,
    capacity: usize,
    ttl: Duration,
    state: Mutex<TierState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Tier {
    fn new(kind: TierKind, config: &TierConfig) -> Self {
        Self {
            kind,
            capacity: config.capacity,
            ttl: config.ttl,
            state: Mutex::new(TierState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) >= self.ttl
    }

    fn get(&self, fingerprint: &Fingerprint, now: Instant) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let expired = match state.slots.get(fingerprint) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(slot) => self.is_expired(&slot.entry, now),
        };
        if expired {
            state.remove(fingerprint);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = state.bump();
        let state = &mut *state;
        let slot = state.slots.get_mut(fingerprint)?;
        state.recency.remove(&slot.tick);
        state.recency.insert(tick, *fingerprint);
        slot.tick = tick;
        slot.entry.last_accessed_at = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    /// Mark a live entry as most recently used. No statistics change.
    fn touch(&self, fingerprint: &Fingerprint, now: Instant) {
        let mut state = self.state.lock();
        let tick = state.next_tick + 1;
        let state = &mut *state;
        let Some(slot) = state.slots.get_mut(fingerprint) else {
            return;
        };
        if self.is_expired(&slot.entry, now) {
            return;
        }
        state.next_tick = tick;
        state.recency.remove(&slot.tick);
        state.recency.insert(tick, *fingerprint);
        slot.tick = tick;
        slot.entry.last_accessed_at = now;
    }

    fn contains(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.state
            .lock()
            .slots
            .get(fingerprint)
            .is_some_and(|slot| !self.is_expired(&slot.entry, now))
    }

    /// Store an entry first cached at `created_at`. Entries already past
    /// this tier's TTL are not stored.
    fn insert(
        &self,
        fingerprint: Fingerprint,
        result: serde_json::Value,
        size_bytes: usize,
        created_at: Instant,
        now: Instant,
    ) {
        if self.capacity == 0 || now.saturating_duration_since(created_at) >= self.ttl {
            return;
        }
        let mut state = self.state.lock();
        state.remove(&fingerprint);
        while state.slots.len() >= self.capacity {
            let Some((_, victim)) = state.recency.pop_first() else {
                break;
            };
            state.slots.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(tier = ?self.kind, fingerprint = %victim.short(), "cache eviction");
        }
        let tick = state.bump();
        state.recency.insert(tick, fingerprint);
        state.slots.insert(
            fingerprint,
            Slot {
                entry: CacheEntry {
                    fingerprint,
                    result,
                    created_at,
                    last_accessed_at: now,
                    size_bytes,
                    tier: self.kind,
                },
                tick,
            },
        );
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<Fingerprint> = state
            .slots
            .iter()
            .filter(|(_, slot)| self.is_expired(&slot.entry, now))
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &expired {
            state.remove(fp);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.recency.clear();
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: self.state.lock().slots.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Fingerprint-keyed result cache with a small fast tier and a large slow tier.
pub struct FingerprintCache {
    fast: Tier,
    slow: Tier,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FingerprintCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            fast: Tier::new(TierKind::Fast, &config.fast),
            slow: Tier::new(TierKind::Slow, &config.slow),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Instant::now();
        if let Some(entry) = self.fast.get(fingerprint, now) {
            // keep the slow copy from aging out of LRU order behind fast hits
            self.slow.touch(fingerprint, now);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }
        if let Some(entry) = self.slow.get(fingerprint, now) {
            self.fast.insert(
                *fingerprint,
                entry.result.clone(),
                entry.size_bytes,
                entry.created_at,
                now,
            );
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-through into both tiers.
    pub fn put(&self, fingerprint: Fingerprint, result: serde_json::Value) {
        let now = Instant::now();
        let size_bytes = result.to_string().len();
        self.slow.insert(fingerprint, result.clone(), size_bytes, now, now);
        self.fast.insert(fingerprint, result, size_bytes, now, now);
    }

    /// Live entry in either tier. Does not touch recency or statistics.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        self.fast.contains(fingerprint, now) || self.slow.contains(fingerprint, now)
    }

    pub fn invalidate_all(&self) {
        self.fast.clear();
        self.slow.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.fast.purge_expired(now) + self.slow.purge_expired(now)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            fast: self.fast.stats(),
            slow: self.slow.stats(),
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
        }
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
