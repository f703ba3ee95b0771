//! Bounded keyed cache with idle TTL and max-size eviction.
//!
//! Values live in an arena of slots; the key map points at a slot plus the
//! generation it was written in. Freeing a slot bumps its generation, so a
//! [`CacheIndex`] held across an eviction resolves to `None` instead of to
//! whatever entry reused the slot.
//!
//! The cache does no locking of its own. Owners keep it behind an `RwLock`:
//! lookups need only `&self` (access times are atomics), inserts and
//! evictions need `&mut self`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fraction of `max_entries` that overflow eviction shrinks the cache to.
const LOW_WATER_PERCENT: usize = 90;

/// Stable handle to a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheIndex {
    slot: u32,
    generation: u32,
}

impl CacheIndex {
    /// Slot position in the arena.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation of the slot when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Occupant<V> {
    key: String,
    value: Arc<V>,
    /// Nanoseconds since the cache origin.
    last_accessed: AtomicU64,
}

struct Slot<V> {
    generation: u32,
    occupant: Option<Occupant<V>>,
}

/// Arena-backed map from string keys to shared values.
pub struct BoundedCache<V> {
    index: HashMap<String, CacheIndex>,
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    origin: Instant,
    max_entries: usize,
    idle_timeout: Duration,
}

impl<V> BoundedCache<V> {
    /// Create an empty cache. `origin` anchors the stored access times and
    /// must not be later than any `now` passed afterwards.
    pub fn new(max_entries: usize, idle_timeout: Duration, origin: Instant) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            origin,
            max_entries,
            idle_timeout,
        }
    }

    /// Look up a key and mark it accessed.
    pub fn get(&self, key: &str, now: Instant) -> Option<Arc<V>> {
        let idx = *self.index.get(key)?;
        let occupant = self.occupant(idx)?;
        occupant
            .last_accessed
            .fetch_max(self.stamp(now), Ordering::Relaxed);
        Some(Arc::clone(&occupant.value))
    }

    /// Handle for a key, without touching its access time.
    pub fn index_of(&self, key: &str) -> Option<CacheIndex> {
        self.index.get(key).copied()
    }

    /// Resolve a handle. Returns `None` once the entry has been evicted.
    pub fn get_by_index(&self, idx: CacheIndex) -> Option<Arc<V>> {
        self.occupant(idx).map(|o| Arc::clone(&o.value))
    }

    /// Return the existing value for `key`, or insert the one built by `make`.
    ///
    /// The boolean is `true` when a new entry was created.
    pub fn get_or_insert_with<F>(&mut self, key: &str, now: Instant, make: F) -> (Arc<V>, bool)
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(key, now) {
            return (existing, false);
        }

        let value = Arc::new(make());
        let occupant = Occupant {
            key: key.to_string(),
            value: Arc::clone(&value),
            last_accessed: AtomicU64::new(self.stamp(now)),
        };

        let idx = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.occupant = Some(occupant);
                CacheIndex {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    occupant: Some(occupant),
                });
                CacheIndex {
                    slot,
                    generation: 0,
                }
            }
        };

        self.index.insert(key.to_string(), idx);
        (value, true)
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Option<Arc<V>> {
        let idx = self.index.remove(key)?;
        self.release(idx.slot).map(|o| o.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Configured maximum size.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether the cache has grown past its maximum.
    pub fn is_over_capacity(&self) -> bool {
        self.index.len() > self.max_entries
    }

    /// Remove every entry idle for longer than the idle timeout.
    ///
    /// Entries for which `pinned` returns `true` are kept regardless of age.
    /// Returns the number of entries removed.
    pub fn evict_idle<P>(&mut self, now: Instant, pinned: P) -> usize
    where
        P: Fn(&V) -> bool,
    {
        let now_stamp = self.stamp(now);
        let ttl = self.idle_timeout.as_nanos() as u64;

        let expired: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let occupant = entry.occupant.as_ref()?;
                let idle = now_stamp.saturating_sub(occupant.last_accessed.load(Ordering::Relaxed));
                (idle > ttl && !pinned(&*occupant.value)).then_some(slot as u32)
            })
            .collect();

        self.remove_slots(&expired)
    }

    /// Bring the cache back under its maximum size.
    ///
    /// Idle entries go first, except those `keep_idle` accepts. If that is
    /// not enough, the least recently accessed unpinned entries are dropped
    /// until the cache is at the low water mark. Returns the number of
    /// entries removed.
    pub fn enforce_capacity<K, P>(&mut self, now: Instant, keep_idle: K, pinned: P) -> usize
    where
        K: Fn(&V) -> bool,
        P: Fn(&V) -> bool,
    {
        if !self.is_over_capacity() {
            return 0;
        }

        let mut removed = self.evict_idle(now, |v| pinned(v) || keep_idle(v));
        if !self.is_over_capacity() {
            return removed;
        }

        let target = self.max_entries * LOW_WATER_PERCENT / 100;
        let excess = self.index.len().saturating_sub(target);
        if excess == 0 {
            return removed;
        }

        let mut candidates: Vec<(u64, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let occupant = entry.occupant.as_ref()?;
                (!pinned(&*occupant.value))
                    .then(|| (occupant.last_accessed.load(Ordering::Relaxed), slot as u32))
            })
            .collect();

        if excess < candidates.len() {
            candidates.select_nth_unstable(excess - 1);
            candidates.truncate(excess);
        }

        let oldest: Vec<u32> = candidates.into_iter().map(|(_, slot)| slot).collect();
        removed += self.remove_slots(&oldest);
        removed
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        let occupied: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.occupant.is_some())
            .map(|(slot, _)| slot as u32)
            .collect();
        self.remove_slots(&occupied);
    }

    /// Iterate over live keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<V>)> {
        self.slots
            .iter()
            .filter_map(|entry| entry.occupant.as_ref())
            .map(|o| (o.key.as_str(), &o.value))
    }

    fn remove_slots(&mut self, slots: &[u32]) -> usize {
        let mut removed = 0;
        for &slot in slots {
            if let Some(occupant) = self.release(slot) {
                self.index.remove(&occupant.key);
                removed += 1;
            }
        }
        removed
    }

    fn release(&mut self, slot: u32) -> Option<Occupant<V>> {
        let entry = self.slots.get_mut(slot as usize)?;
        let occupant = entry.occupant.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        Some(occupant)
    }

    fn occupant(&self, idx: CacheIndex) -> Option<&Occupant<V>> {
        let entry = self.slots.get(idx.slot as usize)?;
        if entry.generation != idx.generation {
            return None;
        }
        entry.occupant.as_ref()
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_nanos() as u64
    }
}
