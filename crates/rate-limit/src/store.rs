use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Per-client counter state.
#[derive(Debug)]
pub struct Bucket {
    pub(crate) tokens_remaining: u64,
    pub(crate) window_start: Instant,
    /// Set by the sweeper, under this bucket's lock, when the entry is
    /// removed from the store.
    pub(crate) evicted: bool,
}

impl Bucket {
    fn full(capacity: u64, now: Instant) -> Self {
        Self {
            tokens_remaining: capacity,
            window_start: now,
            evicted: false,
        }
    }

    pub fn tokens_remaining(&self) -> u64 {
        self.tokens_remaining
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

pub type SharedBucket = Arc<Mutex<Bucket>>;

/// Concurrent map from client key to bucket.
///
/// Two lock levels: the map's `RwLock` covers insertion and removal of
/// keys, each bucket's own `Mutex` covers its token count. Lock order is
/// always map then bucket; the request path never holds a bucket lock while
/// touching the map.
pub struct BucketStore {
    buckets: RwLock<HashMap<String, SharedBucket>>,
    capacity: u64,
}

impl BucketStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Return the bucket for `key`, inserting a full one if it is missing.
    pub fn get_or_create(&self, key: &str, now: Instant) -> SharedBucket {
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between dropping the read lock
        // and acquiring the write lock.
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::full(self.capacity, now))));
        Arc::clone(bucket)
    }

    /// Remove every bucket whose window started more than `idle_after`
    /// before `now`. Returns the number of entries removed.
    ///
    /// Holds the map's write lock for the whole pass and each bucket's lock
    /// while deciding on and performing its removal.
    pub fn sweep(&self, now: Instant, idle_after: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();

        buckets.retain(|_key, bucket| {
            let mut state = lock_bucket(bucket);
            let idle = now.saturating_duration_since(state.window_start);
            if idle > idle_after {
                state.evicted = true;
                false
            } else {
                true
            }
        });

        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

/// Lock a bucket, recovering from poisoning. Bucket state is two plain
/// integers and is valid at every point a holder could have panicked.
pub(crate) fn lock_bucket(bucket: &Mutex<Bucket>) -> MutexGuard<'_, Bucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}
