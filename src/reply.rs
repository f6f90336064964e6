//! Reply routing: consumer to simulator de-multiplexing
//!
//! A consumer answers a dispatched batch with one reply tensor per declared
//! reply key. The router slices each row out of those tensors, looks up the
//! row's originating simulator in the batch routing metadata, and delivers a
//! per-row [`ReplyRecord`] to that simulator's [`Mailbox`].
//!
//! A simulator that has not yet blocked on its mailbox when the reply lands
//! gets the record parked in a bounded [`ReplyCache`], keyed by the sample
//! identity `{agent}-{game_counter}-{seq}`. The cache is checked before
//! blocking, so a raced reply is picked up immediately on the next wait.
//! Matching is strict on the full identity; a record from a previous episode
//! can never answer a later request.

use std::collections::{ HashMap, VecDeque };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use parking_lot::{ Condvar, Mutex };
use tracing::warn;

use crate::batch::BatchSlot;
use crate::constants::DONE_POLL_INTERVAL;
use crate::contract_error;
use crate::error::{ ConvoyError, Result };
use crate::event::{ RouteKey, Value };
use crate::spec::ReplyKey;

/// One simulator's share of a reply batch: the sample identity it answers
/// plus one value per declared reply key.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    /// Identity of the sample this record answers
    pub key: RouteKey,
    /// `(key name, value)` pairs, one per declared reply key, each flattened
    /// `[reply_t, *shape]`
    pub values: Vec<(Arc<str>, Value)>,
}

impl ReplyRecord {
    /// Value for a reply key by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }
}

/// A consumer's answer to one dispatched batch.
///
/// Each column is flattened `[reply_t, rows, *shape]` row-major, `rows` being
/// the dispatched batch's effective row count.
#[derive(Debug, Clone, Default)]
pub struct ReplyBatch {
    t: usize,
    columns: Vec<(Arc<str>, Value)>,
}

impl ReplyBatch {
    /// A reply covering `t` time steps per row
    pub fn new(t: usize) -> Self {
        Self { t: t.max(1), columns: Vec::new() }
    }

    /// Attach a reply column
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.columns.push((Arc::from(name), value));
        self
    }

    /// Time steps per row
    pub fn t(&self) -> usize {
        self.t
    }

    /// Column by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }
}

/// Bounded, insertion-ordered cache of replies that raced ahead of their
/// simulator's next wait. First insert per key wins; eviction is silent.
#[derive(Debug)]
pub struct ReplyCache {
    capacity: usize,
    map: HashMap<RouteKey, ReplyRecord>,
    order: VecDeque<RouteKey>,
    parked: u64,
    hits: u64,
    evictions: u64,
}

impl ReplyCache {
    /// An empty cache bounded to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
            parked: 0,
            hits: 0,
            evictions: 0,
        }
    }

    /// Park a record unless one with the same identity is already cached
    pub fn insert(&mut self, rec: ReplyRecord) {
        if self.map.contains_key(&rec.key) {
            return;
        }
        self.order.push_back(rec.key.clone());
        self.map.insert(rec.key.clone(), rec);
        self.parked += 1;

        while self.map.len() > self.capacity {
            // Order entries whose record was already taken are skipped.
            match self.order.pop_front() {
                Some(stale) => {
                    if self.map.remove(&stale).is_some() {
                        self.evictions += 1;
                    }
                }
                None => break,
            }
        }
    }

    /// Remove and return the record for the exact identity, if cached
    pub fn take(&mut self, key: &RouteKey) -> Option<ReplyRecord> {
        let rec = self.map.remove(key);
        if rec.is_some() {
            self.hits += 1;
        }
        rec
    }

    /// Records currently parked
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `(parked, hits, evictions)` lifetime counters
    pub fn counters(&self) -> (u64, u64, u64) {
        (self.parked, self.hits, self.evictions)
    }
}

#[derive(Default)]
struct MailboxState {
    awaiting: Option<RouteKey>,
    reply: Option<ReplyRecord>,
}

/// At-most-one-slot reply channel between a collector and one simulator.
///
/// The simulator blocks in [`Mailbox::wait_reply`] after submitting an event;
/// the router wakes it through [`Mailbox::deliver`]. Both sides agree on the
/// sample identity, so a stale record can never unblock the wrong wait.
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<MailboxState>,
    cv: Condvar,
}

impl Mailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the reply for `key` arrives, checking the shared cache
    /// first and re-checking `done` at the poll interval.
    pub fn wait_reply(
        &self,
        cache: &Mutex<ReplyCache>,
        key: RouteKey,
        done: &AtomicBool
    ) -> Result<ReplyRecord> {
        let mut state = self.inner.lock();

        // A reply that raced ahead of this wait is already parked.
        if let Some(rec) = cache.lock().take(&key) {
            return Ok(rec);
        }

        debug_assert!(state.awaiting.is_none(), "one reply wait at a time per mailbox");
        state.awaiting = Some(key);

        loop {
            if let Some(rec) = state.reply.take() {
                state.awaiting = None;
                return Ok(rec);
            }
            if done.load(Ordering::Acquire) {
                state.awaiting = None;
                return Err(ConvoyError::Stopped);
            }
            self.cv.wait_for(&mut state, DONE_POLL_INTERVAL);
        }
    }

    /// Deliver a record: wake the matching waiter, or park in the cache.
    pub fn deliver(&self, cache: &Mutex<ReplyCache>, rec: ReplyRecord) {
        let mut state = self.inner.lock();
        if state.awaiting.as_ref() == Some(&rec.key) && state.reply.is_none() {
            state.reply = Some(rec);
            self.cv.notify_one();
        } else {
            cache.lock().insert(rec);
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").finish_non_exhaustive()
    }
}

/// Per-collector reply de-multiplexer
#[derive(Debug)]
pub struct ReplyRouter {
    reply_keys: Arc<[ReplyKey]>,
    reply_t: usize,
    cache: Arc<Mutex<ReplyCache>>,
}

impl ReplyRouter {
    /// Create a router for the given reply key set
    pub fn new(reply_keys: Arc<[ReplyKey]>, reply_t: usize, cache_capacity: usize) -> Self {
        Self {
            reply_keys,
            reply_t,
            cache: Arc::new(Mutex::new(ReplyCache::new(cache_capacity))),
        }
    }

    /// Shared reply cache, also consulted by simulator-side waits
    pub fn cache(&self) -> &Arc<Mutex<ReplyCache>> {
        &self.cache
    }

    /// Validate a reply against the dispatched slot and deliver it row by row
    pub fn route(&self, slot: &BatchSlot, reply: &ReplyBatch) -> Result<()> {
        let routes = slot.routes();
        let rows = routes.len();
        debug_assert_eq!(rows, slot.rows());

        if reply.t() != self.reply_t {
            return Err(
                contract_error!("reply covers {} time steps, consumer declared {}", reply.t(), self.reply_t)
            );
        }

        // Validate every declared key before delivering anything.
        let mut columns = Vec::with_capacity(self.reply_keys.len());
        for key in self.reply_keys.iter() {
            let value = reply
                .get(&key.name)
                .ok_or_else(|| contract_error!("reply is missing declared key '{}'", key.name))?;
            if value.dtype() != key.spec.dtype {
                return Err(
                    contract_error!(
                        "reply key '{}' has element type {:?}, declared {:?}",
                        key.name,
                        value.dtype(),
                        key.spec.dtype
                    )
                );
            }
            let numel = key.spec.numel();
            let expected = self.reply_t * rows * numel;
            if value.len() != expected {
                return Err(
                    contract_error!(
                        "reply key '{}' has {} elements for {} dispatched rows, expected {}",
                        key.name,
                        value.len(),
                        rows,
                        expected
                    )
                );
            }
            columns.push((key.name.clone(), value, numel));
        }

        for (i, route) in routes.iter().enumerate() {
            let values = columns
                .iter()
                .map(|(name, value, numel)| {
                    (name.clone(), gather_row(value, self.reply_t, rows, *numel, i))
                })
                .collect();
            let rec = ReplyRecord { key: route.key.clone(), values };
            route.sender.deliver(&self.cache, rec);
        }
        Ok(())
    }

    /// Log cache pressure; called from the summary path
    pub fn report_pressure(&self, collector: &str) {
        let cache = self.cache.lock();
        let (parked, _, evictions) = cache.counters();
        if evictions > 0 {
            warn!(collector, parked, evictions, "reply cache evicted records");
        }
    }
}

/// Slice row `row` out of a `[reply_t, rows, numel]` column
fn gather_row(value: &Value, reply_t: usize, rows: usize, numel: usize, row: usize) -> Value {
    let mut out = value.slice_block(row * numel, numel);
    for tt in 1..reply_t {
        out.extend_from(&value.slice_block((tt * rows + row) * numel, numel));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seq: u32) -> RouteKey {
        RouteKey { agent: Arc::from("game-0"), game_counter: 0, seq }
    }

    fn record(seq: u32, action: i64) -> ReplyRecord {
        ReplyRecord {
            key: key(seq),
            values: vec![(Arc::from("a"), Value::scalar_i64(action))],
        }
    }

    #[test]
    fn test_cache_first_insert_wins() {
        let mut cache = ReplyCache::new(8);
        cache.insert(record(0, 1));
        cache.insert(record(0, 2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take(&key(0)).unwrap().get("a").unwrap().as_i64(), Some(1));
        assert!(cache.take(&key(0)).is_none());
    }

    #[test]
    fn test_cache_eviction_is_fifo_and_silent() {
        let mut cache = ReplyCache::new(2);
        cache.insert(record(0, 0));
        cache.insert(record(1, 1));
        cache.insert(record(2, 2));
        assert_eq!(cache.len(), 2);
        assert!(cache.take(&key(0)).is_none());
        assert!(cache.take(&key(1)).is_some());
        assert!(cache.take(&key(2)).is_some());

        let (parked, hits, evictions) = cache.counters();
        assert_eq!((parked, hits, evictions), (3, 2, 1));
    }

    #[test]
    fn test_mailbox_parks_unclaimed_reply() {
        let mailbox = Mailbox::new();
        let cache = Mutex::new(ReplyCache::new(8));
        let done = AtomicBool::new(false);

        // No waiter yet: the record lands in the cache.
        mailbox.deliver(&cache, record(5, 9));
        assert_eq!(cache.lock().len(), 1);

        // The wait picks it straight out of the cache.
        let rec = mailbox.wait_reply(&cache, key(5), &done).unwrap();
        assert_eq!(rec.get("a").unwrap().as_i64(), Some(9));
        assert!(cache.lock().is_empty());
    }

    #[test]
    fn test_mailbox_wakes_waiter() {
        use std::sync::Arc as StdArc;
        use std::thread;
        use std::time::Duration;

        let mailbox = StdArc::new(Mailbox::new());
        let cache = StdArc::new(Mutex::new(ReplyCache::new(8)));
        let done = StdArc::new(AtomicBool::new(false));

        let waiter = {
            let (mailbox, cache, done) = (mailbox.clone(), cache.clone(), done.clone());
            thread::spawn(move || mailbox.wait_reply(&cache, key(3), &done))
        };

        thread::sleep(Duration::from_millis(20));
        mailbox.deliver(&cache, record(3, 4));

        let rec = waiter.join().unwrap().unwrap();
        assert_eq!(rec.key, key(3));
        // Delivered directly, never parked.
        assert!(cache.lock().is_empty());
    }

    #[test]
    fn test_mailbox_wait_aborts_on_done() {
        let mailbox = Mailbox::new();
        let cache = Mutex::new(ReplyCache::new(8));
        let done = AtomicBool::new(true);

        let err = mailbox.wait_reply(&cache, key(0), &done).unwrap_err();
        assert!(err.is_shutdown());
    }

    #[test]
    fn test_gather_row_multi_step() {
        // [reply_t = 2, rows = 3, numel = 1]
        let col = Value::I64(vec![10, 11, 12, 20, 21, 22]);
        assert_eq!(gather_row(&col, 2, 3, 1, 1), Value::I64(vec![11, 21]));
        assert_eq!(gather_row(&col, 2, 3, 1, 2), Value::I64(vec![12, 22]));
    }
}
