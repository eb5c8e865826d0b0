//! Nonce-indexed table of outstanding queries.
//!
//! Every request/response exchange on the wire is owned by a
//! [`QueryEntry`]: a random 16-byte nonce, a hard deadline, an optional
//! retry timer and up to three callbacks. A single background scheduler
//! thread wakes at the nearest timer, fires retry hooks while retries
//! remain and expiry hooks when the deadline passes. Successful
//! responses resolve the entry from the receive path, which cancels any
//! pending retries and the expiry.
//!
//! For one entry, at most one callback runs at a time and exactly one of
//! success or expiry fires before removal (or neither, when the entry is
//! deactivated). Distinct entries run their callbacks concurrently.

pub mod data;

pub use self::data::QueryData;

use std::{
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::{Condvar, Mutex};

/// Identifier of an outstanding query, unique across the process while
/// the entry is live.
pub type Nonce = [u8; 16];

/// Hook invoked with exclusive access to the entry.
pub type Callback = Box<dyn Fn(&mut QueryEntry) + Send>;

/// Scan again this soon when an entry is busy running a callback.
const BUSY_RESCAN: Duration = Duration::from_millis(20);

/// Upper bound on one scheduler sleep, so the thread notices when the
/// owning table has been dropped.
const MAX_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Resolved,
    Expired,
    Deactivated,
}

pub struct QueryEntry {
    pub nonce: Nonce,
    pub data: QueryData,
    deadline: Instant,
    expire_after: Duration,
    fire_after: Option<Instant>,
    interval: Option<Duration>,
    retries_left: u32,
    state: State,
    on_success: Option<Callback>,
    on_retry: Option<Callback>,
    on_expire: Option<Callback>,
}

impl QueryEntry {
    /// Re-arm the retry timer and push the deadline out by the original
    /// expiry window. Retry hooks call this before re-sending.
    pub fn update(&mut self) {
        if let Some(interval) = self.interval {
            self.update_after(interval);
        }
    }

    /// Like [`QueryEntry::update`] with an explicit retry delay.
    pub fn update_after(&mut self, delay: Duration) {
        let now = Instant::now();
        self.fire_after = Some(now + delay);
        self.deadline = now + self.expire_after;
    }

    /// Time left until the entry expires.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }
}

/// Builder for a query entry.
pub struct Query {
    data: QueryData,
    expire_after: Duration,
    interval: Option<Duration>,
    retries: u32,
    on_success: Option<Callback>,
    on_retry: Option<Callback>,
    on_expire: Option<Callback>,
}

impl Query {
    pub fn new(data: QueryData, expire_after: Duration) -> Self {
        Self {
            data,
            expire_after,
            interval: None,
            retries: 0,
            on_success: None,
            on_retry: None,
            on_expire: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&mut QueryEntry) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_retry(mut self, hook: impl Fn(&mut QueryEntry) + Send + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn on_expire(mut self, hook: impl Fn(&mut QueryEntry) + Send + 'static) -> Self {
        self.on_expire = Some(Box::new(hook));
        self
    }
}

type Cell = Arc<Mutex<QueryEntry>>;

struct Shared {
    entries: Mutex<HashMap<Nonce, Cell>>,
    signal: Condvar,
}

/// The process-wide query table.
///
/// Clones share the same table and scheduler.
#[derive(Clone)]
pub struct Ticker {
    shared: Arc<Shared>,
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            signal: Condvar::new(),
        });

        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("query-ticker".to_string())
            .spawn(move || scheduler_loop(weak))
            .expect("spawn query ticker thread");

        Self { shared }
    }

    /// Insert a new entry under a fresh random nonce and arm its timers.
    pub fn insert(&self, query: Query) -> Nonce {
        let now = Instant::now();
        let mut entries = self.shared.entries.lock();

        let mut nonce: Nonce = rand::random();
        while entries.contains_key(&nonce) {
            nonce = rand::random();
        }

        entries.insert(
            nonce,
            Arc::new(Mutex::new(QueryEntry {
                nonce,
                data: query.data,
                deadline: now + query.expire_after,
                expire_after: query.expire_after,
                fire_after: query.interval.map(|interval| now + interval),
                interval: query.interval,
                retries_left: query.retries,
                state: State::Active,
                on_success: query.on_success,
                on_retry: query.on_retry,
                on_expire: query.on_expire,
            })),
        );

        self.shared.signal.notify_one();
        nonce
    }

    /// Schedule a one-shot hook; sugar for an entry with only an expiry
    /// callback.
    pub fn exec_after(
        &self,
        delay: Duration,
        data: QueryData,
        hook: impl Fn(&mut QueryEntry) + Send + 'static,
    ) -> Nonce {
        self.insert(Query::new(data, delay).on_expire(hook))
    }

    fn take(&self, nonce: &Nonce) -> Option<Cell> {
        self.shared.entries.lock().remove(nonce)
    }

    fn peek(&self, nonce: &Nonce) -> Option<Cell> {
        self.shared.entries.lock().get(nonce).cloned()
    }

    /// Resolve an entry: fire its success hook and remove it. Pending
    /// retries and the expiry are cancelled. Returns whether the nonce
    /// named a live entry.
    pub fn resolve(&self, nonce: &Nonce) -> bool {
        let Some(cell) = self.take(nonce) else {
            return false;
        };

        let mut entry = cell.lock();
        if entry.state != State::Active {
            return false;
        }

        entry.state = State::Resolved;
        if let Some(hook) = entry.on_success.take() {
            hook(&mut entry);
        }

        true
    }

    /// Remove an entry without firing any callback. Idempotent.
    pub fn deactivate(&self, nonce: &Nonce) {
        if let Some(cell) = self.take(nonce) {
            cell.lock().state = State::Deactivated;
        }
    }

    /// Fire the retry hook once without consuming a retry; the initial
    /// transmission of every retried exchange goes through here.
    pub fn kick(&self, nonce: &Nonce) {
        let Some(cell) = self.peek(nonce) else {
            return;
        };

        let mut entry = cell.lock();
        if entry.state != State::Active {
            return;
        }

        if let Some(hook) = entry.on_retry.take() {
            hook(&mut entry);
            entry.on_retry = Some(hook);
        }

        self.shared.signal.notify_one();
    }

    /// Run a closure with exclusive access to a live entry.
    pub fn with_entry<R>(&self, nonce: &Nonce, f: impl FnOnce(&mut QueryEntry) -> R) -> Option<R> {
        let cell = self.peek(nonce)?;

        let result = {
            let mut entry = cell.lock();
            if entry.state != State::Active {
                return None;
            }

            f(&mut entry)
        };

        // Timing fields may have moved; let the scheduler re-arm.
        self.shared.signal.notify_one();
        Some(result)
    }

    /// Time left until an entry expires.
    pub fn remaining(&self, nonce: &Nonce) -> Option<Duration> {
        self.with_entry(nonce, |entry| entry.remaining())
    }

    /// Pull an entry's deadline closer, if it is further away than the
    /// given delay.
    pub fn expire_within(&self, nonce: &Nonce, delay: Duration) {
        self.with_entry(nonce, |entry| {
            entry.deadline = entry.deadline.min(Instant::now() + delay);
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }
}

enum Due {
    Retry(Cell),
    Expire(Cell),
}

fn scheduler_loop(weak: Weak<Shared>) {
    let mut due: Vec<Due> = Vec::new();

    while let Some(shared) = weak.upgrade() {
        let mut entries = shared.entries.lock();
        let now = Instant::now();
        let mut nearest = now + MAX_SLEEP;

        entries.retain(|_, cell| {
            // A held lock means a callback is mid-flight on another
            // thread; look again shortly instead of blocking the whole
            // table behind it.
            let Some(mut entry) = cell.try_lock() else {
                nearest = nearest.min(now + BUSY_RESCAN);
                return true;
            };

            if entry.state != State::Active {
                return false;
            }

            if entry.deadline <= now {
                entry.state = State::Expired;
                due.push(Due::Expire(cell.clone()));
                return false;
            }

            nearest = nearest.min(entry.deadline);
            if let Some(fire_after) = entry.fire_after {
                if entry.retries_left > 0 {
                    if fire_after <= now {
                        entry.retries_left -= 1;
                        entry.fire_after = entry.interval.map(|interval| now + interval);
                        due.push(Due::Retry(cell.clone()));
                    }

                    if let Some(fire_after) = entry.fire_after {
                        nearest = nearest.min(fire_after);
                    }
                }
            }

            true
        });

        if due.is_empty() {
            shared.signal.wait_until(&mut entries, nearest);
            continue;
        }

        drop(entries);
        for item in due.drain(..) {
            match item {
                Due::Retry(cell) => {
                    let mut entry = cell.lock();
                    if entry.state != State::Active {
                        continue;
                    }

                    if let Some(hook) = entry.on_retry.take() {
                        hook(&mut entry);
                        entry.on_retry = Some(hook);
                    }
                }
                Due::Expire(cell) => {
                    let mut entry = cell.lock();
                    if entry.state != State::Expired {
                        continue;
                    }

                    log::trace!("query expired: nonce={:02x?}", &entry.nonce[..4]);
                    if let Some(hook) = entry.on_expire.take() {
                        hook(&mut entry);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use codec::types::{DomainId, NodeId};

    use super::*;

    fn ping_data() -> QueryData {
        QueryData::Ping {
            domain_id: DomainId::GLOBAL,
            node_id: NodeId::from([1u8; 32]),
        }
    }

    #[test]
    fn expiry_fires_exactly_once() {
        let ticker = Ticker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let hits = fired.clone();
        ticker.insert(
            Query::new(ping_data(), Duration::from_millis(50))
                .on_expire(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
        );

        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ticker.len(), 0);
    }

    #[test]
    fn retries_are_bounded() {
        let ticker = Ticker::new();
        let sent = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));

        let sent_ = sent.clone();
        let expired_ = expired.clone();
        let nonce = ticker.insert(
            Query::new(ping_data(), Duration::from_millis(120))
                .interval(Duration::from_millis(40))
                .retries(3)
                .on_retry(move |entry| {
                    entry.update();
                    sent_.fetch_add(1, Ordering::SeqCst);
                })
                .on_expire(move |_| {
                    expired_.fetch_add(1, Ordering::SeqCst);
                }),
        );
        ticker.kick(&nonce);

        thread::sleep(Duration::from_millis(600));

        // One initial send plus every retry, then a single expiry.
        assert_eq!(sent.load(Ordering::SeqCst), 4);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_cancels_retries_and_expiry() {
        let ticker = Ticker::new();
        let retried = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));
        let resolved = Arc::new(AtomicUsize::new(0));

        let retried_ = retried.clone();
        let expired_ = expired.clone();
        let resolved_ = resolved.clone();
        let nonce = ticker.insert(
            Query::new(ping_data(), Duration::from_millis(150))
                .interval(Duration::from_millis(50))
                .retries(5)
                .on_retry(move |entry| {
                    entry.update();
                    retried_.fetch_add(1, Ordering::SeqCst);
                })
                .on_success(move |_| {
                    resolved_.fetch_add(1, Ordering::SeqCst);
                })
                .on_expire(move |_| {
                    expired_.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert!(ticker.resolve(&nonce));
        assert!(!ticker.resolve(&nonce));

        thread::sleep(Duration::from_millis(400));
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(retried.load(Ordering::SeqCst), 0);
        assert_eq!(expired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deactivate_fires_nothing() {
        let ticker = Ticker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let hits = fired.clone();
        let nonce = ticker.insert(
            Query::new(ping_data(), Duration::from_millis(50))
                .on_success({
                    let hits = hits.clone();
                    move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .on_expire(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
        );

        ticker.deactivate(&nonce);
        ticker.deactivate(&nonce);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!ticker.resolve(&nonce));
    }

    #[test]
    fn expire_within_pulls_the_deadline_closer() {
        let ticker = Ticker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let hits = fired.clone();
        let nonce = ticker.exec_after(Duration::from_secs(600), ping_data(), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(ticker.remaining(&nonce).unwrap() > Duration::from_secs(500));
        ticker.expire_within(&nonce, Duration::from_millis(50));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
