//! Per-client counting state and the stores that own it.
//!
//! A store is the only shared mutable resource in the limiter. Every mutation on a key
//! is serialized by the store, and reads hand back copies so nothing outside can change
//! a [`ClientState`] behind the store's back.

use crate::clock::{saturating_add, to_delta};
use crate::config::WindowPolicy;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Counting state for one client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientState {
    /// Requests accepted into the current window, including the one that tripped the limit.
    pub request_count: u64,
    /// When the current window began.
    pub window_start: DateTime<Utc>,
    /// Denied until this instant; `None` when not blocked.
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Outcome of [`ClientStateStore::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Counted and let through.
    Admitted,
    /// Counted, pushed the client over the limit, and started a block.
    Tripped,
    /// Rejected without counting because an earlier block is still running.
    Blocked,
}

impl Verdict {
    pub fn is_allowed(self) -> bool {
        matches!(self, Verdict::Admitted)
    }
}

impl ClientState {
    /// State for a client's first counted request.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self { request_count: 1, window_start: now, blocked_until: None }
    }

    /// Begin a new window at `now` with the current request counted.
    ///
    /// The count still goes through the limit check, so a limit of zero trips on the
    /// opening request.
    pub fn start(now: DateTime<Utc>, policy: &WindowPolicy) -> (Self, Verdict) {
        let mut state = Self::fresh(now);
        if state.request_count > policy.max_requests {
            state.blocked_until = Some(saturating_add(now, policy.block));
            (state, Verdict::Tripped)
        } else {
            (state, Verdict::Admitted)
        }
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Apply one request at `now` to existing state.
    ///
    /// Checks run in a fixed order: active block, expired block, elapsed window, then
    /// count. Both expiry paths restart the window with the current request counted and
    /// checked against the limit.
    pub fn admit(&mut self, now: DateTime<Utc>, policy: &WindowPolicy) -> Verdict {
        match self.blocked_until {
            Some(until) if now < until => return Verdict::Blocked,
            Some(_) => return self.restart(now, policy),
            None => {}
        }

        if now.signed_duration_since(self.window_start) >= to_delta(policy.window) {
            return self.restart(now, policy);
        }

        self.request_count = self.request_count.saturating_add(1);
        if self.request_count > policy.max_requests {
            self.blocked_until = Some(saturating_add(now, policy.block));
            Verdict::Tripped
        } else {
            Verdict::Admitted
        }
    }

    fn restart(&mut self, now: DateTime<Utc>, policy: &WindowPolicy) -> Verdict {
        let (state, verdict) = Self::start(now, policy);
        *self = state;
        verdict
    }
}

/// Storage interface for per-client state.
///
/// All operations must be safe under any number of concurrent callers, on the same key
/// or different ones. Backends that can fail (a remote store, say) report it through
/// `Error`; the limiter passes that along instead of guessing allow or deny.
pub trait ClientStateStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Copy of the state for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<ClientState>, Self::Error>;

    /// Replace the state for `key` wholesale.
    fn set(&self, key: &str, state: ClientState) -> Result<(), Self::Error>;

    /// Bump the count for `key` and return the new value.
    ///
    /// A missing key is created with a count of 1 and a window starting at `now`.
    fn increment(&self, key: &str, now: DateTime<Utc>) -> Result<u64, Self::Error>;

    /// Restart the window for `key` at `window_start` with a count of 1 and no block.
    fn reset_window(&self, key: &str, window_start: DateTime<Utc>) -> Result<(), Self::Error>;

    /// Block an existing client until `until`. Unknown keys are left alone.
    fn block_until(&self, key: &str, until: DateTime<Utc>) -> Result<(), Self::Error>;

    /// Forget one client.
    fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Forget every client.
    fn clear(&self) -> Result<(), Self::Error>;

    /// Run the whole window/block state machine for one request under a single
    /// critical section, returning a copy of the resulting state.
    fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &WindowPolicy,
    ) -> Result<(ClientState, Verdict), Self::Error>;
}

/// In-memory store behind a single reader-writer lock.
///
/// Reads share the lock; every mutation, including the compound check, takes it
/// exclusively. Clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    clients: Arc<RwLock<HashMap<String, ClientState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // No critical section below can leave the map half-updated, so a poisoned lock
    // still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ClientState>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ClientState>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientStateStore for InMemoryStore {
    type Error = Infallible;

    fn get(&self, key: &str) -> Result<Option<ClientState>, Self::Error> {
        Ok(self.read().get(key).copied())
    }

    fn set(&self, key: &str, state: ClientState) -> Result<(), Self::Error> {
        self.write().insert(key.to_owned(), state);
        Ok(())
    }

    fn increment(&self, key: &str, now: DateTime<Utc>) -> Result<u64, Self::Error> {
        let mut clients = self.write();
        match clients.get_mut(key) {
            Some(state) => {
                state.request_count = state.request_count.saturating_add(1);
                Ok(state.request_count)
            }
            None => {
                clients.insert(key.to_owned(), ClientState::fresh(now));
                Ok(1)
            }
        }
    }

    fn reset_window(&self, key: &str, window_start: DateTime<Utc>) -> Result<(), Self::Error> {
        self.write().insert(key.to_owned(), ClientState::fresh(window_start));
        Ok(())
    }

    fn block_until(&self, key: &str, until: DateTime<Utc>) -> Result<(), Self::Error> {
        if let Some(state) = self.write().get_mut(key) {
            state.blocked_until = Some(until);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), Self::Error> {
        self.write().clear();
        Ok(())
    }

    fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &WindowPolicy,
    ) -> Result<(ClientState, Verdict), Self::Error> {
        let mut clients = self.write();
        if let Some(state) = clients.get_mut(key) {
            let verdict = state.admit(now, policy);
            return Ok((*state, verdict));
        }
        let (state, verdict) = ClientState::start(now, policy);
        clients.insert(key.to_owned(), state);
        Ok((state, verdict))
    }
}

/// In-memory store sharded with [`DashMap`].
///
/// Operations on keys in different shards never contend. Each compound check holds
/// the write lock of its key's shard for its whole duration.
#[derive(Default, Clone, Debug)]
pub struct ShardedStore {
    clients: Arc<DashMap<String, ClientState>>,
}

impl ShardedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClientStateStore for ShardedStore {
    type Error = Infallible;

    fn get(&self, key: &str) -> Result<Option<ClientState>, Self::Error> {
        Ok(self.clients.get(key).map(|entry| *entry.value()))
    }

    fn set(&self, key: &str, state: ClientState) -> Result<(), Self::Error> {
        self.clients.insert(key.to_owned(), state);
        Ok(())
    }

    fn increment(&self, key: &str, now: DateTime<Utc>) -> Result<u64, Self::Error> {
        if let Some(mut entry) = self.clients.get_mut(key) {
            entry.request_count = entry.request_count.saturating_add(1);
            return Ok(entry.request_count);
        }
        // Another caller may have created the key since the lookup above.
        let mut entry = self.clients.entry(key.to_owned()).or_insert_with(|| ClientState {
            request_count: 0,
            window_start: now,
            blocked_until: None,
        });
        entry.request_count = entry.request_count.saturating_add(1);
        Ok(entry.request_count)
    }

    fn reset_window(&self, key: &str, window_start: DateTime<Utc>) -> Result<(), Self::Error> {
        self.clients.insert(key.to_owned(), ClientState::fresh(window_start));
        Ok(())
    }

    fn block_until(&self, key: &str, until: DateTime<Utc>) -> Result<(), Self::Error> {
        if let Some(mut entry) = self.clients.get_mut(key) {
            entry.blocked_until = Some(until);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.clients.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), Self::Error> {
        self.clients.clear();
        Ok(())
    }

    fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &WindowPolicy,
    ) -> Result<(ClientState, Verdict), Self::Error> {
        if let Some(mut entry) = self.clients.get_mut(key) {
            let verdict = entry.admit(now, policy);
            return Ok((*entry, verdict));
        }
        match self.clients.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let verdict = entry.get_mut().admit(now, policy);
                Ok((*entry.get(), verdict))
            }
            Entry::Vacant(entry) => {
                let (state, verdict) = ClientState::start(now, policy);
                entry.insert(state);
                Ok((state, verdict))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 6, 14, 30, 0).unwrap()
    }

    fn policy(max_requests: u64) -> WindowPolicy {
        WindowPolicy {
            window: Duration::from_secs(60),
            max_requests,
            block: Duration::from_secs(10),
        }
    }

    #[test]
    fn admit_counts_then_trips() {
        let mut state = ClientState::fresh(t0());
        assert_eq!(state.admit(t0(), &policy(2)), Verdict::Admitted);
        assert_eq!(state.request_count, 2);

        assert_eq!(state.admit(t0(), &policy(2)), Verdict::Tripped);
        assert_eq!(state.request_count, 3);
        assert_eq!(state.blocked_until, Some(t0() + TimeDelta::seconds(10)));
    }

    #[test]
    fn admit_does_not_count_while_blocked() {
        let mut state = ClientState {
            request_count: 3,
            window_start: t0(),
            blocked_until: Some(t0() + TimeDelta::seconds(10)),
        };
        let now = t0() + TimeDelta::seconds(9);
        assert!(state.is_blocked_at(now));
        assert_eq!(state.admit(now, &policy(2)), Verdict::Blocked);
        assert_eq!(state.request_count, 3);
    }

    #[test]
    fn admit_restarts_after_block_expiry() {
        let mut state = ClientState {
            request_count: 3,
            window_start: t0(),
            blocked_until: Some(t0() + TimeDelta::seconds(10)),
        };
        let now = t0() + TimeDelta::seconds(10);
        assert!(!state.is_blocked_at(now));
        assert_eq!(state.admit(now, &policy(2)), Verdict::Admitted);
        assert_eq!(state, ClientState::fresh(now));
    }

    #[test]
    fn admit_restarts_after_window_elapses() {
        let mut state = ClientState { request_count: 2, window_start: t0(), blocked_until: None };
        let now = t0() + TimeDelta::seconds(60);
        assert_eq!(state.admit(now, &policy(2)), Verdict::Admitted);
        assert_eq!(state, ClientState::fresh(now));
    }

    #[test]
    fn zero_limit_trips_on_first_increment() {
        let mut state = ClientState { request_count: 0, window_start: t0(), blocked_until: None };
        assert_eq!(state.admit(t0(), &policy(0)), Verdict::Tripped);
        assert_eq!(state.request_count, 1);
    }

    #[test]
    fn start_checks_the_opening_request_against_the_limit() {
        assert_eq!(
            ClientState::start(t0(), &policy(1)),
            (ClientState::fresh(t0()), Verdict::Admitted)
        );

        let (state, verdict) = ClientState::start(t0(), &policy(0));
        assert_eq!(verdict, Verdict::Tripped);
        assert_eq!(state.request_count, 1);
        assert_eq!(state.window_start, t0());
        assert_eq!(state.blocked_until, Some(t0() + TimeDelta::seconds(10)));
    }

    #[test]
    fn zero_limit_trips_again_after_each_reset() {
        let p = policy(0);
        let mut state = ClientState { request_count: 1, window_start: t0(), blocked_until: None };
        let after_window = t0() + TimeDelta::seconds(60);
        assert_eq!(state.admit(after_window, &p), Verdict::Tripped);
        assert_eq!(state.request_count, 1);
        assert_eq!(state.blocked_until, Some(after_window + TimeDelta::seconds(10)));

        let after_block = after_window + TimeDelta::seconds(10);
        assert_eq!(state.admit(after_block, &p), Verdict::Tripped);
        assert_eq!(state.request_count, 1);
        assert_eq!(state.window_start, after_block);
        assert_eq!(state.blocked_until, Some(after_block + TimeDelta::seconds(10)));
    }

    #[test]
    fn zero_block_expires_on_next_access() {
        let p = WindowPolicy { block: Duration::ZERO, ..policy(1) };
        let mut state = ClientState::fresh(t0());
        assert_eq!(state.admit(t0(), &p), Verdict::Tripped);
        assert_eq!(state.blocked_until, Some(t0()));

        let later = t0() + TimeDelta::milliseconds(1);
        assert_eq!(state.admit(later, &p), Verdict::Admitted);
        assert_eq!(state.request_count, 1);
    }

    fn exercise_basic_ops<S: ClientStateStore>(store: &S) {
        assert_eq!(store.get("a").unwrap(), None);

        assert_eq!(store.increment("a", t0()).unwrap(), 1);
        assert_eq!(store.increment("a", t0()).unwrap(), 2);
        let state = store.get("a").unwrap().expect("created by increment");
        assert_eq!(state.request_count, 2);
        assert_eq!(state.window_start, t0());
        assert_eq!(state.blocked_until, None);

        let until = t0() + TimeDelta::seconds(30);
        store.block_until("a", until).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().blocked_until, Some(until));

        store.block_until("missing", until).unwrap();
        assert_eq!(store.get("missing").unwrap(), None);

        let later = t0() + TimeDelta::seconds(5);
        store.reset_window("a", later).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(ClientState::fresh(later)));

        let custom = ClientState { request_count: 7, window_start: t0(), blocked_until: None };
        store.set("b", custom).unwrap();
        assert_eq!(store.get("b").unwrap(), Some(custom));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.get("b").unwrap().is_some());

        store.clear().unwrap();
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn in_memory_store_basic_ops() {
        let store = InMemoryStore::new();
        exercise_basic_ops(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn sharded_store_basic_ops() {
        let store = ShardedStore::new();
        exercise_basic_ops(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn get_returns_a_copy() {
        let store = InMemoryStore::new();
        store.increment("a", t0()).unwrap();
        let mut copy = store.get("a").unwrap().unwrap();
        copy.request_count = 99;
        assert_eq!(copy.request_count, 99);
        assert_eq!(store.get("a").unwrap().unwrap().request_count, 1);
    }

    #[test]
    fn check_and_increment_creates_fresh_state() {
        let store = InMemoryStore::new();
        let (state, verdict) = store.check_and_increment("a", t0(), &policy(5)).unwrap();
        assert_eq!(verdict, Verdict::Admitted);
        assert_eq!(state, ClientState::fresh(t0()));
        assert_eq!(store.len(), 1);
    }

    fn zero_limit_denies_new_key<S: ClientStateStore>(store: &S) {
        let (state, verdict) = store.check_and_increment("new", t0(), &policy(0)).unwrap();
        assert_eq!(verdict, Verdict::Tripped);
        assert_eq!(state.request_count, 1);
        assert_eq!(state.blocked_until, Some(t0() + TimeDelta::seconds(10)));
        assert_eq!(store.get("new").unwrap(), Some(state));

        let (_, verdict) = store.check_and_increment("new", t0(), &policy(0)).unwrap();
        assert_eq!(verdict, Verdict::Blocked);
    }

    #[test]
    fn in_memory_zero_limit_denies_new_key() {
        zero_limit_denies_new_key(&InMemoryStore::new());
    }

    #[test]
    fn sharded_zero_limit_denies_new_key() {
        zero_limit_denies_new_key(&ShardedStore::new());
    }

    #[test]
    fn sharded_check_and_increment_matches_in_memory() {
        let a = InMemoryStore::new();
        let b = ShardedStore::new();
        let p = policy(2);
        for step in 0..6 {
            let now = t0() + TimeDelta::seconds(step * 3);
            assert_eq!(
                a.check_and_increment("k", now, &p).unwrap(),
                b.check_and_increment("k", now, &p).unwrap(),
                "diverged at step {step}"
            );
        }
    }

    #[test]
    fn concurrent_increments_lose_nothing() {
        let store = InMemoryStore::new();
        let sharded = ShardedStore::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        store.increment("hot", t0()).unwrap();
                        sharded.increment("hot", t0()).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.get("hot").unwrap().unwrap().request_count, 800);
        assert_eq!(sharded.get("hot").unwrap().unwrap().request_count, 800);
    }

    fn hand_out_each_count_once<S: ClientStateStore>(store: &S) {
        let counts = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..64 {
                scope.spawn(|| {
                    let n = store.increment("fresh", t0()).unwrap();
                    counts.lock().unwrap().push(n);
                });
            }
        });
        let mut counts = counts.into_inner().unwrap();
        counts.sort_unstable();
        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }

    #[test]
    fn in_memory_concurrent_increments_hand_out_each_count_once() {
        hand_out_each_count_once(&InMemoryStore::new());
    }

    #[test]
    fn sharded_concurrent_increments_hand_out_each_count_once() {
        hand_out_each_count_once(&ShardedStore::new());
    }
}
