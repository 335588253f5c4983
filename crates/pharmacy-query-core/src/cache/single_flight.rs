//! At-most-one computation per key.
//!
//! The first caller for a key computes; callers arriving while it runs block
//! on a condvar and receive a clone of its value. If the computing caller
//! unwinds, waiters retry and one of them takes over.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Whether the caller computed the value or waited for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

enum CallState<V> {
    Pending,
    Done(V),
    Abandoned,
}

struct Call<V> {
    state: Mutex<CallState<V>>,
    done: Condvar,
}

impl<V: Clone> Call<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState::Pending),
            done: Condvar::new(),
        }
    }

    /// Block until the leader finishes. `None` if it gave up.
    fn wait(&self) -> Option<V> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                CallState::Pending => {
                    state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                CallState::Done(value) => return Some(value.clone()),
                CallState::Abandoned => return None,
            }
        }
    }

    fn settle(&self, next: CallState<V>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = next;
        self.done.notify_all();
    }
}

/// In-flight registry keyed by `K`.
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `compute` unless a call for `key` is already in flight, in which
    /// case wait for and share its value.
    pub fn run<F>(&self, key: &K, compute: F) -> (V, Role)
    where
        F: FnOnce() -> V,
    {
        let call = loop {
            let (call, leading) = {
                let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
                match calls.get(key) {
                    Some(call) => (Arc::clone(call), false),
                    None => {
                        let call = Arc::new(Call::new());
                        calls.insert(key.clone(), Arc::clone(&call));
                        (call, true)
                    }
                }
            };
            if leading {
                break call;
            }
            if let Some(value) = call.wait() {
                return (value, Role::Follower);
            }
        };

        let mut guard = LeaderGuard {
            flight: self,
            key,
            call: &call,
            finished: false,
        };
        let value = compute();
        guard.finish(value.clone());
        (value, Role::Leader)
    }

    /// Keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, key: &K, call: &Arc<Call<V>>) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, call)) {
            calls.remove(key);
        }
    }
}

/// Unregisters the call on every exit path, marking it abandoned on unwind.
struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    flight: &'a SingleFlight<K, V>,
    key: &'a K,
    call: &'a Arc<Call<V>>,
    finished: bool,
}

impl<K, V> LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn finish(&mut self, value: V) {
        self.flight.release(self.key, self.call);
        self.call.settle(CallState::Done(value));
        self.finished = true;
    }
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.finished {
            self.flight.release(self.key, self.call);
            self.call.settle(CallState::Abandoned);
        }
    }
}
