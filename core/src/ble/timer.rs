/// Cancellable timers owned by the controllers
///
/// Every timer lives in a [`TimerSet`] keyed by what it is for. Scheduling a
/// key again replaces (and aborts) the previous timer. Each schedule hands out
/// a [`TimerToken`]; a firing callback must confirm its token with
/// [`TimerSet::complete`] or [`TimerSet::is_current`] under the owner's lock
/// before acting, so a timer that was cancelled or replaced while its task was
/// already running has no effect.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Identity of one scheduling of a timer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// A single scheduled timer task
#[derive(Debug)]
pub struct TimerHandle {
    token: TimerToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Abort the timer task
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the task has not run to completion yet
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn token(&self) -> TimerToken {
        self.token
    }
}

/// Keyed set of cancellable timers
pub struct TimerSet<K> {
    runtime: Handle,
    timers: HashMap<K, TimerHandle>,
    next_token: u64,
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an empty set spawning timer tasks on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: HashMap::new(),
            next_token: 0,
        }
    }

    fn issue_token(&mut self) -> TimerToken {
        self.next_token += 1;
        TimerToken(self.next_token)
    }

    fn install(&mut self, key: K, handle: TimerHandle) {
        if let Some(previous) = self.timers.insert(key.clone(), handle) {
            previous.cancel();
            trace!("Timer {:?} replaced", key);
        }
    }

    /// Run `fire` once after `delay`
    pub fn schedule<F>(&mut self, key: K, delay: Duration, fire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        let token = self.issue_token();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(token);
        });
        self.install(key, TimerHandle { token, task });
        token
    }

    /// Run `tick` every `period`, first after one full period
    pub fn schedule_repeating<F>(&mut self, key: K, period: Duration, tick: F) -> TimerToken
    where
        F: Fn(TimerToken) + Send + 'static,
    {
        let token = self.issue_token();
        let task = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick(token);
            }
        });
        self.install(key, TimerHandle { token, task });
        token
    }

    /// Whether `token` is still the live scheduling of `key`
    pub fn is_current(&self, key: &K, token: TimerToken) -> bool {
        self.timers
            .get(key)
            .map(|handle| handle.token == token)
            .unwrap_or(false)
    }

    /// Retire a fired one-shot timer; false if it was cancelled or replaced
    pub fn complete(&mut self, key: &K, token: TimerToken) -> bool {
        if self.is_current(key, token) {
            self.timers.remove(key);
            true
        } else {
            false
        }
    }

    /// Cancel one timer
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer matching `predicate`
    pub fn cancel_where<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let keys: Vec<K> = self.timers.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    /// Cancel everything
    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, handle) in self.timers.drain() {
            handle.cancel();
        }
        count
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.cancel();
        }
    }
}
