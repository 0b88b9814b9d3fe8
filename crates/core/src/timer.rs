//! Timer pool: deadline heap with a dedicated arming thread.
//!
//! Expiry is centralized on the event-loop thread: the arming thread only
//! posts timer events into the inbound queue, so nanoapp code never sees a
//! cross-thread callback.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::event::{EventType, InstanceId};
use crate::event_loop::EventLoopHandle;

/// Handle for one armed timer, unique for the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload delivered with [`EventType::TIMER`] to the timer's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: TimerId,
    pub cookie: u64,
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    target: InstanceId,
    cookie: u64,
    period: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the nearest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    live: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
    next_id: u32,
    shutdown: bool,
}

struct TimerPoolInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Shared, internally synchronized timer pool.
///
/// Cancellation is lazy: cancelled ids are tombstoned and skipped when their
/// heap entry surfaces.
#[derive(Clone)]
pub struct TimerPool {
    inner: Arc<TimerPoolInner>,
}

impl TimerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerPoolInner {
                state: Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    live: HashSet::new(),
                    cancelled: HashSet::new(),
                    next_id: 1,
                    shutdown: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Arms a timer for `target`. One-shot timers fire once; periodic timers
    /// re-arm with the same delay until cancelled.
    pub fn set_timer(
        &self,
        target: InstanceId,
        delay: Duration,
        one_shot: bool,
        cookie: u64,
    ) -> TimerId {
        let mut state = self.lock_state();
        let id = TimerId(state.next_id);
        state.next_id = state.next_id.wrapping_add(1);
        state.live.insert(id);
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            target,
            cookie,
            period: (!one_shot).then_some(delay),
        });
        self.inner.cv.notify_one();
        id
    }

    /// Cancels an armed timer. Returns false for unknown or already-fired
    /// ids.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.lock_state();
        if state.live.remove(&id) {
            state.cancelled.insert(id);
            self.inner.cv.notify_one();
            true
        } else {
            false
        }
    }

    /// Cancels every timer owned by an unloading nanoapp.
    pub(crate) fn cancel_all_for(&self, target: InstanceId) {
        let mut state = self.lock_state();
        let owned: Vec<TimerId> = state
            .heap
            .iter()
            .filter(|entry| entry.target == target && state.live.contains(&entry.id))
            .map(|entry| entry.id)
            .collect();
        for id in owned {
            state.live.remove(&id);
            state.cancelled.insert(id);
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutdown = true;
        self.inner.cv.notify_all();
    }

    /// Spawns the arming thread. It sleeps until the nearest deadline,
    /// interruptible by inserts, cancels, and shutdown.
    pub(crate) fn spawn_arming_thread(&self, poster: EventLoopHandle) -> JoinHandle<()> {
        let pool = self.clone();
        thread::Builder::new()
            .name("ctxhub-timer".into())
            .spawn(move || pool.arming_loop(poster))
            .expect("failed to spawn timer thread")
    }

    fn arming_loop(&self, poster: EventLoopHandle) {
        debug!("timer arming thread start");
        let mut state = self.lock_state();
        loop {
            if state.shutdown {
                break;
            }
            match Self::next_wakeup(&state) {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        drop(state);
                        self.post_due_timers(&poster, now);
                        state = self.lock_state();
                    } else {
                        let (guard, _) = self
                            .inner
                            .cv
                            .wait_timeout(state, deadline - now)
                            .expect("timer mutex poisoned");
                        state = guard;
                    }
                }
                None => {
                    state = self.inner.cv.wait(state).expect("timer mutex poisoned");
                }
            }
        }
        debug!("timer arming thread exit");
    }

    fn next_wakeup(state: &TimerState) -> Option<Instant> {
        state.heap.peek().map(|entry| entry.deadline)
    }

    /// Fires every entry due at `now`; periodic entries re-arm. Returns the
    /// number of timer events posted. Exposed to the crate so tests can step
    /// time without the arming thread.
    pub(crate) fn post_due_timers(&self, poster: &EventLoopHandle, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let (id, target, cookie) = {
                let mut state = self.lock_state();
                let due = state
                    .heap
                    .peek()
                    .map_or(false, |head| head.deadline <= now);
                if !due {
                    break;
                }
                let entry = state.heap.pop().expect("peeked entry");
                if state.cancelled.remove(&entry.id) {
                    continue;
                }
                match entry.period {
                    // Re-arm from now, so a late wakeup does not burst-fire.
                    Some(period) => state.heap.push(TimerEntry {
                        deadline: now + period,
                        id: entry.id,
                        target: entry.target,
                        cookie: entry.cookie,
                        period: entry.period,
                    }),
                    None => {
                        state.live.remove(&entry.id);
                    }
                }
                (entry.id, entry.target, entry.cookie)
            };

            let event = TimerEvent { id, cookie };
            if poster
                .post_event(
                    EventType::TIMER,
                    Box::new(event),
                    None,
                    InstanceId::SYSTEM,
                    target,
                )
                .is_err()
            {
                warn!(timer = id.0, "dropping timer expiry, post failed");
            } else {
                fired += 1;
            }
        }
        fired
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.inner.state.lock().expect("timer mutex poisoned")
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}
