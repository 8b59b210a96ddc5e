//! Shared timer for delayed gateway flushes, fragment expiry and the
//! leave-tunnel job.
//!
//! Events are `FnOnce` closures ordered by deadline. They always run with the
//! timer's own lock released, so an event may schedule or cancel others.
//!
//! In threaded mode ([`SimpleTimer::start`]) one named thread sleeps on a
//! condvar until the next deadline. In manual mode ([`SimpleTimer::manual`])
//! nothing runs until [`SimpleTimer::fire_due`] is called, which together with
//! a manual clock makes timing deterministic in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use hopnet_types::clock::Clock;
use tracing::{debug, trace};

use crate::Result;

type Event = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Default)]
struct TimerState {
    events: BTreeMap<(u64, u64), Event>,
    deadlines: HashMap<u64, u64>,
    next_id: u64,
}

/// Deadline-ordered event scheduler.
pub struct SimpleTimer {
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
    wakeup: Condvar,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimpleTimer {
    /// Create a timer that only fires from [`SimpleTimer::fire_due`].
    pub fn manual(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        })
    }

    /// Create a timer served by its own thread.
    ///
    /// # Errors
    ///
    /// - [`crate::TunnelError::Io`] if the thread cannot be spawned
    pub fn start(clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let timer = Self::manual(clock);
        let worker = timer.clone();
        let handle = std::thread::Builder::new()
            .name("SimpleTimer".into())
            .spawn(move || worker.run())?;
        *lock(&timer.thread) = Some(handle);
        Ok(timer)
    }

    /// Run `event` once `delay_ms` has elapsed.
    pub fn schedule<F>(&self, delay_ms: u64, event: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.clock.now().saturating_add(delay_ms);
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.events.insert((deadline, id), Box::new(event));
        state.deadlines.insert(id, deadline);
        drop(state);
        self.wakeup.notify_one();
        trace!(id, delay_ms, "timer event scheduled");
        TimerHandle(id)
    }

    /// Cancel a scheduled event. Returns `false` if it already ran or was
    /// cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = lock(&self.state);
        match state.deadlines.remove(&handle.0) {
            Some(deadline) => state.events.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Run every event whose deadline has passed. Returns how many ran.
    pub fn fire_due(&self) -> usize {
        let mut fired = 0;
        while let Some(event) = self.pop_due(self.clock.now()) {
            event();
            fired += 1;
        }
        fired
    }

    /// Number of events waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.state).events.len()
    }

    /// Stop the timer thread and drop all pending events.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.events.clear();
            state.deadlines.clear();
        }
        self.wakeup.notify_all();
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("timer stopped");
    }

    fn pop_due(&self, now: u64) -> Option<Event> {
        let mut state = lock(&self.state);
        let (&(deadline, id), _) = state.events.iter().next()?;
        if deadline > now {
            return None;
        }
        state.deadlines.remove(&id);
        state.events.remove(&(deadline, id))
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.fire_due();
            let state = lock(&self.state);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let now = self.clock.now();
            let wait = match state.events.keys().next() {
                Some(&(deadline, _)) if deadline <= now => continue,
                Some(&(deadline, _)) => Duration::from_millis(deadline - now),
                None => Duration::from_secs(60),
            };
            let _ = self
                .wakeup
                .wait_timeout(state, wait)
                .map_err(|e| e.into_inner());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
