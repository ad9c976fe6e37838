//! The per-thread event dispatcher.
//!
//! Each nexxT thread has an executor holding the FIFO of pending receive
//! events and the timers of its filters. Delivery skips filters that are
//! currently inside one of their callbacks (the blocked set), so re-entrant
//! transmissions enqueue instead of recursing into the same filter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::environment::FilterHost;
use crate::sample::DataSample;
use crate::transport::ConnSemaphore;

/// Bound on per-port deliveries during finalize, guarding against filters
/// that keep producing samples while the graph drains.
pub const MAX_LOOPS_FINALIZE: usize = 5;

/// A pending receive event.
pub(crate) struct PendingReceive {
    pub target: Arc<FilterHost>,
    pub port: usize,
    pub sample: DataSample,
    pub semaphore: Option<Arc<ConnSemaphore>>,
}

struct TimerEntry {
    target: Weak<FilterHost>,
    period: Duration,
    next: Instant,
}

/// The event dispatcher of one nexxT thread.
pub struct Executor {
    thread_name: String,
    pending: Mutex<VecDeque<PendingReceive>>,
    blocked: Mutex<HashSet<usize>>,
    timers: Mutex<Vec<TimerEntry>>,
    stopped: AtomicBool,
    notify_tx: Sender<()>,
}

impl Executor {
    /// Create an executor together with the wake-up channel its thread
    /// loop listens on.
    pub(crate) fn new(thread_name: &str) -> (Arc<Self>, Receiver<()>) {
        let (notify_tx, notify_rx) = bounded(1);
        (
            Arc::new(Self {
                thread_name: thread_name.to_string(),
                pending: Mutex::new(VecDeque::new()),
                blocked: Mutex::new(HashSet::new()),
                timers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                notify_tx,
            }),
            notify_rx,
        )
    }

    /// Name of the thread this executor belongs to.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn notify(&self) {
        // a pending wake-up is as good as a new one
        let _ = self.notify_tx.try_send(());
    }

    /// Register a pending receive event and wake the thread loop. Events
    /// registered after [`Executor::clear`] are discarded.
    pub(crate) fn register_pending_receive(
        &self,
        target: Arc<FilterHost>,
        port: usize,
        sample: DataSample,
        semaphore: Option<Arc<ConnSemaphore>>,
    ) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.pending.lock().unwrap().push_back(PendingReceive {
            target,
            port,
            sample,
            semaphore,
        });
        self.notify();
    }

    /// Dispatch a sample to a same-thread filter. Delivers synchronously
    /// unless the target is currently inside one of its callbacks, in which
    /// case the event is queued.
    pub(crate) fn deliver_direct(&self, target: &Arc<FilterHost>, port: usize, sample: DataSample) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.is_blocked(target) {
            self.register_pending_receive(Arc::clone(target), port, sample, None);
        } else {
            target.process_receive(port, sample, None);
        }
    }

    pub(crate) fn is_blocked(&self, host: &Arc<FilterHost>) -> bool {
        self.blocked
            .lock()
            .unwrap()
            .contains(&(Arc::as_ptr(host) as usize))
    }

    pub(crate) fn block(&self, host: &Arc<FilterHost>) {
        self.blocked
            .lock()
            .unwrap()
            .insert(Arc::as_ptr(host) as usize);
    }

    pub(crate) fn unblock(&self, host: &Arc<FilterHost>) {
        self.blocked
            .lock()
            .unwrap()
            .remove(&(Arc::as_ptr(host) as usize));
    }

    /// Process one pending event whose target filter is not blocked.
    /// Returns `true` if an event was processed.
    pub(crate) fn step(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let event = {
            let mut pending = self.pending.lock().unwrap();
            let idx = pending
                .iter()
                .position(|ev| !self.is_blocked(&ev.target));
            match idx {
                Some(idx) => pending.remove(idx),
                None => None,
            }
        };
        match event {
            Some(ev) => {
                ev.target
                    .process_receive(ev.port, ev.sample, ev.semaphore.as_ref());
                true
            }
            None => false,
        }
    }

    /// Drain the pending queue before the thread stops. Each input port is
    /// invoked at most [`MAX_LOOPS_FINALIZE`] times; remaining events are
    /// discarded by the subsequent [`Executor::clear`].
    pub(crate) fn finalize(&self) {
        tracing::trace!("starting finalize ({})", self.thread_name);
        let mut num_called: HashMap<(usize, usize), usize> = HashMap::new();
        loop {
            let event = {
                let mut pending = self.pending.lock().unwrap();
                let idx = pending.iter().position(|ev| {
                    let key = (Arc::as_ptr(&ev.target) as usize, ev.port);
                    !self.is_blocked(&ev.target)
                        && num_called.get(&key).copied().unwrap_or(0) < MAX_LOOPS_FINALIZE
                });
                match idx {
                    Some(idx) => pending.remove(idx),
                    None => None,
                }
            };
            let Some(ev) = event else { break };
            let key = (Arc::as_ptr(&ev.target) as usize, ev.port);
            *num_called.entry(key).or_insert(0) += 1;
            ev.target
                .process_receive(ev.port, ev.sample, ev.semaphore.as_ref());
        }
    }

    /// Called after processing has stopped: discards pending events and
    /// makes further registrations no-ops.
    pub(crate) fn clear(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
        self.blocked.lock().unwrap().clear();
    }

    /// Re-arm the executor for another start/stop cycle.
    pub(crate) fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    // ── Timers ──

    /// Install, change or remove the periodic timer of a filter.
    pub(crate) fn set_timer(&self, host: &Arc<FilterHost>, period: Option<Duration>) {
        let mut timers = self.timers.lock().unwrap();
        let ptr = Arc::as_ptr(host) as usize;
        timers.retain(|t| {
            t.target
                .upgrade()
                .map(|h| Arc::as_ptr(&h) as usize != ptr)
                .unwrap_or(false)
        });
        if let Some(period) = period {
            timers.push(TimerEntry {
                target: Arc::downgrade(host),
                period,
                next: Instant::now() + period,
            });
            self.notify();
        }
    }

    /// The next point in time a timer is due, if any.
    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.lock().unwrap().iter().map(|t| t.next).min()
    }

    /// Fire all due timers. Missed periods are coalesced into one call.
    pub(crate) fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<Arc<FilterHost>> = {
            let mut timers = self.timers.lock().unwrap();
            timers.retain(|t| t.target.strong_count() > 0);
            timers
                .iter_mut()
                .filter(|t| t.next <= now)
                .filter_map(|t| {
                    t.next = now + t.period;
                    t.target.upgrade()
                })
                .collect()
        };
        for host in due {
            if !self.is_blocked(&host) {
                host.process_timer();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleared_executor_discards_registrations() {
        let (executor, _rx) = Executor::new("test");
        executor.clear();
        assert!(!executor.step());
        assert!(executor.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_notify_coalesces() {
        let (executor, rx) = Executor::new("test");
        executor.notify();
        executor.notify();
        executor.notify();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
