//! Sample transport between connected ports.
//!
//! Two transports exist: the direct transport dispatches synchronously
//! between filters on the same thread; the queued transport crosses thread
//! boundaries through the sink thread's executor, bounded by a counting
//! semaphore per connection. Stopping a queued connection makes producers
//! drop samples instead of blocking, which is how data flow ceases at
//! graph stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::environment::FilterHost;
use crate::executor::Executor;
use crate::sample::DataSample;

/// Tick with which a blocked producer re-checks the stopped flag.
const ACQUIRE_TICK: Duration = Duration::from_millis(500);

/// A counting semaphore guarding the in-flight samples of one queued
/// connection.
pub struct ConnSemaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl ConnSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Acquire one permit without blocking. Returns `false` if none is
    /// available.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire one permit, waiting up to `timeout`.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *permits == 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, res) = self.cond.wait_timeout(permits, remaining).unwrap();
            permits = guard;
            if res.timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    /// Release `n` permits.
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        for _ in 0..n {
            self.cond.notify_one();
        }
    }
}

/// A wired connection of an output port.
pub(crate) enum Connection {
    /// Same-thread connection, dispatched synchronously through the local
    /// executor.
    Direct {
        target: Arc<FilterHost>,
        port: usize,
    },
    /// Cross-thread connection.
    Queued(Arc<InterThreadConnection>),
}

/// Transmits data samples between threads with bounded backpressure.
///
/// The producer acquires the connection semaphore before handing the
/// sample to the sink thread's executor; the permit is released when the
/// sink actually processes the sample. Connections start in stopped mode
/// and are flipped to running at graph start.
pub struct InterThreadConnection {
    semaphore: Arc<ConnSemaphore>,
    stopped: AtomicBool,
    width: usize,
    sink_executor: Arc<Executor>,
    target: Arc<FilterHost>,
    port: usize,
}

impl InterThreadConnection {
    /// Create a connection to `port` of `target`, processed by the sink
    /// thread's `executor`. A `width` of 0 declares the connection
    /// non-blocking: the producer never waits.
    pub(crate) fn new(
        width: usize,
        sink_executor: Arc<Executor>,
        target: Arc<FilterHost>,
        port: usize,
    ) -> Self {
        Self {
            semaphore: Arc::new(ConnSemaphore::new(width.max(1))),
            stopped: AtomicBool::new(true),
            width,
            sink_executor,
            target,
            port,
        }
    }

    /// When the connection is stopped (the default), transmit drops samples
    /// with a log message instead of blocking. Thread safe.
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Hand a sample to the sink thread, blocking on the connection
    /// semaphore. Called on the producer's thread.
    pub(crate) fn transmit(&self, sample: DataSample) {
        loop {
            if self.stopped() {
                tracing::info!(
                    "The inter-thread connection is set to stopped mode; data sample discarded."
                );
                return;
            }
            if self.width == 0 {
                // declared non-blocking, no permit accounting
                self.sink_executor.register_pending_receive(
                    Arc::clone(&self.target),
                    self.port,
                    sample,
                    None,
                );
                return;
            }
            if self.semaphore.try_acquire_timeout(ACQUIRE_TICK) {
                self.sink_executor.register_pending_receive(
                    Arc::clone(&self.target),
                    self.port,
                    sample,
                    Some(Arc::clone(&self.semaphore)),
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_semaphore_try_acquire() {
        let sem = ConnSemaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release(1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_semaphore_timeout_expires() {
        let sem = ConnSemaphore::new(0);
        let start = Instant::now();
        assert!(!sem.try_acquire_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_semaphore_release_wakes_waiter() {
        let sem = Arc::new(ConnSemaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || sem2.try_acquire_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        sem.release(1);
        assert!(handle.join().unwrap());
    }
}
