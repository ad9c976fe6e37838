//! The worker threads of an active application.
//!
//! Every thread label of the graph maps to one [`NexxtThread`]. Worker
//! threads run an event loop dispatching receive events, timers and the
//! barrier-coordinated lifecycle operations; the "main" thread variant is
//! pumped by the active application instead of owning a loop.

use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::environment::FilterHost;
use crate::error::{NexxTError, Result};
use crate::executor::Executor;
use crate::filter::Operation;
use crate::graph::FilterMockup;
use crate::property::Variables;

/// A filter scheduled for creation on a thread.
pub(crate) struct MockupEntry {
    pub fqname: String,
    pub mockup: Arc<FilterMockup>,
    pub variables: Arc<Variables>,
}

pub(crate) enum ThreadMsg {
    Op { op: Operation, barrier: Arc<Barrier> },
    Quit,
}

/// Completion report of one thread for one operation.
pub(crate) struct CompletionMsg {
    #[allow(dead_code)]
    pub thread: String,
    pub failures: usize,
}

pub(crate) struct ThreadShared {
    name: String,
    mockups: Mutex<Vec<MockupEntry>>,
    filters: Mutex<Vec<Arc<FilterHost>>>,
    done_tx: Sender<CompletionMsg>,
}

/// A thread of the active application.
pub(crate) struct NexxtThread {
    name: String,
    executor: Arc<Executor>,
    shared: Arc<ThreadShared>,
    ops_tx: Sender<ThreadMsg>,
    notify_rx: Option<Receiver<()>>,
    join: Option<JoinHandle<()>>,
}

impl NexxtThread {
    /// Create a thread with the given name. Unless this is the main
    /// thread, a worker thread running the event loop is spawned.
    pub fn new(name: &str, done_tx: Sender<CompletionMsg>) -> Self {
        let (executor, notify_rx) = Executor::new(name);
        let shared = Arc::new(ThreadShared {
            name: name.to_string(),
            mockups: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            done_tx,
        });
        let (ops_tx, ops_rx) = unbounded();
        if name == "main" {
            Self {
                name: name.to_string(),
                executor,
                shared,
                ops_tx,
                notify_rx: Some(notify_rx),
                join: None,
            }
        } else {
            let thread_shared = Arc::clone(&shared);
            let thread_executor = Arc::clone(&executor);
            let thread_name = name.to_string();
            let join = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    tracing::debug!("thread {} started", thread_name);
                    thread_main(thread_shared, thread_executor, ops_rx, notify_rx);
                    tracing::debug!("thread {} exiting", thread_name);
                })
                .expect("failed to spawn thread");
            Self {
                name: name.to_string(),
                executor,
                shared,
                ops_tx,
                notify_rx: None,
                join: Some(join),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_main(&self) -> bool {
        self.join.is_none()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Schedule a filter for creation on this thread.
    pub fn add_mockup(&self, entry: MockupEntry) -> Result<()> {
        let mut mockups = self.shared.mockups.lock().unwrap();
        if mockups.iter().any(|e| e.fqname == entry.fqname) {
            return Err(NexxTError::NodeExists(entry.fqname));
        }
        mockups.push(entry);
        Ok(())
    }

    /// The filters created on this thread.
    pub fn filters(&self) -> Vec<Arc<FilterHost>> {
        self.shared.filters.lock().unwrap().clone()
    }

    /// A filter by its fully qualified name.
    pub fn get_filter(&self, fqname: &str) -> Result<Arc<FilterHost>> {
        self.shared
            .filters
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.full_qualified_name() == fqname)
            .cloned()
            .ok_or_else(|| NexxTError::NodeNotFound(fqname.to_string()))
    }

    /// Dispatch an operation. Worker threads receive it through their
    /// event loop; on the main thread it executes inline.
    pub fn dispatch_operation(&self, op: Operation, barrier: &Arc<Barrier>) {
        if self.is_main() {
            perform_operation(&self.shared, &self.executor, op, barrier);
        } else {
            let _ = self.ops_tx.send(ThreadMsg::Op {
                op,
                barrier: Arc::clone(barrier),
            });
        }
    }

    /// Process pending events of the main thread for up to `budget`.
    /// Returns when the budget is exhausted (or immediately after idle
    /// wake-ups past the budget).
    pub fn pump(&self, budget: Duration) {
        let Some(notify_rx) = &self.notify_rx else {
            return;
        };
        let deadline = Instant::now() + budget;
        loop {
            self.executor.fire_due_timers();
            while self.executor.step() {}
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let mut timeout = deadline - now;
            if let Some(t) = self.executor.next_timer_deadline() {
                timeout = timeout.min(t.saturating_duration_since(now));
            }
            let _ = notify_rx.recv_timeout(timeout.max(Duration::from_millis(1)));
        }
    }

    /// Stop the worker thread and deallocate the filters.
    pub fn cleanup(&mut self) {
        tracing::trace!("stopping thread {}", self.name);
        let _ = self.ops_tx.send(ThreadMsg::Quit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        for filter in self.shared.filters.lock().unwrap().drain(..) {
            filter.destroy();
        }
        self.shared.mockups.lock().unwrap().clear();
        tracing::trace!("thread cleanup done");
    }
}

impl Drop for NexxtThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.cleanup();
        }
    }
}

fn thread_main(
    shared: Arc<ThreadShared>,
    executor: Arc<Executor>,
    ops_rx: Receiver<ThreadMsg>,
    notify_rx: Receiver<()>,
) {
    loop {
        let timer_deadline = executor.next_timer_deadline();
        let msg = match timer_deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                crossbeam_channel::select! {
                    recv(ops_rx) -> msg => Some(msg),
                    recv(notify_rx) -> _ => None,
                    default(timeout) => None,
                }
            }
            None => {
                crossbeam_channel::select! {
                    recv(ops_rx) -> msg => Some(msg),
                    recv(notify_rx) -> _ => None,
                }
            }
        };
        match msg {
            Some(Ok(ThreadMsg::Op { op, barrier })) => {
                perform_operation(&shared, &executor, op, &barrier);
            }
            Some(Ok(ThreadMsg::Quit)) | Some(Err(_)) => break,
            None => {}
        }
        executor.fire_due_timers();
        while executor.step() {}
    }
}

/// Perform the given operation on all filters of the thread, rendezvousing
/// with the other threads at the shared barrier.
pub(crate) fn perform_operation(
    shared: &Arc<ThreadShared>,
    executor: &Arc<Executor>,
    op: Operation,
    barrier: &Barrier,
) {
    // wait until all threads are in their event loop
    barrier.wait();
    let mut failures = 0usize;
    if op == Operation::Stop {
        // drain backlogged samples while the filters are still active
        executor.finalize();
    }
    if op.transitional_state().is_some() {
        // before any callback runs, all filters are in the adapted state
        for filter in shared.filters.lock().unwrap().iter() {
            if let Err(e) = filter.pre_state_transition(op) {
                failures += 1;
                tracing::error!(
                    "Exception while performing operation '{}' on {}: {}",
                    op.as_str(),
                    filter.full_qualified_name(),
                    e
                );
            }
        }
        barrier.wait();
    }
    match op {
        Operation::Create => {
            let entries: Vec<(String, Arc<FilterMockup>, Arc<Variables>)> = shared
                .mockups
                .lock()
                .unwrap()
                .iter()
                .map(|e| (e.fqname.clone(), Arc::clone(&e.mockup), Arc::clone(&e.variables)))
                .collect();
            for (fqname, mockup, variables) in entries {
                match mockup.create_filter_host(
                    &fqname,
                    &shared.name,
                    Arc::clone(executor),
                    variables,
                ) {
                    Ok(host) => {
                        tracing::trace!("Created filter {} in thread {}", fqname, shared.name);
                        shared.filters.lock().unwrap().push(host);
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::error!(
                            "Exception while performing operation 'create' on {}: {}",
                            fqname,
                            e
                        );
                    }
                }
            }
        }
        Operation::Destruct => {
            let filters: Vec<Arc<FilterHost>> =
                shared.filters.lock().unwrap().drain(..).collect();
            for filter in filters {
                filter.destroy();
            }
        }
        _ => {
            if op == Operation::Start {
                executor.reset();
            }
            let filters = shared.filters.lock().unwrap().clone();
            for filter in filters {
                if let Err(e) = filter.perform_operation(op) {
                    failures += 1;
                    tracing::error!(
                        "Exception while performing operation '{}' on {}: {}",
                        op.as_str(),
                        filter.full_qualified_name(),
                        e
                    );
                }
            }
            if op == Operation::Stop {
                // remaining events are discarded until the next start
                executor.clear();
            }
        }
    }
    tracing::trace!("{}: operation {} finished", shared.name, op.as_str());
    let _ = shared.done_tx.send(CompletionMsg {
        thread: shared.name.clone(),
        failures,
    });
    barrier.wait();
}
