//! The port model: named endpoints on filters.
//!
//! Input ports buffer the most recent samples according to their queue
//! policy; output ports hold the connections wired by the active
//! application. Ports are owned by their filter environment and are only
//! touched on the filter's bound thread.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{NexxTError, Result};
use crate::sample::{DataSample, TIMESTAMP_RES};
use crate::transport::{ConnSemaphore, Connection};

/// Whether a port is an input or an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PortDirection::Input => "Input",
            PortDirection::Output => "Output",
        }
    }
}

/// Static description of a port, used by the graph model and the mockup
/// port cache.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub direction: PortDirection,
    pub dynamic: bool,
    pub queue_size_samples: usize,
    pub queue_size_seconds: f64,
    pub interthread_dynamic_queue: bool,
}

impl PortInfo {
    pub fn input(name: &str, dynamic: bool) -> Self {
        Self {
            name: name.to_string(),
            direction: PortDirection::Input,
            dynamic,
            queue_size_samples: 1,
            queue_size_seconds: 0.0,
            interthread_dynamic_queue: false,
        }
    }

    pub fn output(name: &str, dynamic: bool) -> Self {
        Self {
            name: name.to_string(),
            direction: PortDirection::Output,
            dynamic,
            queue_size_samples: 0,
            queue_size_seconds: 0.0,
            interthread_dynamic_queue: false,
        }
    }
}

/// An input port with its sample queue.
///
/// `queue_size_samples` bounds the number of buffered samples,
/// `queue_size_seconds` bounds their age relative to the newest sample;
/// both bounds apply when both are positive. The newest sample is at the
/// front of the queue.
pub struct InputPort {
    name: String,
    dynamic: bool,
    queue: VecDeque<DataSample>,
    queue_size_samples: usize,
    queue_size_seconds: f64,
    interthread_dynamic_queue: bool,
    // permit ledger per inter-thread connection, see receive_async
    semaphore_n: Vec<(Arc<ConnSemaphore>, isize)>,
}

impl InputPort {
    pub(crate) fn new(info: &PortInfo) -> Self {
        let mut port = Self {
            name: info.name.clone(),
            dynamic: info.dynamic,
            queue: VecDeque::new(),
            queue_size_samples: 1,
            queue_size_seconds: 0.0,
            interthread_dynamic_queue: info.interthread_dynamic_queue,
            semaphore_n: Vec::new(),
        };
        port.set_queue_size(info.queue_size_samples, info.queue_size_seconds);
        port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn queue_size_samples(&self) -> usize {
        self.queue_size_samples
    }

    pub fn queue_size_seconds(&self) -> f64 {
        self.queue_size_seconds
    }

    pub fn interthread_dynamic_queue(&self) -> bool {
        self.interthread_dynamic_queue
    }

    pub(crate) fn set_interthread_dynamic_queue(&mut self, enabled: bool) {
        self.interthread_dynamic_queue = enabled;
    }

    /// Set the queue bounds. If both bounds are non-positive, a one sample
    /// sized queue is used instead and a warning is logged.
    pub(crate) fn set_queue_size(&mut self, samples: usize, seconds: f64) {
        let mut samples = samples;
        if samples == 0 && seconds <= 0.0 {
            tracing::warn!(
                "Warning: infinite buffering used for port '{}'. Using a one sample sized queue instead.",
                self.name
            );
            samples = 1;
        }
        self.queue_size_samples = samples;
        self.queue_size_seconds = seconds;
    }

    /// Current snapshot of the static configuration of this port.
    pub(crate) fn info(&self) -> PortInfo {
        PortInfo {
            name: self.name.clone(),
            direction: PortDirection::Input,
            dynamic: self.dynamic,
            queue_size_samples: self.queue_size_samples,
            queue_size_seconds: self.queue_size_seconds,
            interthread_dynamic_queue: self.interthread_dynamic_queue,
        }
    }

    /// Append a sample as the newest entry and evict per the queue policy.
    pub(crate) fn add_to_queue(&mut self, sample: DataSample) {
        self.queue.push_front(sample);
        if self.queue_size_samples > 0 {
            self.queue.truncate(self.queue_size_samples);
        }
        if self.queue_size_seconds > 0.0 {
            let max_age = (self.queue_size_seconds / TIMESTAMP_RES) as i64;
            let newest = self.queue.front().map(|s| s.timestamp()).unwrap_or(0);
            while let Some(oldest) = self.queue.back() {
                if self.queue.len() > 1 && newest - oldest.timestamp() > max_age {
                    self.queue.pop_back();
                } else {
                    break;
                }
            }
        }
    }

    /// The number of currently buffered samples.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The n-th most recent sample (0 = newest).
    pub fn get_data(&self, delay_samples: usize) -> Result<DataSample> {
        self.queue
            .get(delay_samples)
            .cloned()
            .ok_or_else(|| NexxTError::PortDataNotFound {
                port: self.name.clone(),
            })
    }

    /// The first sample at least `delay_seconds` older than the newest one.
    pub fn get_data_by_seconds(&self, delay_seconds: f64) -> Result<DataSample> {
        let newest = self
            .queue
            .front()
            .ok_or_else(|| NexxTError::PortDataNotFound {
                port: self.name.clone(),
            })?
            .timestamp();
        let delay = (delay_seconds / TIMESTAMP_RES) as i64;
        self.queue
            .iter()
            .find(|s| newest - s.timestamp() >= delay)
            .cloned()
            .ok_or_else(|| NexxTError::PortDataNotFound {
                port: self.name.clone(),
            })
    }

    /// Reconcile the permit ledger of an inter-thread connection after a
    /// sample has been queued (dynamic queue mode). The producer holds one
    /// acquired permit when this is called.
    pub(crate) fn reconcile_semaphore(&mut self, semaphore: &Arc<ConnSemaphore>) {
        if !self.interthread_dynamic_queue {
            semaphore.release(1);
            return;
        }
        let idx = match self
            .semaphore_n
            .iter()
            .position(|(s, _)| Arc::ptr_eq(s, semaphore))
        {
            Some(idx) => idx,
            None => {
                self.semaphore_n.push((Arc::clone(semaphore), 1));
                self.semaphore_n.len() - 1
            }
        };
        let n = self.semaphore_n[idx].1;
        let delta = n - self.queue.len() as isize;
        if delta <= 0 {
            // the semaphore's N is too small
            semaphore.release((1 - delta) as usize);
            self.semaphore_n[idx].1 += -delta;
        } else {
            // first acquire is done by the producer
            self.semaphore_n[idx].1 -= 1;
            // the semaphore's N is too large, try acquires to reduce the size
            for _ in 1..delta {
                if semaphore.try_acquire() {
                    self.semaphore_n[idx].1 -= 1;
                } else {
                    break;
                }
            }
        }
        tracing::trace!(
            "delta = {}: semaphoreN = {}",
            delta,
            self.semaphore_n[idx].1
        );
    }
}

/// An output port with its wired connections.
pub struct OutputPort {
    name: String,
    dynamic: bool,
    pub(crate) connections: Vec<Connection>,
}

impl OutputPort {
    pub(crate) fn new(info: &PortInfo) -> Self {
        Self {
            name: info.name.clone(),
            dynamic: info.dynamic,
            connections: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub(crate) fn info(&self) -> PortInfo {
        PortInfo::output(&self.name, self.dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64) -> DataSample {
        DataSample::new(&b"x"[..], "t", ts)
    }

    #[test]
    fn test_queue_sample_bound() {
        let mut port = InputPort::new(&PortInfo {
            queue_size_samples: 3,
            ..PortInfo::input("in", false)
        });
        for ts in 0..5 {
            port.add_to_queue(sample(ts));
        }
        assert_eq!(port.queue_len(), 3);
        assert_eq!(port.get_data(0).unwrap().timestamp(), 4);
        assert_eq!(port.get_data(2).unwrap().timestamp(), 2);
        assert!(port.get_data(3).is_err());
    }

    #[test]
    fn test_queue_seconds_bound() {
        let mut port = InputPort::new(&PortInfo {
            queue_size_samples: 0,
            queue_size_seconds: 1.0,
            ..PortInfo::input("in", false)
        });
        // 1.0 seconds = 1_000_000 timestamp units
        for ts in [0, 400_000, 800_000, 1_600_000, 2_000_000] {
            port.add_to_queue(sample(ts));
        }
        // only samples within 1s of the newest (2_000_000) remain
        assert_eq!(port.queue_len(), 2);
        assert_eq!(port.get_data(1).unwrap().timestamp(), 1_600_000);
    }

    #[test]
    fn test_zero_queue_clamps_to_one() {
        let mut port = InputPort::new(&PortInfo {
            queue_size_samples: 0,
            queue_size_seconds: 0.0,
            ..PortInfo::input("in", false)
        });
        assert_eq!(port.queue_size_samples(), 1);
        port.add_to_queue(sample(1));
        port.add_to_queue(sample(2));
        assert_eq!(port.queue_len(), 1);
        assert_eq!(port.get_data(0).unwrap().timestamp(), 2);
    }

    #[test]
    fn test_get_data_by_seconds() {
        let mut port = InputPort::new(&PortInfo {
            queue_size_samples: 10,
            ..PortInfo::input("in", false)
        });
        for ts in [0, 500_000, 1_000_000] {
            port.add_to_queue(sample(ts));
        }
        assert_eq!(port.get_data_by_seconds(0.0).unwrap().timestamp(), 1_000_000);
        assert_eq!(port.get_data_by_seconds(0.4).unwrap().timestamp(), 500_000);
        assert_eq!(port.get_data_by_seconds(1.0).unwrap().timestamp(), 0);
        assert!(port.get_data_by_seconds(2.0).is_err());
    }

    #[test]
    fn test_dynamic_queue_reconciliation_grows_permits() {
        let mut port = InputPort::new(&PortInfo {
            queue_size_samples: 3,
            interthread_dynamic_queue: true,
            ..PortInfo::input("in", false)
        });
        let sem = Arc::new(ConnSemaphore::new(1));
        // producer acquired the single permit before each receive
        assert!(sem.try_acquire());
        port.add_to_queue(sample(1));
        port.reconcile_semaphore(&sem);
        // queue length 1, ledger 1 -> delta 0 -> one permit released back
        assert!(sem.try_acquire());
        port.add_to_queue(sample(2));
        port.reconcile_semaphore(&sem);
        // queue length 2 now exceeds the ledger, extra permit released
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        sem.release(2);
    }
}
