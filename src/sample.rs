//! The data sample envelope flowing through the filter graph.
//!
//! A [`DataSample`] holds an opaque byte payload, a data-type string chosen
//! by producer and consumer to identify the serialization, and an integer
//! timestamp in units of [`TIMESTAMP_RES`] seconds. Samples are shared by
//! reference counting; once published, payload and timestamp never change.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The resolution of sample timestamps in seconds (1 microsecond).
pub const TIMESTAMP_RES: f64 = 1e-6;

/// An immutable, reference-counted data sample.
#[derive(Clone, Debug)]
pub struct DataSample {
    content: Arc<[u8]>,
    datatype: Arc<str>,
    timestamp: i64,
}

thread_local! {
    // current_time must not run backwards within a thread, even if the
    // system clock is adjusted.
    static LAST_TIME: Cell<i64> = const { Cell::new(0) };
}

impl DataSample {
    /// Create a sample from a payload, a data-type tag and a timestamp.
    pub fn new(content: impl Into<Arc<[u8]>>, datatype: &str, timestamp: i64) -> Self {
        Self {
            content: content.into(),
            datatype: Arc::from(datatype),
            timestamp,
        }
    }

    /// The payload. The returned handle is immutable and independent of the
    /// sample, so readers can never observe modifications.
    pub fn content(&self) -> Arc<[u8]> {
        Arc::clone(&self.content)
    }

    /// The data-type tag identifying the payload serialization.
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    /// The timestamp in units of [`TIMESTAMP_RES`] seconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Create a copy of the given sample.
    pub fn copy(src: &DataSample) -> DataSample {
        DataSample::new(src.content(), src.datatype(), src.timestamp())
    }

    /// The current system time in units of [`TIMESTAMP_RES`] seconds,
    /// monotonically non-decreasing within the calling thread.
    pub fn current_time() -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        LAST_TIME.with(|last| {
            let t = now.max(last.get());
            last.set(t);
            t
        })
    }

    /// The measured resolution of [`DataSample::current_time`] in timestamp
    /// units. Some platforms tick coarser than the 10 us target; callers can
    /// use this for diagnostics.
    pub fn time_resolution() -> i64 {
        let t0 = Self::current_time();
        loop {
            let t1 = Self::current_time();
            if t1 > t0 {
                return t1 - t0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_accessors() {
        let s = DataSample::new(&b"hello"[..], "text/plain", 42);
        assert_eq!(&*s.content(), b"hello");
        assert_eq!(s.datatype(), "text/plain");
        assert_eq!(s.timestamp(), 42);
    }

    #[test]
    fn test_content_views_are_independent() {
        let s = DataSample::new(&b"abc"[..], "t", 0);
        let a = s.content();
        let b = s.content();
        assert_eq!(&*a, &*b);
        drop(a);
        assert_eq!(&*s.content(), b"abc");
    }

    #[test]
    fn test_copy_is_equal_but_detached() {
        let s = DataSample::new(&b"xyz"[..], "t", 7);
        let c = DataSample::copy(&s);
        assert_eq!(&*c.content(), &*s.content());
        assert_eq!(c.datatype(), s.datatype());
        assert_eq!(c.timestamp(), s.timestamp());
    }

    #[test]
    fn test_current_time_monotonic() {
        let mut last = DataSample::current_time();
        for _ in 0..1000 {
            let t = DataSample::current_time();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn test_current_time_is_wall_clock_scaled() {
        let t = DataSample::current_time();
        let secs = t as f64 * TIMESTAMP_RES;
        // sometime after 2020-01-01 and before 2100
        assert!(secs > 1.577e9 && secs < 4.1e9);
    }
}
