//! The sample tap service: a channel sink filters can publish received
//! samples to, mainly for inspection by tests and diagnostics tools.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::sample::DataSample;

/// Service name under which the tap is registered.
pub const SAMPLE_TAP_SERVICE: &str = "SampleTap";

/// One received sample as reported by a collecting sink.
#[derive(Debug, Clone)]
pub struct TapRecord {
    /// Fully qualified name of the reporting filter.
    pub filter: String,
    /// Timestamp when the sample was processed (DataSample time units).
    pub received_time: i64,
    /// The received sample.
    pub sample: DataSample,
}

/// Fan-in channel for received samples.
pub struct SampleTap {
    tx: Sender<TapRecord>,
}

impl SampleTap {
    /// Create a tap together with the receiving end.
    pub fn channel() -> (Self, Receiver<TapRecord>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn publish(&self, record: TapRecord) {
        let _ = self.tx.send(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_channel() {
        let (tap, rx) = SampleTap::channel();
        tap.publish(TapRecord {
            filter: "/a".into(),
            received_time: 1,
            sample: DataSample::new(&b"x"[..], "t", 1),
        });
        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.filter, "/a");
    }
}
