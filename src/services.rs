//! The process-wide service registry and the service contracts published
//! by the core.
//!
//! Services are registered by name at startup and queried by name by
//! loosely-coupled collaborators. The core neither creates nor depends on
//! a specific implementation; tests construct their own registry, while
//! production code consults the process default.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::error::{NexxTError, Result};

/// Log levels of the logging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Internal,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Critical,
}

impl LogLevel {
    /// Parse a verbosity name as used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INTERNAL" => Some(LogLevel::Internal),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

/// A name → service map for loosely-coupled collaborators.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

static DEFAULT: OnceLock<ServiceRegistry> = OnceLock::new();

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn default() -> &'static ServiceRegistry {
        DEFAULT.get_or_init(ServiceRegistry::new)
    }

    /// Register a service under a name, replacing any previous entry.
    pub fn add_service<T: Any + Send + Sync>(&self, name: &str, service: Arc<T>) {
        self.services
            .write()
            .unwrap()
            .insert(name.to_string(), service);
    }

    /// Look up a service by name and concrete type.
    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        let services = self.services.read().unwrap();
        let service = services
            .get(name)
            .ok_or_else(|| NexxTError::Runtime(format!("Service '{}' not found.", name)))?;
        Arc::clone(service).downcast::<T>().map_err(|_| {
            NexxTError::Runtime(format!("Service '{}' has an unexpected type.", name))
        })
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.read().unwrap().contains_key(name)
    }

    /// Remove a single service.
    pub fn remove_service(&self, name: &str) {
        self.services.write().unwrap().remove(name);
    }

    /// Remove all registered services.
    pub fn remove_all(&self) {
        self.services.write().unwrap().clear();
    }
}

// ── Logging ──

/// Contract of the logging service.
pub trait LoggingService: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, file: &str, line: u32);
}

/// Maps the logging service onto the tracing framework.
pub struct ConsoleLogger;

impl LoggingService for ConsoleLogger {
    fn log(&self, level: LogLevel, message: &str, file: &str, line: u32) {
        match level {
            LogLevel::Internal => tracing::trace!("{} ({}:{})", message, file, line),
            LogLevel::Debug => tracing::debug!("{} ({}:{})", message, file, line),
            LogLevel::Info => tracing::info!("{} ({}:{})", message, file, line),
            LogLevel::Warn => tracing::warn!("{} ({}:{})", message, file, line),
            LogLevel::Error | LogLevel::Fatal | LogLevel::Critical => {
                tracing::error!("{} ({}:{})", message, file, line)
            }
        }
    }
}

// ── Playback control ──

/// Events published by the playback control service.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    SequenceOpened {
        file: String,
        begin_ns: i64,
        end_ns: i64,
        streams: Vec<String>,
    },
    CurrentTimestampChanged(i64),
    PlaybackStarted,
    PlaybackPaused,
    TimeRatioChanged(f64),
}

/// Implemented by playback-capable filters which register themselves with
/// the playback control service.
pub trait PlaybackDelegate: Send + Sync {
    fn start_playback(&self);
    fn pause_playback(&self);
    fn step_forward(&self, stream: Option<&str>);
    fn step_backward(&self, stream: Option<&str>);
    fn seek_beginning(&self);
    fn seek_end(&self);
    fn seek_time(&self, timestamp_ns: i64);
    fn set_sequence(&self, path: &str);
    fn set_time_factor(&self, factor: f64);
}

type PlaybackObserver = Box<dyn Fn(&PlaybackEvent) + Send + Sync>;

/// Console implementation of the playback control service: forwards the
/// control slots to the registered delegate and fans events out to the
/// subscribed observers.
#[derive(Default)]
pub struct PlaybackControl {
    delegate: RwLock<Option<Arc<dyn PlaybackDelegate>>>,
    observers: Mutex<Vec<PlaybackObserver>>,
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by playback filters during open to take over the transport
    /// controls.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn PlaybackDelegate>>) {
        *self.delegate.write().unwrap() = delegate;
    }

    pub fn subscribe(&self, observer: PlaybackObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Publish an event to all observers (called by playback filters).
    pub fn notify(&self, event: PlaybackEvent) {
        for obs in self.observers.lock().unwrap().iter() {
            obs(&event);
        }
    }

    fn with_delegate(&self, f: impl FnOnce(&Arc<dyn PlaybackDelegate>)) {
        match self.delegate.read().unwrap().as_ref() {
            Some(d) => f(d),
            None => tracing::warn!("no playback delegate registered"),
        }
    }

    pub fn start_playback(&self) {
        self.with_delegate(|d| d.start_playback());
    }

    pub fn pause_playback(&self) {
        self.with_delegate(|d| d.pause_playback());
    }

    pub fn step_forward(&self, stream: Option<&str>) {
        self.with_delegate(|d| d.step_forward(stream));
    }

    pub fn step_backward(&self, stream: Option<&str>) {
        self.with_delegate(|d| d.step_backward(stream));
    }

    pub fn seek_beginning(&self) {
        self.with_delegate(|d| d.seek_beginning());
    }

    pub fn seek_end(&self) {
        self.with_delegate(|d| d.seek_end());
    }

    pub fn seek_time(&self, timestamp_ns: i64) {
        self.with_delegate(|d| d.seek_time(timestamp_ns));
    }

    pub fn set_sequence(&self, path: &str) {
        self.with_delegate(|d| d.set_sequence(path));
    }

    pub fn set_time_factor(&self, factor: f64) {
        self.with_delegate(|d| d.set_time_factor(factor));
    }
}

// ── Recording control ──

/// Events published by the recording control service.
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    StatusUpdate {
        file: String,
        length_seconds: f64,
        bytes_written: u64,
    },
    NotifyError(String),
}

/// Implemented by recording-capable filters.
pub trait RecordingDelegate: Send + Sync {
    fn start_recording(&self, directory: &str);
    fn stop_recording(&self);
}

type RecordingObserver = Box<dyn Fn(&RecordingEvent) + Send + Sync>;

/// Console implementation of the recording control service.
#[derive(Default)]
pub struct RecordingControl {
    delegates: RwLock<Vec<Arc<dyn RecordingDelegate>>>,
    observers: Mutex<Vec<RecordingObserver>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_delegate(&self, delegate: Arc<dyn RecordingDelegate>) {
        self.delegates.write().unwrap().push(delegate);
    }

    pub fn clear_delegates(&self) {
        self.delegates.write().unwrap().clear();
    }

    pub fn subscribe(&self, observer: RecordingObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Publish an event to all observers. A reported error stops the
    /// recording.
    pub fn notify(&self, event: RecordingEvent) {
        if matches!(event, RecordingEvent::NotifyError(_)) {
            self.stop_recording();
        }
        for obs in self.observers.lock().unwrap().iter() {
            obs(&event);
        }
    }

    pub fn start_recording(&self, directory: &str) {
        for d in self.delegates.read().unwrap().iter() {
            d.start_recording(directory);
        }
    }

    pub fn stop_recording(&self) {
        for d in self.delegates.read().unwrap().iter() {
            d.stop_recording();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_add_get() {
        let registry = ServiceRegistry::new();
        registry.add_service("Logging", Arc::new(ConsoleLogger));
        assert!(registry.has_service("Logging"));
        let logger: Arc<ConsoleLogger> = registry.get_service("Logging").unwrap();
        logger.log(LogLevel::Info, "hello", file!(), line!());
        assert!(registry.get_service::<ConsoleLogger>("Missing").is_err());
        // wrong type
        assert!(registry.get_service::<PlaybackControl>("Logging").is_err());
    }

    #[test]
    fn test_registry_remove() {
        let registry = ServiceRegistry::new();
        registry.add_service("PlaybackControl", Arc::new(PlaybackControl::new()));
        registry.remove_service("PlaybackControl");
        assert!(!registry.has_service("PlaybackControl"));
        registry.add_service("PlaybackControl", Arc::new(PlaybackControl::new()));
        registry.remove_all();
        assert!(!registry.has_service("PlaybackControl"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("internal"), Some(LogLevel::Internal));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_playback_events_reach_observers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let control = PlaybackControl::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        control.subscribe(Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        control.notify(PlaybackEvent::PlaybackStarted);
        control.notify(PlaybackEvent::CurrentTimestampChanged(1000));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
