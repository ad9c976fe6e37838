//! # nexxT: an extensible dataflow runtime
//!
//! nexxT turns a declarative graph of filters into a running,
//! multi-threaded pipeline with strict lifecycle guarantees, bounded
//! inter-thread queues and deterministic teardown. It targets
//! computer-vision and sensor pipelines.
//!
//! ## Architecture
//!
//! - **Interface**: [`filter::Filter`], [`sample::DataSample`] and the
//!   port model form the user extension surface.
//! - **Core**: per-thread executors ([`executor`]), transports
//!   ([`transport`]) and the coordinated state machine ([`active`]).
//! - **Configuration**: applications and composite filters with JSON
//!   persistence ([`config`]), parameterized through the property and
//!   variable subsystem ([`property`]).
//! - **Extension points**: plugin loading ([`plugins`]) and the service
//!   registry ([`services`]).
//!
//! ## Example
//!
//! ```ignore
//! use nexxt::config::{Configuration, ConfigFileLoader};
//!
//! fn main() -> anyhow::Result<()> {
//!     nexxt::filters::register_builtin();
//!     let mut config = Configuration::new();
//!     ConfigFileLoader::load(&mut config, "pipeline.json")?;
//!     config.activate("live")?;
//!     let app = config.active_application().expect("just activated");
//!     app.init()?;
//!     app.open()?;
//!     app.start()?;
//!     app.process_events(std::time::Duration::from_secs(10));
//!     app.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod active;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod filter;
pub mod filters;
pub mod graph;
pub mod plugins;
pub mod ports;
pub mod property;
pub mod sample;
pub mod services;
pub mod thread;
pub mod transport;

// Re-export commonly used types
pub use active::ActiveApplication;
pub use config::{Application, CompositeFilter, ConfigFileLoader, Configuration};
pub use environment::{FilterContext, FilterCreationContext, InputPortRef, OutputPortRef};
pub use error::{NexxTError, Result};
pub use filter::{Filter, FilterState};
pub use graph::{FilterGraph, LibraryRef};
pub use property::{PropertyCollection, PropertyHandler, PropertyValue, Variables};
pub use sample::{DataSample, TIMESTAMP_RES};
pub use services::ServiceRegistry;

/// The platform identifier used in `${NEXXT_PLATFORM}` substitutions,
/// e.g. `linux_x86_64` or `msvc_x86_64`.
pub fn nexxt_platform() -> String {
    let os = match std::env::consts::OS {
        "windows" => "msvc",
        other => other,
    };
    format!("{}_{}", os, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nexxt_platform_shape() {
        let p = nexxt_platform();
        assert!(p.contains('_'));
        assert!(!p.is_empty());
    }
}
