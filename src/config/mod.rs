//! The configuration container: applications, composite filters and
//! their (de)serialization.

pub mod application;
pub mod composite;
pub mod configuration;
pub mod files;
pub mod subconfig;

pub use application::Application;
pub use composite::CompositeFilter;
pub use configuration::Configuration;
pub use files::ConfigFileLoader;
pub use subconfig::SubConfiguration;
