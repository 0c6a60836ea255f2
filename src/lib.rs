#[macro_use]
extern crate tracing;

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod duration;
pub mod http;
pub mod metrics;
pub mod prometheus;
pub mod scrape;
pub mod signal;

pub use scrape::{check_config, Manager, ScrapeOptions, Sink};

/// Basic error type, dynamically dispatched and safe to send across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;
