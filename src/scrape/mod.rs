//! The scrape supervision tree: a [`Manager`] drives one category loop per
//! service-discovery mechanism, each category owns a scraper group, and
//! each group owns one scrape loop per live target.

mod discovery;
mod group;
mod manager;
mod status;
mod work;
mod worker;

use std::sync::Arc;

use crate::prometheus::WriteRequest;

pub use manager::{check_config, Manager, ScrapeOptions};
pub use status::{dropped_targets, DroppedTargets, TargetStatus, TargetStatusMap};
pub use work::ScrapeWork;

/// Downstream consumer of scraped series. Shared by every scrape loop, so
/// it must tolerate concurrent calls.
pub type Sink = Arc<dyn Fn(WriteRequest) + Send + Sync>;
