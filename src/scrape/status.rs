use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::ScrapeWork;
use crate::metrics;
use crate::prometheus::{labels_string, Label};

/// Live view of every scrape target, keyed by group and work identity.
/// Workers register before their first scrape and unregister after their
/// loop returns, so a reader may briefly observe a target that the
/// reconcile already dropped.
#[derive(Default)]
pub struct TargetStatusMap {
    targets: Mutex<HashMap<(&'static str, String), TargetStatus>>,
}

#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub scrape_url: String,
    pub up: bool,
    pub scrapes_total: u64,
    pub last_scrape_duration: Duration,
    pub last_error: Option<String>,
}

impl TargetStatusMap {
    /// Publishes zeroed gauges for a group so it is visible before the
    /// first reconcile.
    pub(crate) fn init_group(&self, group: &'static str) {
        self.sync_gauges(group);
    }

    pub fn register(&self, group: &'static str, work: &ScrapeWork) {
        self.targets.lock().insert(
            (group, work.key()),
            TargetStatus {
                scrape_url: work.scrape_url.clone(),
                up: false,
                scrapes_total: 0,
                last_scrape_duration: Duration::ZERO,
                last_error: None,
            },
        );

        self.sync_gauges(group);
    }

    pub fn unregister(&self, group: &'static str, work: &ScrapeWork) {
        self.targets.lock().remove(&(group, work.key()));
        self.sync_gauges(group);
    }

    pub fn update(
        &self,
        group: &'static str,
        work: &ScrapeWork,
        up: bool,
        duration: Duration,
        error: Option<String>,
    ) {
        let mut targets = self.targets.lock();
        if let Some(status) = targets.get_mut(&(group, work.key())) {
            status.up = up;
            status.scrapes_total += 1;
            status.last_scrape_duration = duration;
            status.last_error = error;
        }
        drop(targets);

        self.sync_gauges(group);
    }

    /// Number of registered targets in `group` with the given up state.
    pub fn status_by_group(&self, group: &str, up: bool) -> usize {
        self.targets
            .lock()
            .iter()
            .filter(|(key, status)| key.0 == group && status.up == up)
            .count()
    }

    /// Total registered targets across all groups.
    pub fn registered(&self) -> usize {
        self.targets.lock().len()
    }

    fn sync_gauges(&self, group: &'static str) {
        let gauge = metrics::register_gauge(
            "vm_promscrape_targets",
            "Current number of scrape targets, by group and up state",
        );
        gauge
            .recorder([
                ("type", Cow::Borrowed(group)),
                ("status", Cow::Borrowed("up")),
            ])
            .set(self.status_by_group(group, true) as i64);
        gauge
            .recorder([
                ("type", Cow::Borrowed(group)),
                ("status", Cow::Borrowed("down")),
            ])
            .set(self.status_by_group(group, false) as i64);
    }
}

/// Process-wide record of targets dropped because their key collided with
/// another target in the same reconcile pass. De-duplicated by label set
/// and never cleared; diagnostics only.
#[derive(Default)]
pub struct DroppedTargets {
    targets: Mutex<HashMap<String, Vec<Label>>>,
}

impl DroppedTargets {
    pub fn register(&self, original_labels: &[Label]) {
        self.targets
            .lock()
            .entry(labels_string(original_labels))
            .or_insert_with(|| original_labels.to_vec());
    }

    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Label strings of every dropped target seen so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.targets.lock().keys().cloned().collect()
    }
}

lazy_static! {
    static ref DROPPED_TARGETS: DroppedTargets = DroppedTargets::default();
}

pub fn dropped_targets() -> &'static DroppedTargets {
    &DROPPED_TARGETS
}
