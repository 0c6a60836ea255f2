//! The live set of scrape loops for one service-discovery category and the
//! reconcile that keeps it equal to the desired target list.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::status::{dropped_targets, TargetStatusMap};
use super::{worker, ScrapeWork, Sink};
use crate::http::HttpClient;
use crate::metrics::{self, Counter};

/// One running scrape loop and the handle that cancels it.
struct Scraper {
    work: Arc<ScrapeWork>,
    stop: CancellationToken,
}

pub(crate) struct ScraperGroup {
    name: &'static str,
    sink: Sink,
    client: HttpClient,
    status: Arc<TargetStatusMap>,
    suppress_duplicate_errors: bool,

    /// Live scrapers by work key. `None` once the group is stopped, which
    /// turns any late reconcile into a no-op.
    targets: Mutex<Option<HashMap<String, Scraper>>>,

    tracker: TaskTracker,
    changes: Counter,
}

impl ScraperGroup {
    pub(crate) fn new(
        name: &'static str,
        sink: Sink,
        client: HttpClient,
        status: Arc<TargetStatusMap>,
        suppress_duplicate_errors: bool,
    ) -> Self {
        status.init_group(name);

        Self {
            name,
            sink,
            client,
            status,
            suppress_duplicate_errors,
            targets: Mutex::new(Some(HashMap::new())),
            tracker: TaskTracker::new(),
            changes: metrics::register_counter(
                "vm_promscrape_config_changes_total",
                "Total number of scrape target additions and removals, by group",
            )
            .recorder(&[("type", name)]),
        }
    }

    /// Reconciles the live scraper set against `sws`: newcomers are
    /// started, targets missing from `sws` are cancelled, unchanged keys
    /// keep their running scraper untouched. Duplicate keys within `sws`
    /// collapse to the first occurrence; the losers land in the dropped
    /// registry. Returns (additions, deletions).
    pub(crate) fn update(&self, sws: &[ScrapeWork]) -> (usize, usize) {
        let mut guard = self.targets.lock();
        let Some(targets) = guard.as_mut() else {
            return (0, 0);
        };

        let mut additions = 0;
        let mut deletions = 0;

        // Desired work keys, mapped to the original labels of the first
        // occurrence for duplicate diagnostics.
        let mut desired: HashMap<String, String> = HashMap::with_capacity(sws.len());
        for sw in sws {
            let key = sw.key();
            if let Some(first_labels) = desired.get(&key) {
                if !self.suppress_duplicate_errors {
                    error!(
                        message = "skipping duplicate scrape target with identical labels; make sure service discovery and relabeling are set up properly",
                        endpoint = %sw.scrape_url,
                        labels = %sw.labels_string(),
                        original_labels_first = %first_labels,
                        original_labels_second = %sw.original_labels_string(),
                    );
                }
                dropped_targets().register(&sw.original_labels);
                continue;
            }
            desired.insert(key.clone(), sw.original_labels_string());

            if targets.contains_key(&key) {
                // The scraper for the given key already exists; equal keys
                // imply equal scrape-relevant fields, so leave it running.
                continue;
            }

            let scraper = Scraper {
                work: Arc::new(sw.clone()),
                stop: CancellationToken::new(),
            };
            self.status.register(self.name, &scraper.work);

            let work = Arc::clone(&scraper.work);
            let client = self.client.clone();
            let sink = Arc::clone(&self.sink);
            let status = Arc::clone(&self.status);
            let name = self.name;
            let stop = scraper.stop.clone();
            self.tracker.spawn(async move {
                worker::run(Arc::clone(&work), client, sink, Arc::clone(&status), name, stop).await;
                status.unregister(name, &work);
            });

            targets.insert(key, scraper);
            additions += 1;
        }

        // Cancel scrapers whose key left the desired set.
        targets.retain(|key, scraper| {
            if desired.contains_key(key) {
                true
            } else {
                scraper.stop.cancel();
                deletions += 1;
                false
            }
        });

        let total = targets.len();
        drop(guard);

        if additions + deletions > 0 {
            self.changes.inc((additions + deletions) as u64);
            info!(
                message = "scrape targets changed",
                group = self.name,
                added = additions,
                removed = deletions,
                total,
            );
        }

        (additions, deletions)
    }

    /// Cancels every scraper and waits for all of their loops to return.
    /// The group no longer accepts reconciles afterwards.
    pub(crate) async fn stop(&self) {
        {
            let mut guard = self.targets.lock();
            if let Some(targets) = guard.take() {
                for scraper in targets.values() {
                    scraper.stop.cancel();
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}
