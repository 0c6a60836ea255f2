//! The top-level supervisor: loads the config, spawns one category loop
//! per service-discovery mechanism, fans fresh configs out on reload and
//! cascades cancellation on stop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::discovery;
use super::group::ScraperGroup;
use super::status::TargetStatusMap;
use super::{ScrapeWork, Sink};
use crate::config::{self, Config};
use crate::http::HttpClient;
use crate::metrics;

const DEFAULT_FILE_SD_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Checks the config at `path` for errors without starting anything.
pub fn check_config(path: &Path) -> crate::Result<()> {
    if path.as_os_str().is_empty() {
        return Err("missing scrape config path".into());
    }
    config::load_from_path(path)?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    /// Path to the scrape config file. Empty means nothing to scrape;
    /// the manager starts and stops but supervises no targets.
    pub config_path: PathBuf,

    /// Periodic re-read of the config file. Zero disables the recheck;
    /// reloads then happen only on [`Manager::reload`].
    pub config_check_interval: Duration,

    /// Re-extraction cadence for `file_sd_configs` targets.
    pub file_sd_check_interval: Duration,

    /// Silence duplicate-target diagnostics. Duplicates are dropped
    /// either way.
    pub suppress_duplicate_errors: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            config_check_interval: Duration::ZERO,
            file_sd_check_interval: DEFAULT_FILE_SD_CHECK_INTERVAL,
            suppress_duplicate_errors: false,
        }
    }
}

/// A running scrape supervisor. Obtained from [`Manager::start`]; torn
/// down with [`Manager::stop`], which returns only once every scrape loop
/// has exited.
pub struct Manager {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    reload_tx: mpsc::Sender<()>,
    pending: Arc<AtomicI32>,
    status: Arc<TargetStatusMap>,
}

impl Manager {
    /// Loads the config at `options.config_path` and starts the
    /// supervision tree. A load failure at this point is fatal for the
    /// caller; later reload failures only log and keep the previous
    /// config. Must be called within a tokio runtime.
    pub fn start(options: ScrapeOptions, sink: Sink) -> crate::Result<Manager> {
        let stop = CancellationToken::new();
        let pending = Arc::new(AtomicI32::new(0));
        let status = Arc::new(TargetStatusMap::default());
        let (reload_tx, reload_rx) = mpsc::channel(2);

        if options.config_path.as_os_str().is_empty() {
            // Nothing to scrape.
            return Ok(Manager {
                stop,
                handle: tokio::spawn(async {}),
                reload_tx,
                pending,
                status,
            });
        }

        info!(message = "reading scrape configs", path = ?options.config_path);
        let (cfg, data) = config::load_from_path(&options.config_path)?;

        let handle = tokio::spawn(run_scraper(
            options,
            cfg,
            data,
            sink,
            stop.clone(),
            reload_rx,
            Arc::clone(&pending),
            Arc::clone(&status),
        ));

        Ok(Manager {
            stop,
            handle,
            reload_tx,
            pending,
            status,
        })
    }

    /// Requests a config re-read, as a SIGHUP handler would. Never blocks;
    /// a reload already in flight absorbs the request.
    pub fn reload(&self) {
        let _ = self.reload_tx.try_send(());
    }

    /// Number of categories that have not yet applied their first config.
    /// Zero means every category finished its initial reconcile; readiness
    /// probes should gate on this.
    pub fn pending_scrape_configs(&self) -> i32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Live view of every scrape target this manager supervises.
    pub fn target_status(&self) -> Arc<TargetStatusMap> {
        Arc::clone(&self.status)
    }

    /// Stops everything and waits for every scrape loop to exit. No
    /// deadline is imposed; callers wanting one should wrap this in a
    /// timeout and log the elapsed time.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scraper(
    options: ScrapeOptions,
    cfg: Config,
    mut data: Vec<u8>,
    sink: Sink,
    stop: CancellationToken,
    mut reload_rx: mpsc::Receiver<()>,
    pending: Arc<AtomicI32>,
    status: Arc<TargetStatusMap>,
) {
    let mut cfg = Arc::new(cfg);

    let mut set = CategorySet::new(
        Arc::clone(&cfg),
        sink,
        HttpClient::new(),
        status,
        pending,
        options.suppress_duplicate_errors,
        stop.child_token(),
    );
    set.add("static_configs", Duration::ZERO, |cfg, _prev| {
        discovery::static_scrape_works(cfg)
    });
    set.add(
        "file_sd_configs",
        options.file_sd_check_interval,
        discovery::file_sd_scrape_works,
    );

    let reloads = metrics::register_counter(
        "vm_promscrape_config_reloads_total",
        "Total number of scrape config reloads applied",
    )
    .recorder(&[]);

    let mut ticker = (!options.config_check_interval.is_zero()).then(|| {
        time::interval_at(
            time::Instant::now() + options.config_check_interval,
            options.config_check_interval,
        )
    });

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!(message = "stopping scrapers");
                let started = Instant::now();
                set.stop().await;
                info!(message = "stopped scrapers", elapsed = ?started.elapsed());
                return;
            }

            Some(()) = reload_rx.recv() => {
                info!(message = "reload signal received; re-reading scrape configs", path = ?options.config_path);
                match config::load_from_path(&options.config_path) {
                    Ok((new_cfg, new_data)) => {
                        if new_data == data {
                            info!(message = "nothing changed", path = ?options.config_path);
                            continue;
                        }
                        cfg = Arc::new(new_cfg);
                        data = new_data;
                    }
                    Err(err) => {
                        error!(
                            message = "cannot re-read scrape configs; continuing with the previous config",
                            path = ?options.config_path,
                            %err
                        );
                        continue;
                    }
                }
            }

            _ = tick(&mut ticker) => {
                match config::load_from_path(&options.config_path) {
                    Ok((new_cfg, new_data)) => {
                        if new_data == data {
                            continue;
                        }
                        cfg = Arc::new(new_cfg);
                        data = new_data;
                    }
                    Err(err) => {
                        warn!(
                            message = "cannot re-read scrape configs; continuing with the previous config",
                            path = ?options.config_path,
                            %err
                        );
                        continue;
                    }
                }
            }
        }

        info!(message = "scrape config changed; applying", path = ?options.config_path);
        reloads.inc(1);
        set.update_config(&cfg);
    }
}

/// Resolves on the next tick, or never when no ticker is configured.
async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

type Extractor = Box<dyn Fn(&Config, &[ScrapeWork]) -> Vec<ScrapeWork> + Send>;

/// The set of per-category loops and the watch channels feeding them. Each
/// channel holds exactly the latest config: a slow category never delays
/// the runner, it just skips superseded snapshots.
struct CategorySet {
    initial: Arc<Config>,
    sink: Sink,
    client: HttpClient,
    status: Arc<TargetStatusMap>,
    pending: Arc<AtomicI32>,
    suppress_duplicate_errors: bool,
    stop: CancellationToken,
    tracker: TaskTracker,
    senders: Vec<watch::Sender<Arc<Config>>>,
}

impl CategorySet {
    #[allow(clippy::too_many_arguments)]
    fn new(
        initial: Arc<Config>,
        sink: Sink,
        client: HttpClient,
        status: Arc<TargetStatusMap>,
        pending: Arc<AtomicI32>,
        suppress_duplicate_errors: bool,
        stop: CancellationToken,
    ) -> Self {
        Self {
            initial,
            sink,
            client,
            status,
            pending,
            suppress_duplicate_errors,
            stop,
            tracker: TaskTracker::new(),
            senders: Vec::new(),
        }
    }

    fn add<F>(&mut self, name: &'static str, check_interval: Duration, extract: F)
    where
        F: Fn(&Config, &[ScrapeWork]) -> Vec<ScrapeWork> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = watch::channel(Arc::clone(&self.initial));
        let category = Category {
            name,
            check_interval,
            extract: Box::new(extract),
            cfg_rx: rx,
            stop: self.stop.clone(),
            group: ScraperGroup::new(
                name,
                Arc::clone(&self.sink),
                self.client.clone(),
                Arc::clone(&self.status),
                self.suppress_duplicate_errors,
            ),
        };

        self.tracker.spawn(category.run(Arc::clone(&self.pending)));
        self.senders.push(tx);
    }

    /// Delivers the latest config to every category. An unread older
    /// snapshot is simply overwritten.
    fn update_config(&self, cfg: &Arc<Config>) {
        for tx in &self.senders {
            let _ = tx.send(Arc::clone(cfg));
        }
    }

    async fn stop(self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One service-discovery category: re-extracts the desired target list on
/// every config change or poll tick and hands it to its scraper group.
struct Category {
    name: &'static str,
    check_interval: Duration,
    extract: Extractor,
    cfg_rx: watch::Receiver<Arc<Config>>,
    stop: CancellationToken,
    group: ScraperGroup,
}

impl Category {
    async fn run(mut self, pending: Arc<AtomicI32>) {
        let mut ticker = (!self.check_interval.is_zero()).then(|| {
            time::interval_at(
                time::Instant::now() + self.check_interval,
                self.check_interval,
            )
        });

        let mut cfg = self.cfg_rx.borrow_and_update().clone();
        let mut prev = (self.extract)(&cfg, &[]);
        self.group.update(&prev);
        pending.fetch_sub(1, Ordering::SeqCst);
        debug!(
            message = "initial reconcile applied",
            category = self.name,
            targets = prev.len(),
        );

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,

                changed = self.cfg_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    cfg = self.cfg_rx.borrow_and_update().clone();
                }

                _ = tick(&mut ticker) => {}
            }

            let sws = (self.extract)(&cfg, &prev);
            self.group.update(&sws);
            prev = sws;
        }

        self.group.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::prometheus::{Label, WriteRequest};

    fn noop_sink() -> Sink {
        Arc::new(|_: WriteRequest| {})
    }

    fn work(url: &str) -> ScrapeWork {
        ScrapeWork {
            scrape_url: url.to_string(),
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(10),
            honor_labels: false,
            labels: vec![Label::new("instance", url.to_string())],
            original_labels: vec![Label::new("__address__", url.to_string())],
            auth: None,
            tls: None,
            sample_limit: 0,
            series_limit: 0,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn category_set_applies_initial_config_and_churn() {
        let desired: Arc<Mutex<Vec<ScrapeWork>>> = Arc::new(Mutex::new(vec![
            work("http://a/metrics"),
            work("http://b/metrics"),
            work("http://c/metrics"),
        ]));

        let status = Arc::new(TargetStatusMap::default());
        let pending = Arc::new(AtomicI32::new(0));
        let mut set = CategorySet::new(
            Arc::new(Config::default()),
            noop_sink(),
            HttpClient::new(),
            Arc::clone(&status),
            Arc::clone(&pending),
            false,
            CancellationToken::new(),
        );

        let changes = metrics::register_counter("vm_promscrape_config_changes_total", "")
            .recorder(&[("type", "synthetic_sd_test")]);
        let before = changes.fetch();

        let source = Arc::clone(&desired);
        set.add(
            "synthetic_sd_test",
            Duration::from_millis(30),
            move |_cfg, _prev| source.lock().clone(),
        );

        // initial reconcile: 3 additions
        wait_for(|| pending.load(Ordering::SeqCst) == 0).await;
        wait_for(|| status.registered() == 3).await;
        assert_eq!(changes.fetch(), before + 3);

        // next tick sees one target replaced by a new one
        desired.lock().remove(0);
        desired.lock().push(work("http://d/metrics"));
        wait_for(|| changes.fetch() == before + 5).await;
        assert_eq!(status.registered(), 3);

        set.stop().await;
        assert_eq!(status.registered(), 0);
    }

    #[tokio::test]
    async fn config_updates_reach_zero_interval_categories() {
        let status = Arc::new(TargetStatusMap::default());
        let pending = Arc::new(AtomicI32::new(0));
        let mut set = CategorySet::new(
            Arc::new(Config::default()),
            noop_sink(),
            HttpClient::new(),
            Arc::clone(&status),
            Arc::clone(&pending),
            false,
            CancellationToken::new(),
        );

        // extractor output depends only on the config generation
        set.add("config_driven_test", Duration::ZERO, |cfg, _prev| {
            cfg.scrape_configs
                .iter()
                .map(|job| work(&format!("http://{}/metrics", job.job_name)))
                .collect()
        });

        wait_for(|| pending.load(Ordering::SeqCst) == 0).await;
        assert_eq!(status.registered(), 0);

        let cfg: Config =
            serde_yaml::from_str("scrape_configs:\n  - job_name: fresh\n").unwrap();
        set.update_config(&Arc::new(cfg));
        wait_for(|| status.registered() == 1).await;

        set.stop().await;
    }

    #[tokio::test]
    async fn check_config_requires_path() {
        assert!(check_config(Path::new("")).is_err());
        assert!(check_config(Path::new("/nonexistent/promscrape.yml")).is_err());
    }
}
