//! The per-target poll loop. Spawned by a scraper group when a target
//! appears in the desired set; runs until its cancellation token fires.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http::{Request, StatusCode};
use hyper::Body;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::status::TargetStatusMap;
use super::{ScrapeWork, Sink};
use crate::http::{HttpClient, HttpError};
use crate::prometheus::{parse_text, Label, ParseError, Sample, TimeSeries, WriteRequest};

#[derive(Debug, Error)]
enum ScrapeError {
    #[error("http error, {0}")]
    Http(#[from] HttpError),

    #[error("unexpected status code {0}")]
    UnexpectedStatusCode(StatusCode),

    #[error("parse metrics failed, {0}")]
    Parse(#[from] ParseError),
}

pub(crate) async fn run(
    work: Arc<ScrapeWork>,
    client: HttpClient,
    sink: Sink,
    status: Arc<TargetStatusMap>,
    group: &'static str,
    stop: CancellationToken,
) {
    // Spread first scrapes across the interval so a large group does not
    // hit its targets in lockstep.
    let start = time::Instant::now() + scrape_offset(&work.key(), work.interval);
    let mut ticker = time::interval_at(start, work.interval);

    let mut seen_series = HashSet::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let begin = Instant::now();
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = time::timeout(work.timeout, scrape_one(&client, &work)) => result,
        };
        let elapsed = begin.elapsed();
        let timestamp = now_millis();

        let (mut series, up, error) = match result {
            Ok(Ok(series)) => {
                if work.sample_limit > 0 && series.len() > work.sample_limit {
                    warn!(
                        message = "sample limit exceeded; dropping scraped samples",
                        endpoint = %work.scrape_url,
                        scraped = series.len(),
                        limit = work.sample_limit,
                    );
                    (Vec::new(), false, Some("sample limit exceeded".to_string()))
                } else {
                    (series, true, None)
                }
            }
            Ok(Err(err)) => {
                warn!(message = "scrape failed", endpoint = %work.scrape_url, %err);
                (Vec::new(), false, Some(err.to_string()))
            }
            Err(_) => {
                warn!(
                    message = "scrape timed out",
                    endpoint = %work.scrape_url,
                    timeout = ?work.timeout,
                );
                (
                    Vec::new(),
                    false,
                    Some(format!("timeout after {:?}", work.timeout)),
                )
            }
        };

        if work.series_limit > 0 {
            enforce_series_limit(&mut series, &mut seen_series, work.series_limit, &work.scrape_url);
        }

        let scraped = series.len();
        for ts in series.iter_mut() {
            apply_target_labels(ts, &work.labels, work.honor_labels);
            for sample in ts.samples.iter_mut() {
                if sample.timestamp == 0 {
                    sample.timestamp = timestamp;
                }
            }
        }

        series.push(auto_metric("up", if up { 1.0 } else { 0.0 }, &work, timestamp));
        series.push(auto_metric(
            "scrape_duration_seconds",
            elapsed.as_secs_f64(),
            &work,
            timestamp,
        ));
        series.push(auto_metric(
            "scrape_samples_scraped",
            scraped as f64,
            &work,
            timestamp,
        ));

        status.update(group, &work, up, elapsed, error);
        (sink)(WriteRequest { timeseries: series });
    }
}

async fn scrape_one(client: &HttpClient, work: &ScrapeWork) -> Result<Vec<TimeSeries>, ScrapeError> {
    let mut req = Request::get(work.scrape_url.as_str())
        .body(Body::empty())
        .map_err(HttpError::BuildRequest)?;
    if let Some(auth) = &work.auth {
        auth.apply(&mut req);
    }

    let resp = client.send(req).await?;
    if resp.status() != StatusCode::OK {
        return Err(ScrapeError::UnexpectedStatusCode(resp.status()));
    }

    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .map_err(|err| ScrapeError::Http(HttpError::ReadBody(err)))?;
    let text = String::from_utf8_lossy(&body);

    Ok(parse_text(&text)?)
}

/// Drops series beyond the lifetime cap, keeping every series already seen.
fn enforce_series_limit(
    series: &mut Vec<TimeSeries>,
    seen: &mut HashSet<u64>,
    limit: usize,
    endpoint: &str,
) {
    let mut dropped = 0;
    series.retain(|ts| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for label in &ts.labels {
            label.name.hash(&mut hasher);
            label.value.hash(&mut hasher);
        }
        let h = hasher.finish();

        if seen.contains(&h) {
            true
        } else if seen.len() < limit {
            seen.insert(h);
            true
        } else {
            dropped += 1;
            false
        }
    });

    if dropped > 0 {
        warn!(
            message = "series limit exceeded; dropping new series",
            endpoint = %endpoint,
            dropped,
            limit,
        );
    }
}

/// Merges the target's finalized labels into a scraped series. Scraped
/// labels clashing with target labels are renamed `exported_<name>` unless
/// `honor` is set.
fn apply_target_labels(ts: &mut TimeSeries, target: &[Label], honor: bool) {
    for label in target {
        match ts.labels.iter_mut().find(|l| l.name == label.name) {
            Some(existing) => {
                if honor {
                    continue;
                }
                let exported = Label {
                    name: format!("exported_{}", existing.name),
                    value: std::mem::take(&mut existing.value),
                };
                existing.value = label.value.clone();
                ts.labels.push(exported);
            }
            None => ts.labels.push(label.clone()),
        }
    }

    ts.labels.sort_by(|a, b| a.name.cmp(&b.name));
}

fn auto_metric(name: &'static str, value: f64, work: &ScrapeWork, timestamp: i64) -> TimeSeries {
    let mut labels = Vec::with_capacity(work.labels.len() + 1);
    labels.push(Label::new("__name__", name));
    labels.extend(work.labels.iter().cloned());
    labels.sort_by(|a, b| a.name.cmp(&b.name));

    TimeSeries {
        labels,
        samples: vec![Sample { value, timestamp }],
    }
}

/// Deterministic start offset within the interval, derived from the work
/// key so a target keeps its phase across reconciles.
fn scrape_offset(key: &str, interval: Duration) -> Duration {
    let nanos = interval.as_nanos() as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);

    Duration::from_nanos(hasher.finish() % nanos)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server};

    use super::*;

    #[test]
    fn offset_is_spread_and_stable() {
        let interval = Duration::from_secs(30);

        for i in 0..1000 {
            let key = format!("http://10.0.0.{}:9100/metrics", i);
            assert!(scrape_offset(&key, interval) < interval);
        }

        assert_eq!(
            scrape_offset("boo", interval),
            scrape_offset("boo", interval)
        );
        assert_ne!(
            scrape_offset("boo", interval),
            scrape_offset("far", interval)
        );
        assert_eq!(scrape_offset("boo", Duration::ZERO), Duration::ZERO);
    }

    fn series(labels: &[(&str, &str)]) -> TimeSeries {
        TimeSeries {
            labels: labels.iter().map(|(n, v)| Label::new(*n, *v)).collect(),
            samples: vec![Sample {
                value: 1.0,
                timestamp: 0,
            }],
        }
    }

    fn value_of<'a>(ts: &'a TimeSeries, name: &str) -> Option<&'a str> {
        ts.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    #[test]
    fn target_labels_win_by_default() {
        let mut ts = series(&[("__name__", "up"), ("job", "exporter")]);
        let target = vec![Label::new("instance", "a:80"), Label::new("job", "node")];

        apply_target_labels(&mut ts, &target, false);

        assert_eq!(value_of(&ts, "job"), Some("node"));
        assert_eq!(value_of(&ts, "exported_job"), Some("exporter"));
        assert_eq!(value_of(&ts, "instance"), Some("a:80"));
    }

    #[test]
    fn honor_labels_keeps_scraped_values() {
        let mut ts = series(&[("__name__", "up"), ("job", "exporter")]);
        let target = vec![Label::new("job", "node")];

        apply_target_labels(&mut ts, &target, true);

        assert_eq!(value_of(&ts, "job"), Some("exporter"));
        assert_eq!(value_of(&ts, "exported_job"), None);
    }

    #[test]
    fn series_limit_keeps_known_series() {
        let mut seen = HashSet::new();

        let mut batch = vec![series(&[("__name__", "a")]), series(&[("__name__", "b")])];
        enforce_series_limit(&mut batch, &mut seen, 2, "test");
        assert_eq!(batch.len(), 2);

        // a third distinct series is dropped, known ones survive
        let mut batch = vec![
            series(&[("__name__", "a")]),
            series(&[("__name__", "c")]),
        ];
        enforce_series_limit(&mut batch, &mut seen, 2, "test");
        assert_eq!(batch.len(), 1);
        assert_eq!(value_of(&batch[0], "__name__"), Some("a"));
    }

    async fn serve_payload(payload: &'static str) -> SocketAddr {
        let make = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                Ok::<_, Infallible>(Response::new(Body::from(payload)))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);

        addr
    }

    fn test_work(addr: SocketAddr) -> ScrapeWork {
        ScrapeWork {
            scrape_url: format!("http://{}/metrics", addr),
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            honor_labels: false,
            labels: vec![
                Label::new("instance", addr.to_string()),
                Label::new("job", "test"),
            ],
            original_labels: Vec::new(),
            auth: None,
            tls: None,
            sample_limit: 0,
            series_limit: 0,
        }
    }

    #[tokio::test]
    async fn worker_pushes_scraped_samples() {
        let addr = serve_payload("foo_total 7\n").await;
        let work = Arc::new(test_work(addr));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: Sink = Arc::new(move |wr| {
            let _ = tx.send(wr);
        });

        let status = Arc::new(TargetStatusMap::default());
        status.register("worker_test", &work);

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            work.clone(),
            HttpClient::new(),
            sink,
            status.clone(),
            "worker_test",
            stop.clone(),
        ));

        let wr = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no push before timeout")
            .expect("sink closed");

        let foo = wr
            .timeseries
            .iter()
            .find(|ts| value_of(ts, "__name__") == Some("foo_total"))
            .expect("scraped series missing");
        assert_eq!(foo.samples[0].value, 7.0);
        assert_eq!(value_of(foo, "job"), Some("test"));
        assert!(foo.samples[0].timestamp > 0);

        let up = wr
            .timeseries
            .iter()
            .find(|ts| value_of(ts, "__name__") == Some("up"))
            .expect("up series missing");
        assert_eq!(up.samples[0].value, 1.0);

        assert_eq!(status.status_by_group("worker_test", true), 1);

        stop.cancel();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn worker_reports_down_target() {
        // nothing listens on this address
        let work = Arc::new(ScrapeWork {
            scrape_url: "http://127.0.0.1:1/metrics".to_string(),
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            honor_labels: false,
            labels: vec![Label::new("job", "test")],
            original_labels: Vec::new(),
            auth: None,
            tls: None,
            sample_limit: 0,
            series_limit: 0,
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: Sink = Arc::new(move |wr| {
            let _ = tx.send(wr);
        });

        let status = Arc::new(TargetStatusMap::default());
        status.register("worker_down_test", &work);

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            work.clone(),
            HttpClient::new(),
            sink,
            status.clone(),
            "worker_down_test",
            stop.clone(),
        ));

        let wr = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no push before timeout")
            .expect("sink closed");

        let up = wr
            .timeseries
            .iter()
            .find(|ts| value_of(ts, "__name__") == Some("up"))
            .expect("up series missing");
        assert_eq!(up.samples[0].value, 0.0);
        assert_eq!(status.status_by_group("worker_down_test", false), 1);

        stop.cancel();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
