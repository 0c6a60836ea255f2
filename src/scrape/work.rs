use std::time::Duration;

use crate::http::{Auth, TlsConfig};
use crate::prometheus::{labels_string, Label};

/// The fully-resolved description of one target: everything a scrape loop
/// needs, plus the pre-finalization labels kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeWork {
    /// Full endpoint URL, query string included.
    pub scrape_url: String,

    /// Duration between scrape attempts.
    pub interval: Duration,

    /// Per-attempt deadline.
    pub timeout: Duration,

    /// Keep conflicting labels from the scraped payload as-is.
    pub honor_labels: bool,

    /// Finalized labels attached to every pushed series, sorted by name.
    pub labels: Vec<Label>,

    /// Labels as produced by service discovery, before finalization.
    /// Diagnostics only; two works differing only here are duplicates.
    pub original_labels: Vec<Label>,

    pub auth: Option<Auth>,

    pub tls: Option<TlsConfig>,

    /// Scrapes returning more samples than this are discarded (0 = off).
    pub sample_limit: usize,

    /// Cap on distinct series over the target's lifetime (0 = off).
    pub series_limit: usize,
}

impl ScrapeWork {
    /// Canonical fingerprint of this work. Covers every field that changes
    /// what or how the target is scraped and deliberately excludes
    /// `original_labels`. Equal keys mean interchangeable targets: the
    /// reconcile loop keeps at most one scrape loop per key and never
    /// restarts a target whose key is unchanged. Changing the composition
    /// of this string forces a restart of every target on upgrade.
    pub fn key(&self) -> String {
        format!(
            "ScrapeURL={}, ScrapeInterval={:?}, ScrapeTimeout={:?}, HonorLabels={}, Labels={}, Auth={:?}, Tls={:?}, SampleLimit={}, SeriesLimit={}",
            self.scrape_url,
            self.interval,
            self.timeout,
            self.honor_labels,
            self.labels_string(),
            self.auth,
            self.tls,
            self.sample_limit,
            self.series_limit,
        )
    }

    pub fn labels_string(&self) -> String {
        labels_string(&self.labels)
    }

    pub fn original_labels_string(&self) -> String {
        labels_string(&self.original_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn work(url: &str) -> ScrapeWork {
        ScrapeWork {
            scrape_url: url.to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            honor_labels: false,
            labels: vec![
                Label::new("instance", "a:80"),
                Label::new("job", "test"),
            ],
            original_labels: vec![Label::new("__address__", "a:80")],
            auth: None,
            tls: None,
            sample_limit: 0,
            series_limit: 0,
        }
    }

    #[test]
    fn equal_works_have_equal_keys() {
        assert_eq!(work("http://a/metrics").key(), work("http://a/metrics").key());
        assert_ne!(work("http://a/metrics").key(), work("http://b/metrics").key());
    }

    #[test]
    fn key_ignores_original_labels() {
        let mut a = work("http://a/metrics");
        let mut b = work("http://a/metrics");
        a.original_labels = vec![Label::new("__address__", "a:80")];
        b.original_labels = vec![Label::new("__address__", "other:80")];
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_covers_scrape_relevant_fields() {
        let base = work("http://a/metrics");

        let mut changed = base.clone();
        changed.timeout = Duration::from_secs(5);
        assert_ne!(base.key(), changed.key());

        let mut changed = base.clone();
        changed.interval = Duration::from_secs(60);
        assert_ne!(base.key(), changed.key());

        let mut changed = base.clone();
        changed.labels.push(Label::new("env", "prod"));
        assert_ne!(base.key(), changed.key());

        let mut changed = base.clone();
        changed.auth = Some(Auth::Basic {
            user: "u".into(),
            password: "p".into(),
        });
        assert_ne!(base.key(), changed.key());

        let mut changed = base.clone();
        changed.sample_limit = 100;
        assert_ne!(base.key(), changed.key());
    }
}
