//! The declarative scrape configuration: a Prometheus-style YAML file with
//! one job per `scrape_configs` entry and the service-discovery sections
//! each job may carry.

mod loading;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::http::{Auth, TlsConfig};

pub use loading::{load_from_path, LoadError};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub scrape_configs: Vec<JobConfig>,
}

impl Config {
    /// Checks the parsed file for the mistakes serde cannot catch.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.global.scrape_interval.is_zero() {
            errors.push("global.scrape_interval must be positive".to_string());
        }
        if self.global.scrape_timeout.is_zero() {
            errors.push("global.scrape_timeout must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for job in &self.scrape_configs {
            if job.job_name.is_empty() {
                errors.push("scrape config with empty job_name".to_string());
                continue;
            }
            if !seen.insert(&job.job_name) {
                errors.push(format!("duplicate job_name {:?}", job.job_name));
            }
            if let Some(interval) = job.scrape_interval {
                if interval.is_zero() {
                    errors.push(format!(
                        "job {:?}: scrape_interval must be positive",
                        job.job_name
                    ));
                }
            }
            if let Some(timeout) = job.scrape_timeout {
                if timeout.is_zero() {
                    errors.push(format!(
                        "job {:?}: scrape_timeout must be positive",
                        job.job_name
                    ));
                }
            }
            if !job.metrics_path.starts_with('/') {
                errors.push(format!(
                    "job {:?}: metrics_path must start with '/'",
                    job.job_name
                ));
            }
            if job.static_configs.is_empty() && job.file_sd_configs.is_empty() {
                errors.push(format!(
                    "job {:?}: no service discovery section configured",
                    job.job_name
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Duration between scrapes of a target, unless the job overrides it.
    #[serde(default = "default_scrape_interval", with = "crate::duration::serde")]
    pub scrape_interval: Duration,

    /// Per-attempt deadline, unless the job overrides it.
    #[serde(default = "default_scrape_timeout", with = "crate::duration::serde")]
    pub scrape_timeout: Duration,

    /// Labels attached to every discovered target. Job and target labels
    /// with the same name win.
    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            external_labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job_name: String,

    #[serde(default, with = "crate::duration::serde_option")]
    pub scrape_interval: Option<Duration>,

    #[serde(default, with = "crate::duration::serde_option")]
    pub scrape_timeout: Option<Duration>,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default)]
    pub scheme: Scheme,

    /// Keep conflicting labels from the scraped payload instead of
    /// renaming them `exported_<name>`.
    #[serde(default)]
    pub honor_labels: bool,

    /// Query parameters appended to every scrape URL.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub auth: Option<Auth>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Scrapes returning more samples than this are discarded. Zero
    /// disables the limit.
    #[serde(default)]
    pub sample_limit: usize,

    /// Cap on distinct series a target may expose over its lifetime.
    /// Zero disables the limit.
    #[serde(default)]
    pub series_limit: usize,

    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default)]
    pub file_sd_configs: Vec<FileSdConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A fixed list of targets sharing one label set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    pub targets: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Targets read from files on disk, each file a JSON or YAML list of
/// `{targets, labels}` groups.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSdConfig {
    pub files: Vec<PathBuf>,
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
