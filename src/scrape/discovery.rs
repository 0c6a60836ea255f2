//! Extractors turning a parsed `Config` into the desired `ScrapeWork` list
//! for one service-discovery category.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::ScrapeWork;
use crate::config::{Config, GlobalConfig, JobConfig, StaticConfig};
use crate::prometheus::Label;

/// Internal label carrying the file a file-SD target came from. Dropped at
/// finalization, used to fall back to the previous batch when a file turns
/// unreadable.
const FILEPATH_LABEL: &str = "__file_sd_path";

pub(crate) fn static_scrape_works(cfg: &Config) -> Vec<ScrapeWork> {
    let mut works = Vec::new();

    for job in &cfg.scrape_configs {
        for sc in &job.static_configs {
            append_group_works(&mut works, &cfg.global, job, sc, None);
        }
    }

    works
}

pub(crate) fn file_sd_scrape_works(cfg: &Config, prev: &[ScrapeWork]) -> Vec<ScrapeWork> {
    // Previous batch grouped by source file, for per-file fallback.
    let mut prev_by_path: HashMap<String, Vec<ScrapeWork>> = HashMap::new();
    for work in prev {
        if let Some(label) = work.original_labels.iter().find(|l| l.name == FILEPATH_LABEL) {
            prev_by_path
                .entry(label.value.clone())
                .or_default()
                .push(work.clone());
        }
    }

    let mut works = Vec::new();
    for job in &cfg.scrape_configs {
        for fc in &job.file_sd_configs {
            for file in &fc.files {
                match read_sd_file(file) {
                    Ok(groups) => {
                        for group in &groups {
                            append_group_works(&mut works, &cfg.global, job, group, Some(file));
                        }
                    }
                    Err(err) => {
                        warn!(
                            message = "cannot read file_sd file; keeping its previous targets",
                            file = ?file,
                            %err
                        );
                        if let Some(kept) = prev_by_path.remove(&file.display().to_string()) {
                            works.extend(kept);
                        }
                    }
                }
            }
        }
    }

    works
}

fn read_sd_file(path: &Path) -> crate::Result<Vec<StaticConfig>> {
    let data = std::fs::read_to_string(path)?;
    let groups = serde_yaml::from_str(&data)?;
    Ok(groups)
}

fn append_group_works(
    works: &mut Vec<ScrapeWork>,
    global: &GlobalConfig,
    job: &JobConfig,
    group: &StaticConfig,
    sd_path: Option<&Path>,
) {
    for target in &group.targets {
        match target_scrape_work(global, job, target, &group.labels, sd_path) {
            Ok(work) => works.push(work),
            Err(err) => error!(
                message = "skipping invalid target",
                job = %job.job_name,
                target = %target,
                %err
            ),
        }
    }
}

/// Resolves one `host:port` target against its job into a `ScrapeWork`.
///
/// Label precedence, weakest first: external labels, discovery meta labels,
/// target labels. Finalization defaults `instance` to `__address__` and
/// drops every `__`-prefixed label.
fn target_scrape_work(
    global: &GlobalConfig,
    job: &JobConfig,
    target: &str,
    target_labels: &BTreeMap<String, String>,
    sd_path: Option<&Path>,
) -> Result<ScrapeWork, String> {
    let address = target.trim();
    if address.is_empty() {
        return Err("empty target address".to_string());
    }
    if address.contains('/') || address.contains(' ') {
        return Err(format!("target {:?} is not a host:port pair", address));
    }

    let mut original = BTreeMap::new();
    for (name, value) in &global.external_labels {
        original.insert(name.clone(), value.clone());
    }
    original.insert("__address__".to_string(), address.to_string());
    original.insert("__scheme__".to_string(), job.scheme.as_str().to_string());
    original.insert("__metrics_path__".to_string(), job.metrics_path.clone());
    for (name, values) in &job.params {
        if let Some(first) = values.first() {
            original.insert(format!("__param_{}", name), first.clone());
        }
    }
    if let Some(path) = sd_path {
        original.insert(FILEPATH_LABEL.to_string(), path.display().to_string());
    }
    original.insert("job".to_string(), job.job_name.clone());
    for (name, value) in target_labels {
        original.insert(name.clone(), value.clone());
    }

    let mut finalized = original.clone();
    finalized
        .entry("instance".to_string())
        .or_insert_with(|| address.to_string());
    finalized.retain(|name, _| !name.starts_with("__"));

    let query = job
        .params
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |value| format!("{}={}", name, value)))
        .collect::<Vec<_>>()
        .join("&");
    let scrape_url = if query.is_empty() {
        format!("{}://{}{}", job.scheme.as_str(), address, job.metrics_path)
    } else {
        format!(
            "{}://{}{}?{}",
            job.scheme.as_str(),
            address,
            job.metrics_path,
            query
        )
    };

    Ok(ScrapeWork {
        scrape_url,
        interval: job.scrape_interval.unwrap_or(global.scrape_interval),
        timeout: job.scrape_timeout.unwrap_or(global.scrape_timeout),
        honor_labels: job.honor_labels,
        labels: to_labels(finalized),
        original_labels: to_labels(original),
        auth: job.auth.clone(),
        tls: job.tls.clone(),
        sample_limit: job.sample_limit,
        series_limit: job.series_limit,
    })
}

fn to_labels(map: BTreeMap<String, String>) -> Vec<Label> {
    map.into_iter()
        .map(|(name, value)| Label { name, value })
        .collect()
}
