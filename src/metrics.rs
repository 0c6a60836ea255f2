//! Process-wide metric registry. Counters and gauges are sharded by
//! attribute set, so one registered metric serves every label combination.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The label set distinguishing one recorder of a [`Metric`] from another.
/// Keys are checked on construction so an illegal metric label blows up at
/// the registration site, not when the metric is later rendered.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Cow<'static, str>)>,
    {
        Self(
            pairs
                .into_iter()
                .inspect(|(key, _)| check_key(key))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(key, value)| (*key, value.as_ref()))
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self::from_pairs(pairs.iter().map(|(key, value)| (*key, Cow::Borrowed(*value))))
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self::from_pairs(pairs)
    }
}

/// Metric names and attribute keys are &'static str baked into the code,
/// so a bad one is a programming error: panic rather than export garbage.
fn check_key(key: &str) {
    let legal = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    assert!(
        legal,
        "metric names and attribute keys must match [0-9a-z_]+, rejected {key:?}"
    );
}

/// A monotonically increasing value.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that is recomputed and overwritten, never stepped.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub enum Observation {
    Counter(u64),
    Gauge(i64),
}

#[derive(Clone)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    shard: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: Default + Clone> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            shard: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the recorder for the given attribute set, creating it on
    /// first use. Recorders share state, so repeated calls with equal
    /// attributes observe the same value.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.shard
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }
}

/// Receives the current value of every registered metric via
/// [`Registry::report`].
pub trait Reporter {
    fn start_metric(&mut self, name: &'static str, description: &'static str);

    fn report(&mut self, attrs: &Attributes, observation: Observation);

    /// Finish recording a given metric
    fn finish_metric(&mut self);
}

pub struct Registry {
    counters: Mutex<BTreeMap<&'static str, Metric<Counter>>>,
    gauges: Mutex<BTreeMap<&'static str, Metric<Gauge>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_counter(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<Counter> {
        check_key(name);

        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric::new(name, description))
            .clone()
    }

    pub fn register_gauge(&self, name: &'static str, description: &'static str) -> Metric<Gauge> {
        check_key(name);

        self.gauges
            .lock()
            .entry(name)
            .or_insert_with(|| Metric::new(name, description))
            .clone()
    }

    pub fn report(&self, reporter: &mut impl Reporter) {
        for (_, metric) in self.counters.lock().iter() {
            reporter.start_metric(metric.name, metric.description);
            for (attrs, counter) in metric.shard.lock().iter() {
                reporter.report(attrs, Observation::Counter(counter.fetch()));
            }
            reporter.finish_metric();
        }

        for (_, metric) in self.gauges.lock().iter() {
            reporter.start_metric(metric.name, metric.description);
            for (attrs, gauge) in metric.shard.lock().iter() {
                reporter.report(attrs, Observation::Gauge(gauge.fetch()));
            }
            reporter.finish_metric();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Registry = Registry::new();
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

pub fn register_counter(name: &'static str, description: &'static str) -> Metric<Counter> {
    GLOBAL_REGISTRY.register_counter(name, description)
}

pub fn register_gauge(name: &'static str, description: &'static str) -> Metric<Gauge> {
    GLOBAL_REGISTRY.register_gauge(name, description)
}
