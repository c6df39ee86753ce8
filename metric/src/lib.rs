//! A minimal metrics capability: callers register named instruments with a
//! [`Registry`] and record against attribute sets, without coupling to any
//! particular metrics runtime. Exporters walk the registry and read the
//! observers out.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A set of key-value attributes identifying one observer of an instrument,
/// e.g. `("topic", "orders"), ("partition", "3")`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace a single attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Look up an attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_ref())
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(pairs.into_iter().collect())
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|&(k, v)| (k, Cow::Borrowed(v)))
                .collect(),
        )
    }
}

impl From<Vec<(&'static str, String)>> for Attributes {
    fn from(pairs: Vec<(&'static str, String)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k, Cow::Owned(v)))
                .collect(),
        )
    }
}

/// Something that can be handed out by a [`Metric`] and observed later.
///
/// Implementations are cheap clones sharing their underlying state, so a
/// recorder held by application code and an observer fetched by an exporter
/// see the same value.
pub trait MetricObserver: Debug + Clone + Default + Send + Sync + 'static {}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicU64>);

impl U64Gauge {
    /// Replace the current value.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increase by `delta`.
    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrease by `delta`, saturating at zero.
    pub fn sub(&self, delta: u64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named instrument holding one observer per attribute set.
#[derive(Debug, Clone)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instrument description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the recorder for `attributes`, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Fetch the observer for `attributes` if one was ever recorded.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }

    /// Drop the observer for `attributes`, e.g. when the labeled entity is
    /// torn down.
    pub fn remove(&self, attributes: &Attributes) {
        self.observers.lock().remove(attributes);
    }

    /// Snapshot of all attribute sets and their current observers.
    pub fn observers(&self) -> Vec<(Attributes, T)> {
        self.observers
            .lock()
            .iter()
            .map(|(a, o)| (a.clone(), o.clone()))
            .collect()
    }
}

/// Registry of named instruments.
///
/// Application code registers instruments by name; tests and exporters look
/// them back up with [`Registry::get_instrument`].
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.instruments.lock().keys().copied().collect();
        f.debug_struct("Registry").field("instruments", &names).finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register (or fetch the previously registered) instrument `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` was already registered with a different observer
    /// type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        entry
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric \"{name}\" registered with a different type"))
            .clone()
    }

    /// Look up a previously registered instrument.
    pub fn get_instrument<T: MetricObserver>(&self, name: &str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.downcast_ref::<Metric<T>>())
            .cloned()
    }
}
