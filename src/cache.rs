//! Read-through caches for values that are built once per key and then shared
//! immutably across every source of a batch.

use crate::types::Band;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Exact identity of a sampling grid: its length and the bit pattern of every value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbscissaKey(Arc<[u64]>);

impl AbscissaKey {
    pub fn new(positions: &[f64]) -> Self {
        Self(positions.iter().map(|v| v.to_bits()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Unit of the abscissa a design matrix was evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbscissaUnit {
    Pseudo,
    Wavelength,
}

/// Where the basis shapes of a design matrix come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BasisKey {
    /// Hermite basis of the instrument model, by basis function id.
    Hermite(u32),
    /// A matrix registered by the caller from an external model.
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DesignKey {
    pub band: Band,
    pub basis: BasisKey,
    pub unit: AbscissaUnit,
    pub abscissa: AbscissaKey,
}

/// Build-once, share-immutably map.
///
/// Concurrent misses on the same key may both run the builder; the first
/// inserted value wins and every caller receives that one.
#[derive(Debug)]
pub struct ReadThroughCache<K, V> {
    label: &'static str,
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Clone, V> ReadThroughCache<K, V> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    pub fn get_or_try_build<E>(
        &self,
        key: &K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = Arc::new(build()?);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let stored = entries.entry(key.clone()).or_insert(value).clone();
        log::debug!("{} cache: {} entries", self.label, entries.len());
        Ok(stored)
    }

    pub fn get_or_build(&self, key: &K, build: impl FnOnce() -> V) -> Arc<V> {
        match self.get_or_try_build::<std::convert::Infallible>(key, || Ok(build())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Registers a value built elsewhere. An existing entry is kept.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.entry(key).or_insert_with(|| Arc::new(value)).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
