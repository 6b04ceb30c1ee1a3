use std::hash::Hash;

use egress_gateway_common::{EntryKey, EntryValue, PolicyEntry, TableDiff};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Storage the datapath reads the egress table from.
pub trait TableMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<K, V> TableMap<K, V> for ahash::HashMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Cached view of a [`TableMap`]. Writes that would not change the map are
/// skipped.
pub struct TableState<M, K, V>
where
    M: TableMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    cache: ahash::HashMap<K, V>,
    table: M,
}

impl<M, K, V> TableState<M, K, V>
where
    M: TableMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Seeds the cache from whatever the map already holds.
    pub fn try_new(table: M) -> Result<Self> {
        let cache = table.get_state()?;
        Ok(Self { cache, table })
    }

    /// Returns whether the map was written.
    pub fn update(&mut self, key: K, value: V) -> Result<bool> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(false);
        };
        self.table.update(key.clone(), value.clone())?;
        self.cache.insert(key, value);
        Ok(true)
    }

    /// Returns whether the key was present.
    pub fn delete(&mut self, key: &K) -> Result<bool> {
        if !self.cache.contains_key(key) {
            return Ok(false);
        }
        self.table.delete(key)?;
        self.cache.remove(key);
        Ok(true)
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}

pub type NodeTable<M> = TableState<M, EntryKey, EntryValue>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub written: usize,
    pub removed: usize,
}

impl<M: TableMap<EntryKey, EntryValue>> TableState<M, EntryKey, EntryValue> {
    /// Removals first so a key moved between diffs ends up upserted.
    pub fn apply(&mut self, diff: &TableDiff) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        for key in &diff.removals {
            if self.delete(key)? {
                summary.removed += 1;
            }
        }
        for entry in &diff.upserts {
            if self.update(entry.key(), entry.value())? {
                summary.written += 1;
            }
        }
        Ok(summary)
    }

    /// Installed rows in key order.
    pub fn entries(&self) -> Vec<PolicyEntry> {
        let mut entries: Vec<PolicyEntry> = self
            .cache
            .iter()
            .map(|(key, value)| PolicyEntry::new(*key, *value))
            .collect();
        entries.sort();
        entries
    }
}
