//! # Endpoint Index
//!
//! Maps `(host, port, user)` to the LRU entry of a pooled connection.
//!
//! The table is allocated lazily on first insert with the configured size
//! hint. Lookups go through a borrowed probe so no key is built unless a new
//! entry is actually inserted.

use std::hash::{Hash, Hasher};

use ahash::RandomState;
use hashbrown::{Equivalent, HashMap};
use psl_common::{EndpointKey, EndpointRef, PslError, PslResult};

use crate::lru::EntryId;

// Local wrapper so the borrowed probe can be looked up against owned keys.
struct Probe<'a>(EndpointRef<'a>);

impl Hash for Probe<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Equivalent<EndpointKey> for Probe<'_> {
    fn equivalent(&self, key: &EndpointKey) -> bool {
        self.0.matches(key)
    }
}

/// Hash index from endpoint key to pooled entry.
#[derive(Debug)]
pub struct EndpointIndex {
    table: Option<HashMap<EndpointKey, EntryId, RandomState>>,
    table_size: usize,
}

impl EndpointIndex {
    /// Creates an index whose table will be sized for `table_size` entries.
    pub fn new(table_size: usize) -> Self {
        EndpointIndex {
            table: None,
            table_size,
        }
    }

    /// Returns true once the table has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.table.is_some()
    }

    /// Number of indexed endpoints.
    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, HashMap::len)
    }

    /// Returns true when no endpoint is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the entry for an endpoint.
    pub fn lookup(&self, endpoint: EndpointRef<'_>) -> Option<EntryId> {
        self.table.as_ref()?.get(&Probe(endpoint)).copied()
    }

    fn table_mut(&mut self) -> PslResult<&mut HashMap<EndpointKey, EntryId, RandomState>> {
        let table = match self.table.take() {
            Some(table) => table,
            None => {
                let mut table = HashMap::with_hasher(RandomState::new());
                table
                    .try_reserve(self.table_size)
                    .map_err(|_| PslError::NoMemory)?;
                table
            }
        };
        Ok(self.table.insert(table))
    }

    /// Looks the endpoint up and inserts it when absent.
    ///
    /// `create` runs only for a new endpoint and only after table space and
    /// the owned key are secured, so a failure anywhere leaves the index
    /// unchanged. Returns the entry and whether it was created.
    pub fn enter<F>(&mut self, endpoint: EndpointRef<'_>, create: F) -> PslResult<(EntryId, bool)>
    where
        F: FnOnce() -> PslResult<EntryId>,
    {
        let table = self.table_mut()?;
        if let Some(id) = table.get(&Probe(endpoint)) {
            return Ok((*id, false));
        }
        table.try_reserve(1).map_err(|_| PslError::NoMemory)?;
        let key = endpoint.to_key()?;
        let id = create()?;
        table.insert(key, id);
        Ok((id, true))
    }

    /// Inserts an owned key for an existing entry.
    ///
    /// # Errors
    /// `AlreadyExists` if the endpoint is indexed already.
    pub fn enter_key(&mut self, key: EndpointKey, id: EntryId) -> PslResult<()> {
        let table = self.table_mut()?;
        if table.contains_key(&key) {
            return Err(PslError::AlreadyExists);
        }
        table.try_reserve(1).map_err(|_| PslError::NoMemory)?;
        table.insert(key, id);
        Ok(())
    }

    /// Removes an endpoint, returning the entry it pointed to.
    pub fn remove(&mut self, endpoint: EndpointRef<'_>) -> Option<EntryId> {
        self.table.as_mut()?.remove(&Probe(endpoint))
    }

    /// Iterates over indexed endpoints in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&EndpointKey, EntryId)> + '_ {
        self.table
            .iter()
            .flat_map(|table| table.iter())
            .map(|(key, id)| (key, *id))
    }

    /// Keeps only the endpoints for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&EndpointKey, EntryId) -> bool,
    {
        if let Some(table) = self.table.as_mut() {
            table.retain(|key, id| keep(key, *id));
        }
    }

    /// Empties the index and releases the table.
    pub fn drain(&mut self) -> Vec<(EndpointKey, EntryId)> {
        match self.table.take() {
            Some(table) => table.into_iter().collect(),
            None => Vec::new(),
        }
    }
}
