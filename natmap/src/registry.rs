//! The active-mapping table.

use std::{collections::HashMap, sync::Arc};

use tokio_util::task::AbortOnDropHandle;

use crate::{
    adapter::Adapter,
    mapping::{MappingKey, MappingRecord},
};

/// A registered mapping: the record, the adapter that owns it, and the armed
/// renewal or expiry timer.
///
/// Dropping an entry aborts its timer, so a timer can never outlive the
/// mapping it was armed for.
#[derive(Debug)]
pub(crate) struct Entry {
    pub record: MappingRecord,
    pub adapter: Arc<dyn Adapter>,
    pub timer: Option<AbortOnDropHandle<()>>,
}

/// Mappings currently held open, keyed by external identity.
///
/// All mutation happens on the service task; this type only guards the
/// keying discipline.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<MappingKey, Entry>,
}

impl Registry {
    /// Inserts an entry under its external identity, returning the displaced
    /// entry when the key was already taken.
    ///
    /// Callers only insert established records; an entry without an external
    /// identity is a bug upstream.
    pub(crate) fn insert(&mut self, entry: Entry) -> Option<Entry> {
        let key = entry.record.key().expect("record is established");
        self.entries.insert(key, entry)
    }

    pub(crate) fn remove(&mut self, key: &MappingKey) -> Option<Entry> {
        self.entries.remove(key)
    }

    pub(crate) fn get_mut(&mut self, key: &MappingKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Snapshot of all active records.
    pub(crate) fn records(&self) -> Vec<MappingRecord> {
        self.entries.values().map(|entry| entry.record.clone()).collect()
    }

    pub(crate) fn keys(&self) -> Vec<MappingKey> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Entry> {
        self.entries.drain().map(|(_key, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
