//! Multi-entity transactions over a fixed, pre-locked set of shards.

use std::collections::HashSet;

use super::RecordData;
use super::shard::{ShardFile, StoredRecord, shard_of};
use crate::error::{Error, Result};
use crate::model::Record;

/// Staged view of the locked shards, handed to the closure passed to
/// [`ShardedRecordStore::transact`](super::ShardedRecordStore::transact).
///
/// Only entities declared up front are reachable; anything else is
/// [`Error::UndeclaredEntity`], since its shard is not locked.
pub struct Transaction<T> {
    shard_count: u32,
    declared: HashSet<String>,
    staged: Vec<Staged<T>>,
}

struct Staged<T> {
    shard_id: u32,
    file: ShardFile<T>,
    dirty: bool,
}

impl<T: RecordData> Transaction<T> {
    pub(crate) fn new(
        shard_count: u32,
        declared: HashSet<String>,
        shards: impl Iterator<Item = (u32, ShardFile<T>)>,
    ) -> Self {
        Self {
            shard_count,
            declared,
            staged: shards
                .map(|(shard_id, file)| Staged {
                    shard_id,
                    file,
                    dirty: false,
                })
                .collect(),
        }
    }

    pub fn get(&self, entity_id: &str) -> Result<Option<Record<T>>> {
        let idx = self.index_of(entity_id)?;
        Ok(self.staged[idx].file.record(entity_id))
    }

    pub fn update<F>(&mut self, entity_id: &str, mutator: F) -> Result<Record<T>>
    where
        F: FnOnce(&mut T),
    {
        let idx = self.index_of(entity_id)?;
        let staged = &mut self.staged[idx];
        let (mut data, version) = staged.file.current_or_default(entity_id);
        mutator(&mut data);
        staged.file.records.insert(
            entity_id.to_string(),
            StoredRecord {
                version: version + 1,
                data: data.clone(),
            },
        );
        staged.dirty = true;
        Ok(Record {
            entity_id: entity_id.to_string(),
            version: version + 1,
            data,
        })
    }

    pub fn delete(&mut self, entity_id: &str) -> Result<Option<Record<T>>> {
        let idx = self.index_of(entity_id)?;
        let staged = &mut self.staged[idx];
        let existing = staged.file.record(entity_id);
        if existing.is_some() {
            staged.file.records.remove(entity_id);
            staged.dirty = true;
        }
        Ok(existing)
    }

    /// Changed shard files, in lock order; `None` for untouched shards.
    pub(crate) fn into_staged(self) -> impl Iterator<Item = Option<ShardFile<T>>> {
        self.staged
            .into_iter()
            .map(|s| if s.dirty { Some(s.file) } else { None })
    }

    fn index_of(&self, entity_id: &str) -> Result<usize> {
        if !self.declared.contains(entity_id) {
            return Err(Error::UndeclaredEntity(entity_id.to_string()));
        }
        let shard_id = shard_of(entity_id, self.shard_count);
        self.staged
            .iter()
            .position(|s| s.shard_id == shard_id)
            .ok_or_else(|| Error::UndeclaredEntity(entity_id.to_string()))
    }
}
