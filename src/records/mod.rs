//! Sharded, lock-guarded record storage.
//!
//! The keyspace is split into a fixed number of shards, each backed by one
//! file and guarded by one async mutex. That single lock covers both the
//! in-memory copy of the shard and its file, so a read-modify-write is one
//! critical section: load if needed, apply the mutator, write the whole shard
//! atomically, then publish the new state in memory.
//!
//! Operations touching several shards lock them in ascending shard order.

mod shard;
mod txn;

pub use shard::shard_of;
pub use txn::Transaction;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use lru::LruCache;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::config::RecordStoreConfig;
use crate::error::{Error, Result};
use crate::model::Record;
use crate::retry::RetryPolicy;
use crate::storage::AtomicFileStore;
use crate::telemetry::metrics;

use shard::{MANIFEST_FILE, Manifest, ShardFile, StoredRecord, shard_path};

/// Bounds every record payload must satisfy.
pub trait RecordData: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

impl<T> RecordData for T where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

/// What a [`ShardedRecordStore::mutate`] mutator decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Persist the mutated value.
    Write,
    /// Remove the record.
    Delete,
    /// Leave the stored record untouched.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStoreStats {
    pub shard_count: u32,
    pub resident_shards: usize,
    pub quarantined: u64,
}

/// A shard's lock-guarded state.
pub(crate) struct ShardSlot<T> {
    id: u32,
    path: PathBuf,
    loaded: bool,
    file: ShardFile<T>,
}

pub struct ShardedRecordStore<T> {
    dir: PathBuf,
    shard_count: u32,
    shards: Vec<Mutex<ShardSlot<T>>>,
    files: AtomicFileStore,
    retry: RetryPolicy,
    /// Which shards are loaded, in recency order. Only ever held briefly and
    /// never across an await.
    resident: StdMutex<LruCache<u32, ()>>,
    max_resident: usize,
    quarantined: AtomicU64,
}

impl<T: RecordData> ShardedRecordStore<T> {
    /// Open (or create) a record directory.
    ///
    /// The shard count is pinned by a manifest on first open; reopening with a
    /// different count is a configuration error.
    pub async fn open(dir: impl Into<PathBuf>, config: &RecordStoreConfig) -> Result<Self> {
        let dir = dir.into();
        if config.shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".into()));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let files = AtomicFileStore::new();
        let swept = files.sweep_temp_files(&dir).await?;
        if swept > 0 {
            info!(dir = %dir.display(), swept, "removed temp files left by an interrupted write");
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        match files.read_if_exists(&manifest_path).await? {
            Some(bytes) => {
                let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Startup(format!("bad record manifest {}: {e}", manifest_path.display()))
                })?;
                if manifest.shard_count != config.shard_count {
                    return Err(Error::Config(format!(
                        "record directory {} has {} shards, configured {}",
                        dir.display(),
                        manifest.shard_count,
                        config.shard_count
                    )));
                }
            }
            None => {
                let manifest = Manifest {
                    shard_count: config.shard_count,
                    created_at: Utc::now(),
                };
                files
                    .write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
                    .await?;
            }
        }

        let shards = (0..config.shard_count)
            .map(|id| {
                Mutex::new(ShardSlot {
                    id,
                    path: shard_path(&dir, id),
                    loaded: false,
                    file: ShardFile::empty(id),
                })
            })
            .collect();

        Ok(Self {
            dir,
            shard_count: config.shard_count,
            shards,
            files,
            retry: RetryPolicy::exponential(config.io_retry_attempts, config.io_retry_base_delay)
                .with_max_delay(config.io_retry_base_delay.saturating_mul(32)),
            resident: StdMutex::new(LruCache::unbounded()),
            max_resident: config.max_resident_shards.max(1),
            quarantined: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_of(&self, entity_id: &str) -> u32 {
        shard_of(entity_id, self.shard_count)
    }

    /// Copy of the record, if it exists.
    pub async fn get(&self, entity_id: &str) -> Result<Option<Record<T>>> {
        let slot = self.lock_loaded(self.shard_of(entity_id)).await?;
        Ok(slot.file.record(entity_id))
    }

    /// Apply `mutator` to the record (or a fresh default) and persist it.
    pub async fn update<F>(&self, entity_id: &str, mutator: F) -> Result<Record<T>>
    where
        F: FnOnce(&mut T),
    {
        let mut slot = self.lock_loaded(self.shard_of(entity_id)).await?;
        let (mut data, version) = slot.file.current_or_default(entity_id);
        mutator(&mut data);
        self.put(&mut slot, entity_id, version + 1, data).await
    }

    /// Like [`update`](Self::update), but only if the stored version (0 when
    /// absent) still equals `expected_version`.
    pub async fn update_if_version<F>(
        &self,
        entity_id: &str,
        expected_version: u64,
        mutator: F,
    ) -> Result<Record<T>>
    where
        F: FnOnce(&mut T),
    {
        let mut slot = self.lock_loaded(self.shard_of(entity_id)).await?;
        let (mut data, version) = slot.file.current_or_default(entity_id);
        if version != expected_version {
            return Err(Error::Conflict {
                entity_id: entity_id.to_string(),
                expected: expected_version,
                actual: version,
            });
        }
        mutator(&mut data);
        self.put(&mut slot, entity_id, version + 1, data).await
    }

    /// Let the mutator decide whether to write, delete or leave the record.
    ///
    /// Returns the record as stored afterwards.
    pub async fn mutate<F>(&self, entity_id: &str, mutator: F) -> Result<Option<Record<T>>>
    where
        F: FnOnce(&mut T) -> Mutation,
    {
        let mut slot = self.lock_loaded(self.shard_of(entity_id)).await?;
        let (mut data, version) = slot.file.current_or_default(entity_id);
        match mutator(&mut data) {
            Mutation::Write => self.put(&mut slot, entity_id, version + 1, data).await.map(Some),
            Mutation::Delete => {
                self.remove(&mut slot, entity_id).await?;
                Ok(None)
            }
            Mutation::Skip => Ok(slot.file.record(entity_id)),
        }
    }

    /// Remove a record. Returns what was removed.
    pub async fn delete(&self, entity_id: &str) -> Result<Option<Record<T>>> {
        let mut slot = self.lock_loaded(self.shard_of(entity_id)).await?;
        self.remove(&mut slot, entity_id).await
    }

    /// Run `f` over a declared set of entities with all their shards locked.
    ///
    /// Shards are locked in ascending id order before anything is read, so
    /// concurrent transactions over overlapping shards cannot deadlock. Staged
    /// changes are written shard by shard, in the same order, after `f`
    /// returns `Ok`; nothing is written if it returns `Err`.
    pub async fn transact<R, F>(&self, entity_ids: &[&str], f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<T>) -> Result<R>,
    {
        let mut shard_ids: Vec<u32> = entity_ids.iter().map(|id| self.shard_of(id)).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        let mut guards = Vec::with_capacity(shard_ids.len());
        for shard_id in &shard_ids {
            guards.push(self.lock_loaded(*shard_id).await?);
        }

        let declared: HashSet<String> = entity_ids.iter().map(|id| id.to_string()).collect();
        let mut txn = Transaction::new(
            self.shard_count,
            declared,
            guards.iter().map(|g| (g.id, g.file.clone())),
        );
        let value = f(&mut txn)?;

        for (guard, staged) in guards.iter_mut().zip(txn.into_staged()) {
            if let Some(mut next) = staged {
                next.version += 1;
                self.persist(guard, next).await?;
                metrics::records_updated().add(1, &[KeyValue::new("change", "transaction")]);
            }
        }
        Ok(value)
    }

    /// Visit records in shard order, returning up to `limit` matches.
    ///
    /// Locks one shard at a time, so the result is not a point-in-time view
    /// across shards.
    pub async fn scan<F>(&self, limit: usize, filter: F) -> Result<Vec<Record<T>>>
    where
        F: Fn(&Record<T>) -> bool,
    {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        for shard_id in 0..self.shard_count {
            let slot = self.lock_loaded(shard_id).await?;
            for entity_id in slot.file.records.keys() {
                if let Some(record) = slot.file.record(entity_id)
                    && filter(&record)
                {
                    out.push(record);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> RecordStoreStats {
        let resident = self
            .resident
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();
        RecordStoreStats {
            shard_count: self.shard_count,
            resident_shards: resident,
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn lock_loaded(&self, shard_id: u32) -> Result<MutexGuard<'_, ShardSlot<T>>> {
        let mut slot = self.shards[shard_id as usize].lock().await;
        if !slot.loaded {
            self.load(&mut slot).await?;
        }
        self.touch(shard_id);
        Ok(slot)
    }

    async fn load(&self, slot: &mut ShardSlot<T>) -> Result<()> {
        let path = slot.path.clone();
        let bytes = self
            .retry
            .run("shard.read", || self.files.read_if_exists(&path))
            .await?;

        slot.file = match bytes {
            None => ShardFile::empty(slot.id),
            Some(bytes) => match serde_json::from_slice::<ShardFile<T>>(&bytes) {
                Ok(file) if file.shard_id == slot.id => file,
                Ok(file) => {
                    let reason = format!("file belongs to shard {}", file.shard_id);
                    self.quarantine(slot, &reason).await?;
                    ShardFile::empty(slot.id)
                }
                Err(e) => {
                    self.quarantine(slot, &e.to_string()).await?;
                    ShardFile::empty(slot.id)
                }
            },
        };
        slot.loaded = true;
        debug!(shard = slot.id, records = slot.file.records.len(), "shard loaded");
        Ok(())
    }

    /// Move an unreadable shard file aside so the shard can start empty.
    async fn quarantine(&self, slot: &ShardSlot<T>, reason: &str) -> Result<()> {
        let aside = slot.path.with_extension(format!(
            "json.corrupt-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        tokio::fs::rename(&slot.path, &aside).await.map_err(|e| Error::CorruptShard {
            shard_id: slot.id,
            reason: format!("{reason}; quarantine failed: {e}"),
        })?;
        self.quarantined.fetch_add(1, Ordering::Relaxed);
        metrics::records_quarantined().add(1, &[]);
        error!(
            shard = slot.id,
            quarantined_to = %aside.display(),
            %reason,
            "corrupt shard quarantined, reinitialized empty"
        );
        Ok(())
    }

    /// Record `shard_id` as most recently used, then unload least recently
    /// used shards while over capacity. Only shards whose lock is free right
    /// now are unloaded; busy ones stay loaded and tracked until a later touch
    /// finds them free.
    fn touch(&self, shard_id: u32) {
        let mut resident = self
            .resident
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        resident.put(shard_id, ());

        let excess = resident.len().saturating_sub(self.max_resident);
        if excess == 0 {
            return;
        }
        let candidates: Vec<u32> = resident
            .iter()
            .rev()
            .map(|(id, _)| *id)
            .filter(|id| *id != shard_id)
            .collect();
        let mut unloaded = 0;
        for victim in candidates {
            if unloaded == excess {
                break;
            }
            if let Ok(mut slot) = self.shards[victim as usize].try_lock() {
                slot.loaded = false;
                slot.file = ShardFile::empty(victim);
                resident.pop(&victim);
                unloaded += 1;
                debug!(shard = victim, "shard unloaded");
            }
        }
    }

    async fn put(
        &self,
        slot: &mut ShardSlot<T>,
        entity_id: &str,
        version: u64,
        data: T,
    ) -> Result<Record<T>> {
        let mut next = slot.file.clone();
        next.records.insert(
            entity_id.to_string(),
            StoredRecord {
                version,
                data: data.clone(),
            },
        );
        next.version += 1;
        self.persist(slot, next).await?;
        metrics::records_updated().add(1, &[KeyValue::new("change", "write")]);
        Ok(Record {
            entity_id: entity_id.to_string(),
            version,
            data,
        })
    }

    async fn remove(&self, slot: &mut ShardSlot<T>, entity_id: &str) -> Result<Option<Record<T>>> {
        let Some(existing) = slot.file.record(entity_id) else {
            return Ok(None);
        };
        let mut next = slot.file.clone();
        next.records.remove(entity_id);
        next.version += 1;
        self.persist(slot, next).await?;
        metrics::records_updated().add(1, &[KeyValue::new("change", "delete")]);
        Ok(Some(existing))
    }

    /// Durably write `next`, then make it the in-memory state.
    async fn persist(&self, slot: &mut ShardSlot<T>, next: ShardFile<T>) -> Result<()> {
        let start = Instant::now();
        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = slot.path.clone();
        self.retry
            .run("shard.write", || self.files.write(&path, bytes.clone()))
            .await?;
        slot.file = next;
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "shard.write")],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entity_in_shard(shard: u32, shard_count: u32) -> String {
        (0..)
            .map(|i| format!("entity-{i}"))
            .find(|id| shard_of(id, shard_count) == shard)
            .unwrap()
    }

    #[tokio::test]
    async fn busy_shards_stay_tracked_until_they_can_be_unloaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RecordStoreConfig {
            shard_count: 4,
            max_resident_shards: 1,
            io_retry_base_delay: Duration::from_millis(1),
            ..RecordStoreConfig::default()
        };
        let store: ShardedRecordStore<u64> =
            ShardedRecordStore::open(dir.path(), &config).await.unwrap();
        let ids: Vec<String> = (0..3).map(|s| entity_in_shard(s, 4)).collect();

        store.update(&ids[0], |n| *n += 1).await.unwrap();
        let held = store.shards[0].lock().await;

        // Shard 0 is over the bound but locked, so it stays loaded and counted.
        store.update(&ids[1], |n| *n += 1).await.unwrap();
        assert!(held.loaded);
        assert_eq!(store.stats().resident_shards, 2);

        drop(held);
        store.update(&ids[2], |n| *n += 1).await.unwrap();
        assert_eq!(store.stats().resident_shards, 1);
        assert!(!store.shards[0].lock().await.loaded);
        assert!(!store.shards[1].lock().await.loaded);
    }
}
