//! Store Façade
//!
//! The store owns the full shard array. The first `collision_shards`
//! entries are reserved: a key normally lives in the primary shard picked
//! by its murmur3 hash, but when two distinct keys alias to the same hash
//! bucket the shard reports a collision and the operation retries against
//! the collision shards in order. With at least one collision shard,
//! distinct aliasing keys coexist; with zero, the collision surfaces to
//! the caller.
//!
//! Whole-store concerns live here too: parallel shard open, counters,
//! key counts, backup streams (plain and gzipped), the round-robin
//! expiration hook for the background driver, and shutdown.

use crate::storage::shard::Shard;
use crate::storage::StoreError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 256;

/// Default number of collision shards. Four is enough to absorb the
/// expected aliasing of well over a billion short keys.
pub const DEFAULT_COLLISION_SHARDS: usize = 4;

/// Number of worker threads used to open shard files in parallel.
const OPEN_WORKERS: usize = 4;

/// Leading byte of a backup stream.
const BACKUP_STREAM_MARKER: u8 = 1;

/// Hashes a key the way the on-disk format requires: murmur3, 32-bit,
/// seed 0, over the raw key bytes.
pub(crate) fn hash_key(key: &[u8]) -> u32 {
    // reading from an in-memory cursor cannot fail
    murmur3::murmur3_32(&mut Cursor::new(key), 0).unwrap_or_default()
}

/// Configuration for [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory holding one file per shard.
    pub dir: PathBuf,
    /// Total number of shards, collision shards included.
    pub shard_count: usize,
    /// Shards reserved at the front of the array for collision fallback.
    pub collision_shards: usize,
    /// Optional shard filename prefix: `<prefix>-<index>` instead of
    /// `<index>`.
    pub prefix: Option<String>,
}

impl StoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StoreOptions {
            dir: dir.into(),
            shard_count: DEFAULT_SHARD_COUNT,
            collision_shards: DEFAULT_COLLISION_SHARDS,
            prefix: None,
        }
    }

    fn shard_path(&self, index: usize) -> PathBuf {
        match &self.prefix {
            Some(prefix) => self.dir.join(format!("{}-{}", prefix, index)),
            None => self.dir.join(index.to_string()),
        }
    }
}

/// The hash-partitioned key-value store.
///
/// Designed to be wrapped in an `Arc` and shared across connection
/// tasks; every operation takes `&self`.
pub struct Store {
    shards: Vec<Shard>,
    collision_shards: usize,
    expire_seq: AtomicUsize,
    force_exit: Arc<AtomicBool>,
}

impl Store {
    /// Opens every shard file under `opts.dir`, creating the directory
    /// and files as needed. Shards are opened by a small pool of worker
    /// threads; the first failure aborts the open.
    pub fn open(opts: StoreOptions) -> Result<Store, StoreError> {
        if opts.shard_count <= opts.collision_shards {
            return Err(StoreError::InvalidConfig(
                "shard count must exceed collision shard count by at least one",
            ));
        }
        std::fs::create_dir_all(&opts.dir)?;

        let force_exit = Arc::new(AtomicBool::new(false));
        let shards = open_shards(&opts, &force_exit)?;
        info!(
            shards = opts.shard_count,
            collision_shards = opts.collision_shards,
            dir = %opts.dir.display(),
            "store opened"
        );

        Ok(Store {
            shards,
            collision_shards: opts.collision_shards,
            expire_seq: AtomicUsize::new(0),
            force_exit,
        })
    }

    /// Primary shard index for a hash: collision shards are skipped.
    fn shard_for(&self, h: u32) -> usize {
        self.collision_shards + (h as usize % (self.shards.len() - self.collision_shards))
    }

    /// Stores a key-value pair. `expire` is absolute unix seconds, 0 for
    /// never.
    pub fn set(&self, key: &[u8], value: &[u8], expire: u32) -> Result<(), StoreError> {
        let h = hash_key(key);
        let mut res = self.shards[self.shard_for(h)].set(key, value, h, expire);
        if matches!(res, Err(StoreError::Collision)) {
            for shard in &self.shards[..self.collision_shards] {
                res = shard.set(key, value, h, expire);
                if matches!(res, Err(StoreError::Collision)) {
                    continue;
                }
                break;
            }
        }
        res
    }

    /// Fetches the value for a key.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let h = hash_key(key);
        let mut res = self.shards[self.shard_for(h)].get(key, h);
        if matches!(res, Err(StoreError::Collision)) {
            for shard in &self.shards[..self.collision_shards] {
                res = shard.get(key, h);
                if matches!(
                    res,
                    Err(StoreError::Collision) | Err(StoreError::KeyNotFound)
                ) {
                    continue;
                }
                break;
            }
        }
        res.map(|(value, _)| value)
    }

    /// Updates the expiry of an existing key.
    pub fn touch(&self, key: &[u8], expire: u32) -> Result<(), StoreError> {
        let h = hash_key(key);
        let mut res = self.shards[self.shard_for(h)].touch(key, h, expire);
        if matches!(res, Err(StoreError::Collision)) {
            for shard in &self.shards[..self.collision_shards] {
                res = shard.touch(key, h, expire);
                if matches!(res, Err(StoreError::Collision)) {
                    continue;
                }
                break;
            }
        }
        res
    }

    /// Removes a key, reporting whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let h = hash_key(key);
        let mut res = self.shards[self.shard_for(h)].delete(key, h);
        if matches!(res, Err(StoreError::Collision)) {
            for shard in &self.shards[..self.collision_shards] {
                res = shard.delete(key, h);
                if matches!(
                    res,
                    Err(StoreError::Collision) | Err(StoreError::KeyNotFound)
                ) {
                    continue;
                }
                break;
            }
        }
        res
    }

    /// Increments an 8-byte big-endian counter, creating it at zero.
    /// Counters route to their primary shard only.
    pub fn incr(&self, key: &[u8], delta: u64) -> Result<u64, StoreError> {
        let h = hash_key(key);
        self.shards[self.shard_for(h)].counter(key, h, delta, true)
    }

    /// Decrements an 8-byte big-endian counter; wraps on underflow.
    pub fn decr(&self, key: &[u8], delta: u64) -> Result<u64, StoreError> {
        let h = hash_key(key);
        self.shards[self.shard_for(h)].counter(key, h, delta, false)
    }

    /// Total number of live keys across all shards.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.count()).sum()
    }

    /// Total size of the disk storage used by the store.
    pub fn file_size(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.file_size()?;
        }
        Ok(total)
    }

    /// Streams a backup: a single marker byte, then every shard's live
    /// records in file order.
    pub fn backup(&self, w: &mut dyn Write) -> Result<(), StoreError> {
        w.write_all(&[BACKUP_STREAM_MARKER])?;
        for shard in &self.shards {
            shard.backup(w)?;
        }
        Ok(())
    }

    /// Same stream as [`Store::backup`], gzip-compressed.
    pub fn backup_gz(&self, w: &mut dyn Write) -> Result<(), StoreError> {
        let mut gz = GzEncoder::new(w, Compression::default());
        self.backup(&mut gz)?;
        gz.finish()?;
        Ok(())
    }

    /// Restoring from a backup stream is not implemented.
    pub fn restore(&self, _r: &mut dyn std::io::Read) -> Result<(), StoreError> {
        Err(StoreError::NotSupported)
    }

    /// Sweeps expired keys from every shard without a time budget.
    pub fn expire_all(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.expire_keys(Duration::ZERO))
            .sum()
    }

    /// Sweeps one shard, round-robin across calls. The periodic driver
    /// calls this once per tick with the tick interval as budget.
    pub fn sweep_next(&self, budget: Duration) -> usize {
        let i = self.expire_seq.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[i].expire_keys(budget)
    }

    /// Flushes every shard that has unsynced writes.
    pub fn fsync_all(&self) -> Result<(), StoreError> {
        for shard in &self.shards {
            shard.fsync()?;
        }
        Ok(())
    }

    /// Shuts the store down: in-flight sweeps are told to abort, and all
    /// dirty shards are flushed. Shard files close when the store drops.
    pub fn close(&self) -> Result<(), StoreError> {
        self.force_exit.store(true, Ordering::SeqCst);
        self.fsync_all()
    }
}

/// Opens all shard files with a fixed pool of worker threads. Workers
/// pull indices from a shared counter and stop early once any open
/// fails.
fn open_shards(opts: &StoreOptions, force_exit: &Arc<AtomicBool>) -> Result<Vec<Shard>, StoreError> {
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let opened: Mutex<Vec<(usize, Shard)>> = Mutex::new(Vec::with_capacity(opts.shard_count));
    let first_error: Mutex<Option<StoreError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..OPEN_WORKERS {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= opts.shard_count || failed.load(Ordering::Relaxed) {
                    break;
                }
                match Shard::open(&opts.shard_path(i), Arc::clone(force_exit)) {
                    Ok(shard) => opened.lock().unwrap().push((i, shard)),
                    Err(e) => {
                        failed.store(true, Ordering::Relaxed);
                        first_error.lock().unwrap().get_or_insert(e);
                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }

    let mut opened = opened.into_inner().unwrap();
    opened.sort_by_key(|(i, _)| *i);
    Ok(opened.into_iter().map(|(_, shard)| shard).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        let mut opts = StoreOptions::new(dir.path());
        // small shard array keeps test directories light
        opts.shard_count = 16;
        opts.collision_shards = 4;
        Store::open(opts).unwrap()
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set(b"aa", b"bbb", 0).unwrap();
        store.set(b"aa", b"ccc", 0).unwrap();
        assert_eq!(store.get(b"aa").unwrap(), b"ccc");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_delete_then_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set(b"aa", b"ccc", 0).unwrap();
        assert!(store.delete(b"aa").unwrap());
        assert!(store.get(b"aa").is_err());
        assert_eq!(store.count(), 0);
        assert!(!store.delete(b"aa").unwrap());
    }

    #[test]
    fn test_counter_sequence() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.incr(b"counter", 1).unwrap(), 1);
        assert_eq!(store.incr(b"counter", 10).unwrap(), 11);
        assert_eq!(store.decr(b"counter", 1).unwrap(), 10);
        assert_eq!(store.decr(b"counter", 11).unwrap(), 18446744073709551615);
    }

    #[test]
    fn test_empty_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set(b"", b"abc", 0).unwrap();
        store.set(b"", b"def", 0).unwrap();
        assert_eq!(store.get(b"").unwrap(), b"def");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_single_shard_without_collision_shards() {
        let dir = TempDir::new().unwrap();
        let mut opts = StoreOptions::new(dir.path());
        opts.shard_count = 1;
        opts.collision_shards = 0;
        let store = Store::open(opts).unwrap();

        store.set(b"a", b"123", 0).unwrap();
        store.set(b"b", b"456", 0).unwrap();
        assert_eq!(store.get(b"b").unwrap(), b"456");
        assert_eq!(store.get(b"a").unwrap(), b"123");
        store.close().unwrap();
    }

    #[test]
    fn test_rejects_collision_shards_eating_all_shards() {
        let dir = TempDir::new().unwrap();
        let mut opts = StoreOptions::new(dir.path());
        opts.shard_count = 4;
        opts.collision_shards = 4;
        assert!(matches!(
            Store::open(opts),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reopen_is_a_noop_for_query_results() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set(b"aa", b"bbb", 0).unwrap();
            store.close().unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get(b"aa").unwrap(), b"bbb");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_shard_prefix_names_files() {
        let dir = TempDir::new().unwrap();
        let mut opts = StoreOptions::new(dir.path());
        opts.shard_count = 2;
        opts.collision_shards = 1;
        opts.prefix = Some("kv".to_string());
        let store = Store::open(opts).unwrap();
        store.set(b"a", b"1", 0).unwrap();

        assert!(dir.path().join("kv-0").exists());
        assert!(dir.path().join("kv-1").exists());
    }

    #[test]
    fn test_many_keys_no_misses() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let n = 10_000u64;

        for i in 0..n {
            let key = format!("key-{i:010}");
            store.set(key.as_bytes(), &i.to_be_bytes(), 0).unwrap();
        }
        assert_eq!(store.count() as u64, n);

        for i in 0..n {
            let key = format!("key-{i:010}");
            let value = store.get(key.as_bytes()).unwrap();
            assert_eq!(value, i.to_be_bytes());
        }

        for i in 0..n {
            let key = format!("key-{i:010}");
            assert!(store.delete(key.as_bytes()).unwrap());
        }
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_backup_stream_marker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set(b"key", b"value", 0).unwrap();

        let mut plain = Vec::new();
        store.backup(&mut plain).unwrap();
        assert_eq!(plain[0], BACKUP_STREAM_MARKER);
        assert!(plain.len() > 1);

        let mut gz = Vec::new();
        store.backup_gz(&mut gz).unwrap();
        // RFC 1952 magic
        assert_eq!(&gz[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_file_size_accounts_preambles() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        // 16 empty shards, two preamble bytes each
        assert_eq!(store.file_size().unwrap(), 32);
    }

    #[test]
    fn test_restore_not_supported() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut r = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            store.restore(&mut r),
            Err(StoreError::NotSupported)
        ));
    }

    #[test]
    fn test_expire_all() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let past = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - 10_000) as u32;

        for i in 0..50 {
            store
                .set(format!("key{}", i).as_bytes(), b"v", past)
                .unwrap();
        }
        store.set(b"keeper", b"v", 0).unwrap();

        assert_eq!(store.expire_all(), 50);
        assert_eq!(store.count(), 1);
    }
}
