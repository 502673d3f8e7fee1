//! Shard: One File, One Index, One Lock
//!
//! A shard owns a single append-structured file plus two in-memory maps:
//!
//! - `index`: murmur3 hash -> packed slot descriptor (offset, size class,
//!   coarse expiry)
//! - `freelist`: offset -> size class of a deleted slot, consulted to
//!   reuse space before growing the file
//!
//! All access goes through one `RwLock`. Mutations hold the write lock
//! for their full duration, file I/O included; reads take the read lock
//! and use positional I/O so no seek cursor is shared. The expiration
//! sweep releases the lock between batches to avoid starving foreground
//! work.
//!
//! The shard does not know about keys beyond byte equality: the caller
//! supplies the hash, and a mismatch between the stored key and the
//! looked-up key surfaces as [`StoreError::Collision`] for the store to
//! retry on its collision shards.

use crate::storage::record::{
    self, header_size, pack_entry, read_header, unmarshal, unpack_entry, Header, HEADER_SIZE,
    SHARD_VERSION, STATUS_DELETED, STATUS_LIVE, VERSION_MARKER,
};
use crate::storage::StoreError;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One partition of the store: a file with its in-memory lookup state.
pub struct Shard {
    state: RwLock<ShardState>,
    /// Raised once at shutdown; sweeps check it between batches.
    force_exit: Arc<AtomicBool>,
}

struct ShardState {
    file: File,
    index: HashMap<u32, u64>,
    freelist: HashMap<u32, u8>,
    needs_fsync: bool,
}

/// Result of a slot lookup while some lock is already held.
enum Lookup {
    Hit(Vec<u8>, Header),
    /// The entry is past its expiry; `(offset, size_class)` for cleanup.
    Expired(u32, u8),
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Shard {
    /// Opens or creates the shard file at `path` and rebuilds the
    /// in-memory state.
    ///
    /// - empty / new file: the two-byte preamble is written
    /// - version 1: a sequential scan fills `index` and `freelist`
    /// - version 0: the file is upgraded record by record into a sibling
    ///   file that atomically replaces the original
    /// - anything else: [`StoreError::UnsupportedVersion`]
    pub fn open(path: &Path, force_exit: Arc<AtomicBool>) -> Result<Shard, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut state = ShardState {
            file,
            index: HashMap::new(),
            freelist: HashMap::new(),
            needs_fsync: false,
        };

        if state.file.metadata()?.len() == 0 {
            state
                .file
                .write_all_at(&[VERSION_MARKER, SHARD_VERSION], 0)?;
        } else {
            match detect_version(&state.file, path)? {
                SHARD_VERSION => scan(&mut state)?,
                0 => upgrade(&mut state, path)?,
                version => {
                    return Err(StoreError::UnsupportedVersion {
                        version,
                        path: path.display().to_string(),
                    })
                }
            }
        }

        Ok(Shard {
            state: RwLock::new(state),
            force_exit,
        })
    }

    /// Inserts or overwrites a record.
    ///
    /// `expire` is an absolute unix-seconds timestamp, 0 for never. The
    /// caller supplies the key hash so collision shards can reuse it.
    pub fn set(&self, key: &[u8], value: &[u8], h: u32, expire: u32) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        Self::write_locked(&mut state, key, value, h, expire)
    }

    fn write_locked(
        state: &mut ShardState,
        key: &[u8],
        value: &[u8],
        h: u32,
        expire: u32,
    ) -> Result<(), StoreError> {
        state.needs_fsync = true;
        let (header, slot) = record::marshal(key, value, expire)?;
        let mut pos: Option<u64> = None;

        if let Some(&packed) = state.index.get(&h) {
            let (offset, size_class, _) = unpack_entry(packed);
            let mut existing = vec![0u8; 1 << size_class];
            state.file.read_exact_at(&mut existing, offset as u64)?;
            let (old_header, old_key, _) = unmarshal(&existing);
            if old_key != key {
                return Err(StoreError::Collision);
            }

            if old_header.size_class == header.size_class {
                // same size class: overwrite in place
                pos = Some(offset as u64);
            } else {
                // tombstone the old slot, then try to remap into a freed
                // slot of the right size class
                state.file.write_all_at(&[STATUS_DELETED], offset as u64 + 1)?;
                state.freelist.insert(offset, old_header.size_class);

                let reusable = state
                    .freelist
                    .iter()
                    .find(|(_, &sc)| sc == header.size_class)
                    .map(|(&offset, _)| offset);
                if let Some(offset) = reusable {
                    state.freelist.remove(&offset);
                    pos = Some(offset as u64);
                }
            }
        }

        let pos = match pos {
            Some(pos) => pos,
            None => state.file.metadata()?.len(),
        };

        state.file.write_all_at(&slot, pos)?;
        state
            .index
            .insert(h, pack_entry(pos as u32, header.size_class, header.expire));
        Ok(())
    }

    /// Looks up a key. Expired entries are lazily removed and reported as
    /// [`StoreError::Expired`]; a key mismatch at the bucket reports
    /// [`StoreError::Collision`].
    pub fn get(&self, key: &[u8], h: u32) -> Result<(Vec<u8>, Header), StoreError> {
        let now = unix_now();

        {
            let state = self.state.read().unwrap();
            if let Lookup::Hit(value, header) = Self::lookup(&state, key, h, now)? {
                return Ok((value, header));
            }
        }

        // lazy cleanup needs the write lock; the lookup runs again since
        // the entry may have been replaced while we were unlocked
        let mut state = self.state.write().unwrap();
        Self::get_locked(&mut state, key, h, now)
    }

    fn lookup(state: &ShardState, key: &[u8], h: u32, now: i64) -> Result<Lookup, StoreError> {
        let packed = match state.index.get(&h) {
            Some(&packed) => packed,
            None => return Err(StoreError::KeyNotFound),
        };
        let (offset, size_class, hint_expire) = unpack_entry(packed);

        // the packed expiry is an upper bound: past means definitely past
        if hint_expire != 0 && (hint_expire as i64) < now {
            return Ok(Lookup::Expired(offset, size_class));
        }

        let mut slot = vec![0u8; 1 << size_class];
        state.file.read_exact_at(&mut slot, offset as u64)?;
        let (header, stored_key, value) = unmarshal(&slot);
        if stored_key != key {
            return Err(StoreError::Collision);
        }
        if header.is_expired(now) {
            return Ok(Lookup::Expired(offset, size_class));
        }
        Ok(Lookup::Hit(value.to_vec(), header))
    }

    /// Same as [`Shard::get`] but with the write lock already held, so
    /// expired entries are cleaned up inline.
    fn get_locked(
        state: &mut ShardState,
        key: &[u8],
        h: u32,
        now: i64,
    ) -> Result<(Vec<u8>, Header), StoreError> {
        match Self::lookup(state, key, h, now)? {
            Lookup::Hit(value, header) => Ok((value, header)),
            Lookup::Expired(offset, size_class) => {
                state.index.remove(&h);
                state.freelist.insert(offset, size_class);
                Err(StoreError::Expired)
            }
        }
    }

    /// Removes a key. Returns whether it was present. The slot is kept on
    /// disk with its status byte flipped and its offset goes to the
    /// freelist.
    pub fn delete(&self, key: &[u8], h: u32) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        let packed = match state.index.get(&h) {
            Some(&packed) => packed,
            None => return Ok(false),
        };
        let (offset, size_class, _) = unpack_entry(packed);
        let mut slot = vec![0u8; 1 << size_class];
        state.file.read_exact_at(&mut slot, offset as u64)?;
        let (header, stored_key, _) = unmarshal(&slot);
        if stored_key != key {
            return Err(StoreError::Collision);
        }
        state.file.write_all_at(&[STATUS_DELETED], offset as u64 + 1)?;
        state.index.remove(&h);
        state.freelist.insert(offset, header.size_class);
        Ok(true)
    }

    /// Rewrites only the record header with a new expiry.
    pub fn touch(&self, key: &[u8], h: u32, expire: u32) -> Result<(), StoreError> {
        let now = unix_now();
        let mut state = self.state.write().unwrap();
        let packed = match state.index.get(&h) {
            Some(&packed) => packed,
            None => return Err(StoreError::KeyNotFound),
        };
        let (offset, size_class, _) = unpack_entry(packed);
        let mut slot = vec![0u8; 1 << size_class];
        state.file.read_exact_at(&mut slot, offset as u64)?;
        let (mut header, stored_key, _) = unmarshal(&slot);
        if stored_key != key {
            return Err(StoreError::Collision);
        }
        if header.is_expired(now) {
            return Err(StoreError::Expired);
        }

        header.expire = expire;
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        state.file.write_all_at(&buf, offset as u64)?;
        state.index.insert(h, pack_entry(offset, size_class, expire));
        state.needs_fsync = true;
        Ok(())
    }

    /// Read-modify-write of an 8-byte big-endian counter.
    ///
    /// A missing (or expired) key starts from zero; a live value of any
    /// other width is [`StoreError::WrongFormat`]. Arithmetic wraps.
    pub fn counter(
        &self,
        key: &[u8],
        h: u32,
        delta: u64,
        increment: bool,
    ) -> Result<u64, StoreError> {
        let now = unix_now();
        let mut state = self.state.write().unwrap();

        let (old, expire) = match Self::get_locked(&mut state, key, h, now) {
            Ok((value, header)) => (value, header.expire),
            Err(StoreError::KeyNotFound) | Err(StoreError::Expired) => (vec![0u8; 8], 0),
            Err(e) => return Err(e),
        };

        let old: [u8; 8] = old.try_into().map_err(|_| StoreError::WrongFormat)?;
        let count = u64::from_be_bytes(old);
        let count = if increment {
            count.wrapping_add(delta)
        } else {
            count.wrapping_sub(delta)
        };

        Self::write_locked(&mut state, key, &count.to_be_bytes(), h, expire)?;
        Ok(count)
    }

    /// Sweeps expired entries, spending at most `budget` wall-clock time.
    ///
    /// Candidates are collected under the read lock from the packed
    /// expiries; removal happens in batches under the write lock with a
    /// sleep in between so foreground work keeps making progress. A zero
    /// budget removes up to 1000 candidates per batch without sleeping.
    /// Returns the number of removed entries.
    pub fn expire_keys(&self, budget: Duration) -> usize {
        let start_ms = now_millis();
        let current = start_ms / 1000;

        let budget = budget.min(Duration::from_secs(1000));
        let budget_ms = budget.as_millis() as i64;
        let mut end_ms = start_ms + budget_ms;

        let expired: Vec<u32> = {
            let state = self.state.read().unwrap();
            state
                .index
                .iter()
                .filter(|(_, &packed)| {
                    let (_, _, expire) = unpack_entry(packed);
                    expire != 0 && current > expire as i64
                })
                .map(|(&h, _)| h)
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let mut sleep_ms = budget_ms / expired.len() as i64 / 2;
        let mut batch_size = 1usize;
        if sleep_ms < 1 {
            batch_size = expired.len() / (budget_ms as usize + 1) + 1;
            sleep_ms = 1;
        } else if sleep_ms > 10 {
            sleep_ms = 10;
        }
        if budget_ms == 0 {
            batch_size = 1000;
            sleep_ms = 0;
            end_ms = start_ms + 300_000;
        }

        let mut removed = 0;
        let mut in_batch = 0;
        let mut state = self.state.write().unwrap();
        for h in expired {
            if self.force_exit.load(Ordering::Relaxed) || now_millis() >= end_ms {
                break;
            }
            if let Some(&packed) = state.index.get(&h) {
                let (offset, size_class, expire) = unpack_entry(packed);
                // re-confirm: the entry may have been rewritten since the
                // candidate scan
                if expire != 0 && current > expire as i64 {
                    state.index.remove(&h);
                    state.freelist.insert(offset, size_class);
                    removed += 1;
                }
            }
            in_batch += 1;
            if in_batch >= batch_size {
                drop(state);
                if sleep_ms > 0 {
                    std::thread::sleep(Duration::from_millis(sleep_ms as u64));
                }
                state = self.state.write().unwrap();
                in_batch = 0;
            }
        }
        drop(state);

        removed
    }

    /// Flushes file contents to stable storage if anything was written
    /// since the last sync.
    pub fn fsync(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        if state.needs_fsync {
            state.needs_fsync = false;
            state.file.sync_all()?;
        }
        Ok(())
    }

    /// Number of live keys.
    pub fn count(&self) -> usize {
        self.state.read().unwrap().index.len()
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state.file.metadata()?.len())
    }

    /// Streams every live, unexpired record to `w` in file order as
    /// header + value + key (padding is not emitted).
    pub fn backup(&self, w: &mut dyn Write) -> Result<(), StoreError> {
        let state = self.state.write().unwrap();
        let now = unix_now();
        let file_len = state.file.metadata()?.len();
        let mut offset = 2u64;
        let mut header_buf = [0u8; HEADER_SIZE];

        while offset + HEADER_SIZE as u64 <= file_len {
            state.file.read_exact_at(&mut header_buf, offset)?;
            if header_buf[0] == 0 {
                break;
            }
            let header = Header::decode(&header_buf);
            let mut payload = vec![0u8; header.val_len as usize + header.key_len as usize];
            state
                .file
                .read_exact_at(&mut payload, offset + HEADER_SIZE as u64)?;

            if !header.is_deleted() && !header.is_expired(now) {
                w.write_all(&header_buf)?;
                w.write_all(&payload)?;
            }
            offset += header.slot_size() as u64;
        }
        Ok(())
    }
}

/// Reads the two-byte preamble and decides the file format version.
///
/// Legacy version-0 files carry no preamble: their first bytes are a
/// record header, recognized by a status-like second byte.
fn detect_version(file: &File, path: &Path) -> Result<u8, StoreError> {
    let mut preamble = [0u8; 2];
    file.read_exact_at(&mut preamble, 0)?;

    let version = if preamble[0] == VERSION_MARKER {
        if preamble[1] == STATUS_LIVE || preamble[1] == STATUS_DELETED {
            0
        } else {
            preamble[1]
        }
    } else if preamble[1] == STATUS_LIVE || preamble[1] == STATUS_DELETED {
        0
    } else {
        return Err(StoreError::UnsupportedVersion {
            version: preamble[1],
            path: path.display().to_string(),
        });
    };

    if version > SHARD_VERSION {
        return Err(StoreError::UnsupportedVersion {
            version,
            path: path.display().to_string(),
        });
    }
    Ok(version)
}

/// Sequentially scans a current-format file, filling the index with live
/// unexpired records and the freelist with everything else.
fn scan(state: &mut ShardState) -> Result<(), StoreError> {
    let now = unix_now();
    let mut reader = state.file.try_clone()?;
    reader.seek(SeekFrom::Start(2))?;
    let mut reader = BufReader::new(reader);
    let mut offset = 2u32;

    while let Some(header) = read_header(&mut reader, SHARD_VERSION)? {
        let body_len = header.slot_size() - HEADER_SIZE;
        let mut body = vec![0u8; body_len];
        std::io::Read::read_exact(&mut reader, &mut body)?;

        let val_end = header.val_len as usize + header.key_len as usize;
        let key = &body[header.val_len as usize..val_end];

        if !header.is_deleted() && !header.is_expired(now) {
            let h = crate::storage::store::hash_key(key);
            state
                .index
                .insert(h, pack_entry(offset, header.size_class, header.expire));
        } else {
            state.freelist.insert(offset, header.size_class);
        }
        offset += header.slot_size() as u32;
    }
    Ok(())
}

/// Streams a legacy version-0 file into a sibling `<path>.new` file with
/// widened headers, then atomically replaces the original by rename.
/// Deleted records are dropped instead of carried over.
fn upgrade(state: &mut ShardState, path: &Path) -> Result<(), StoreError> {
    tracing::info!(path = %path.display(), "upgrading shard file from version 0");

    let new_path: PathBuf = {
        let mut os = path.as_os_str().to_owned();
        os.push(".new");
        os.into()
    };
    let new_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&new_path)?;

    let mut reader = state.file.try_clone()?;
    reader.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(reader);

    let mut writer = BufWriter::new(&new_file);
    writer.write_all(&[VERSION_MARKER, SHARD_VERSION])?;
    let mut write_offset = 2u32;

    let old_head = header_size(0);
    while let Some(old_header) = read_header(&mut reader, 0)? {
        let body_len = (1usize << old_header.size_class) - old_head;
        let mut body = vec![0u8; body_len];
        std::io::Read::read_exact(&mut reader, &mut body)?;

        if old_header.is_deleted() {
            continue;
        }

        let value = &body[..old_header.val_len as usize];
        let key = &body
            [old_header.val_len as usize..old_header.val_len as usize + old_header.key_len as usize];

        let (header, slot) = record::marshal(key, value, old_header.expire)?;
        writer.write_all(&slot)?;

        let h = crate::storage::store::hash_key(key);
        state
            .index
            .insert(h, pack_entry(write_offset, header.size_class, header.expire));
        write_offset += header.slot_size() as u32;
    }

    writer.flush()?;
    drop(writer);
    new_file.sync_all()?;
    std::fs::rename(&new_path, path)?;
    state.file = new_file;
    Ok(())
}
