//! File-backed block allocator.
//!
//! Temp blocks are plain files under `<root>/<tier>/.tmp/<session>/<block>`.
//! A single capacity pool covers every tier; reservations are taken with a
//! CAS loop so concurrent writers never overshoot it. Committed blocks move
//! to `<root>/<tier>/<block>`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::allocator::{BlockAllocator, BlockSink};
use crate::error::AllocationError;
use crate::protocol::{BlockId, SessionId, StreamKey};
use crate::tier::StorageTierAssoc;

const TEMP_DIR: &str = ".tmp";

/// Configuration for [`LocalBlockStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlockStoreConfig {
    /// Base directory; one subdirectory per tier.
    pub root_dir: PathBuf,
    /// Bytes that may be reserved across all blocks.
    pub capacity_bytes: u64,
}

impl Default for LocalBlockStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("blocks"),
            capacity_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
        }
    }
}

#[derive(Debug)]
struct TempBlock {
    tier: String,
    path: PathBuf,
    reserved: u64,
}

pub struct LocalBlockStore {
    config: LocalBlockStoreConfig,
    tiers: StorageTierAssoc,
    used: AtomicU64,
    temp_blocks: DashMap<StreamKey, TempBlock>,
}

impl LocalBlockStore {
    /// Opens the store, creating the root directory if needed.
    pub fn open(
        config: LocalBlockStoreConfig,
        tiers: StorageTierAssoc,
    ) -> Result<Arc<Self>, AllocationError> {
        fs::create_dir_all(&config.root_dir)?;
        Ok(Arc::new(Self {
            config,
            tiers,
            used: AtomicU64::new(0),
            temp_blocks: DashMap::new(),
        }))
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Bytes currently reserved.
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> u64 {
        self.config.capacity_bytes.saturating_sub(self.used_bytes())
    }

    pub fn temp_block_count(&self) -> usize {
        self.temp_blocks.len()
    }

    pub fn temp_block_path(&self, session_id: SessionId, block_id: BlockId) -> Option<PathBuf> {
        self.temp_blocks
            .get(&StreamKey::new(session_id, block_id))
            .map(|block| block.path.clone())
    }

    /// Bytes written to a temp block so far.
    pub fn temp_block_len(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<u64, AllocationError> {
        let path = self
            .temp_block_path(session_id, block_id)
            .ok_or(AllocationError::NotFound {
                session_id,
                block_id,
            })?;
        Ok(fs::metadata(path)?.len())
    }

    /// Moves a finished temp block to its committed location.
    ///
    /// Reservation beyond the block's final length is returned to the pool.
    pub fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<PathBuf, AllocationError> {
        let (_, block) = self
            .temp_blocks
            .remove(&StreamKey::new(session_id, block_id))
            .ok_or(AllocationError::NotFound {
                session_id,
                block_id,
            })?;
        let committed = self
            .config
            .root_dir
            .join(&block.tier)
            .join(block_id.get().to_string());
        let len = match fs::metadata(&block.path).and_then(|meta| {
            fs::rename(&block.path, &committed)?;
            Ok(meta.len())
        }) {
            Ok(len) => len,
            Err(err) => {
                self.release(block.reserved);
                return Err(err.into());
            }
        };
        self.release(block.reserved.saturating_sub(len));
        debug!(
            session_id = session_id.get(),
            block_id = block_id.get(),
            bytes = len,
            path = %committed.display(),
            "temp block committed"
        );
        Ok(committed)
    }

    /// Deletes a temp block and returns its reservation.
    pub fn abort_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), AllocationError> {
        let (_, block) = self
            .temp_blocks
            .remove(&StreamKey::new(session_id, block_id))
            .ok_or(AllocationError::NotFound {
                session_id,
                block_id,
            })?;
        self.release(block.reserved);
        match fs::remove_file(&block.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Aborts every temp block of a session. Returns how many were removed.
    pub fn cleanup_session(&self, session_id: SessionId) -> usize {
        let keys: Vec<StreamKey> = self
            .temp_blocks
            .iter()
            .filter(|entry| entry.key().session_id == session_id)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for key in keys {
            match self.abort_block(key.session_id, key.block_id) {
                Ok(()) => removed += 1,
                Err(error) => warn!(
                    session_id = key.session_id.get(),
                    block_id = key.block_id.get(),
                    error = %error,
                    "failed to clean up temp block"
                ),
            }
        }
        for dir in self.session_dirs(session_id) {
            // Only succeeds once the directory is empty.
            let _ = fs::remove_dir(dir);
        }
        removed
    }

    fn session_dirs(&self, session_id: SessionId) -> impl Iterator<Item = PathBuf> + '_ {
        self.tiers.aliases().map(move |tier| {
            self.config
                .root_dir
                .join(tier)
                .join(TEMP_DIR)
                .join(session_id.get().to_string())
        })
    }

    fn reserve(&self, bytes: u64) -> Result<(), AllocationError> {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let available = self.config.capacity_bytes.saturating_sub(current);
            if bytes > available {
                return Err(AllocationError::NoSpace {
                    requested: bytes,
                    available,
                });
            }
            if self
                .used
                .compare_exchange(current, current + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

impl BlockAllocator for LocalBlockStore {
    fn create_temp(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        tier_alias: &str,
        initial_bytes: u64,
    ) -> Result<Box<dyn BlockSink>, AllocationError> {
        if self.tiers.ordinal(tier_alias).is_none() {
            return Err(AllocationError::UnknownTier(tier_alias.to_string()));
        }
        let entry = match self.temp_blocks.entry(StreamKey::new(session_id, block_id)) {
            Entry::Occupied(_) => {
                return Err(AllocationError::AlreadyExists {
                    session_id,
                    block_id,
                });
            }
            Entry::Vacant(entry) => entry,
        };

        self.reserve(initial_bytes)?;
        let dir = self
            .config
            .root_dir
            .join(tier_alias)
            .join(TEMP_DIR)
            .join(session_id.get().to_string());
        let path = dir.join(block_id.get().to_string());
        let file = fs::create_dir_all(&dir).and_then(|()| {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
        });
        let file = match file {
            Ok(file) => file,
            Err(err) => {
                self.release(initial_bytes);
                return Err(err.into());
            }
        };

        entry.insert(TempBlock {
            tier: tier_alias.to_string(),
            path: path.clone(),
            reserved: initial_bytes,
        });
        debug!(
            session_id = session_id.get(),
            block_id = block_id.get(),
            tier = tier_alias,
            bytes = initial_bytes,
            "temp block created"
        );
        Ok(Box::new(FileBlockSink {
            file,
            path,
            position: 0,
        }))
    }

    fn reserve_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        additional_bytes: u64,
    ) -> Result<(), AllocationError> {
        let mut block = self
            .temp_blocks
            .get_mut(&StreamKey::new(session_id, block_id))
            .ok_or(AllocationError::NotFound {
                session_id,
                block_id,
            })?;
        self.reserve(additional_bytes)?;
        block.reserved += additional_bytes;
        Ok(())
    }
}

/// Sink appending to a temp block file.
#[derive(Debug)]
pub struct FileBlockSink {
    file: File,
    path: PathBuf,
    position: u64,
}

impl FileBlockSink {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockSink for FileBlockSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SESSION: SessionId = SessionId::new(3);

    fn store(temp: &TempDir, capacity_bytes: u64) -> Arc<LocalBlockStore> {
        LocalBlockStore::open(
            LocalBlockStoreConfig {
                root_dir: temp.path().to_path_buf(),
                capacity_bytes,
            },
            StorageTierAssoc::worker_default(),
        )
        .unwrap()
    }

    #[test]
    fn write_commit_moves_block() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 1024);
        let block = BlockId::new(11);

        let mut sink = store.create_temp(SESSION, block, "MEM", 5).unwrap();
        sink.append(b"hello").unwrap();
        store.reserve_space(SESSION, block, 6).unwrap();
        sink.append(b" world").unwrap();
        assert_eq!(sink.position(), 11);
        sink.commit().unwrap();

        let temp_path = temp.path().join("MEM/.tmp/3/11");
        assert_eq!(store.temp_block_path(SESSION, block), Some(temp_path));
        assert_eq!(store.temp_block_len(SESSION, block).unwrap(), 11);
        assert_eq!(store.used_bytes(), 11);

        let committed = store.commit_block(SESSION, block).unwrap();
        assert_eq!(committed, temp.path().join("MEM/11"));
        assert_eq!(fs::read(&committed).unwrap(), b"hello world");
        assert_eq!(store.temp_block_count(), 0);
        assert_eq!(store.used_bytes(), 11);
    }

    #[test]
    fn rejects_duplicates_unknown_blocks_and_tiers() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 1024);
        let block = BlockId::new(1);

        let _sink = store.create_temp(SESSION, block, "SSD", 8).unwrap();
        assert!(matches!(
            store.create_temp(SESSION, block, "SSD", 8),
            Err(AllocationError::AlreadyExists { .. })
        ));
        assert!(matches!(
            store.reserve_space(SESSION, BlockId::new(2), 8),
            Err(AllocationError::NotFound { .. })
        ));
        assert_eq!(
            store
                .create_temp(SESSION, BlockId::new(3), "TAPE", 8)
                .err(),
            Some(AllocationError::UnknownTier("TAPE".to_string()))
        );
        assert_eq!(store.used_bytes(), 8);
    }

    #[test]
    fn capacity_is_enforced() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 100);
        let block = BlockId::new(5);

        let _sink = store.create_temp(SESSION, block, "MEM", 60).unwrap();
        assert_eq!(
            store.reserve_space(SESSION, block, 50),
            Err(AllocationError::NoSpace {
                requested: 50,
                available: 40
            })
        );
        store.reserve_space(SESSION, block, 40).unwrap();
        assert_eq!(store.available_bytes(), 0);
        assert!(matches!(
            store.create_temp(SESSION, BlockId::new(6), "MEM", 1),
            Err(AllocationError::NoSpace { .. })
        ));
        // The failed create left nothing behind.
        assert_eq!(store.temp_block_count(), 1);
    }

    #[test]
    fn abort_and_session_cleanup_release_space() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 1024);

        for block in 0..3 {
            let mut sink = store
                .create_temp(SESSION, BlockId::new(block), "HDD", 10)
                .unwrap();
            sink.append(&[7; 10]).unwrap();
            sink.abort();
        }
        let other = SessionId::new(4);
        let _sink = store.create_temp(other, BlockId::new(9), "HDD", 10).unwrap();
        assert_eq!(store.used_bytes(), 40);

        store.abort_block(SESSION, BlockId::new(0)).unwrap();
        assert!(!temp.path().join("HDD/.tmp/3/0").exists());
        assert_eq!(store.used_bytes(), 30);

        assert_eq!(store.cleanup_session(SESSION), 2);
        assert_eq!(store.used_bytes(), 10);
        assert_eq!(store.temp_block_count(), 1);
        assert!(store.temp_block_path(other, BlockId::new(9)).is_some());
    }
}
