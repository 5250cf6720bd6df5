//! The store: buffer pool, log, lock service and transactions over one data
//! directory.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::blink::BlinkIndex;
use crate::buffer_pool::BufferManager;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::field::Field;
use crate::lock_manager::LockManager;
use crate::meta::{Attachments, IndexDescriptor, IndexStatistics};
use crate::page_id::PageId;
use crate::recovery::{self, RecoveryReport};
use crate::transaction::{Tx, TxManager};
use crate::wal::WalManager;
use crate::Lsn;

pub const WAL_FILE: &str = "arbor.wal";

/// Container new indexes are created in.
pub const DEFAULT_CONTAINER: u16 = 0;

pub struct Store {
    config: StoreConfig,
    bm: Arc<BufferManager>,
    locks: Arc<LockManager>,
    txm: TxManager,
    attachments: RwLock<HashMap<PageId, Attachments>>,
    next_unit: AtomicU32,
    recovery: RecoveryReport,
}

/// Container numbers of the container files found in `dir`.
fn existing_containers(dir: &std::path::Path) -> Result<Vec<u16>> {
    let mut containers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(number) = name
            .strip_prefix("container-")
            .and_then(|rest| rest.strip_suffix(".db"))
            .and_then(|n| n.parse::<u16>().ok())
        {
            containers.push(number);
        }
    }
    containers.sort_unstable();
    Ok(containers)
}

impl Store {
    /// Opens the store in `config.data_dir`, creating it when empty, and runs
    /// restart recovery.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let wal = Arc::new(WalManager::open(
            config.data_dir.join(WAL_FILE),
            config.log_buffer_size,
        )?);
        let bm = Arc::new(BufferManager::new(
            config.data_dir.clone(),
            config.buffer_pool_size,
            wal,
        ));
        let mut containers = existing_containers(&config.data_dir)?;
        if containers.is_empty() {
            containers.push(DEFAULT_CONTAINER);
        }
        for container in containers {
            bm.open_container(container)?;
        }

        let locks = Arc::new(LockManager::new(config.lock_timeout));
        let txm = TxManager::new(bm.clone(), locks.clone(), 1);
        let report = recovery::recover(&txm)?;
        let mut max_unit = 0;
        for container in bm.containers() {
            max_unit = max_unit.max(bm.max_unit(container)?);
        }
        info!(dir = ?config.data_dir, containers = ?bm.containers(), max_unit, "store open");
        Ok(Self {
            config,
            bm,
            locks,
            txm,
            attachments: RwLock::new(HashMap::new()),
            next_unit: AtomicU32::new(max_unit + 1),
            recovery: report,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn tx_manager(&self) -> &TxManager {
        &self.txm
    }

    /// What restart recovery did when the store was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn begin(&self) -> Tx {
        self.txm.begin()
    }

    pub fn commit(&self, tx: &Tx) -> Result<()> {
        self.txm.commit(tx)
    }

    pub fn rollback(&self, tx: &Tx) -> Result<()> {
        self.txm.rollback(tx)
    }

    /// Flushes everything and logs a checkpoint. Fails while transactions
    /// are active.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let active = self.txm.active_transactions();
        if !active.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "checkpoint with active transactions {active:?}"
            )));
        }
        recovery::checkpoint(&self.bm)
    }

    /// Opens another container file, creating it if needed.
    pub fn add_container(&self, container: u16) -> Result<()> {
        self.bm.open_container(container)
    }

    /// Creates an index in the default container and records its
    /// descriptor.
    pub fn create_index(
        &self,
        tx: &Tx,
        name: &str,
        key_type: Field,
        value_type: Field,
        unique: bool,
    ) -> Result<BlinkIndex> {
        let unit = self.next_unit.fetch_add(1, Ordering::SeqCst);
        let index = BlinkIndex::create(tx, DEFAULT_CONTAINER, unit, key_type, value_type, unique)?;
        self.attachments.write().entry(index.root()).or_default().set(IndexDescriptor {
            name: name.to_string(),
            root: index.root(),
            key_type,
            value_type,
            unique,
        });
        debug!(name, root = %index.root(), unit, "index created");
        Ok(index)
    }

    pub fn open_index(&self, root: PageId) -> Result<BlinkIndex> {
        BlinkIndex::open(&self.bm, root)
    }

    /// Samples the index and attaches the statistics to it.
    pub fn analyze(&self, tx: &Tx, index: &BlinkIndex, probes: usize) -> Result<IndexStatistics> {
        let statistics = index.sample(tx, probes)?;
        self.attachments
            .write()
            .entry(index.root())
            .or_default()
            .set(statistics.clone());
        debug!(root = %index.root(), %statistics, "analyzed index");
        Ok(statistics)
    }

    pub fn attachments(&self, root: PageId) -> Attachments {
        self.attachments.read().get(&root).cloned().unwrap_or_default()
    }

    pub fn update_attachments<R>(&self, root: PageId, f: impl FnOnce(&mut Attachments) -> R) -> R {
        f(self.attachments.write().entry(root).or_default())
    }

    /// Checkpoints and closes the store. Dropping a store without closing it
    /// leaves the files as a crash would.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        info!(dir = ?self.config.data_dir, "store closed");
        Ok(())
    }
}
