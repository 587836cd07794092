use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::block::BlockStore;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::index::HashDirectory;
use crate::metrics::{self, MetricsSnapshot};
use crate::persist::Persistable;
use crate::recovery;
use crate::txn::{Handle, Transaction, TransactionProcessor};
use crate::Error;

const LOCK_FILE: &str = "blockkv.lock";

/// Durable key-value store holding values of one [`Persistable`] type.
///
/// Every operation becomes a [`Transaction`] applied by a single background
/// thread in submission order. The `*_async` methods return a [`Handle`] right
/// away; the other methods wait for the outcome. Once shutdown has been
/// requested every method fails immediately.
pub struct Store<T> {
    config: StoreConfig,
    shutting_down: AtomicBool,
    processor: TransactionProcessor<T>,
    lock: Mutex<Option<FileLock>>,
}

impl<T: Persistable + Send + 'static> Store<T> {
    /// Open store with default configuration
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(dir))
    }

    /// Open store with custom configuration
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let mut blocks = BlockStore::open(&config.dir, config.block_size, config.lock_stripes)?;
        let mut directory =
            HashDirectory::open(&config.dir, config.initial_capacity, config.max_load_factor)?;
        if config.sweep_on_open {
            recovery::sweep(&mut blocks, &mut directory)?;
        }

        let block_stats = blocks.stats();
        let directory_stats = directory.stats();
        let processor = TransactionProcessor::start(blocks, directory)?;

        tracing::info!(
            dir = ?config.dir,
            block_size = block_stats.block_size,
            blocks = block_stats.block_count,
            keys = directory_stats.len(),
            split = directory_stats.split,
            "Opened store"
        );

        Ok(Self {
            config,
            shutting_down: AtomicBool::new(false),
            processor,
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Submits a prebuilt transaction, typically one with a callback bound
    /// through [`Transaction::on_complete`].
    pub fn submit(&self, txn: Transaction<T>) -> Option<Handle<T>> {
        if self.is_shutting_down() {
            return None;
        }
        self.processor.submit(txn)
    }

    /// Reads `key` into `receiver`; the filled receiver comes back through
    /// [`Handle::take_value`].
    pub fn get_async(&self, key: &str, receiver: T) -> Option<Handle<T>> {
        self.submit(Transaction::get(key, receiver))
    }

    pub fn put_async(&self, key: &str, value: T) -> Option<Handle<T>> {
        self.submit(Transaction::put(key, value))
    }

    pub fn remove_async(&self, key: &str) -> Option<Handle<T>> {
        self.submit(Transaction::delete(key))
    }

    pub fn move_async(&self, key: &str, new_key: &str) -> Option<Handle<T>> {
        self.submit(Transaction::move_key(key, new_key))
    }

    /// Reads `key` into `receiver`. Returns false if the key is absent, holds
    /// an integer, or could not be read.
    pub fn get(&self, key: &str, receiver: &mut T) -> bool
    where
        T: Default,
    {
        if self.is_shutting_down() {
            return false;
        }
        let handle = match self.get_async(key, std::mem::take(receiver)) {
            Some(handle) => handle,
            None => return false,
        };
        let succeeded = handle.wait();
        if let Some(value) = handle.take_value() {
            *receiver = value;
        }
        succeeded
    }

    pub fn put(&self, key: &str, value: T) -> bool {
        wait(self.put_async(key, value))
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub fn remove(&self, key: &str) -> bool {
        wait(self.remove_async(key))
    }

    /// Rebinds the value of `key` to `new_key`.
    pub fn move_key(&self, key: &str, new_key: &str) -> bool {
        wait(self.move_async(key, new_key))
    }

    /// Stores an integer directly in the directory. Fails if `key` holds a
    /// value.
    pub fn put_long(&self, key: &str, value: u64) -> bool {
        wait(self.submit(Transaction::put_long(key, value)))
    }

    pub fn get_long(&self, key: &str) -> Option<u64> {
        let handle = self.submit(Transaction::get_long(key))?;
        if handle.wait() {
            handle.long_value()
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        wait(self.submit(Transaction::exists(key)))
    }
}

impl<T> Store<T> {
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Blocks until every submitted transaction has completed and its
    /// callback has run.
    pub fn flush(&self) {
        if !self.is_shutting_down() {
            self.processor.flush();
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.processor.metrics()
    }

    pub fn log_metrics(&self) {
        metrics::log_metrics(&self.metrics());
    }

    /// Fails queued transactions, stops the background threads, syncs the
    /// files and releases the directory lock. Callable from any thread; later
    /// calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let result = self.processor.shutdown();
        let lock = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(lock) = lock {
            if let Err(e) = lock.unlock() {
                tracing::warn!(dir = ?self.config.dir, error = %e, "Failed to release directory lock");
            }
            tracing::info!(dir = ?self.config.dir, "Store closed");
        }
        result
    }
}

impl<T> Drop for Store<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Failed to shut down store");
        }
    }
}

fn wait<T>(handle: Option<Handle<T>>) -> bool {
    handle.map_or(false, |handle| handle.wait())
}
