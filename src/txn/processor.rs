use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::{Handle, Kind, Transaction};
use crate::block::BlockStore;
use crate::error::Result;
use crate::index::{Entry, HashDirectory, Upsert};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::persist::Persistable;
use crate::Error;

struct Shared {
    draining: AtomicBool,
    /// Transactions submitted but not yet through the dispatch stage
    pending: Mutex<usize>,
    idle: Condvar,
    metrics: Metrics,
}

impl Shared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Owns the storage and applies transactions to it on a dedicated thread.
///
/// Transactions are applied one at a time in submission order. Completed
/// transactions that carry a callback are handed to a second thread, so slow
/// callbacks never hold up the writer.
pub struct TransactionProcessor<T> {
    intake: Mutex<Option<Sender<Arc<Transaction<T>>>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Persistable + Send + 'static> TransactionProcessor<T> {
    /// Takes ownership of the storage and starts the worker and dispatch
    /// threads.
    pub fn start(blocks: BlockStore, directory: HashDirectory) -> Result<Self> {
        let shared = Arc::new(Shared {
            draining: AtomicBool::new(false),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            metrics: Metrics::default(),
        });
        shared
            .metrics
            .record_storage(blocks.stats(), directory.stats());

        let (intake_tx, intake_rx) = mpsc::channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel();

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("blockkv-dispatch".to_string())
                .spawn(move || dispatch_loop(dispatch_rx, &shared))?
        };

        let worker = Worker {
            blocks,
            directory,
            intake: intake_rx,
            dispatch: dispatch_tx,
            shared: Arc::clone(&shared),
        };
        let worker = thread::Builder::new()
            .name("blockkv-worker".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            intake: Mutex::new(Some(intake_tx)),
            shared,
            worker: Mutex::new(Some(worker)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Queues a transaction. Returns `None` once shutdown has been requested.
    pub fn submit(&self, txn: Transaction<T>) -> Option<Handle<T>> {
        let intake = self.intake.lock().unwrap();
        let sender = match intake.as_ref() {
            Some(sender) => sender,
            None => {
                self.shared.metrics.record_rejected();
                return None;
            }
        };

        let txn = Arc::new(txn);
        *self.shared.pending.lock().unwrap() += 1;
        if sender.send(Arc::clone(&txn)).is_err() {
            // The worker thread is gone.
            self.shared.finish_one();
            self.shared.metrics.record_rejected();
            return None;
        }
        self.shared.metrics.record_submitted();
        Some(Handle::new(txn))
    }
}

impl<T> TransactionProcessor<T> {
    pub fn is_running(&self) -> bool {
        self.intake.lock().unwrap().is_some()
    }

    /// Blocks until every submitted transaction has been applied and its
    /// callback, if any, has run. Must not be called from a callback.
    pub fn flush(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.shared.idle.wait(pending).unwrap();
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stops accepting work, fails whatever is still queued, joins both
    /// threads and syncs the storage files. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut intake = self.intake.lock().unwrap();
            if intake.is_some() {
                tracing::info!("Shutting down transaction processor");
                self.shared.draining.store(true, Ordering::SeqCst);
            }
            // Dropping the only sender lets the worker run dry and exit.
            intake.take();
        }

        let worker = self.worker.lock().unwrap().take();
        let result = match worker {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(Error::InvalidState(
                    "transaction worker panicked".to_string(),
                ))
            }),
            None => Ok(()),
        };

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("Dispatch thread panicked");
            }
        }

        result
    }
}

impl<T> Drop for TransactionProcessor<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Failed to shut down transaction processor");
        }
    }
}

/// Runs `f`, turning a panic in user code into an error for the transaction.
fn guarded<R>(what: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(Error::InvalidState(format!("{} panicked", what))))
}

fn dispatch_loop<T>(dispatch: Receiver<Arc<Transaction<T>>>, shared: &Shared) {
    for txn in dispatch {
        if let Some(callback) = txn.take_callback() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&txn)));
            if result.is_err() {
                tracing::error!(key = txn.key(), kind = ?txn.kind(), "Callback panicked");
            }
            shared.metrics.record_callback();
        }
        shared.finish_one();
    }
}

struct Worker<T> {
    blocks: BlockStore,
    directory: HashDirectory,
    intake: Receiver<Arc<Transaction<T>>>,
    dispatch: Sender<Arc<Transaction<T>>>,
    shared: Arc<Shared>,
}

impl<T: Persistable> Worker<T> {
    fn run(mut self) -> Result<()> {
        loop {
            let txn = match self.intake.try_recv() {
                Ok(txn) => txn,
                Err(TryRecvError::Empty) => {
                    // Nothing queued: spend the time growing the directory.
                    if self.migrate() {
                        continue;
                    }
                    match self.intake.recv() {
                        Ok(txn) => txn,
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            if self.shared.draining.load(Ordering::SeqCst) {
                txn.complete(Err(Error::ShuttingDown));
                self.shared.metrics.record_aborted();
            } else {
                self.process(&txn);
                self.migrate();
            }
            self.finish(txn);
        }

        self.close()
    }

    fn process(&mut self, txn: &Transaction<T>) {
        let result = guarded("transaction", || self.apply(txn));
        match &result {
            Ok(_) => {}
            Err(e) if e.is_caller_error() => {
                tracing::debug!(key = txn.key(), kind = ?txn.kind(), error = %e, "Transaction failed");
            }
            Err(e) => {
                tracing::error!(key = txn.key(), kind = ?txn.kind(), error = %e, "Transaction failed");
            }
        }
        self.shared.metrics.record_applied(result.is_ok());
        self.shared
            .metrics
            .record_storage(self.blocks.stats(), self.directory.stats());
        txn.complete(result);
    }

    fn finish(&mut self, txn: Arc<Transaction<T>>) {
        if txn.has_callback() {
            if self.dispatch.send(txn).is_ok() {
                return;
            }
            tracing::error!("Dispatch thread is gone, dropping callback");
        }
        self.shared.finish_one();
    }

    /// Moves one directory row if a split is in progress.
    fn migrate(&mut self) -> bool {
        if !self.directory.is_split() {
            return false;
        }
        match self.directory.migrate_one() {
            Ok(moved) => {
                if moved {
                    self.shared.metrics.record_migration();
                    self.shared
                        .metrics
                        .record_storage(self.blocks.stats(), self.directory.stats());
                }
                moved
            }
            Err(e) => {
                tracing::error!(error = %e, "Directory migration failed");
                false
            }
        }
    }

    fn apply(&mut self, txn: &Transaction<T>) -> Result<Option<u64>> {
        let key = txn.key();
        match txn.kind() {
            Kind::Get => self.get(txn).map(|()| None),
            Kind::Put => self.put(txn).map(|()| None),
            Kind::Delete => {
                let address = self.directory.delete(key)?;
                if address != 0 {
                    self.blocks.free(address)?;
                }
                Ok(None)
            }
            Kind::Move => {
                let new_key = txn
                    .new_key()
                    .ok_or_else(|| Error::InvalidState("move without a destination".to_string()))?;
                self.move_key(key, new_key).map(|()| None)
            }
            Kind::PutLong => {
                if self.directory.put_long(key, txn.long_argument())? {
                    Ok(None)
                } else {
                    Err(Error::TypeMismatch(key.to_string()))
                }
            }
            Kind::GetLong => match self.directory.lookup(key)? {
                Some(Entry::Integer(value)) => Ok(Some(value)),
                Some(Entry::Address(_)) => Err(Error::TypeMismatch(key.to_string())),
                None => Err(Error::KeyNotFound),
            },
            Kind::Exists => match self.directory.lookup(key)? {
                Some(_) => Ok(None),
                None => Err(Error::KeyNotFound),
            },
        }
    }

    fn get(&mut self, txn: &Transaction<T>) -> Result<()> {
        let address = match self.directory.lookup(txn.key())? {
            Some(Entry::Address(address)) => address,
            Some(Entry::Integer(_)) => return Err(Error::TypeMismatch(txn.key().to_string())),
            None => return Err(Error::KeyNotFound),
        };

        let mut reader = self.blocks.open_read(address)?;
        txn.with_value(|value| match value {
            Some(receiver) => receiver.reconstruct(&mut reader),
            None => Err(Error::InvalidState("get without a receiver".to_string())),
        })
    }

    fn put(&mut self, txn: &Transaction<T>) -> Result<()> {
        let key = txn.key();
        let upsert = self
            .directory
            .upsert_address(key, self.blocks.next_address())?;

        if let Upsert::Inserted(expected) = upsert {
            let allocated = self.blocks.allocate();
            match allocated {
                Ok(address) if address == expected => {}
                Ok(address) => {
                    self.blocks.free(address)?;
                    self.directory.delete(key)?;
                    return Err(Error::InvalidState(format!(
                        "allocated block {} but indexed {}",
                        address, expected
                    )));
                }
                Err(e) => {
                    self.directory.delete(key)?;
                    return Err(e);
                }
            }
        }

        let address = upsert.address();
        let written = {
            let mut writer = self.blocks.open_write(address)?;
            txn.with_value(|value| match value {
                Some(value) => guarded("persist", || value.persist(&mut writer)),
                None => Err(Error::InvalidState("put without a value".to_string())),
            })
            .and_then(|()| writer.close())
        };

        match written {
            Ok(_) => Ok(()),
            Err(e) => {
                // The chain now holds a partial write under a stale length or
                // none at all. It must not stay reachable.
                self.directory.delete(key)?;
                self.blocks.free(address)?;
                tracing::warn!(key, error = %e, "Dropped key after failed write");
                Err(e)
            }
        }
    }

    fn move_key(&mut self, key: &str, new_key: &str) -> Result<()> {
        let address = match self.directory.lookup(key)? {
            Some(Entry::Address(address)) => address,
            Some(Entry::Integer(_)) => return Err(Error::TypeMismatch(key.to_string())),
            None => return Err(Error::KeyNotFound),
        };
        if key == new_key {
            return Ok(());
        }

        match self.directory.upsert_address(new_key, address)? {
            Upsert::Inserted(_) => {}
            Upsert::Existing(existing) if existing == address => {}
            Upsert::Existing(_) => return Err(Error::KeyExists(new_key.to_string())),
        }
        self.directory.delete(key)?;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        let directory = self.directory.sync();
        if let Err(e) = &directory {
            tracing::error!(error = %e, "Failed to sync hash directory");
        }
        let blocks = self.blocks.sync();
        if let Err(e) = &blocks {
            tracing::error!(error = %e, "Failed to sync block store");
        }
        tracing::info!(
            keys = self.directory.stats().len(),
            blocks = self.blocks.stats().block_count,
            "Transaction processor stopped"
        );
        directory.and(blocks)
    }
}
