//! Transactions: one operation against the store plus the state needed to
//! report its outcome.
//!
//! A transaction is built by the caller, handed to the processor exactly once
//! and mutated only by the processor thread from then on. Completion is
//! signalled through a condition variable, so any number of threads may block
//! in [`Handle::wait`]. A callback bound with [`Transaction::on_complete`]
//! runs on the dispatch thread after the transaction is complete.

pub mod processor;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::Error;

pub use processor::TransactionProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Get,
    GetLong,
    Put,
    PutLong,
    Delete,
    Move,
    Exists,
}

type Callback<T> = Box<dyn FnOnce(&Transaction<T>) + Send>;

/// Locks `mutex` even if a panicking value or callback poisoned it.
fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Outcome {
    completed: bool,
    succeeded: bool,
    long: Option<u64>,
    error: Option<Error>,
}

pub struct Transaction<T> {
    kind: Kind,
    key: String,
    new_key: Option<String>,
    long: u64,
    /// Value to store for puts, receiver for gets
    value: Mutex<Option<T>>,
    outcome: Mutex<Outcome>,
    completed: Condvar,
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> fmt::Debug for Transaction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = lock(&self.outcome);
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("new_key", &self.new_key)
            .field("completed", &outcome.completed)
            .field("succeeded", &outcome.succeeded)
            .finish()
    }
}

impl<T> Transaction<T> {
    fn new(kind: Kind, key: &str) -> Self {
        Self {
            kind,
            key: key.to_string(),
            new_key: None,
            long: 0,
            value: Mutex::new(None),
            outcome: Mutex::new(Outcome::default()),
            completed: Condvar::new(),
            callback: Mutex::new(None),
        }
    }

    /// Reads `key` into `receiver`, which is handed back through
    /// [`Handle::take_value`].
    pub fn get(key: &str, receiver: T) -> Self {
        let txn = Self::new(Kind::Get, key);
        *lock(&txn.value) = Some(receiver);
        txn
    }

    pub fn put(key: &str, value: T) -> Self {
        let txn = Self::new(Kind::Put, key);
        *lock(&txn.value) = Some(value);
        txn
    }

    pub fn delete(key: &str) -> Self {
        Self::new(Kind::Delete, key)
    }

    /// Renames `key` to `new_key` without copying its value.
    pub fn move_key(key: &str, new_key: &str) -> Self {
        let mut txn = Self::new(Kind::Move, key);
        txn.new_key = Some(new_key.to_string());
        txn
    }

    pub fn get_long(key: &str) -> Self {
        Self::new(Kind::GetLong, key)
    }

    pub fn put_long(key: &str, value: u64) -> Self {
        let mut txn = Self::new(Kind::PutLong, key);
        txn.long = value;
        txn
    }

    pub fn exists(key: &str) -> Self {
        Self::new(Kind::Exists, key)
    }

    /// Binds a callback to run once the transaction completes. Binding happens
    /// before submission, so the callback can never be missed.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(&Transaction<T>) + Send + 'static,
    {
        *lock(&self.callback) = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn new_key(&self) -> Option<&str> {
        self.new_key.as_deref()
    }

    /// Integer argument of a `PutLong`.
    pub fn long_argument(&self) -> u64 {
        self.long
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.outcome).completed
    }

    pub fn succeeded(&self) -> bool {
        lock(&self.outcome).succeeded
    }

    /// Integer read by a successful `GetLong`.
    pub fn long_value(&self) -> Option<u64> {
        lock(&self.outcome).long
    }

    /// Why the transaction failed, if it did.
    pub fn error_message(&self) -> Option<String> {
        lock(&self.outcome).error.as_ref().map(|e| e.to_string())
    }

    /// Takes the failure detail, leaving `None` behind.
    pub fn take_error(&self) -> Option<Error> {
        lock(&self.outcome).error.take()
    }

    /// Takes the value back out: the reconstructed receiver of a `Get`, or the
    /// original value of a `Put`.
    pub fn take_value(&self) -> Option<T> {
        lock(&self.value).take()
    }

    /// Runs `f` against the value slot.
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        f(&mut lock(&self.value))
    }

    pub(crate) fn has_callback(&self) -> bool {
        lock(&self.callback).is_some()
    }

    pub(crate) fn take_callback(&self) -> Option<Callback<T>> {
        lock(&self.callback).take()
    }

    /// Blocks until the transaction completes and returns whether it
    /// succeeded.
    pub fn wait(&self) -> bool {
        let mut outcome = lock(&self.outcome);
        while !outcome.completed {
            outcome = self
                .completed
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
        outcome.succeeded
    }

    pub(crate) fn complete(&self, result: crate::Result<Option<u64>>) {
        let mut outcome = lock(&self.outcome);
        match result {
            Ok(long) => {
                outcome.succeeded = true;
                outcome.long = long;
            }
            Err(e) => {
                outcome.succeeded = false;
                outcome.error = Some(e);
            }
        }
        outcome.completed = true;
        self.completed.notify_all();
    }
}

/// Shared view of a submitted transaction.
pub struct Handle<T> {
    txn: Arc<Transaction<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            txn: Arc::clone(&self.txn),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.txn, f)
    }
}

impl<T> Handle<T> {
    pub(crate) fn new(txn: Arc<Transaction<T>>) -> Self {
        Self { txn }
    }
}

impl<T> std::ops::Deref for Handle<T> {
    type Target = Transaction<T>;

    fn deref(&self) -> &Transaction<T> {
        &self.txn
    }
}
