//! On-disk hash directory mapping keys to block chains or plain integers.
//!
//! Keys are never stored. Each key is reduced to a 16-byte digest and placed by
//! linear probing into a fixed-capacity table kept in its own file. Growth is
//! incremental: when an insert would push the table past the load factor, the
//! table file is renamed to `.index.1` and a fresh table of twice the capacity
//! is created as `.index.2`. Rows then migrate from the old table to the new
//! one a few at a time (see [`HashDirectory::migrate_one`]) while lookups
//! consult the new table first and the old one second. Once the old table is
//! empty its file is removed.

pub mod digest;
pub mod generation;
pub mod header;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

use digest::{digest, Digest};
pub use generation::Entry;
use generation::{Generation, Probe, Row};

pub const OLD_FILE: &str = ".index.1";
pub const NEW_FILE: &str = ".index.2";

/// Outcome of [`HashDirectory::upsert_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The key already mapped to this chain; nothing was written.
    Existing(u64),
    /// A new row now maps the key to the given chain.
    Inserted(u64),
}

impl Upsert {
    pub fn address(&self) -> u64 {
        match *self {
            Upsert::Existing(address) | Upsert::Inserted(address) => address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryStats {
    pub split: bool,
    pub new_size: u32,
    pub new_capacity: u32,
    pub old_size: u32,
    pub old_capacity: u32,
}

impl DirectoryStats {
    /// Keys across both generations.
    pub fn len(&self) -> u64 {
        self.new_size as u64 + self.old_size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Which {
    New,
    Old,
}

#[derive(Debug)]
pub struct HashDirectory {
    dir: PathBuf,
    old: Option<Generation>,
    new: Generation,
    max_load_factor: f32,
    migrate_cursor: u32,
    sync_writes: bool,
}

impl HashDirectory {
    /// Opens the directory files in `dir`, creating an empty table of
    /// `initial_capacity` rows when none exist.
    pub fn open(dir: &Path, initial_capacity: u32, max_load_factor: f32) -> Result<Self> {
        let old_path = dir.join(OLD_FILE);
        let new_path = dir.join(NEW_FILE);

        let (old, new) = match (old_path.exists(), new_path.exists()) {
            (old_exists, true) => {
                let old = if old_exists {
                    Some(Generation::open(&old_path)?)
                } else {
                    None
                };
                (old, Generation::open(&new_path)?)
            }
            (true, false) => {
                // Interrupted between renaming the table and creating its
                // replacement.
                let old = Generation::open(&old_path)?;
                let capacity = double(old.capacity())?;
                tracing::warn!(
                    path = ?new_path,
                    capacity,
                    "Recreating missing directory generation"
                );
                (Some(old), Generation::create(&new_path, capacity)?)
            }
            (false, false) => (None, Generation::create(&new_path, initial_capacity)?),
        };

        let mut directory = Self {
            dir: dir.to_path_buf(),
            old,
            new,
            max_load_factor,
            migrate_cursor: 0,
            sync_writes: true,
        };
        if directory.old.as_ref().map_or(false, |old| old.size() == 0) {
            directory.retire_old()?;
        }

        let stats = directory.stats();
        tracing::debug!(
            dir = ?directory.dir,
            split = stats.split,
            keys = stats.len(),
            capacity = stats.new_capacity,
            "Opened hash directory"
        );

        Ok(directory)
    }

    /// Whether header updates are followed by `sync_data` (default: true).
    pub fn set_sync_writes(&mut self, enabled: bool) {
        self.sync_writes = enabled;
        self.new.set_sync_writes(enabled);
        if let Some(old) = self.old.as_mut() {
            old.set_sync_writes(enabled);
        }
    }

    pub fn is_split(&self) -> bool {
        self.old.is_some()
    }

    pub fn stats(&self) -> DirectoryStats {
        let (old_size, old_capacity) = self
            .old
            .as_ref()
            .map_or((0, 0), |old| (old.size(), old.capacity()));
        DirectoryStats {
            split: self.old.is_some(),
            new_size: self.new.size(),
            new_capacity: self.new.capacity(),
            old_size,
            old_capacity,
        }
    }

    fn generation(&mut self, which: Which) -> Result<&mut Generation> {
        match which {
            Which::New => Ok(&mut self.new),
            Which::Old => self
                .old
                .as_mut()
                .ok_or_else(|| Error::InvalidState("directory is not split".to_string())),
        }
    }

    fn find(&mut self, digest: &Digest) -> Result<Option<(Which, u32, Row)>> {
        if let Probe::Occupied(slot, row) = self.new.probe(digest)? {
            return Ok(Some((Which::New, slot, row)));
        }
        if let Some(old) = self.old.as_mut() {
            if let Probe::Occupied(slot, row) = old.probe(digest)? {
                return Ok(Some((Which::Old, slot, row)));
            }
        }
        Ok(None)
    }

    pub fn lookup(&mut self, key: &str) -> Result<Option<Entry>> {
        Ok(self.find(&digest(key))?.map(|(_, _, row)| row.entry))
    }

    /// Maps `key` to `address` unless it already names a chain, in which case
    /// that chain is returned untouched.
    pub fn upsert_address(&mut self, key: &str, address: u64) -> Result<Upsert> {
        let digest = digest(key);
        match self.find(&digest)? {
            Some((_, _, row)) => match row.entry {
                Entry::Address(existing) => Ok(Upsert::Existing(existing)),
                Entry::Integer(_) => Err(Error::TypeMismatch(key.to_string())),
            },
            None => {
                self.insert(Row {
                    digest,
                    entry: Entry::Address(address),
                })?;
                Ok(Upsert::Inserted(address))
            }
        }
    }

    /// Stores an integer under `key`. Returns false if the key names a chain.
    pub fn put_long(&mut self, key: &str, value: u64) -> Result<bool> {
        let digest = digest(key);
        let row = Row {
            digest,
            entry: Entry::Integer(value),
        };
        match self.find(&digest)? {
            Some((_, _, Row {
                entry: Entry::Address(_),
                ..
            })) => Ok(false),
            Some((which, slot, _)) => {
                self.generation(which)?.overwrite(slot, row)?;
                Ok(true)
            }
            None => {
                self.insert(row)?;
                Ok(true)
            }
        }
    }

    /// Removes `key`, returning the chain it named or 0.
    pub fn delete(&mut self, key: &str) -> Result<u64> {
        let digest = digest(key);
        let mut removed = 0;

        if let Probe::Occupied(slot, row) = self.new.probe(&digest)? {
            self.new.remove(slot)?;
            removed = address_of(row.entry);
        }
        // A crash mid-migration can leave the key in both tables.
        let mut drained = false;
        if let Some(old) = self.old.as_mut() {
            if let Probe::Occupied(slot, row) = old.probe(&digest)? {
                old.remove(slot)?;
                if removed == 0 {
                    removed = address_of(row.entry);
                }
                drained = old.size() == 0;
            }
        }
        if drained {
            self.retire_old()?;
        }

        Ok(removed)
    }

    fn insert(&mut self, row: Row) -> Result<()> {
        if self.is_split() {
            self.migrate_one()?;
        }

        let carried = self.old.as_ref().map_or(0, |old| old.size());
        if self.new.would_exceed(carried, self.max_load_factor) {
            if self.is_split() {
                tracing::debug!(
                    carried,
                    "Directory full before split finished, migrating remaining rows"
                );
                self.finish_split()?;
            }
            self.begin_split()?;
        }

        insert_into(&mut self.new, row)
    }

    /// Moves the current table aside and starts a table of twice its capacity.
    pub fn begin_split(&mut self) -> Result<()> {
        if self.is_split() {
            return Err(Error::InvalidState(
                "directory split already in progress".to_string(),
            ));
        }

        let capacity = double(self.new.capacity())?;
        let old_path = self.dir.join(OLD_FILE);
        let new_path = self.dir.join(NEW_FILE);

        self.new.sync()?;
        fs::rename(&new_path, &old_path)?;
        let mut fresh = Generation::create(&new_path, capacity)?;
        fresh.set_sync_writes(self.sync_writes);

        let old = std::mem::replace(&mut self.new, fresh).renamed(old_path);
        tracing::info!(
            keys = old.size(),
            old_capacity = old.capacity(),
            new_capacity = capacity,
            "Began directory split"
        );
        self.old = Some(old);
        self.migrate_cursor = 0;
        Ok(())
    }

    /// Moves one row from the old table into the new one. Returns false when
    /// there was nothing left to move.
    pub fn migrate_one(&mut self) -> Result<bool> {
        let old = match self.old.as_mut() {
            Some(old) => old,
            None => return Ok(false),
        };

        let (slot, row) = match old.next_occupied(self.migrate_cursor)? {
            Some(found) => found,
            None => {
                self.retire_old()?;
                return Ok(false);
            }
        };

        // The row may already be in the new table if a previous migration
        // was interrupted before removing it here.
        if let Probe::Vacant(target) = self.new.probe(&row.digest)? {
            self.new.insert(target, row)?;
        }
        old.remove(slot)?;
        self.migrate_cursor = slot;

        tracing::trace!(slot, remaining = old.size(), "Migrated directory row");

        if old.size() == 0 {
            self.retire_old()?;
        }
        Ok(true)
    }

    /// Migrates every remaining row of the old table.
    pub fn finish_split(&mut self) -> Result<()> {
        while self.migrate_one()? {}
        Ok(())
    }

    fn retire_old(&mut self) -> Result<()> {
        let old = match self.old.take() {
            Some(old) => old,
            None => return Ok(()),
        };
        self.new.sync()?;

        let path = old.path().to_path_buf();
        drop(old);
        fs::remove_file(&path)?;
        self.migrate_cursor = 0;

        tracing::info!(
            keys = self.new.size(),
            capacity = self.new.capacity(),
            "Finished directory split"
        );
        Ok(())
    }

    /// Calls `f` with every chain address held by either table.
    pub fn for_each_address<F: FnMut(u64)>(&mut self, mut f: F) -> Result<()> {
        for row in self.new.rows()? {
            if let Entry::Address(address) = row.entry {
                f(address);
            }
        }
        if let Some(old) = self.old.as_mut() {
            for row in old.rows()? {
                if let Entry::Address(address) = row.entry {
                    f(address);
                }
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.new.sync()?;
        if let Some(old) = self.old.as_mut() {
            old.sync()?;
        }
        Ok(())
    }
}

fn insert_into(generation: &mut Generation, row: Row) -> Result<()> {
    match generation.probe(&row.digest)? {
        Probe::Vacant(slot) => generation.insert(slot, row),
        Probe::Occupied(slot, _) => generation.overwrite(slot, row),
    }
}

fn address_of(entry: Entry) -> u64 {
    match entry {
        Entry::Address(address) => address,
        Entry::Integer(_) => 0,
    }
}

fn double(capacity: u32) -> Result<u32> {
    capacity
        .checked_mul(2)
        .ok_or_else(|| Error::InvalidState(format!("cannot grow directory past {}", capacity)))
}
