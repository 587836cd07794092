use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::digest::{home_slot, Digest, DIGEST_SIZE};
use super::header::{Header, HEADER_SIZE};
use crate::error::Result;
use crate::Error;

// digest:16 + tag:1 + payload:8
pub const ROW_SIZE: usize = 25;

const TAG_EMPTY: u8 = 0;
const TAG_ADDRESS: u8 = 1;
const TAG_INTEGER: u8 = 2;

/// Value held by an occupied row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Start of a block chain
    Address(u64),
    /// Integer stored directly in the row
    Integer(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub digest: Digest,
    pub entry: Entry,
}

impl Row {
    fn encode(&self) -> [u8; ROW_SIZE] {
        let mut buf = [0u8; ROW_SIZE];
        buf[..DIGEST_SIZE].copy_from_slice(&self.digest);
        let (tag, payload) = match self.entry {
            Entry::Address(address) => (TAG_ADDRESS, address),
            Entry::Integer(value) => (TAG_INTEGER, value),
        };
        buf[DIGEST_SIZE] = tag;
        buf[DIGEST_SIZE + 1..].copy_from_slice(&payload.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&buf[DIGEST_SIZE + 1..]);
        let payload = u64::from_be_bytes(payload);

        let entry = match buf[DIGEST_SIZE] {
            TAG_EMPTY => return Ok(None),
            TAG_ADDRESS => Entry::Address(payload),
            TAG_INTEGER => Entry::Integer(payload),
            tag => {
                return Err(Error::IndexCorruption(format!(
                    "unknown row tag {}",
                    tag
                )))
            }
        };

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&buf[..DIGEST_SIZE]);
        Ok(Some(Row { digest, entry }))
    }
}

/// Result of probing for a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The digest lives in this slot
    Occupied(u32, Row),
    /// The digest is absent; this is where it would go
    Vacant(u32),
}

/// One open-addressing table stored in its own file.
pub struct Generation {
    file: File,
    path: PathBuf,
    header: Header,
    sync_writes: bool,
    data_syncs: u64,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("path", &self.path)
            .field("size", &self.header.size)
            .field("capacity", &self.header.capacity)
            .finish()
    }
}

impl Generation {
    /// Creates an empty table, replacing whatever was at `path`.
    pub fn create(path: &Path, capacity: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(Self::file_len(capacity))?;

        let mut generation = Self {
            file,
            path: path.to_path_buf(),
            header: Header::new(capacity),
            sync_writes: true,
            data_syncs: 0,
        };
        generation.persist_header()?;
        Ok(generation)
    }

    /// Opens an existing table.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)
            .map_err(|e| Error::Decode("index header", e))?;
        let header = Header::decode(&buf)?;

        let expected = Self::file_len(header.capacity);
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(Error::IndexCorruption(format!(
                "{:?} holds {} bytes, expected {}",
                path, actual, expected
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            sync_writes: true,
            data_syncs: 0,
        })
    }

    fn file_len(capacity: u32) -> u64 {
        HEADER_SIZE as u64 + capacity as u64 * ROW_SIZE as u64
    }

    pub fn set_sync_writes(&mut self, enabled: bool) {
        self.sync_writes = enabled;
    }

    /// `sync_data` calls issued since open.
    pub fn data_syncs(&self) -> u64 {
        self.data_syncs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that the underlying file was renamed.
    pub fn renamed(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn size(&self) -> u32 {
        self.header.size
    }

    pub fn capacity(&self) -> u32 {
        self.header.capacity
    }

    /// Whether one more row, on top of `carried` rows still waiting to move in,
    /// would push the table past `max_load_factor`.
    pub fn would_exceed(&self, carried: u32, max_load_factor: f32) -> bool {
        let rows = self.header.size as f32 + carried as f32 + 1.0;
        rows / self.header.capacity as f32 > max_load_factor
    }

    fn persist_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&self.header.encode())
            .map_err(|e| Error::Encode("index header", e))?;
        self.sync_data()
    }

    fn sync_data(&mut self) -> Result<()> {
        if self.sync_writes {
            self.file.sync_data()?;
            self.data_syncs += 1;
        }
        Ok(())
    }

    fn row_offset(slot: u32) -> u64 {
        HEADER_SIZE as u64 + slot as u64 * ROW_SIZE as u64
    }

    pub fn read_row(&mut self, slot: u32) -> Result<Option<Row>> {
        let mut buf = [0u8; ROW_SIZE];
        self.file.seek(SeekFrom::Start(Self::row_offset(slot)))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| Error::Decode("index row", e))?;
        Row::decode(&buf)
    }

    fn write_row(&mut self, slot: u32, row: &Row) -> Result<()> {
        self.file.seek(SeekFrom::Start(Self::row_offset(slot)))?;
        self.file
            .write_all(&row.encode())
            .map_err(|e| Error::Encode("index row", e))?;
        Ok(())
    }

    fn clear_row(&mut self, slot: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(Self::row_offset(slot)))?;
        self.file
            .write_all(&[0u8; ROW_SIZE])
            .map_err(|e| Error::Encode("index row", e))?;
        Ok(())
    }

    /// Linear probe from the digest's home slot, wrapping at the end of the
    /// table. Stops at the first empty row or the first matching digest.
    pub fn probe(&mut self, digest: &Digest) -> Result<Probe> {
        let capacity = self.header.capacity;
        let home = home_slot(digest, capacity);
        for step in 0..capacity {
            let slot = (home + step) % capacity;
            match self.read_row(slot)? {
                None => return Ok(Probe::Vacant(slot)),
                Some(row) if row.digest == *digest => return Ok(Probe::Occupied(slot, row)),
                Some(_) => {}
            }
        }
        Err(Error::IndexCorruption(format!(
            "{:?} has no free row",
            self.path
        )))
    }

    /// Fills a vacant slot returned by [`probe`](Self::probe).
    pub fn insert(&mut self, slot: u32, row: Row) -> Result<()> {
        self.write_row(slot, &row)?;
        self.header.size += 1;
        self.persist_header()
    }

    /// Replaces the entry of an occupied slot without changing the size.
    pub fn overwrite(&mut self, slot: u32, row: Row) -> Result<()> {
        self.write_row(slot, &row)?;
        self.sync_data()
    }

    /// Empties `slot`, shifting later members of its probe cluster back so
    /// that none of them becomes unreachable.
    pub fn remove(&mut self, slot: u32) -> Result<()> {
        let capacity = self.header.capacity;
        let mut hole = slot;
        let mut next = slot;
        for _ in 1..capacity {
            next = (next + 1) % capacity;
            let row = match self.read_row(next)? {
                Some(row) => row,
                None => break,
            };
            let home = home_slot(&row.digest, capacity);
            if !cyclic_between(hole, home, next) {
                self.write_row(hole, &row)?;
                hole = next;
            }
        }
        self.clear_row(hole)?;
        self.header.size = self.header.size.saturating_sub(1);
        self.persist_header()
    }

    /// First occupied slot at or after `from`, wrapping around once.
    pub fn next_occupied(&mut self, from: u32) -> Result<Option<(u32, Row)>> {
        let capacity = self.header.capacity;
        for step in 0..capacity {
            let slot = (from % capacity + step) % capacity;
            if let Some(row) = self.read_row(slot)? {
                return Ok(Some((slot, row)));
            }
        }
        Ok(None)
    }

    /// Every occupied row in slot order.
    pub fn rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.header.size as usize);
        let mut buf = vec![0u8; self.header.capacity as usize * ROW_SIZE];
        self.file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| Error::Decode("index rows", e))?;
        for chunk in buf.chunks_exact(ROW_SIZE) {
            if let Some(row) = Row::decode(chunk)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Whether `slot` lies in the cyclic interval `(after, until]`.
fn cyclic_between(after: u32, slot: u32, until: u32) -> bool {
    if after <= until {
        after < slot && slot <= until
    } else {
        slot > after || slot <= until
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::digest::digest;
    use tempfile::NamedTempFile;

    fn temp_generation(capacity: u32) -> (NamedTempFile, Generation) {
        let file = NamedTempFile::new().expect("Failed to create temp file");
        let mut generation =
            Generation::create(file.path(), capacity).expect("Failed to create generation");
        generation.set_sync_writes(false);
        (file, generation)
    }

    /// Digest whose home slot in a table of `capacity` rows is `slot`.
    fn digest_with_home(slot: u32, capacity: u32, salt: u8) -> Digest {
        let mut d = [0u8; DIGEST_SIZE];
        d[0] = salt;
        let base = u128::from_be_bytes(d);
        let wanted = (slot as u128 + capacity as u128 - base % capacity as u128) % capacity as u128;
        (base + wanted).to_be_bytes()
    }

    fn insert(generation: &mut Generation, digest: Digest, entry: Entry) -> u32 {
        match generation.probe(&digest).unwrap() {
            Probe::Vacant(slot) => {
                generation.insert(slot, Row { digest, entry }).unwrap();
                slot
            }
            Probe::Occupied(..) => panic!("digest already present"),
        }
    }

    #[test]
    fn test_row_encoding_layout() {
        let row = Row {
            digest: [0xAB; DIGEST_SIZE],
            entry: Entry::Address(0x0102),
        };
        let encoded = row.encode();
        assert_eq!(&encoded[..16], &[0xAB; 16]);
        assert_eq!(encoded[16], TAG_ADDRESS);
        assert_eq!(&encoded[17..], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(Row::decode(&encoded).unwrap(), Some(row));
        assert_eq!(Row::decode(&[0u8; ROW_SIZE]).unwrap(), None);
    }

    #[test]
    fn test_overwrite_syncs() -> Result<()> {
        let (_file, mut generation) = temp_generation(8);
        generation.set_sync_writes(true);
        let d = digest("counter");
        insert(&mut generation, d, Entry::Integer(1));

        let before = generation.data_syncs();
        let slot = match generation.probe(&d)? {
            Probe::Occupied(slot, _) => slot,
            Probe::Vacant(_) => panic!("row missing"),
        };
        generation.overwrite(
            slot,
            Row {
                digest: d,
                entry: Entry::Integer(2),
            },
        )?;
        assert_eq!(generation.data_syncs(), before + 1);
        assert_eq!(generation.size(), 1);
        Ok(())
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let mut raw = [0u8; ROW_SIZE];
        raw[DIGEST_SIZE] = 9;
        assert!(matches!(Row::decode(&raw), Err(Error::IndexCorruption(_))));
    }

    #[test]
    fn test_probe_insert_and_find() {
        let (_file, mut generation) = temp_generation(16);
        let d = digest("foo1");
        let slot = insert(&mut generation, d, Entry::Integer(5));

        assert_eq!(
            generation.probe(&d).unwrap(),
            Probe::Occupied(
                slot,
                Row {
                    digest: d,
                    entry: Entry::Integer(5)
                }
            )
        );
        assert_eq!(generation.size(), 1);
    }

    #[test]
    fn test_collisions_probe_forward_and_wrap() {
        let (_file, mut generation) = temp_generation(4);
        let a = digest_with_home(3, 4, 1);
        let b = digest_with_home(3, 4, 2);

        assert_eq!(insert(&mut generation, a, Entry::Integer(1)), 3);
        // Slot 3 is the last row, so the collision wraps to slot 0.
        assert_eq!(insert(&mut generation, b, Entry::Integer(2)), 0);
        assert!(matches!(generation.probe(&b).unwrap(), Probe::Occupied(0, _)));
    }

    #[test]
    fn test_remove_keeps_cluster_reachable() {
        let (_file, mut generation) = temp_generation(8);
        let a = digest_with_home(2, 8, 1);
        let b = digest_with_home(2, 8, 2);
        let c = digest_with_home(3, 8, 3);

        insert(&mut generation, a, Entry::Integer(1)); // slot 2
        insert(&mut generation, b, Entry::Integer(2)); // slot 3
        insert(&mut generation, c, Entry::Integer(3)); // slot 4

        generation.remove(2).unwrap();
        assert_eq!(generation.size(), 2);

        // b shifts into its home slot, c follows into slot 3.
        assert!(matches!(generation.probe(&b).unwrap(), Probe::Occupied(2, _)));
        assert!(matches!(generation.probe(&c).unwrap(), Probe::Occupied(3, _)));
        assert_eq!(generation.probe(&a).unwrap(), Probe::Vacant(4));
    }

    #[test]
    fn test_remove_leaves_rows_at_home() {
        let (_file, mut generation) = temp_generation(8);
        let a = digest_with_home(1, 8, 1);
        let b = digest_with_home(2, 8, 2);

        insert(&mut generation, a, Entry::Integer(1));
        insert(&mut generation, b, Entry::Integer(2));
        generation.remove(1).unwrap();

        assert!(matches!(generation.probe(&b).unwrap(), Probe::Occupied(2, _)));
    }

    #[test]
    fn test_remove_across_wraparound() {
        let (_file, mut generation) = temp_generation(4);
        let a = digest_with_home(3, 4, 1);
        let b = digest_with_home(3, 4, 2);
        let c = digest_with_home(0, 4, 3);

        insert(&mut generation, a, Entry::Integer(1)); // slot 3
        insert(&mut generation, b, Entry::Integer(2)); // slot 0
        insert(&mut generation, c, Entry::Integer(3)); // slot 1

        generation.remove(3).unwrap();
        assert!(matches!(generation.probe(&b).unwrap(), Probe::Occupied(3, _)));
        assert!(matches!(generation.probe(&c).unwrap(), Probe::Occupied(0, _)));
    }

    #[test]
    fn test_reopen_restores_rows() {
        let file = NamedTempFile::new().expect("Failed to create temp file");
        let d = digest("persisted");
        {
            let mut generation = Generation::create(file.path(), 8).unwrap();
            insert(&mut generation, d, Entry::Address(24));
            generation.sync().unwrap();
        }

        let mut generation = Generation::open(file.path()).unwrap();
        assert_eq!(generation.size(), 1);
        assert_eq!(generation.capacity(), 8);
        assert_eq!(
            generation.rows().unwrap(),
            vec![Row {
                digest: d,
                entry: Entry::Address(24)
            }]
        );
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let file = NamedTempFile::new().expect("Failed to create temp file");
        {
            let generation = Generation::create(file.path(), 8).unwrap();
            drop(generation);
        }
        let handle = OpenOptions::new().write(true).open(file.path()).unwrap();
        handle.set_len(HEADER_SIZE as u64 + 3 * ROW_SIZE as u64).unwrap();

        assert!(matches!(
            Generation::open(file.path()),
            Err(Error::IndexCorruption(_))
        ));
    }

    #[test]
    fn test_next_occupied_wraps() {
        let (_file, mut generation) = temp_generation(8);
        let d = digest_with_home(1, 8, 7);
        insert(&mut generation, d, Entry::Integer(1));

        assert_eq!(generation.next_occupied(5).unwrap().map(|(s, _)| s), Some(1));
        generation.remove(1).unwrap();
        assert_eq!(generation.next_occupied(0).unwrap(), None);
    }

    #[test]
    fn test_would_exceed() {
        let (_file, mut generation) = temp_generation(10);
        for i in 0..6 {
            insert(&mut generation, digest(&i.to_string()), Entry::Integer(i));
        }
        assert!(!generation.would_exceed(0, 0.7));
        assert!(generation.would_exceed(1, 0.7));
        insert(&mut generation, digest("6"), Entry::Integer(6));
        assert!(generation.would_exceed(0, 0.7));
    }
}
