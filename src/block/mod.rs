//! Fixed-size block allocator backing every stored value.
//!
//! The block file is a small header followed by equally sized records. Each
//! record is a payload region plus an 8-byte trailer pointing at the next block
//! of the same chain:
//!
//! ```text
//! +-----------------------------------------------------------+
//! | header_size:u32 | block_size:u32 | free:u64 | count:u64    |  24 bytes
//! +-----------------------------------------------------------+
//! | payload (block_size bytes)                 | next:u64     |  block 0
//! +-----------------------------------------------------------+
//! | payload (block_size bytes)                 | next:u64     |  block 1
//! +-----------------------------------------------------------+
//! | ...                                                       |
//! ```
//!
//! A trailer of 0 ends a chain. Address 0 falls inside the header, so it never
//! names a real block and doubles as the "no block" sentinel.
//!
//! Unused blocks are threaded onto a free list through the same trailers. The
//! allocator pops that list before growing the file, and freeing a chain splices
//! the whole chain onto the list with a single header update.
//!
//! # Crash behaviour
//!
//! There is no journal. Header and trailer updates are ordered so that a crash
//! can leave a block allocated but unlinked (a leak, reclaimable with
//! [`crate::recovery::sweep`]) but never makes a linked chain point at a block
//! that is also on the free list.

pub mod header;
pub mod lock;
pub mod stream;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

use header::{Header, HEADER_SIZE};
use lock::LockTable;
pub use stream::{BlockReader, BlockWriter};

pub const STORE_FILE: &str = ".store";

const TRAILER_SIZE: u64 = 8;

/// Point-in-time allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStats {
    pub block_size: u32,
    pub block_count: u64,
    pub free_blocks: u64,
}

impl BlockStats {
    /// Blocks currently reachable from some chain (or leaked).
    pub fn live_blocks(&self) -> u64 {
        self.block_count - self.free_blocks
    }
}

pub struct BlockStore {
    file: File,
    path: PathBuf,
    header: Header,
    free_blocks: u64,
    sync_writes: bool,
    data_syncs: u64,
    locks: Arc<LockTable>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

impl BlockStore {
    /// Creates a block file in `dir`, or restores the one already there.
    /// `block_size` only applies to a new file.
    pub fn open(dir: &Path, block_size: u32, lock_stripes: usize) -> Result<Self> {
        let path = dir.join(STORE_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let existing = file.metadata()?.len() > 0;
        let header = if existing {
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)
                .map_err(|e| Error::Decode("block header", e))?;
            Header::decode(&buf)?
        } else {
            let header = Header::new(block_size);
            header.validate()?;
            file.write_all(&header.encode())
                .map_err(|e| Error::Encode("block header", e))?;
            file.sync_all()?;
            header
        };

        let mut store = Self {
            file,
            path,
            header,
            free_blocks: 0,
            sync_writes: true,
            data_syncs: 0,
            locks: Arc::new(LockTable::new(lock_stripes)),
        };
        store.free_blocks = store.free_list()?.len() as u64;

        tracing::debug!(
            path = ?store.path,
            restored = existing,
            block_size = store.header.block_size,
            block_count = store.header.block_count,
            free_blocks = store.free_blocks,
            "Opened block store"
        );

        Ok(store)
    }

    /// Whether header updates and closed streams are followed by `sync_data`
    /// (default: true).
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

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn stats(&self) -> BlockStats {
        BlockStats {
            block_size: self.header.block_size,
            block_count: self.header.block_count,
            free_blocks: self.free_blocks,
        }
    }

    fn stride(&self) -> u64 {
        self.header.block_size as u64 + TRAILER_SIZE
    }

    fn end_address(&self) -> u64 {
        HEADER_SIZE as u64 + self.header.block_count * self.stride()
    }

    /// Index of the block at `address`, rejecting anything that is not the
    /// start of an existing block.
    pub(crate) fn block_index(&self, address: u64) -> Result<u64> {
        let base = HEADER_SIZE as u64;
        if address < base || (address - base) % self.stride() != 0 {
            return Err(Error::CorruptedChain(format!(
                "{} is not a block address",
                address
            )));
        }
        let index = (address - base) / self.stride();
        if index >= self.header.block_count {
            return Err(Error::CorruptedChain(format!(
                "block {} is past the end of the store",
                address
            )));
        }
        Ok(index)
    }

    pub(crate) fn address_of(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * self.stride()
    }

    fn persist_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&self.header.encode())
            .map_err(|e| Error::Encode("block header", e))?;
        self.sync_data()
    }

    fn sync_data(&mut self) -> Result<()> {
        if self.sync_writes {
            self.file.sync_data()?;
            self.data_syncs += 1;
        }
        Ok(())
    }

    pub(crate) fn read_trailer(&mut self, address: u64) -> Result<u64> {
        let stride = self.stride();
        self.block_index(address)?;
        self.file
            .seek(SeekFrom::Start(address + stride - TRAILER_SIZE))?;
        let next = self
            .file
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("block trailer", e))?;
        Ok(next)
    }

    fn write_trailer(&mut self, address: u64, next: u64) -> Result<()> {
        let stride = self.stride();
        self.file
            .seek(SeekFrom::Start(address + stride - TRAILER_SIZE))?;
        self.file
            .write_u64::<BigEndian>(next)
            .map_err(|e| Error::Encode("block trailer", e))?;
        Ok(())
    }

    /// Address the next call to [`allocate`](Self::allocate) will return.
    pub fn next_address(&self) -> u64 {
        if self.header.free_block != 0 {
            self.header.free_block
        } else {
            self.end_address()
        }
    }

    /// Hands out a block with an end-of-chain trailer, reusing a freed block
    /// when one is available.
    pub fn allocate(&mut self) -> Result<u64> {
        let address = if self.header.free_block == 0 {
            let address = self.end_address();
            self.file.set_len(address + self.stride())?;
            self.header.block_count += 1;
            address
        } else {
            let address = self.header.free_block;
            self.header.free_block = self.read_trailer(address)?;
            self.free_blocks -= 1;
            address
        };

        self.write_trailer(address, 0)?;
        self.persist_header()?;
        Ok(address)
    }

    /// Follows `current`'s trailer, extending the chain with a fresh block when
    /// it ends at `current`.
    pub fn next_block_address(&mut self, current: u64) -> Result<u64> {
        let next = self.read_trailer(current)?;
        if next != 0 {
            return Ok(next);
        }
        let next = self.allocate()?;
        self.write_trailer(current, next)?;
        Ok(next)
    }

    /// Frees every block after `chain_start`, leaving it a single-block chain.
    pub fn truncate(&mut self, chain_start: u64) -> Result<()> {
        let next = self.read_trailer(chain_start)?;
        if next == 0 {
            return Ok(());
        }
        self.write_trailer(chain_start, 0)?;
        self.free(next)
    }

    /// Returns a whole chain to the free list.
    pub fn free(&mut self, chain_start: u64) -> Result<()> {
        if chain_start == 0 {
            return Ok(());
        }
        let chain = self.chain(chain_start)?;
        let last = *chain.last().unwrap_or(&chain_start);

        let free_head = self.header.free_block;
        self.write_trailer(last, free_head)?;
        self.header.free_block = chain_start;
        self.free_blocks += chain.len() as u64;
        self.persist_header()
    }

    /// Pushes individual, unlinked blocks onto the free list.
    pub(crate) fn reclaim(&mut self, blocks: &[u64]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        for &address in blocks {
            self.block_index(address)?;
            let free_head = self.header.free_block;
            self.write_trailer(address, free_head)?;
            self.header.free_block = address;
        }
        self.free_blocks += blocks.len() as u64;
        self.persist_header()
    }

    /// Every block of the chain starting at `start`, in order.
    pub fn chain(&mut self, start: u64) -> Result<Vec<u64>> {
        self.walk(start)
    }

    /// Every block currently on the free list.
    pub fn free_list(&mut self) -> Result<Vec<u64>> {
        match self.header.free_block {
            0 => Ok(Vec::new()),
            head => self.walk(head),
        }
    }

    fn walk(&mut self, start: u64) -> Result<Vec<u64>> {
        let limit = self.header.block_count as usize;
        let mut blocks = Vec::new();
        let mut current = start;
        while current != 0 {
            if blocks.len() >= limit {
                return Err(Error::CorruptedChain(format!(
                    "chain at {} loops back on itself",
                    start
                )));
            }
            blocks.push(current);
            current = self.read_trailer(current)?;
        }
        Ok(blocks)
    }

    /// Opens a reader over the chain at `address`, holding its advisory lock.
    pub fn open_read(&mut self, address: u64) -> Result<BlockReader<'_>> {
        self.block_index(address)?;
        let guard = self.locks.lock(address);
        BlockReader::open(self, address, guard)
    }

    /// Opens a writer over the chain at `address`, holding its advisory lock.
    pub fn open_write(&mut self, address: u64) -> Result<BlockWriter<'_>> {
        self.block_index(address)?;
        let guard = self.locks.lock(address);
        Ok(BlockWriter::open(self, address, guard))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
