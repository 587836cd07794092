use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::lock::BlockGuard;
use super::BlockStore;
use crate::error::Result;
use crate::Error;

/// Bytes at the start of every chain holding the logical stream length.
pub const LENGTH_PREFIX: u32 = 4;

fn to_io(err: Error) -> io::Error {
    match err {
        Error::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Sequential reader over one chain, clipped to the length recorded in its
/// first four bytes.
pub struct BlockReader<'a> {
    store: &'a mut BlockStore,
    current: u64,
    offset: u32,
    remaining: u64,
    _guard: BlockGuard,
}

impl<'a> BlockReader<'a> {
    pub(super) fn open(store: &'a mut BlockStore, start: u64, guard: BlockGuard) -> Result<Self> {
        store.file.seek(SeekFrom::Start(start))?;
        let length = store
            .file
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("stream length", e))?;

        Ok(Self {
            store,
            current: start,
            offset: LENGTH_PREFIX,
            remaining: length as u64,
            _guard: guard,
        })
    }

    /// Logical bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let block_size = self.store.block_size();
        if self.offset == block_size {
            let next = self.store.read_trailer(self.current).map_err(to_io)?;
            if next == 0 {
                return Err(to_io(Error::CorruptedChain(format!(
                    "chain ends {} bytes before its recorded length",
                    self.remaining
                ))));
            }
            self.current = next;
            self.offset = 0;
        }

        let n = buf
            .len()
            .min((block_size - self.offset) as usize)
            .min(self.remaining as usize);

        let file = &mut self.store.file;
        file.seek(SeekFrom::Start(self.current + self.offset as u64))?;
        file.read_exact(&mut buf[..n])?;

        self.offset += n as u32;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Sequential writer over one chain.
///
/// Bytes are staged per block and written out when the block fills. Existing
/// successor blocks are reused before new ones are allocated, so overwriting a
/// value rewrites its chain in place. The length prefix is only updated by
/// [`close`](Self::close); a writer dropped without closing leaves the previous
/// length in place.
pub struct BlockWriter<'a> {
    store: &'a mut BlockStore,
    start: u64,
    current: u64,
    /// Bytes of the current block's payload already claimed
    fill: u32,
    /// Staged bytes ending at `fill`
    pending: Vec<u8>,
    written: u64,
    _guard: BlockGuard,
}

impl<'a> BlockWriter<'a> {
    pub(super) fn open(store: &'a mut BlockStore, start: u64, guard: BlockGuard) -> Self {
        let block_size = store.block_size() as usize;
        Self {
            store,
            start,
            current: start,
            fill: LENGTH_PREFIX,
            pending: Vec::with_capacity(block_size),
            written: 0,
            _guard: guard,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offset = (self.fill as usize - self.pending.len()) as u64;
        let file = &mut self.store.file;
        file.seek(SeekFrom::Start(self.current + offset))?;
        file.write_all(&self.pending)
            .map_err(|e| Error::Encode("block payload", e))?;
        self.pending.clear();
        Ok(())
    }

    /// Flushes staged bytes, frees whatever remained of the previous chain past
    /// the last block written, and records the final length. The value is on
    /// disk once this returns when the store syncs writes.
    pub fn close(mut self) -> Result<u64> {
        self.write_pending()?;
        self.store.truncate(self.current)?;

        let length = self.written as u32;
        let file = &mut self.store.file;
        file.seek(SeekFrom::Start(self.start))?;
        file.write_u32::<BigEndian>(length)
            .map_err(|e| Error::Encode("stream length", e))?;
        self.store.sync_data()?;
        Ok(self.written)
    }
}

impl Write for BlockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > u32::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "value exceeds the 4 GiB stream limit",
            ));
        }

        let block_size = self.store.block_size();
        let mut consumed = 0;
        while consumed < buf.len() {
            if self.fill == block_size {
                self.write_pending().map_err(to_io)?;
                self.current = self
                    .store
                    .next_block_address(self.current)
                    .map_err(to_io)?;
                self.fill = 0;
            }

            let n = (buf.len() - consumed).min((block_size - self.fill) as usize);
            self.pending.extend_from_slice(&buf[consumed..consumed + n]);
            self.fill += n as u32;
            consumed += n;
        }

        self.written += consumed as u64;
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_pending().map_err(to_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_store(dir: &TempDir, block_size: u32) -> BlockStore {
        let mut store = BlockStore::open(dir.path(), block_size, 4).expect("Failed to open store");
        store.set_sync_writes(false);
        store
    }

    fn write_value(store: &mut BlockStore, start: u64, value: &[u8]) -> Result<u64> {
        let mut writer = store.open_write(start)?;
        writer.write_all(value)?;
        writer.close()
    }

    fn read_value(store: &mut BlockStore, start: u64) -> Result<Vec<u8>> {
        let mut reader = store.open_read(start)?;
        let mut value = Vec::new();
        reader.read_to_end(&mut value)?;
        Ok(value)
    }

    #[test]
    fn test_round_trip_within_one_block() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 32);

        let start = store.allocate()?;
        assert_eq!(write_value(&mut store, start, b"hello")?, 5);
        assert_eq!(read_value(&mut store, start)?, b"hello");
        assert_eq!(store.chain(start)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_round_trip_across_blocks() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let value: Vec<u8> = (0..200u8).collect();
        let start = store.allocate()?;
        write_value(&mut store, start, &value)?;

        // 4 length bytes + 200 payload bytes over 16-byte blocks.
        assert_eq!(store.chain(start)?.len(), 13);
        assert_eq!(read_value(&mut store, start)?, value);
        Ok(())
    }

    #[test]
    fn test_exact_fit_does_not_allocate_extra_block() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, &[7u8; 28])?;
        assert_eq!(store.chain(start)?.len(), 2);
        assert_eq!(read_value(&mut store, start)?, vec![7u8; 28]);
        Ok(())
    }

    #[test]
    fn test_many_small_writes() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        {
            let mut writer = store.open_write(start)?;
            for i in 0..100u8 {
                writer.write_all(&[i])?;
            }
            assert_eq!(writer.written(), 100);
            writer.close()?;
        }

        let expected: Vec<u8> = (0..100u8).collect();
        assert_eq!(read_value(&mut store, start)?, expected);
        Ok(())
    }

    #[test]
    fn test_overwrite_shorter_truncates_chain() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, &[1u8; 100])?;
        let long_chain = store.chain(start)?.len() as u64;
        let live_before = store.stats().live_blocks();

        write_value(&mut store, start, b"short")?;
        assert_eq!(store.chain(start)?, vec![start]);
        assert_eq!(store.stats().free_blocks, long_chain - 1);
        assert!(store.stats().live_blocks() <= live_before);
        assert_eq!(read_value(&mut store, start)?, b"short");
        Ok(())
    }

    #[test]
    fn test_overwrite_longer_reuses_and_extends() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, &[1u8; 20])?;
        let first_chain = store.chain(start)?;

        write_value(&mut store, start, &[2u8; 60])?;
        let second_chain = store.chain(start)?;
        assert_eq!(&second_chain[..first_chain.len()], &first_chain[..]);
        assert_eq!(read_value(&mut store, start)?, vec![2u8; 60]);
        Ok(())
    }

    #[test]
    fn test_reader_ignores_stale_tail() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, &[9u8; 50])?;

        // Rewrite only the length prefix, as if a shorter write had not yet
        // released the tail.
        store.file.seek(SeekFrom::Start(start))?;
        store.file.write_u32::<BigEndian>(3)?;

        let value = read_value(&mut store, start)?;
        assert_eq!(value, vec![9u8; 3]);
        assert!(store.chain(start)?.len() > 1);
        Ok(())
    }

    #[test]
    fn test_reader_detects_short_chain() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, b"abc")?;
        store.file.seek(SeekFrom::Start(start))?;
        store.file.write_u32::<BigEndian>(40)?;

        let mut reader = store.open_read(start)?;
        let mut value = Vec::new();
        let err = reader.read_to_end(&mut value).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        Ok(())
    }

    #[test]
    fn test_empty_value() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = open_store(&dir, 16);

        let start = store.allocate()?;
        write_value(&mut store, start, &[])?;
        let reader = store.open_read(start)?;
        assert_eq!(reader.remaining(), 0);
        Ok(())
    }

    #[test]
    fn test_close_syncs_in_place_overwrite() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = BlockStore::open(dir.path(), 16, 4)?;

        let start = store.allocate()?;
        write_value(&mut store, start, b"first")?;

        // A one-block overwrite touches no header, so only close syncs.
        let before = store.data_syncs();
        write_value(&mut store, start, b"second")?;
        assert_eq!(store.data_syncs(), before + 1);
        assert_eq!(read_value(&mut store, start)?, b"second");

        store.set_sync_writes(false);
        write_value(&mut store, start, b"third")?;
        assert_eq!(store.data_syncs(), before + 1);
        Ok(())
    }
}
