use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

// header_size:4 + block_size:4 + free_block:8 + block_count:8
pub const HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub header_size: u32,
    pub block_size: u32,
    /// First block of the free list, 0 when empty
    pub free_block: u64,
    /// Blocks ever appended to the file
    pub block_count: u64,
}

impl Header {
    pub fn new(block_size: u32) -> Self {
        Header {
            header_size: HEADER_SIZE as u32,
            block_size,
            free_block: 0,
            block_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.header_size as usize != HEADER_SIZE || self.block_size < 8 {
            return Err(Error::InvalidHeader);
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        (&mut buf[0..4])
            .write_u32::<BigEndian>(self.header_size)
            .unwrap();
        (&mut buf[4..8])
            .write_u32::<BigEndian>(self.block_size)
            .unwrap();
        (&mut buf[8..16])
            .write_u64::<BigEndian>(self.free_block)
            .unwrap();
        (&mut buf[16..24])
            .write_u64::<BigEndian>(self.block_count)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header_size = (&buf[0..4])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("header_size", e))?;
        let block_size = (&buf[4..8])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("block_size", e))?;
        let free_block = (&buf[8..16])
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("free_block", e))?;
        let block_count = (&buf[16..24])
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("block_count", e))?;

        let header = Self {
            header_size,
            block_size,
            free_block,
            block_count,
        };
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding_decoding() {
        let mut header = Header::new(100);
        header.free_block = 148;
        header.block_count = 7;

        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        // Header size is stored first, big-endian.
        assert_eq!(&encoded[0..4], &[0, 0, 0, 24]);

        let decoded = Header::decode(&encoded).expect("Failed to decode Header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_foreign_header_size() {
        let mut header = Header::new(100);
        header.header_size = 12;
        let result = Header::decode(&header.encode());
        assert!(matches!(result, Err(Error::InvalidHeader)));
    }
}
