use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

// header_size:4 + size:4 + capacity:4
pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub header_size: u32,
    /// Occupied rows
    pub size: u32,
    /// Total rows
    pub capacity: u32,
}

impl Header {
    pub fn new(capacity: u32) -> Self {
        Header {
            header_size: HEADER_SIZE as u32,
            size: 0,
            capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.header_size as usize != HEADER_SIZE || self.capacity == 0 {
            return Err(Error::InvalidHeader);
        }
        if self.size > self.capacity {
            return Err(Error::IndexCorruption(format!(
                "{} rows recorded in a table of {}",
                self.size, self.capacity
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        (&mut buf[0..4])
            .write_u32::<BigEndian>(self.header_size)
            .unwrap();
        (&mut buf[4..8]).write_u32::<BigEndian>(self.size).unwrap();
        (&mut buf[8..12])
            .write_u32::<BigEndian>(self.capacity)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header_size = (&buf[0..4])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("header_size", e))?;
        let size = (&buf[4..8])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("size", e))?;
        let capacity = (&buf[8..12])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("capacity", e))?;

        let header = Self {
            header_size,
            size,
            capacity,
        };
        header.validate()?;
        Ok(header)
    }
}
