use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use crate::error::Result;
use crate::Error;

/// A value that can write itself into a block chain and rebuild itself from
/// one.
///
/// `reconstruct` fills in an existing value so that callers can hand the store
/// a receiver of the right type. Any serde type gets an implementation through
/// bincode; types that need their own layout can implement the trait directly.
pub trait Persistable {
    fn persist(&self, writer: &mut dyn Write) -> Result<()>;

    fn reconstruct(&mut self, reader: &mut dyn Read) -> Result<()>;
}

impl<T> Persistable for T
where
    T: Serialize + DeserializeOwned,
{
    fn persist(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(writer, self).map_err(from_bincode)
    }

    fn reconstruct(&mut self, reader: &mut dyn Read) -> Result<()> {
        *self = bincode::deserialize_from(reader).map_err(from_bincode)?;
        Ok(())
    }
}

fn from_bincode(err: bincode::Error) -> Error {
    match *err {
        bincode::ErrorKind::Io(e) => Error::IoError(e),
        other => Error::Serialization(other.to_string()),
    }
}
