use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    CorruptedChain(String),
    IndexCorruption(String),
    TypeMismatch(String),
    KeyNotFound,
    KeyExists(String),
    ShuttingDown,
    LockError(io::Error),
    InvalidState(String),
    Serialization(String),
}

impl Error {
    /// True for failures that reflect caller input rather than storage trouble.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound
                | Error::KeyExists(_)
                | Error::TypeMismatch(_)
                | Error::ShuttingDown
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::CorruptedChain(msg) => write!(f, "Corrupted block chain: {}", msg),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::TypeMismatch(key) => write!(f, "Type mismatch for key {:?}", key),
            Error::KeyNotFound => write!(f, "Key not found"),
            Error::KeyExists(key) => write!(f, "Key {:?} already holds another value", key),
            Error::ShuttingDown => write!(f, "Store is shutting down"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err)
            | Error::Decode(_, err)
            | Error::Encode(_, err)
            | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(Error::KeyNotFound.is_caller_error());
        assert!(Error::TypeMismatch("x".to_string()).is_caller_error());
        assert!(!Error::IoError(io::Error::new(io::ErrorKind::Other, "disk")).is_caller_error());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::Decode(
            "block_size",
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        );
        assert_eq!(err.to_string(), "Failed to decode block_size: eof");
    }
}
