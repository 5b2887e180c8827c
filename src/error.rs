use std::io;
use thiserror::Error;

/// Errors produced by the parallel gzip writer and reader.
///
/// The first error observed by any pipeline component latches into the
/// session; later operations return a copy of it without touching the
/// sink or source again. `reset` clears the latch.
#[derive(Error, Debug)]
pub enum PargzError {
    #[error("invalid compression level: {0}")]
    InvalidLevel(i32),

    #[error("invalid concurrency setting: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid gzip header: {0}")]
    InvalidHeader(String),

    #[error("invalid gzip checksum")]
    InvalidChecksum,

    #[error("sink write error: {0}")]
    SinkWrite(#[source] io::Error),

    #[error("source read error: {0}")]
    SourceRead(#[source] io::Error),

    #[error("deflate error: {0}")]
    Deflate(String),

    #[error("inflate error: {0}")]
    Inflate(String),
}

pub type PargzResult<T> = Result<T, PargzError>;

// The latched error is handed back from every subsequent operation, so
// the enum must be clonable. `io::Error` is not `Clone`; re-materialize
// it from kind and message.
impl Clone for PargzError {
    fn clone(&self) -> Self {
        match self {
            PargzError::InvalidLevel(l) => PargzError::InvalidLevel(*l),
            PargzError::InvalidConfig(s) => PargzError::InvalidConfig(s.clone()),
            PargzError::InvalidState(s) => PargzError::InvalidState(s),
            PargzError::InvalidHeader(s) => PargzError::InvalidHeader(s.clone()),
            PargzError::InvalidChecksum => PargzError::InvalidChecksum,
            PargzError::SinkWrite(e) => {
                PargzError::SinkWrite(io::Error::new(e.kind(), e.to_string()))
            }
            PargzError::SourceRead(e) => {
                PargzError::SourceRead(io::Error::new(e.kind(), e.to_string()))
            }
            PargzError::Deflate(s) => PargzError::Deflate(s.clone()),
            PargzError::Inflate(s) => PargzError::Inflate(s.clone()),
        }
    }
}

impl From<PargzError> for io::Error {
    fn from(e: PargzError) -> io::Error {
        match e {
            PargzError::SinkWrite(e) | PargzError::SourceRead(e) => e,
            PargzError::InvalidChecksum | PargzError::InvalidHeader(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_io_kind() {
        let err = PargzError::SinkWrite(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        match err.clone() {
            PargzError::SinkWrite(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn header_errors_map_to_invalid_data() {
        let err: io::Error = PargzError::InvalidChecksum.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
