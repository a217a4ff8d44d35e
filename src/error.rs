use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, SmuxError>`.
pub type Result<T> = std::result::Result<T, SmuxError>;

/// Error types for the smux library.
///
/// The codec itself never fails: partial progress is reported through return
/// counts, and the only errors it can surface are the ones its I/O callbacks
/// hand it. Everything else originates in configuration or in the runtime's
/// dealings with the kernel.
#[derive(Debug, Error)]
pub enum SmuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("master link read failed: {0}")]
    MasterRead(#[source] io::Error),

    #[error("master link write failed: {0}")]
    MasterWrite(#[source] io::Error),
}

impl SmuxError {
    /// True when the failure takes the whole runtime down rather than a
    /// single channel.
    pub fn is_fatal(&self) -> bool {
        match self {
            SmuxError::Config(_) | SmuxError::MasterRead(_) | SmuxError::MasterWrite(_) => true,
            SmuxError::Io(_) => false,
        }
    }
}

impl From<nix::errno::Errno> for SmuxError {
    fn from(err: nix::errno::Errno) -> Self {
        SmuxError::Io(io::Error::from_raw_os_error(err as i32))
    }
}
