use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protobuf encode error: {0}")]
    PbEncode(#[from] prost::EncodeError),

    #[error("Protobuf decode error: {0}")]
    PbDecode(#[from] prost::DecodeError),

    #[error("Page server setup failed: {0}")]
    Config(String),

    #[error("Page server protocol error: {0}")]
    Protocol(String),

    #[error("{what}: moved {moved} of {expected} bytes")]
    Relay {
        what: &'static str,
        expected: usize,
        moved: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("{0} not implemented")]
    Unsupported(&'static str),

    #[error("Image {}: {source}", path.display())]
    BackingStore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("Range 0x{addr:x} lies below offset 0x{off:x}")]
    BadRange { addr: u64, off: u64 },
}

impl XferError {
    pub fn backing_store(path: impl Into<PathBuf>, source: io::Error) -> Self {
        XferError::BackingStore {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, XferError>;
