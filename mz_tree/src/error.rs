//! Error type shared by every storage and tree operation

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The metadata file carries a foreign application id, or is some other sqlite database
    #[error("file is not an mzTree file")]
    NotThisFormat,

    #[error("unsupported mzTree file version: {0}")]
    UnsupportedVersion(i32),

    #[error("point {id} is out of range, store holds {count} points")]
    OutOfRange { id: u64, count: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A copy would overwrite an existing file
    #[error("{0:?} already exists")]
    AlreadyExists(std::path::PathBuf),

    /// An undo or redo inverse failed, the command stays in its log
    #[error("command could not be reverted: {0}")]
    InconsistentCommand(Box<Error>),

    #[error("could not parse line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("tree has not been built or opened")]
    NotReady,

    #[error("could not detect m/z resolution near {0}")]
    NoResolution(f64),
}

pub type Result<T> = std::result::Result<T, Error>;
