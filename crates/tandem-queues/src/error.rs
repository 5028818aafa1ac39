use std::path::PathBuf;

use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("couldn't create parent directory for {0}")]
    CreateDir(PathBuf, #[source] std::io::Error),
    #[error("shared memory mapping failed")]
    Shmem(#[from] ShmemError),
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SanityCheckError {
    #[error("stored frame acks a sequence newer than our own MyAck")]
    AckTooNew,
    #[error("stored frames don't pack exactly up to write_idx")]
    Misaligned,
}
