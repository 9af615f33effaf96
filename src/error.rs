use thiserror::Error;

#[derive(Error, Debug)]
pub enum SalvageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("Invalid MBR: {0}")]
    InvalidMbr(String),

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("FAT unreadable: {0}")]
    FatUnreadable(String),

    #[error("Invalid cluster index: {0}")]
    InvalidCluster(u32),

    #[error("Cluster {cluster} is already allocated")]
    RestoreConflict { cluster: u32 },

    #[error("Directory entry {index} is not marked deleted")]
    NotDeleted { index: usize },

    #[error("Directory entry {index} does not exist")]
    NoSuchEntry { index: usize },

    #[error("No contiguous free run of {needed} clusters")]
    NoFreeRun { needed: u32 },
}
