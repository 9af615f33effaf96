//! In-place repair and undelete engine for FAT32 disk images.
//!
//! The engine works on a raw block image: it validates (and where damaged,
//! reconstructs) the partition table and boot sector, verifies and repairs
//! the file allocation table, and restores directory entries marked deleted
//! by writing back to the same image.

pub mod check;
pub mod error;
pub mod fat;
pub mod image;
pub mod layout;
pub mod partition;
pub mod undelete;
pub mod volume;

pub use error::SalvageError;
