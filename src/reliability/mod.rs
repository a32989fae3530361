pub mod disk;
pub mod permissions;

pub use disk::{DIRECTORY_PREFIX, DiskConfig, DiskError, DiskOverflowStore, FILE_SUFFIX};
pub use permissions::{FilePermissions, PermissionError};
