//! Filesystem adapters
//!
//! Everything the device thread does to a loaded medium's filesystem
//! goes through [`FsAdapter`]: mount, unmount, format, sync and space
//! accounting. Real deployments plug in LTFS/POSIX/RADOS adapters;
//! [`DirFs`] is the directory-backed reference implementation.

mod dir_fs;
pub use dir_fs::DirFs;

use std::path::Path;

use anyhow::Error;

use lrs_api_types::{AddressType, FsType, MediumId};

/// Space usage as reported by the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    /// Total capacity (bytes)
    pub total: u64,
    /// Used space (bytes)
    pub used: u64,
    /// Available space (bytes)
    pub avail: u64,
    /// The filesystem mounted read-only (near-full tapes do this)
    pub read_only: bool,
}

/// Interface to one filesystem implementation
pub trait FsAdapter: Send + Sync {
    fn fs_type(&self) -> FsType;

    fn addr_type(&self) -> AddressType;

    /// Mount the medium loaded in `device_path` under `mount_path`.
    fn mount(&self, device_path: &str, medium: &MediumId, mount_path: &Path)
        -> Result<(), Error>;

    fn umount(&self, mount_path: &Path) -> Result<(), Error>;

    /// Create a fresh, empty filesystem labelled `label` on the
    /// medium loaded in `device_path`.
    fn format(&self, device_path: &str, medium: &MediumId, label: &str) -> Result<(), Error>;

    /// Flush all pending writes to the medium.
    fn sync(&self, mount_path: &Path) -> Result<(), Error>;

    /// Space usage of the mounted filesystem.
    fn df(&self, mount_path: &Path) -> Result<FsUsage, Error>;
}
