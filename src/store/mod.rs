//! Persistent metadata store interface
//!
//! The store is the authoritative cross-process serialisation point:
//! it owns the device and media tables, the lock table, and the audit
//! log. The scheduler core only ever talks to it through the
//! [`MetaStore`] trait; [`LocalStore`] is the file-backed reference
//! implementation.

mod local;
pub use local::LocalStore;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use lrs_api_types::{DeviceEntry, DeviceId, Medium, MediumId, ResourceFamily};

/// Audited library/filesystem actions
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LibraryScan,
    LibraryOpen,
    DeviceLookup,
    MediumLookup,
    DeviceLoad,
    DeviceUnload,
    LtfsMount,
    LtfsUmount,
    LtfsFormat,
    LtfsDf,
    LtfsSync,
}

serde_plain::derive_display_from_serialize!(AuditAction);

/// Lock owner prefix shared by everything this scheduler process
/// locks; per-resource owners append to it.
pub fn process_lock_owner() -> String {
    format!("lrs.{}", std::process::id())
}

/// Criteria for a store-side writable medium selection
#[derive(Debug, Clone)]
pub struct WriteMediumFilter<'a> {
    pub family: ResourceFamily,
    /// Minimum free space (bytes)
    pub required_size: u64,
    /// Required medium tags (all must be present)
    pub tags: &'a [String],
    /// Preferred grouping; media already carrying it win
    pub grouping: Option<&'a str>,
    /// Media to skip (already allocated or failed for this request)
    pub exclude: &'a [MediumId],
}

/// Interface to the persistent metadata store
///
/// All operations may block for seconds and may fail; callers treat
/// them as suspension points.
pub trait MetaStore: Send + Sync {
    /// All device rows of this scheduler's libraries.
    fn list_devices(&self) -> Result<Vec<DeviceEntry>, Error>;

    fn lookup_device(&self, id: &DeviceId) -> Result<DeviceEntry, Error>;

    /// Write back a device row (status, health).
    fn update_device(&self, entry: &DeviceEntry) -> Result<(), Error>;

    fn lookup_medium(&self, id: &MediumId) -> Result<Medium, Error>;

    /// Write back a medium row (status, stats, admin).
    fn update_medium(&self, medium: &Medium) -> Result<(), Error>;

    /// Pick a writable medium matching the filter, best match first.
    ///
    /// Does not lock the medium; the caller locks before use.
    fn select_writable_medium(
        &self,
        filter: &WriteMediumFilter,
    ) -> Result<Option<Medium>, Error>;

    /// Take the cross-process lock on a medium. Idempotent per owner.
    fn lock_medium(&self, id: &MediumId, owner: &str) -> Result<(), Error>;

    fn unlock_medium(&self, id: &MediumId, owner: &str) -> Result<(), Error>;

    /// Whether a medium is locked by an owner outside `owner_prefix`
    /// (i.e. by another scheduler process).
    fn medium_locked_by_other(&self, id: &MediumId, owner_prefix: &str) -> Result<bool, Error>;

    /// Take the cross-process lock on a device. Held for the process
    /// lifetime by the owning scheduler.
    fn lock_device(&self, id: &DeviceId, owner: &str) -> Result<(), Error>;

    fn unlock_device(&self, id: &DeviceId, owner: &str) -> Result<(), Error>;

    /// Append an audit row. Never fails the calling operation; storage
    /// problems are logged and swallowed.
    fn audit(&self, action: AuditAction, target: &str, error: Option<&str>);
}
