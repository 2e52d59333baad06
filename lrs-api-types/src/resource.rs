use std::fmt;

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{DRIVE_NAME_SCHEMA, LIBRARY_NAME_SCHEMA, MEDIUM_NAME_SCHEMA};

#[api()]
/// Resource family
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFamily {
    /// Physical tape cartridge
    Tape,
    /// Plain directory
    Dir,
    /// Object pool entry
    Pool,
}

serde_plain::derive_display_from_serialize!(ResourceFamily);
serde_plain::derive_fromstr_from_deserialize!(ResourceFamily);

#[api()]
/// Administrative status of a medium or device
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    /// Usable for scheduling
    Unlocked,
    /// Administratively excluded from scheduling
    Locked,
    /// Failed, excluded until repaired
    Failed,
}

serde_plain::derive_display_from_serialize!(AdminStatus);

#[api()]
/// Filesystem status of a medium
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsStatus {
    /// Never formatted
    Blank,
    /// Formatted, no object written yet
    Empty,
    /// Contains at least one object
    Used,
    /// No usable space left
    Full,
}

serde_plain::derive_display_from_serialize!(FsStatus);

#[api()]
/// Filesystem type used on a medium
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// Linear Tape File System
    Ltfs,
    /// POSIX directory tree
    Posix,
    /// RADOS object pool
    Rados,
}

serde_plain::derive_display_from_serialize!(FsType);
serde_plain::derive_fromstr_from_deserialize!(FsType);

#[api()]
/// Address scheme used to locate objects on a medium
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Objects addressed by relative path
    Path,
    /// Objects addressed by content hash
    Hash,
    /// Opaque, adapter-defined addressing
    Opaque,
}

serde_plain::derive_display_from_serialize!(AddressType);

#[api()]
/// I/O request type
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoRequestKind {
    /// Read allocation
    Read,
    /// Write allocation
    Write,
    /// Medium format
    Format,
}

serde_plain::derive_display_from_serialize!(IoRequestKind);

#[api(
    properties: {
        family: {
            type: ResourceFamily,
        },
        name: {
            schema: MEDIUM_NAME_SCHEMA,
        },
        library: {
            schema: LIBRARY_NAME_SCHEMA,
        },
    },
)]
/// Medium identifier
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize)]
pub struct MediumId {
    pub family: ResourceFamily,
    pub name: String,
    pub library: String,
}

impl MediumId {
    pub fn new(family: ResourceFamily, name: &str, library: &str) -> Self {
        Self {
            family,
            name: name.to_string(),
            library: library.to_string(),
        }
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.family, self.library, self.name)
    }
}

#[api(
    properties: {
        family: {
            type: ResourceFamily,
        },
        name: {
            schema: DRIVE_NAME_SCHEMA,
        },
        library: {
            schema: LIBRARY_NAME_SCHEMA,
        },
    },
)]
/// Device (drive) identifier
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize)]
pub struct DeviceId {
    pub family: ResourceFamily,
    pub name: String,
    pub library: String,
}

impl DeviceId {
    pub fn new(family: ResourceFamily, name: &str, library: &str) -> Self {
        Self {
            family,
            name: name.to_string(),
            library: library.to_string(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.family, self.library, self.name)
    }
}
