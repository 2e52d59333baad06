use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{
    AddressType, AdminStatus, FsStatus, FsType, MediumId, GROUPING_LIST_SCHEMA,
    MEDIUM_TAG_LIST_SCHEMA,
};

/// Health scores saturate here; a fresh medium or drive starts at the
/// maximum and is considered dead at 0.
pub const HEALTH_MAX: u32 = 5;

#[api(
    properties: {
        status: {
            type: FsStatus,
        },
        "fs-type": {
            type: FsType,
        },
        "addr-type": {
            type: AddressType,
        },
    },
)]
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Filesystem description of a medium
pub struct MediumFs {
    pub status: FsStatus,
    pub fs_type: FsType,
    pub addr_type: AddressType,
    /// Filesystem label (usually the medium name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[api()]
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Space accounting for a medium
pub struct MediumStats {
    /// Physical space used (bytes)
    pub phys_spc_used: u64,
    /// Physical space free (bytes)
    pub phys_spc_free: u64,
    /// Logical space used (bytes, as reported by clients)
    pub logical_spc_used: u64,
    /// Number of objects stored
    pub nb_obj: u64,
}

#[api()]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Operations a medium currently accepts
pub struct OperationFlags {
    /// Accepts writes
    pub put: bool,
    /// Accepts reads
    pub get: bool,
    /// Accepts deletes
    pub delete: bool,
}

impl Default for OperationFlags {
    fn default() -> Self {
        OperationFlags {
            put: true,
            get: true,
            delete: true,
        }
    }
}

#[api(
    properties: {
        id: {
            type: MediumId,
        },
        "admin-status": {
            type: AdminStatus,
        },
        fs: {
            type: MediumFs,
        },
        stats: {
            type: MediumStats,
        },
        flags: {
            type: OperationFlags,
        },
        tags: {
            schema: MEDIUM_TAG_LIST_SCHEMA,
        },
        groupings: {
            schema: GROUPING_LIST_SCHEMA,
        },
    },
)]
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Medium record
///
/// This is the unit the medium cache manages. Records are immutable
/// snapshots; mutation always goes through the metadata store and
/// republishes a new version.
pub struct Medium {
    pub id: MediumId,
    pub admin_status: AdminStatus,
    pub fs: MediumFs,
    pub stats: MediumStats,
    pub flags: OperationFlags,
    pub tags: Vec<String>,
    /// Groupings currently in use for writes on this medium
    pub groupings: Vec<String>,
    /// Technology tag (e.g. tape generation), if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technology: Option<String>,
    /// Health score (0 means the medium is considered dead)
    pub health: u32,
}

impl Medium {
    /// A blank, healthy medium with default flags.
    pub fn blank(id: MediumId, fs_type: FsType, addr_type: AddressType) -> Self {
        Medium {
            id,
            admin_status: AdminStatus::Unlocked,
            fs: MediumFs {
                status: FsStatus::Blank,
                fs_type,
                addr_type,
                label: None,
            },
            stats: MediumStats::default(),
            flags: OperationFlags::default(),
            tags: Vec::new(),
            groupings: Vec::new(),
            technology: None,
            health: HEALTH_MAX,
        }
    }

    /// Writability as far as the record alone can tell.
    pub fn is_writable(&self) -> bool {
        self.admin_status == AdminStatus::Unlocked
            && self.flags.put
            && self.health > 0
            && matches!(self.fs.status, FsStatus::Empty | FsStatus::Used)
    }

    pub fn is_readable(&self) -> bool {
        self.admin_status == AdminStatus::Unlocked && self.flags.get && self.health > 0
    }
}
