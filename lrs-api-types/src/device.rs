//! Types for the device (drive) API

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{AdminStatus, DeviceId, IoRequestKind, MediumId, TECHNOLOGY_NAME_SCHEMA};

#[api()]
/// Operational status of a drive, as reported by monitoring
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperStatusKind {
    /// No medium in the drive
    Empty,
    /// Medium loaded, filesystem not mounted
    Loaded,
    /// Medium loaded and filesystem mounted
    Mounted,
    /// Drive failed (absorbing)
    Failed,
}

serde_plain::derive_display_from_serialize!(OperStatusKind);

#[api(
    properties: {
        id: {
            type: DeviceId,
        },
        "admin-status": {
            type: AdminStatus,
        },
        technology: {
            schema: TECHNOLOGY_NAME_SCHEMA,
            optional: true,
        },
    },
)]
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Device row as stored in the metadata store
pub struct DeviceEntry {
    pub id: DeviceId,
    pub admin_status: AdminStatus,
    /// Device node path (e.g. '/dev/sg3')
    pub path: String,
    /// Hardware model, used for technology compatibility checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technology: Option<String>,
    /// Health score (0 means the drive is considered dead)
    pub health: u32,
}

#[api(
    properties: {
        device: {
            type: DeviceId,
        },
        "oper-status": {
            type: OperStatusKind,
        },
        medium: {
            type: MediumId,
            optional: true,
        },
        assigned: {
            type: Array,
            description: "Request types this drive is currently assigned to.",
            items: {
                type: IoRequestKind,
            },
        },
    },
)]
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Point-in-time drive status for monitor responses
pub struct DeviceStatusEntry {
    pub device: DeviceId,
    pub oper_status: OperStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<MediumId>,
    /// Mount path when mounted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Request types this drive is currently assigned to
    pub assigned: Vec<IoRequestKind>,
    /// Health score
    pub health: u32,
    /// Pending sync-queue entries
    pub queued_syncs: u64,
    /// Ongoing client I/O holds the drive
    pub ongoing_io: bool,
}
