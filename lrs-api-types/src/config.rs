//! Types for the scheduler configuration file

use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiStringFormat, Schema, StringSchema};

use crate::{CONFIG_SECTION_NAME_SCHEMA, TECHNOLOGY_NAME_SCHEMA};

#[api()]
/// I/O scheduler algorithm
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoSchedAlgo {
    /// Strict arrival order
    Fifo,
    /// Group read requests by target medium to minimise swaps
    GroupedRead,
}

serde_plain::derive_display_from_serialize!(IoSchedAlgo);
serde_plain::derive_fromstr_from_deserialize!(IoSchedAlgo);

#[api()]
/// Device dispatch algorithm
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAlgo {
    /// Every drive serves every request type
    None,
    /// Partition drives by per-type request load
    FairShare,
}

serde_plain::derive_display_from_serialize!(DispatchAlgo);
serde_plain::derive_fromstr_from_deserialize!(DispatchAlgo);

pub const SHARE_TRIPLE_FORMAT: ApiStringFormat = ApiStringFormat::VerifyFn(|s| {
    parse_share_triple(s)?;
    Ok(())
});

pub const SHARE_TRIPLE_SCHEMA: Schema = StringSchema::new(
    "Three comma-separated device counts, one per request type (read,write,format).",
)
.format(&SHARE_TRIPLE_FORMAT)
.schema();

pub const DRIVE_MODEL_LIST_SCHEMA: Schema =
    StringSchema::new("Comma-separated list of compatible drive models.").schema();

/// Parse a "r,w,f" triple like `fair-share-min`/`fair-share-max` use.
pub fn parse_share_triple(raw: &str) -> Result<[u32; 3], anyhow::Error> {
    let parts: Vec<&str> = raw.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        anyhow::bail!("expected three comma-separated integers, got '{}'", raw);
    }
    let mut triple = [0u32; 3];
    for (i, part) in parts.iter().enumerate() {
        triple[i] = part
            .parse()
            .map_err(|_| anyhow::format_err!("invalid device count '{}'", part))?;
    }
    Ok(triple)
}

#[api(
    properties: {
        name: {
            schema: CONFIG_SECTION_NAME_SCHEMA,
        },
    },
)]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
/// Per-family sync tuning
pub struct FamilyTuningConfig {
    /// The family name ('tape', 'dir' or 'pool')
    pub name: String,
    /// Flush pending releases older than this (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_time_ms: Option<u64>,
    /// Flush once this many releases are pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_nb_req: Option<u64>,
    /// Flush once this much data is pending (KiB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_wsize_kb: Option<u64>,
}

#[api(
    properties: {
        name: {
            schema: TECHNOLOGY_NAME_SCHEMA,
        },
        "drive-models": {
            schema: DRIVE_MODEL_LIST_SCHEMA,
            optional: true,
        },
        "fair-share-min": {
            schema: SHARE_TRIPLE_SCHEMA,
            optional: true,
        },
        "fair-share-max": {
            schema: SHARE_TRIPLE_SCHEMA,
            optional: true,
        },
    },
)]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
/// A supported technology (e.g. tape generation) and its drives
pub struct TechnologyConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_models: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fair_share_min: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fair_share_max: Option<String>,
}

#[api(
    properties: {
        "read-algo": {
            type: IoSchedAlgo,
            optional: true,
        },
        "write-algo": {
            type: IoSchedAlgo,
            optional: true,
        },
        "format-algo": {
            type: IoSchedAlgo,
            optional: true,
        },
        "dispatch-algo": {
            type: DispatchAlgo,
            optional: true,
        },
    },
)]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
/// Scheduler-wide tuning
pub struct SchedTuningConfig {
    /// Section id (a single 'sched' section is expected)
    pub name: String,
    /// Prefix mount roots are built under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_algo: Option<IoSchedAlgo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_algo: Option<IoSchedAlgo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_algo: Option<IoSchedAlgo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_algo: Option<DispatchAlgo>,
    /// Order grouped-read queues by QoS and priority instead of FIFO
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered_grouped_read: Option<bool>,
}
