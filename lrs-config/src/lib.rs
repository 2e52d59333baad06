//! Scheduler configuration
//!
//! This module is based on [`SectionConfig`], and provides a type safe
//! interface to store [`FamilyTuningConfig`], [`TechnologyConfig`] and
//! [`SchedTuningConfig`] sections.
//!
//! [FamilyTuningConfig]: lrs_api_types::FamilyTuningConfig
//! [TechnologyConfig]: lrs_api_types::TechnologyConfig
//! [SchedTuningConfig]: lrs_api_types::SchedTuningConfig
//! [SectionConfig]: proxmox_section_config::SectionConfig

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Error};
use lazy_static::lazy_static;

use proxmox_schema::{ApiType, Schema};
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use lrs_api_types::{
    parse_share_triple, DispatchAlgo, FamilyTuningConfig, IoSchedAlgo, ResourceFamily,
    SchedTuningConfig, TechnologyConfig, CONFIG_SECTION_NAME_SCHEMA,
};

lazy_static! {
    /// Static [`SectionConfig`] to access parser/writer functions.
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let mut config = SectionConfig::new(&CONFIG_SECTION_NAME_SCHEMA);

    let obj_schema = match FamilyTuningConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("family".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match TechnologyConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("technology".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match SchedTuningConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("sched".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    config
}

/// Configuration file name
pub const LRS_CFG_FILENAME: &str = "/etc/lrs/sched.cfg";
/// Lock file name (used to prevent concurrent access)
pub const LRS_CFG_LOCKFILE: &str = "/etc/lrs/.sched.lck";

/// Get exclusive lock
pub fn lock() -> Result<std::fs::File, Error> {
    let options = proxmox_sys::fs::CreateOptions::new();
    let timeout = std::time::Duration::new(10, 0);
    proxmox_sys::fs::open_file_locked(LRS_CFG_LOCKFILE, timeout, true, options)
}

/// Read and parse the configuration file
pub fn config() -> Result<(SectionConfigData, [u8; 32]), Error> {
    parse_config(LRS_CFG_FILENAME)
}

/// Read and parse a configuration file at a non-default location
pub fn parse_config(path: &str) -> Result<(SectionConfigData, [u8; 32]), Error> {
    let content = proxmox_sys::fs::file_read_optional_string(path)?.unwrap_or_default();

    let digest = openssl::sha::sha256(content.as_bytes());
    let data = CONFIG.parse(path, &content)?;
    Ok((data, digest))
}

/// Save the configuration file
pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(LRS_CFG_FILENAME, config)?;
    proxmox_sys::fs::replace_file(
        LRS_CFG_FILENAME,
        raw.as_bytes(),
        proxmox_sys::fs::CreateOptions::new(),
        true,
    )?;
    Ok(())
}

/// Per-family sync tuning with defaults applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyTuning {
    pub sync_time_ms: u64,
    pub sync_nb_req: u64,
    pub sync_wsize_kb: u64,
}

impl Default for FamilyTuning {
    fn default() -> Self {
        FamilyTuning {
            sync_time_ms: 10_000,
            sync_nb_req: 5,
            sync_wsize_kb: 1024 * 1024,
        }
    }
}

/// One supported technology, parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Technology {
    pub name: String,
    pub drive_models: Vec<String>,
    pub fair_share_min: [u32; 3],
    pub fair_share_max: [u32; 3],
}

/// Runtime view of the scheduler configuration
///
/// Built once at init; read-mostly afterwards.
#[derive(Debug, Clone)]
pub struct LrsConfig {
    pub mount_prefix: PathBuf,
    pub read_algo: IoSchedAlgo,
    pub write_algo: IoSchedAlgo,
    pub format_algo: IoSchedAlgo,
    pub dispatch_algo: DispatchAlgo,
    pub ordered_grouped_read: bool,
    pub families: HashMap<ResourceFamily, FamilyTuning>,
    pub technologies: Vec<Technology>,
}

impl Default for LrsConfig {
    fn default() -> Self {
        LrsConfig {
            mount_prefix: PathBuf::from("/mnt/lrs"),
            read_algo: IoSchedAlgo::Fifo,
            write_algo: IoSchedAlgo::Fifo,
            format_algo: IoSchedAlgo::Fifo,
            dispatch_algo: DispatchAlgo::None,
            ordered_grouped_read: false,
            families: HashMap::new(),
            technologies: Vec::new(),
        }
    }
}

impl LrsConfig {
    /// Build the runtime view from parsed section config data.
    pub fn with_config(data: &SectionConfigData) -> Result<Self, Error> {
        let mut this = LrsConfig::default();

        for (id, (section_type, _)) in &data.sections {
            match section_type.as_str() {
                "family" => {
                    let family_config: FamilyTuningConfig = data.lookup("family", id)?;
                    let family: ResourceFamily = match family_config.name.parse() {
                        Ok(family) => family,
                        Err(_) => bail!("unknown resource family '{}'", family_config.name),
                    };
                    let mut tuning = FamilyTuning::default();
                    if let Some(value) = family_config.sync_time_ms {
                        tuning.sync_time_ms = value;
                    }
                    if let Some(value) = family_config.sync_nb_req {
                        tuning.sync_nb_req = value;
                    }
                    if let Some(value) = family_config.sync_wsize_kb {
                        tuning.sync_wsize_kb = value;
                    }
                    this.families.insert(family, tuning);
                }
                "technology" => {
                    let tech_config: TechnologyConfig = data.lookup("technology", id)?;
                    this.technologies.push(Technology {
                        name: tech_config.name.clone(),
                        drive_models: tech_config
                            .drive_models
                            .as_deref()
                            .map(|raw| {
                                raw.split(',').map(|model| model.trim().to_string()).collect()
                            })
                            .unwrap_or_default(),
                        fair_share_min: match tech_config.fair_share_min.as_deref() {
                            Some(raw) => parse_share_triple(raw)?,
                            None => [0, 0, 0],
                        },
                        fair_share_max: match tech_config.fair_share_max.as_deref() {
                            Some(raw) => parse_share_triple(raw)?,
                            None => [u32::MAX, u32::MAX, u32::MAX],
                        },
                    });
                }
                "sched" => {
                    let sched_config: SchedTuningConfig = data.lookup("sched", id)?;
                    if let Some(prefix) = sched_config.mount_prefix {
                        this.mount_prefix = PathBuf::from(prefix);
                    }
                    if let Some(algo) = sched_config.read_algo {
                        this.read_algo = algo;
                    }
                    if let Some(algo) = sched_config.write_algo {
                        this.write_algo = algo;
                    }
                    if let Some(algo) = sched_config.format_algo {
                        this.format_algo = algo;
                    }
                    if let Some(algo) = sched_config.dispatch_algo {
                        this.dispatch_algo = algo;
                    }
                    if let Some(ordered) = sched_config.ordered_grouped_read {
                        this.ordered_grouped_read = ordered;
                    }
                }
                unknown => bail!("unknown config section type '{}'", unknown),
            }
        }

        Ok(this)
    }

    /// Sync tuning for a family, defaults when not configured.
    pub fn family_tuning(&self, family: ResourceFamily) -> FamilyTuning {
        self.families.get(&family).copied().unwrap_or_default()
    }

    /// Look up a technology entry by name.
    pub fn technology(&self, name: &str) -> Option<&Technology> {
        self.technologies.iter().find(|tech| tech.name == name)
    }

    /// Technology a drive model belongs to.
    pub fn technology_of_model(&self, model: &str) -> Option<&Technology> {
        self.technologies
            .iter()
            .find(|tech| tech.drive_models.iter().any(|m| m == model))
    }
}
