//! Basic API types used by most of the LRS code.

use proxmox_schema::{const_regex, ApiStringFormat, ArraySchema, Schema, StringSchema};

pub use proxmox_schema::api_types::SAFE_ID_FORMAT as LRS_SAFE_ID_FORMAT;
pub use proxmox_schema::api_types::SAFE_ID_REGEX as LRS_SAFE_ID_REGEX;
pub use proxmox_schema::api_types::SAFE_ID_REGEX_STR as LRS_SAFE_ID_REGEX_STR;
pub use proxmox_schema::api_types::UUID_FORMAT;

const_regex! {
    /// Medium names are barcodes or generated labels.
    pub MEDIUM_NAME_REGEX = r"^[A-Za-z0-9_][A-Za-z0-9._\-]*$";
    pub TECHNOLOGY_NAME_REGEX = r"^[A-Za-z0-9][A-Za-z0-9._\-]*$";
}

pub const MEDIUM_NAME_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&MEDIUM_NAME_REGEX);
pub const TECHNOLOGY_NAME_FORMAT: ApiStringFormat =
    ApiStringFormat::Pattern(&TECHNOLOGY_NAME_REGEX);

pub const MEDIUM_NAME_SCHEMA: Schema = StringSchema::new("Medium name (label or barcode).")
    .format(&MEDIUM_NAME_FORMAT)
    .min_length(1)
    .max_length(32)
    .schema();

pub const DRIVE_NAME_SCHEMA: Schema = StringSchema::new("Drive identifier.")
    .format(&LRS_SAFE_ID_FORMAT)
    .min_length(1)
    .max_length(32)
    .schema();

pub const LIBRARY_NAME_SCHEMA: Schema = StringSchema::new("Library identifier.")
    .format(&LRS_SAFE_ID_FORMAT)
    .min_length(1)
    .max_length(32)
    .schema();

pub const TECHNOLOGY_NAME_SCHEMA: Schema =
    StringSchema::new("Technology tag (e.g. tape generation).")
        .format(&TECHNOLOGY_NAME_FORMAT)
        .min_length(1)
        .max_length(32)
        .schema();

pub const MEDIUM_TAG_SCHEMA: Schema = StringSchema::new("Medium tag.")
    .format(&LRS_SAFE_ID_FORMAT)
    .schema();

pub const MEDIUM_TAG_LIST_SCHEMA: Schema =
    ArraySchema::new("Medium tag list.", &MEDIUM_TAG_SCHEMA).schema();

pub const GROUPING_SCHEMA: Schema =
    StringSchema::new("Grouping tag used to co-locate writes on the same medium.")
        .format(&LRS_SAFE_ID_FORMAT)
        .schema();

pub const GROUPING_LIST_SCHEMA: Schema =
    ArraySchema::new("Grouping tag list.", &GROUPING_SCHEMA).schema();

pub const CONFIG_SECTION_NAME_SCHEMA: Schema = StringSchema::new("Config section identifier.")
    .format(&LRS_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(32)
    .schema();

mod config;
pub use config::*;

mod resource;
pub use resource::*;

mod medium;
pub use medium::*;

mod device;
pub use device::*;

mod request;
pub use request::*;
