//! Request and response types for the scheduler
//!
//! Note: Requests are complex nested enums, so we cannot use them
//! directly for the API macro. Instead, they are plain serde types;
//! the wire framing around them is out of scope here.

use std::fmt;

use serde::{Deserialize, Serialize};

use proxmox_schema::api;
use proxmox_uuid::Uuid;

use crate::{
    AddressType, DeviceId, DeviceStatusEntry, FsType, IoRequestKind, MediumId, ResourceFamily,
};

#[api()]
/// Request kind, echoed back in error responses
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Read allocation
    Read,
    /// Write allocation
    Write,
    /// Medium format
    Format,
    /// Post-I/O release
    Release,
    /// Resource change notification
    Notify,
    /// Status snapshot
    Monitor,
}

serde_plain::derive_display_from_serialize!(RequestKind);

/// Read allocation request
///
/// The client asks for `n_required` media out of the candidate list;
/// the list may be longer to give the scheduler retry room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReadAllocRequest {
    pub n_required: usize,
    pub media: Vec<MediumId>,
}

/// Requirements for one medium of a write allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WriteMediumSpec {
    /// Expected write size (bytes)
    pub size: u64,
    /// Required medium tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Preferred grouping (co-locate with same grouping)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouping: Option<String>,
}

/// Write allocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WriteAllocRequest {
    pub family: ResourceFamily,
    pub media: Vec<WriteMediumSpec>,
}

/// Format request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormatRequest {
    pub medium: MediumId,
    pub fs_type: FsType,
    /// Clear the administrative lock once formatted
    #[serde(default)]
    pub unlock: bool,
}

/// Client-reported outcome for one medium of a release
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReleaseMediumSpec {
    pub medium: MediumId,
    /// Bytes the client wrote during the session
    #[serde(default)]
    pub written_size: u64,
    /// Extents the client wrote during the session
    #[serde(default)]
    pub nb_extents_written: u32,
    /// Client-side return code (0 on success)
    #[serde(default)]
    pub rc: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouping: Option<String>,
}

/// Release request, closing (part of) an allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReleaseRequest {
    pub kind: IoRequestKind,
    pub media: Vec<ReleaseMediumSpec>,
    /// The write session continues; keep the media reserved
    #[serde(default)]
    pub partial: bool,
}

/// Resource change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "op")]
pub enum NotifyRequest {
    /// A drive was added to the metadata store
    DeviceAdd { device: DeviceId },
    /// A drive is being removed
    DeviceRemove { device: DeviceId },
    /// A medium row changed behind our back
    MediumUpdate { medium: MediumId },
}

/// Request body, one variant per accepted request kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "body")]
pub enum RequestBody {
    Read(ReadAllocRequest),
    Write(WriteAllocRequest),
    Format(FormatRequest),
    Release(ReleaseRequest),
    Notify(NotifyRequest),
    Monitor,
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::Read(_) => RequestKind::Read,
            RequestBody::Write(_) => RequestKind::Write,
            RequestBody::Format(_) => RequestKind::Format,
            RequestBody::Release(_) => RequestKind::Release,
            RequestBody::Notify(_) => RequestKind::Notify,
            RequestBody::Monitor => RequestKind::Monitor,
        }
    }
}

/// A decoded client request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Request {
    /// Unique request id, echoed in the response
    pub id: Uuid,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} request {}", self.body.kind(), self.id)
    }
}

/// One allocated medium of a read/write response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AllocSlotReply {
    pub medium: MediumId,
    /// Mount root the client performs its I/O under
    pub root_path: String,
    pub fs_type: FsType,
    pub addr_type: AddressType,
    /// Remaining space, only reported for writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avail_size: Option<u64>,
}

/// Response body, one variant per request kind plus the error form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "body")]
pub enum ResponseBody {
    Read { media: Vec<AllocSlotReply> },
    Write { media: Vec<AllocSlotReply> },
    Format { medium: MediumId },
    Release { media: Vec<MediumId> },
    Notify,
    Monitor { devices: Vec<DeviceStatusEntry> },
    Error(ErrorReply),
}

/// Error response payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorReply {
    /// Negative errno value
    pub error_code: i32,
    /// Kind of the failed request
    pub req_kind: RequestKind,
}

/// A response on its way back to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Response {
    /// Id of the request this answers
    pub id: Uuid,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn error(id: Uuid, req_kind: RequestKind, error_code: i32) -> Self {
        Response {
            id,
            body: ResponseBody::Error(ErrorReply {
                error_code,
                req_kind,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }
}
