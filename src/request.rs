//! In-flight request containers
//!
//! A decoded client request is wrapped into a [`RequestContainer`] on
//! intake and lives until its response is emitted or every
//! sub-request reached a terminal state. The container owns a single
//! mutex over all mutable per-request state; device threads and the
//! scheduler thread synchronise on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{bail, Error};

use proxmox_uuid::Uuid;

use lrs_api_types::{
    AllocSlotReply, FormatRequest, IoRequestKind, Medium, MediumId, ReleaseMediumSpec, Request,
    RequestBody, RequestKind, ResourceFamily, Response, ResponseBody, WriteMediumSpec,
};

/// Terminal/non-terminal state of one sub-request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Todo,
    Done,
    Error,
    Cancel,
}

impl SlotStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SlotStatus::Todo)
    }
}

/// One medium of a read/write allocation
#[derive(Debug, Clone)]
pub struct MediaSlot {
    /// Chosen medium, set by a scheduler algorithm
    pub medium: Option<Arc<Medium>>,
    pub status: SlotStatus,
    /// Candidate media ids (reads only, bounded by the client)
    pub candidates: Vec<MediumId>,
    /// Write requirements (writes only)
    pub write_spec: Option<WriteMediumSpec>,
    /// Filled by the device thread once the slot is done
    pub reply: Option<AllocSlotReply>,
}

/// Mutable state of a read/write allocation
#[derive(Debug)]
pub struct RwAllocState {
    pub io_kind: IoRequestKind,
    pub family: ResourceFamily,
    pub n_required: usize,
    pub slots: Vec<MediaSlot>,
    /// Next candidate index retries may try (always ≥ n_required)
    pub retry_cursor: usize,
    pub first_error: Option<i32>,
}

impl RwAllocState {
    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|slot| slot.status == SlotStatus::Done)
    }

    pub fn all_terminal(&self) -> bool {
        self.slots.iter().all(|slot| slot.status.is_terminal())
    }

    /// Candidate media usable for retries of reads.
    pub fn usable_candidates(&self) -> usize {
        match self.slots.first() {
            Some(slot) => slot.candidates.len().saturating_sub(
                self.retry_cursor.saturating_sub(self.n_required),
            ),
            None => 0,
        }
    }
}

/// Mutable state of a format request
#[derive(Debug)]
pub struct FormatState {
    pub spec: FormatRequest,
    pub status: SlotStatus,
    pub first_error: Option<i32>,
}

/// One medium of a release request
#[derive(Debug, Clone)]
pub struct ReleaseEntry {
    pub spec: ReleaseMediumSpec,
    pub status: SlotStatus,
}

/// Mutable state of a release request
#[derive(Debug)]
pub struct ReleaseState {
    pub kind: IoRequestKind,
    pub partial: bool,
    pub entries: Vec<ReleaseEntry>,
    pub first_error: Option<i32>,
}

impl ReleaseState {
    /// A release ends once every entry is terminal.
    pub fn ended(&self) -> bool {
        self.entries.iter().all(|entry| entry.status.is_terminal())
    }
}

/// Discriminated mutable payload of a request container
#[derive(Debug)]
pub enum Payload {
    RwAlloc(RwAllocState),
    Format(FormatState),
    Release(ReleaseState),
}

/// An accepted request, alive until its response is out
pub struct RequestContainer {
    pub id: Uuid,
    pub kind: RequestKind,
    pub arrived: Instant,
    pub arrived_epoch: i64,
    state: Mutex<Payload>,
    response_sent: AtomicBool,
}

impl std::fmt::Debug for RequestContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} request {}", self.kind, self.id)
    }
}

impl RequestContainer {
    /// Wrap a decoded request. Fails on protocol-level nonsense
    /// (these get an immediate error response upstream).
    pub fn new(request: Request) -> Result<Self, Error> {
        let kind = request.body.kind();

        let payload = match request.body {
            RequestBody::Read(read) => {
                if read.n_required == 0 {
                    bail!("read allocation with zero required media");
                }
                if read.media.len() < read.n_required {
                    bail!(
                        "read allocation with {} candidates for {} required media",
                        read.media.len(),
                        read.n_required
                    );
                }
                let family = read.media[0].family;
                let slots = (0..read.n_required)
                    .map(|_| MediaSlot {
                        medium: None,
                        status: SlotStatus::Todo,
                        candidates: read.media.clone(),
                        write_spec: None,
                        reply: None,
                    })
                    .collect();
                Payload::RwAlloc(RwAllocState {
                    io_kind: IoRequestKind::Read,
                    family,
                    n_required: read.n_required,
                    slots,
                    retry_cursor: read.n_required,
                    first_error: None,
                })
            }
            RequestBody::Write(write) => {
                if write.media.is_empty() {
                    bail!("write allocation without media");
                }
                let n_required = write.media.len();
                let slots = write
                    .media
                    .into_iter()
                    .map(|spec| MediaSlot {
                        medium: None,
                        status: SlotStatus::Todo,
                        candidates: Vec::new(),
                        write_spec: Some(spec),
                        reply: None,
                    })
                    .collect();
                Payload::RwAlloc(RwAllocState {
                    io_kind: IoRequestKind::Write,
                    family: write.family,
                    n_required,
                    slots,
                    retry_cursor: n_required,
                    first_error: None,
                })
            }
            RequestBody::Format(spec) => Payload::Format(FormatState {
                spec,
                status: SlotStatus::Todo,
                first_error: None,
            }),
            RequestBody::Release(release) => {
                if release.media.is_empty() {
                    bail!("release without media");
                }
                let entries = release
                    .media
                    .into_iter()
                    .map(|spec| ReleaseEntry {
                        spec,
                        status: SlotStatus::Todo,
                    })
                    .collect();
                Payload::Release(ReleaseState {
                    kind: release.kind,
                    partial: release.partial,
                    entries,
                    first_error: None,
                })
            }
            RequestBody::Notify(_) | RequestBody::Monitor => {
                bail!("{} requests are handled synchronously", kind);
            }
        };

        Ok(RequestContainer {
            id: request.id,
            kind,
            arrived: Instant::now(),
            arrived_epoch: proxmox_time::epoch_i64(),
            state: Mutex::new(payload),
            response_sent: AtomicBool::new(false),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Payload> {
        self.state.lock().unwrap()
    }

    /// First recorded error, if any.
    pub fn first_error(&self) -> Option<i32> {
        match &*self.lock() {
            Payload::RwAlloc(state) => state.first_error,
            Payload::Format(state) => state.first_error,
            Payload::Release(state) => state.first_error,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.first_error().is_some()
    }

    /// Record a fatal sub-request error.
    ///
    /// The first error wins; peers in `Done` state are rolled back to
    /// `Cancel` (their drives get freed), peers still `Todo` become
    /// `Cancel`. A single error response per parent is emitted later.
    pub fn mark_failed(&self, error_code: i32) {
        let mut guard = self.lock();
        match &mut *guard {
            Payload::RwAlloc(state) => {
                if state.first_error.is_none() {
                    state.first_error = Some(error_code);
                }
                for slot in state.slots.iter_mut() {
                    match slot.status {
                        SlotStatus::Todo | SlotStatus::Done => {
                            slot.status = SlotStatus::Cancel;
                        }
                        SlotStatus::Error | SlotStatus::Cancel => {}
                    }
                }
            }
            Payload::Format(state) => {
                if state.first_error.is_none() {
                    state.first_error = Some(error_code);
                }
                if !state.status.is_terminal() {
                    state.status = SlotStatus::Error;
                }
            }
            Payload::Release(state) => {
                if state.first_error.is_none() {
                    state.first_error = Some(error_code);
                }
            }
        }
    }

    /// Successful response once all sub-requests are done, error
    /// response once the request failed, `None` while still running.
    pub fn make_response(&self) -> Option<Response> {
        let guard = self.lock();
        match &*guard {
            Payload::RwAlloc(state) => {
                if let Some(error_code) = state.first_error {
                    return Some(Response::error(self.id.clone(), self.kind, error_code));
                }
                if !state.all_done() {
                    return None;
                }
                let media: Vec<AllocSlotReply> = state
                    .slots
                    .iter()
                    .filter_map(|slot| slot.reply.clone())
                    .collect();
                if media.len() != state.slots.len() {
                    return None; // a done slot without reply is still in flight
                }
                let body = match state.io_kind {
                    IoRequestKind::Read => ResponseBody::Read { media },
                    _ => ResponseBody::Write { media },
                };
                Some(Response {
                    id: self.id.clone(),
                    body,
                })
            }
            Payload::Format(state) => {
                if let Some(error_code) = state.first_error {
                    return Some(Response::error(self.id.clone(), self.kind, error_code));
                }
                if state.status != SlotStatus::Done {
                    return None;
                }
                Some(Response {
                    id: self.id.clone(),
                    body: ResponseBody::Format {
                        medium: state.spec.medium.clone(),
                    },
                })
            }
            Payload::Release(state) => {
                if !state.ended() {
                    return None;
                }
                if let Some(error_code) = state.first_error {
                    return Some(Response::error(self.id.clone(), self.kind, error_code));
                }
                Some(Response {
                    id: self.id.clone(),
                    body: ResponseBody::Release {
                        media: state
                            .entries
                            .iter()
                            .map(|entry| entry.spec.medium.clone())
                            .collect(),
                    },
                })
            }
        }
    }
}

impl RequestContainer {
    /// Like [`make_response`](Self::make_response), but hands the
    /// response out exactly once across all threads.
    pub fn try_take_response(&self) -> Option<Response> {
        let response = self.make_response()?;
        if self.response_sent.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(response)
    }

    pub fn response_taken(&self) -> bool {
        self.response_sent.load(Ordering::SeqCst)
    }
}

/// A (request, medium index) pair; the device thread's unit of work
#[derive(Clone)]
pub struct SubRequest {
    pub request: Arc<RequestContainer>,
    pub medium_index: usize,
    /// The previous attempt failed on its medium; retries must pick
    /// another candidate
    pub failure_on_medium: bool,
}

impl std::fmt::Debug for SubRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sub-request {}[{}]{}",
            self.request.id,
            self.medium_index,
            if self.failure_on_medium {
                " (medium failed)"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod test {
    use lrs_api_types::{ReadAllocRequest, ResourceFamily};

    use super::*;

    fn read_request(n_required: usize, candidates: &[&str]) -> Request {
        Request {
            id: Uuid::generate(),
            body: RequestBody::Read(ReadAllocRequest {
                n_required,
                media: candidates
                    .iter()
                    .map(|name| MediumId::new(ResourceFamily::Tape, name, "lib0"))
                    .collect(),
            }),
        }
    }

    #[test]
    fn test_intake_validation() {
        assert!(RequestContainer::new(read_request(0, &["a"])).is_err());
        assert!(RequestContainer::new(read_request(2, &["a"])).is_err());
        assert!(RequestContainer::new(read_request(1, &["a", "b"])).is_ok());
    }

    #[test]
    fn test_mark_failed_rolls_back_peers() {
        let container = RequestContainer::new(read_request(2, &["a", "b", "c"])).unwrap();

        if let Payload::RwAlloc(state) = &mut *container.lock() {
            state.slots[0].status = SlotStatus::Done;
        }

        container.mark_failed(-libc::EIO);

        let guard = container.lock();
        let state = match &*guard {
            Payload::RwAlloc(state) => state,
            _ => unreachable!(),
        };
        assert_eq!(state.first_error, Some(-libc::EIO));
        // the done peer is rolled back, the todo peer cancelled
        assert_eq!(state.slots[0].status, SlotStatus::Cancel);
        assert_eq!(state.slots[1].status, SlotStatus::Cancel);
        drop(guard);

        // a single error response
        let response = container.make_response().unwrap();
        assert!(response.is_error());
    }
}
