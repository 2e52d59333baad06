//! Device (drive) handling
//!
//! Each drive is owned by one worker thread; the handful of fields
//! other threads touch (the assigned sub-request, the sync queue, the
//! scheduling flags) live behind the per-device mutex, with a condvar
//! for wakeups.

mod worker;
pub use worker::{spawn_device_thread, DeviceThreadContext};

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use bitflags::bitflags;

use lrs_api_types::{
    AdminStatus, DeviceEntry, DeviceId, DeviceStatusEntry, IoRequestKind, Medium, MediumId,
    OperStatusKind,
};

use crate::request::{RequestContainer, SubRequest};

bitflags! {
    /// Request types a drive is assigned to
    pub struct IoTypeMask: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const FORMAT = 0b100;
    }
}

impl From<IoRequestKind> for IoTypeMask {
    fn from(kind: IoRequestKind) -> Self {
        match kind {
            IoRequestKind::Read => IoTypeMask::READ,
            IoRequestKind::Write => IoTypeMask::WRITE,
            IoRequestKind::Format => IoTypeMask::FORMAT,
        }
    }
}

impl IoTypeMask {
    pub fn kinds(self) -> Vec<IoRequestKind> {
        let mut kinds = Vec::new();
        for kind in [
            IoRequestKind::Read,
            IoRequestKind::Write,
            IoRequestKind::Format,
        ] {
            if self.contains(kind.into()) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

/// Drive state machine
///
/// The closed variant makes illegal transitions (like unmounting an
/// empty drive) unrepresentable. `Failed` is absorbing.
#[derive(Debug, Clone)]
pub enum OperationalStatus {
    Empty,
    Loaded(Arc<Medium>),
    Mounted(Arc<Medium>, std::path::PathBuf),
    Failed,
}

impl OperationalStatus {
    pub fn medium(&self) -> Option<&Arc<Medium>> {
        match self {
            OperationalStatus::Loaded(medium) => Some(medium),
            OperationalStatus::Mounted(medium, _) => Some(medium),
            _ => None,
        }
    }

    pub fn mount_path(&self) -> Option<&std::path::Path> {
        match self {
            OperationalStatus::Mounted(_, path) => Some(path),
            _ => None,
        }
    }

    pub fn kind(&self) -> OperStatusKind {
        match self {
            OperationalStatus::Empty => OperStatusKind::Empty,
            OperationalStatus::Loaded(_) => OperStatusKind::Loaded,
            OperationalStatus::Mounted(..) => OperStatusKind::Mounted,
            OperationalStatus::Failed => OperStatusKind::Failed,
        }
    }
}

/// One pending release obligation
pub struct SyncQueueEntry {
    pub request: Arc<RequestContainer>,
    pub medium_index: usize,
    pub queued: Instant,
}

/// Per-device ordered list of pending release obligations
#[derive(Default)]
pub struct SyncQueue {
    pub entries: VecDeque<SyncQueueEntry>,
    /// Aggregate written size of all queued entries (bytes)
    pub pending_size: u64,
    /// Aggregate extent count of all queued entries
    pub pending_extents: u64,
    /// New groupings to append to the medium record on next sync
    pub groupings_to_update: Vec<String>,
}

impl SyncQueue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queue time of the oldest pending entry.
    pub fn oldest(&self) -> Option<Instant> {
        self.entries.front().map(|entry| entry.queued)
    }
}

/// Fields shared with the scheduler thread, guarded by the device
/// mutex
pub struct DeviceState {
    pub admin_status: AdminStatus,
    pub status: OperationalStatus,
    pub health: u32,
    /// Request types this drive currently serves
    pub io_mask: IoTypeMask,
    /// Sub-request published by the scheduler (`ld_sub_request`)
    pub sub_request: Option<SubRequest>,
    pub sync_queue: SyncQueue,
    pub needs_sync: bool,
    /// A client holds an allocation on this drive
    pub ongoing_io: bool,
    /// A sub-request is published but not picked up yet
    pub ongoing_scheduled: bool,
    /// A client reported a non-zero rc; force state-only updates and
    /// stop the device once drained
    pub last_client_rc: i32,
    pub stopping: bool,
    pub stopped: bool,
}

pub struct Device {
    /// Immutable identity and hardware description
    pub entry: DeviceEntry,
    state: Mutex<DeviceState>,
    cond: Condvar,
}

impl Device {
    pub fn new(entry: DeviceEntry) -> Arc<Self> {
        let health = entry.health;
        let admin_status = entry.admin_status;
        Arc::new(Device {
            entry,
            state: Mutex::new(DeviceState {
                admin_status,
                status: OperationalStatus::Empty,
                health,
                io_mask: IoTypeMask::empty(),
                sub_request: None,
                sync_queue: SyncQueue::default(),
                needs_sync: false,
                ongoing_io: false,
                ongoing_scheduled: false,
                last_client_rc: 0,
                stopping: false,
                stopped: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.entry.id
    }

    pub fn technology(&self) -> &str {
        self.entry.technology.as_deref().unwrap_or("unknown")
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn signal(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, DeviceState>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, DeviceState> {
        let (guard, _result) = self.cond.wait_timeout(guard, timeout).unwrap();
        guard
    }

    /// Whether the scheduler may publish a sub-request right now.
    pub fn sched_ready(&self) -> bool {
        let state = self.lock();
        state.admin_status == AdminStatus::Unlocked
            && !state.stopping
            && !state.stopped
            && !matches!(state.status, OperationalStatus::Failed)
            && state.sub_request.is_none()
            && !state.ongoing_io
            && !state.ongoing_scheduled
    }

    /// Medium currently bound to this drive, if any.
    pub fn loaded_medium(&self) -> Option<Arc<Medium>> {
        self.lock().status.medium().map(Arc::clone)
    }

    pub fn holds_medium(&self, id: &MediumId) -> bool {
        self.lock()
            .status
            .medium()
            .map(|medium| &medium.id == id)
            .unwrap_or(false)
    }

    /// Publish a sub-request into the `ld_sub_request` slot.
    ///
    /// Fails (returns false) when the drive stopped being ready since
    /// the caller checked.
    pub fn assign_sub_request(&self, sub_request: SubRequest) -> bool {
        let mut state = self.lock();
        if state.sub_request.is_some() || state.ongoing_io || state.stopping || state.stopped {
            return false;
        }
        state.sub_request = Some(sub_request);
        state.ongoing_scheduled = true;
        drop(state);
        self.signal();
        true
    }

    /// Append a release obligation to the sync queue.
    ///
    /// The client session pauses here: `ongoing_io` drops so the sync
    /// can run. A completed *partial* release re-arms it (the writer
    /// keeps its claim); a final release leaves the drive free.
    ///
    /// `written_size`/`nb_extents` update the aggregates; a non-zero
    /// client rc forces a state-only update and eventual device stop.
    pub fn queue_release(
        &self,
        request: Arc<RequestContainer>,
        medium_index: usize,
        written_size: u64,
        nb_extents: u64,
        grouping: Option<&str>,
        client_rc: i32,
    ) {
        let mut state = self.lock();
        state.ongoing_io = false;
        state.sync_queue.entries.push_back(SyncQueueEntry {
            request,
            medium_index,
            queued: Instant::now(),
        });
        state.sync_queue.pending_size += written_size;
        state.sync_queue.pending_extents += nb_extents;
        if let Some(grouping) = grouping {
            if !state
                .sync_queue
                .groupings_to_update
                .iter()
                .any(|have| have == grouping)
            {
                state.sync_queue.groupings_to_update.push(grouping.to_string());
            }
        }
        if client_rc != 0 {
            state.last_client_rc = client_rc;
        }
        drop(state);
        self.signal();
    }

    pub fn request_stop(&self) {
        self.lock().stopping = true;
        self.signal();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Point-in-time snapshot for monitor responses.
    pub fn status_entry(&self) -> DeviceStatusEntry {
        let state = self.lock();
        DeviceStatusEntry {
            device: self.entry.id.clone(),
            oper_status: state.status.kind(),
            medium: state.status.medium().map(|medium| medium.id.clone()),
            mount_path: state
                .status
                .mount_path()
                .map(|path| path.to_string_lossy().to_string()),
            assigned: state.io_mask.kinds(),
            health: state.health,
            queued_syncs: state.sync_queue.len() as u64,
            ongoing_io: state.ongoing_io,
        }
    }
}

/// Mount root for a drive: configured prefix + basename of the device
/// node path.
pub fn mount_point(prefix: &std::path::Path, device_path: &str) -> std::path::PathBuf {
    let basename = std::path::Path::new(device_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| device_path.replace('/', "_"));
    prefix.join(basename)
}
