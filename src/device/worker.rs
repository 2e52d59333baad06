//! Device worker thread
//!
//! Runs the per-drive state machine: picks up published sub-requests,
//! performs the physical load/mount/format/sync/unload actions, keeps
//! the health scores, and drains the sync queue. External calls
//! (store, transport, filesystem) can take seconds; the device mutex
//! is never held across them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use crossbeam_channel::Sender;

use lrs_api_types::{
    AdminStatus, FsStatus, IoRequestKind, Medium, MediumId, Response, HEALTH_MAX,
};
use lrs_config::FamilyTuning;

use crate::cache::MediumCache;
use crate::fs_adapter::FsAdapter;
use crate::library::{MediaTransport, TransportError};
use crate::request::{Payload, SlotStatus, SubRequest};
use crate::store::{AuditAction, MetaStore};
use crate::{IDLE_WAKEUP_MS, MIN_SLEEP_MS, RUNNING};

use super::{Device, OperationalStatus, SyncQueue, SyncQueueEntry};

/// Who a failed operation blames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blame {
    /// Transport connection problem; nobody's health is touched
    Transport,
    Medium,
    Drive,
    /// Read-only mount on a write; the medium is full, not defective
    NoSpace,
}

struct OpError {
    blame: Blame,
    errno: i32,
    error: Error,
}

impl OpError {
    fn new(blame: Blame, errno: i32, error: Error) -> Self {
        OpError {
            blame,
            errno,
            error,
        }
    }

    fn medium(error: Error) -> Self {
        Self::new(Blame::Medium, -libc::EIO, error)
    }

    fn drive(error: Error) -> Self {
        Self::new(Blame::Drive, -libc::EIO, error)
    }
}

impl From<TransportError> for OpError {
    fn from(error: TransportError) -> Self {
        let blame = match &error {
            TransportError::Unreachable(_) => Blame::Transport,
            TransportError::Medium(_) => Blame::Medium,
            TransportError::Drive(_) => Blame::Drive,
        };
        let errno = match blame {
            Blame::Transport => -libc::EAGAIN,
            _ => -libc::EIO,
        };
        OpError::new(blame, errno, format_err!("{}", error))
    }
}

/// Everything a device worker needs
pub struct DeviceThreadContext {
    pub device: Arc<Device>,
    pub cache: Arc<MediumCache>,
    pub store: Arc<dyn MetaStore>,
    pub transport: Arc<Mutex<Box<dyn MediaTransport>>>,
    pub fs: Arc<dyn FsAdapter>,
    pub tuning: FamilyTuning,
    pub mount_prefix: PathBuf,
    pub response_tx: Sender<Response>,
    pub retry_tx: Sender<SubRequest>,
    /// Media currently being formatted, shared with the scheduler
    pub ongoing_formats: Arc<Mutex<HashSet<MediumId>>>,
}

/// Takes the permanent store lock on the drive, then starts its
/// worker thread.
pub fn spawn_device_thread(
    ctx: DeviceThreadContext,
) -> Result<std::thread::JoinHandle<()>, Error> {
    let owner = lock_owner(&ctx.device);
    ctx.store.lock_device(ctx.device.id(), &owner)?;

    let name = format!("lrs-dev-{}", ctx.device.id().name);
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let worker = DeviceWorker { ctx };
            worker.run();
        })?;

    Ok(handle)
}

fn lock_owner(device: &Device) -> String {
    format!("{}:{}", crate::store::process_lock_owner(), device.id())
}

enum Work {
    None,
    Sync,
    Dispatch(SubRequest),
    Stop,
}

struct DeviceWorker {
    ctx: DeviceThreadContext,
}

impl DeviceWorker {
    fn run(&self) {
        log::info!("device thread for '{}' running", self.ctx.device.id());

        loop {
            match self.step() {
                Work::Stop => break,
                Work::None => self.wait(),
                Work::Sync => self.do_sync(),
                Work::Dispatch(sub_request) => self.dispatch(sub_request),
            }
        }

        self.shutdown();
    }

    /// One pass over the shared state; returns what to do next.
    fn step(&self) -> Work {
        let device = &self.ctx.device;
        let mut state = device.lock();

        // drop the sub-request if another thread failed its parent
        let parent_failed = state
            .sub_request
            .as_ref()
            .map(|sub_request| sub_request.request.is_failed())
            .unwrap_or(false);
        if parent_failed {
            if let Some(sub_request) = state.sub_request.take() {
                log::info!(
                    "{}: dropping {:?} - parent failed",
                    device.id(),
                    sub_request
                );
            }
            state.ongoing_scheduled = false;
        }

        // purge sync entries of cancelled parents
        let mut ended = Vec::new();
        state.sync_queue.entries.retain(|entry| {
            if !entry.request.is_failed() {
                return true;
            }
            if let Payload::Release(release) = &mut *entry.request.lock() {
                if !release.entries[entry.medium_index].status.is_terminal() {
                    release.entries[entry.medium_index].status = SlotStatus::Cancel;
                }
            }
            ended.push(Arc::clone(&entry.request));
            false
        });
        drop(state);
        for request in ended {
            if let Some(response) = request.try_take_response() {
                let _ = self.ctx.response_tx.send(response);
            }
        }
        let mut state = device.lock();

        let stopping = state.stopping || !RUNNING.load(Ordering::SeqCst);

        // re-evaluate needs_sync
        let needs_sync = !state.sync_queue.is_empty()
            && (state.sync_queue.len() as u64 >= self.ctx.tuning.sync_nb_req
                || state
                    .sync_queue
                    .oldest()
                    .map(|oldest| {
                        oldest.elapsed() >= Duration::from_millis(self.ctx.tuning.sync_time_ms)
                    })
                    .unwrap_or(false)
                || state.sync_queue.pending_size >= self.ctx.tuning.sync_wsize_kb * 1024
                || stopping
                || state.last_client_rc != 0);
        state.needs_sync = needs_sync;

        if stopping
            && !state.ongoing_io
            && state.sub_request.is_none()
            && state.sync_queue.is_empty()
        {
            state.stopped = true;
            return Work::Stop;
        }

        if !state.ongoing_io {
            if state.needs_sync {
                return Work::Sync;
            }
            if let Some(sub_request) = state.sub_request.clone() {
                return Work::Dispatch(sub_request);
            }
        }

        Work::None
    }

    /// Condvar wait until the next sync deadline (or signal).
    fn wait(&self) {
        let device = &self.ctx.device;
        let state = device.lock();

        let timeout = match state.sync_queue.oldest() {
            Some(oldest) => {
                let deadline = oldest + Duration::from_millis(self.ctx.tuning.sync_time_ms);
                deadline.saturating_duration_since(Instant::now())
            }
            None => Duration::from_millis(IDLE_WAKEUP_MS),
        }
        .max(Duration::from_millis(MIN_SLEEP_MS));

        let _state = device.wait_timeout(state, timeout);
    }

    // === health bookkeeping ===================================

    /// A successful operation on the (drive, medium) pair bumps both
    /// scores, saturating at the maximum.
    fn health_success(&self, medium: Option<&MediumId>) {
        let device = &self.ctx.device;
        let new_health = {
            let mut state = device.lock();
            if state.health < HEALTH_MAX {
                state.health += 1;
            }
            state.health
        };
        let mut entry = device.entry.clone();
        entry.health = new_health;
        if let Err(err) = self.ctx.store.update_device(&entry) {
            log::error!("{}: unable to persist device health - {}", device.id(), err);
        }

        if let Some(id) = medium {
            if let Some(current) = self.ctx.cache.lookup(id) {
                if current.health < HEALTH_MAX {
                    let mut updated = (*current).clone();
                    updated.health += 1;
                    self.publish_medium(updated);
                }
            }
        }
    }

    /// A failed operation decrements the blamed side only; scores
    /// never go up on failure. Returns true when the drive died.
    fn health_failure(&self, blame: Blame, medium: Option<&MediumId>) -> bool {
        match blame {
            Blame::Transport | Blame::NoSpace => false,
            Blame::Medium => {
                if let Some(id) = medium {
                    self.medium_health_down(id);
                }
                false
            }
            Blame::Drive => self.drive_health_down(),
        }
    }

    fn medium_health_down(&self, id: &MediumId) {
        let current = match self.ctx.cache.lookup(id) {
            Some(current) => current,
            None => match self.ctx.store.lookup_medium(id) {
                Ok(medium) => Arc::new(medium),
                Err(err) => {
                    log::error!("unable to look up medium '{}' - {}", id, err);
                    return;
                }
            },
        };

        let mut updated = (*current).clone();
        updated.health = updated.health.saturating_sub(1);
        if updated.health == 0 && updated.admin_status != AdminStatus::Failed {
            log::warn!("medium '{}' died, admin-failing it", id);
            updated.admin_status = AdminStatus::Failed;
            self.publish_medium(updated);
            // release the cross-process lock before anything else
            // schedules this medium
            if let Err(err) = self
                .ctx
                .store
                .unlock_medium(id, &lock_owner(&self.ctx.device))
            {
                log::error!("unable to unlock dead medium '{}' - {}", id, err);
            }
        } else {
            self.publish_medium(updated);
        }
    }

    /// Returns true when the drive reached health 0 and must stop.
    fn drive_health_down(&self) -> bool {
        let device = &self.ctx.device;
        let (health, died) = {
            let mut state = device.lock();
            state.health = state.health.saturating_sub(1);
            let died = state.health == 0;
            if died {
                state.admin_status = AdminStatus::Failed;
                state.status = OperationalStatus::Failed;
                state.stopping = true;
            }
            (state.health, died)
        };

        let mut entry = device.entry.clone();
        entry.health = health;
        if died {
            entry.admin_status = AdminStatus::Failed;
        }
        if let Err(err) = self.ctx.store.update_device(&entry) {
            log::error!("{}: unable to persist device health - {}", device.id(), err);
        }

        if died {
            log::error!("drive '{}' died, admin-failing it", device.id());
            if let Err(err) = self
                .ctx
                .store
                .unlock_device(device.id(), &lock_owner(device))
            {
                log::error!("unable to unlock dead drive '{}' - {}", device.id(), err);
            }
        }

        died
    }

    /// Persist and republish a medium record; the current holder of
    /// the drive-uniqueness lock is the only writer.
    fn publish_medium(&self, medium: Medium) -> Arc<Medium> {
        if let Err(err) = self.ctx.store.update_medium(&medium) {
            log::error!("unable to persist medium '{}' - {}", medium.id, err);
        }
        let published = self.ctx.cache.insert(medium);

        // keep the drive's own reference current
        let mut state = self.ctx.device.lock();
        match &state.status {
            OperationalStatus::Loaded(loaded) if loaded.id == published.id => {
                state.status = OperationalStatus::Loaded(Arc::clone(&published));
            }
            OperationalStatus::Mounted(loaded, path) if loaded.id == published.id => {
                state.status =
                    OperationalStatus::Mounted(Arc::clone(&published), path.clone());
            }
            _ => {}
        }

        published
    }

    // === drive operations =====================================

    /// Unmount, if mounted. status ← loaded, mount path cleared.
    fn op_umount(&self) -> Result<(), OpError> {
        let device = &self.ctx.device;
        let (medium, path) = match &device.lock().status {
            OperationalStatus::Mounted(medium, path) => (Arc::clone(medium), path.clone()),
            _ => return Ok(()),
        };

        let result = self.ctx.fs.umount(&path);
        self.ctx.store.audit(
            AuditAction::LtfsUmount,
            &medium.id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );

        match result {
            Ok(()) => {
                device.lock().status = OperationalStatus::Loaded(medium);
                Ok(())
            }
            Err(err) => Err(OpError::drive(err)),
        }
    }

    /// Unload, if loaded; releases the medium's external lock and
    /// cache reference. status ← empty.
    fn op_unload(&self) -> Result<(), OpError> {
        // pending release obligations must hit storage before the
        // medium leaves the drive
        if !self.ctx.device.lock().sync_queue.is_empty() {
            self.do_sync();
        }

        self.op_umount()?;

        let device = &self.ctx.device;
        let medium = match &device.lock().status {
            OperationalStatus::Loaded(medium) => Arc::clone(medium),
            _ => return Ok(()),
        };

        let result = self
            .ctx
            .transport
            .lock()
            .unwrap()
            .unload_medium(device.id(), &medium.id);
        self.ctx.store.audit(
            AuditAction::DeviceUnload,
            &medium.id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        result?;

        device.lock().status = OperationalStatus::Empty;
        if let Err(err) = self
            .ctx
            .store
            .unlock_medium(&medium.id, &lock_owner(device))
        {
            log::error!("unable to unlock medium '{}' - {}", medium.id, err);
        }

        Ok(())
    }

    /// Swap `medium` into the (empty or occupied) drive. On success
    /// the new medium reference is published atomically, status ←
    /// loaded.
    fn op_load(&self, medium: Arc<Medium>) -> Result<(), OpError> {
        let device = &self.ctx.device;

        if device.holds_medium(&medium.id) {
            return Ok(());
        }

        self.op_unload()?;

        // every successful load takes the cross-process medium lock
        self.ctx
            .store
            .lock_medium(&medium.id, &lock_owner(device))
            .map_err(OpError::medium)?;

        let result = self
            .ctx
            .transport
            .lock()
            .unwrap()
            .load_medium(device.id(), &medium.id);
        self.ctx.store.audit(
            AuditAction::DeviceLoad,
            &medium.id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        if let Err(err) = result {
            let _ = self
                .ctx
                .store
                .unlock_medium(&medium.id, &lock_owner(device));
            return Err(err.into());
        }

        device.lock().status = OperationalStatus::Loaded(medium);
        Ok(())
    }

    /// Mount the loaded medium. status ← mounted.
    fn op_mount(&self) -> Result<PathBuf, OpError> {
        let device = &self.ctx.device;
        let medium = match &device.lock().status {
            OperationalStatus::Mounted(_, path) => return Ok(path.clone()),
            OperationalStatus::Loaded(medium) => Arc::clone(medium),
            _ => {
                return Err(OpError::drive(format_err!(
                    "mount without a loaded medium"
                )))
            }
        };

        let mount_path = super::mount_point(&self.ctx.mount_prefix, &device.entry.path);

        let result = self
            .ctx
            .fs
            .mount(&device.entry.path, &medium.id, &mount_path);
        self.ctx.store.audit(
            AuditAction::LtfsMount,
            &medium.id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        result.map_err(OpError::medium)?;

        device.lock().status = OperationalStatus::Mounted(medium, mount_path.clone());
        Ok(mount_path)
    }

    fn op_df(&self, mount_path: &std::path::Path) -> Result<crate::fs_adapter::FsUsage, OpError> {
        let result = self.ctx.fs.df(mount_path);
        self.ctx.store.audit(
            AuditAction::LtfsDf,
            &self.ctx.device.id().to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        result.map_err(OpError::drive)
    }

    /// Load the requested medium if not already there, ensure it is
    /// mounted, and for writes verify the mount is usable.
    ///
    /// Returns the (current) medium record, the mount path and the
    /// available size for writes.
    fn medium_switch_mount(
        &self,
        target: &Arc<Medium>,
        for_write: bool,
    ) -> Result<(Arc<Medium>, PathBuf, Option<u64>), OpError> {
        self.op_load(Arc::clone(target))?;
        let mount_path = self.op_mount()?;

        let mut avail = None;
        if for_write {
            let usage = self.op_df(&mount_path)?;
            if usage.read_only {
                // common for near-full tapes: flag the medium full so
                // the scheduler retries on another one
                let current = self
                    .ctx
                    .cache
                    .lookup(&target.id)
                    .unwrap_or_else(|| Arc::clone(target));
                let mut updated = (*current).clone();
                updated.fs.status = FsStatus::Full;
                updated.stats.phys_spc_free = 0;
                updated.stats.phys_spc_used = usage.used;
                self.publish_medium(updated);

                return Err(OpError::new(
                    Blame::NoSpace,
                    -libc::ENOSPC,
                    format_err!("medium '{}' mounted read-only", target.id),
                ));
            }
            avail = Some(usage.avail);
        }

        let current = self
            .ctx
            .cache
            .lookup(&target.id)
            .unwrap_or_else(|| Arc::clone(target));
        Ok((current, mount_path, avail))
    }

    // === sub-request dispatch =================================

    fn dispatch(&self, sub_request: SubRequest) {
        match sub_request.request.kind {
            lrs_api_types::RequestKind::Format => self.dispatch_format(sub_request),
            _ => self.dispatch_rw(sub_request),
        }
    }

    /// Free the drive after a sub-request reached a terminal state.
    fn clear_sub_request(&self, ongoing_io: bool) {
        let mut state = self.ctx.device.lock();
        state.sub_request = None;
        state.ongoing_scheduled = false;
        state.ongoing_io = ongoing_io;
    }

    fn dispatch_rw(&self, sub_request: SubRequest) {
        let request = &sub_request.request;

        let (target, io_kind) = {
            let guard = request.lock();
            let state = match &*guard {
                Payload::RwAlloc(state) => state,
                _ => {
                    log::error!("{:?}: not an allocation - dropping", sub_request);
                    drop(guard);
                    self.clear_sub_request(false);
                    return;
                }
            };
            match state.slots[sub_request.medium_index].medium.clone() {
                Some(medium) => (medium, state.io_kind),
                None => {
                    drop(guard);
                    log::error!("{:?}: no medium selected - failing", sub_request);
                    request.mark_failed(-libc::EINVAL);
                    self.emit_response(request);
                    self.clear_sub_request(false);
                    return;
                }
            }
        };

        match self.medium_switch_mount(&target, io_kind == IoRequestKind::Write) {
            Ok((medium, mount_path, avail)) => {
                self.health_success(Some(&medium.id));

                let all_done = {
                    let mut guard = request.lock();
                    let state = match &mut *guard {
                        Payload::RwAlloc(state) => state,
                        _ => unreachable!(),
                    };
                    let slot = &mut state.slots[sub_request.medium_index];
                    slot.medium = Some(Arc::clone(&medium));
                    slot.reply = Some(lrs_api_types::AllocSlotReply {
                        medium: medium.id.clone(),
                        root_path: mount_path.to_string_lossy().to_string(),
                        fs_type: medium.fs.fs_type,
                        addr_type: medium.fs.addr_type,
                        avail_size: avail,
                    });
                    slot.status = SlotStatus::Done;
                    state.all_done()
                };

                // the drive is held by the client until its release
                self.clear_sub_request(true);

                if all_done {
                    self.emit_response(request);
                }
            }
            Err(err) => self.dispatch_rw_failure(sub_request, io_kind, target, err),
        }
    }

    fn dispatch_rw_failure(
        &self,
        sub_request: SubRequest,
        io_kind: IoRequestKind,
        target: Arc<Medium>,
        err: OpError,
    ) {
        let request = Arc::clone(&sub_request.request);
        log::warn!("{:?} failed on '{}' - {}", sub_request, target.id, err.error);

        self.health_failure(err.blame, Some(&target.id));

        match err.blame {
            Blame::Transport => {
                // neither device nor medium blamed; requeue
                self.clear_sub_request(false);
                let _ = self.ctx.retry_tx.send(SubRequest {
                    failure_on_medium: false,
                    ..sub_request
                });
            }
            Blame::NoSpace => {
                // retried on another medium by the scheduler
                self.clear_sub_request(false);
                let _ = self.ctx.retry_tx.send(SubRequest {
                    failure_on_medium: true,
                    ..sub_request
                });
            }
            Blame::Medium => {
                let medium_dead = self
                    .ctx
                    .cache
                    .lookup(&target.id)
                    .map(|medium| medium.health == 0)
                    .unwrap_or(true);

                let may_retry = if io_kind == IoRequestKind::Read && medium_dead {
                    let guard = request.lock();
                    match &*guard {
                        Payload::RwAlloc(state) => {
                            state.usable_candidates() > state.n_required
                        }
                        _ => false,
                    }
                } else {
                    !medium_dead // transient medium error, try again
                };

                self.clear_sub_request(false);
                if may_retry {
                    let _ = self.ctx.retry_tx.send(SubRequest {
                        failure_on_medium: medium_dead,
                        ..sub_request
                    });
                } else {
                    request.mark_failed(err.errno);
                    self.emit_response(&request);
                }
            }
            Blame::Drive => {
                // the request retries elsewhere; this drive may be dead
                self.clear_sub_request(false);
                let _ = self.ctx.retry_tx.send(SubRequest {
                    failure_on_medium: false,
                    ..sub_request
                });
            }
        }
    }

    fn dispatch_format(&self, sub_request: SubRequest) {
        let request = Arc::clone(&sub_request.request);

        let spec = {
            let guard = request.lock();
            match &*guard {
                Payload::Format(state) => state.spec.clone(),
                _ => {
                    log::error!("{:?}: not a format request - dropping", sub_request);
                    drop(guard);
                    self.clear_sub_request(false);
                    return;
                }
            }
        };

        let result = self.format_medium(&spec);
        let target = spec.medium.clone();

        match result {
            Ok(()) => {
                self.health_success(Some(&target));
                if let Payload::Format(state) = &mut *request.lock() {
                    state.status = SlotStatus::Done;
                }
                self.clear_sub_request(false);
                self.finish_format(&target);
                self.emit_response(&request);
            }
            Err(err) => {
                log::warn!("{:?} failed on '{}' - {}", sub_request, target, err.error);
                self.health_failure(err.blame, Some(&target));

                self.clear_sub_request(false);
                if err.blame == Blame::Transport {
                    // requeued; the medium stays in the ongoing set
                    let _ = self.ctx.retry_tx.send(SubRequest {
                        failure_on_medium: false,
                        ..sub_request
                    });
                } else {
                    request.mark_failed(err.errno);
                    self.finish_format(&target);
                    self.emit_response(&request);
                }
            }
        }
    }

    fn finish_format(&self, medium: &MediumId) {
        self.ctx.ongoing_formats.lock().unwrap().remove(medium);
    }

    /// Swap the medium in (if needed), then create a fresh filesystem
    /// on it and reset the medium record.
    fn format_medium(&self, spec: &lrs_api_types::FormatRequest) -> Result<(), OpError> {
        let device = &self.ctx.device;

        if device.holds_medium(&spec.medium) {
            self.op_umount()?;
        } else {
            let medium = self
                .ctx
                .cache
                .acquire(self.ctx.store.as_ref(), &spec.medium)
                .map_err(OpError::medium)?;
            self.op_load(medium)?;
        }

        let label = spec.medium.name.clone();
        let result = self
            .ctx
            .fs
            .format(&device.entry.path, &spec.medium, &label);
        self.ctx.store.audit(
            AuditAction::LtfsFormat,
            &spec.medium.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        result.map_err(OpError::medium)?;

        // a quick mount/df/umount refreshes the physical numbers
        let mount_path = self.op_mount()?;
        let usage = self.op_df(&mount_path)?;
        self.op_umount()?;

        let current = match self.ctx.cache.lookup(&spec.medium) {
            Some(current) => current,
            None => {
                return Err(OpError::medium(format_err!(
                    "medium '{}' vanished from the cache",
                    spec.medium
                )))
            }
        };
        let mut updated = (*current).clone();
        updated.fs.label = Some(label);
        updated.fs.fs_type = spec.fs_type;
        updated.fs.status = FsStatus::Empty;
        updated.stats.nb_obj = 0;
        updated.stats.logical_spc_used = 0;
        updated.stats.phys_spc_used = usage.used;
        updated.stats.phys_spc_free = usage.avail;
        if spec.unlock && updated.admin_status == AdminStatus::Locked {
            updated.admin_status = AdminStatus::Unlocked;
        }
        self.publish_medium(updated);

        Ok(())
    }

    fn emit_response(&self, request: &Arc<crate::request::RequestContainer>) {
        if let Some(response) = request.try_take_response() {
            let _ = self.ctx.response_tx.send(response);
        }
    }

    // === sync flow ============================================

    /// Drain the sync queue: filesystem sync, store update, response
    /// emission for every ended release.
    fn do_sync(&self) {
        let device = &self.ctx.device;

        let (queue, medium, mount_path, state_only) = {
            let mut state = device.lock();
            let queue = std::mem::take(&mut state.sync_queue);
            state.needs_sync = false;
            let medium = state.status.medium().map(Arc::clone);
            let mount_path = state.status.mount_path().map(|path| path.to_owned());
            (queue, medium, mount_path, state.last_client_rc != 0)
        };

        if queue.is_empty() {
            return;
        }

        let sync_result = self.sync_storage(&queue, medium, mount_path, state_only);

        self.drain_sync_entries(queue, &sync_result);

        if state_only {
            // the client-side failure forces this device down once
            // everything is drained
            device.request_stop();
        }
    }

    /// The storage half of a sync: filesystem sync plus the store
    /// update of the written stats. Skipped entirely for state-only
    /// updates after a client-reported failure.
    fn sync_storage(
        &self,
        queue: &SyncQueue,
        medium: Option<Arc<Medium>>,
        mount_path: Option<PathBuf>,
        state_only: bool,
    ) -> Result<(), Error> {
        if state_only {
            return Ok(());
        }

        let medium =
            medium.ok_or_else(|| format_err!("sync queue without a loaded medium"))?;
        let mount_path =
            mount_path.ok_or_else(|| format_err!("sync queue without a mounted medium"))?;

        let result = self.ctx.fs.sync(&mount_path);
        self.ctx.store.audit(
            AuditAction::LtfsSync,
            &medium.id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );
        result?;

        let usage = self
            .op_df(&mount_path)
            .map_err(|err| err.error)?;

        let mut updated = (*medium).clone();
        updated.stats.logical_spc_used += queue.pending_size;
        updated.stats.nb_obj += queue.pending_extents;
        updated.stats.phys_spc_used = usage.used;
        updated.stats.phys_spc_free = usage.avail;
        if updated.fs.status == FsStatus::Empty && queue.pending_size > 0 {
            updated.fs.status = FsStatus::Used;
        }
        if usage.avail == 0 {
            updated.fs.status = FsStatus::Full;
        }
        for grouping in &queue.groupings_to_update {
            if !updated.groupings.iter().any(|have| have == grouping) {
                updated.groupings.push(grouping.clone());
            }
        }
        self.publish_medium(updated);

        self.health_success(Some(&medium.id));

        Ok(())
    }

    /// Set every queued entry terminal and post responses for parents
    /// that ended. A single error poisons the whole parent release.
    fn drain_sync_entries(&self, queue: SyncQueue, sync_result: &Result<(), Error>) {
        let device = &self.ctx.device;

        for SyncQueueEntry {
            request,
            medium_index,
            ..
        } in queue.entries
        {
            let (ended, partial, entry_ok) = {
                let mut guard = request.lock();
                let release = match &mut *guard {
                    Payload::Release(release) => release,
                    _ => continue,
                };

                let entry = &mut release.entries[medium_index];
                if !entry.status.is_terminal() {
                    entry.status = match sync_result {
                        Ok(()) if entry.spec.rc == 0 => SlotStatus::Done,
                        Ok(()) => {
                            // client-reported failure poisons the parent
                            if release.first_error.is_none() {
                                let rc = entry.spec.rc;
                                release.first_error =
                                    Some(if rc < 0 { rc } else { -rc });
                            }
                            SlotStatus::Error
                        }
                        Err(err) => {
                            log::error!("sync failed - {}", err);
                            if release.first_error.is_none() {
                                release.first_error = Some(-libc::EIO);
                            }
                            SlotStatus::Error
                        }
                    };
                }

                let entry_ok = release.entries[medium_index].status == SlotStatus::Done;
                (release.ended(), release.partial, entry_ok)
            };

            // the writer of a still-open (partial) session keeps its
            // claim on this drive; a final or failed release leaves
            // the drive free. Settled before the response is out so
            // no allocation races the open writer.
            device.lock().ongoing_io = partial && entry_ok;

            if ended {
                if let Some(response) = request.try_take_response() {
                    let _ = self.ctx.response_tx.send(response);
                }
            }
        }
    }

    // === shutdown =============================================

    /// Drain path once the loop decided to stop: unmount, unload,
    /// release the locks.
    fn shutdown(&self) {
        let device = &self.ctx.device;
        log::info!("device thread for '{}' stopping", device.id());

        if let Err(err) = self.op_unload() {
            log::error!(
                "{}: unable to unload during shutdown - {}",
                device.id(),
                err.error
            );
        }

        let entry = {
            let state = device.lock();
            let mut entry = device.entry.clone();
            entry.health = state.health;
            entry.admin_status = state.admin_status;
            entry
        };
        if let Err(err) = self.ctx.store.update_device(&entry) {
            log::error!("{}: unable to persist device row - {}", device.id(), err);
        }

        if entry.admin_status != AdminStatus::Failed {
            // a dead drive already dropped its lock
            if let Err(err) = self
                .ctx
                .store
                .unlock_device(device.id(), &lock_owner(device))
            {
                log::error!("unable to unlock drive '{}' - {}", device.id(), err);
            }
        }

        device.lock().stopped = true;
        device.signal();
    }
}
