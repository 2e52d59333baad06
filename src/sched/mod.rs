//! Scheduler thread
//!
//! Request intake, fan-out to the three per-request-type I/O
//! schedulers, periodic device dispatch, retry handling, and response
//! emission. One instance runs per process, with one worker thread
//! per drive underneath it.

pub mod dispatch;
pub mod fifo;
pub mod grouped_read;
pub mod io_sched;
pub mod priority;
pub mod release;

pub use dispatch::{compute_device_repartition, DeviceDispatcher, FairShare, NoDispatch};
pub use fifo::FifoScheduler;
pub use grouped_read::GroupedReadScheduler;
pub use io_sched::{Claim, ClaimOutcome, IoScheduler, SchedContext, SchedPeers};
pub use priority::{FifoNextRequest, PrioritySelector, RoundRobin};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;
use crossbeam_channel::{Receiver, Sender};

use lrs_api_types::{
    AdminStatus, DeviceId, IoRequestKind, IoSchedAlgo, MediumId, NotifyRequest, Request,
    RequestBody, RequestKind, Response, ResponseBody,
};
use lrs_config::LrsConfig;

use crate::cache::MediumCache;
use crate::device::{spawn_device_thread, Device, DeviceThreadContext};
use crate::fs_adapter::FsAdapter;
use crate::library::MediaTransport;
use crate::request::{Payload, RequestContainer, SlotStatus, SubRequest};
use crate::store::MetaStore;
use crate::{RUNNING, SCHED_IDLE_WAKEUP_MS};

fn make_io_sched(
    kind: IoRequestKind,
    algo: IoSchedAlgo,
    ctx: SchedContext,
    ordered: bool,
) -> Box<dyn IoScheduler> {
    match algo {
        IoSchedAlgo::Fifo => Box::new(FifoScheduler::new(kind, ctx)),
        IoSchedAlgo::GroupedRead if kind == IoRequestKind::Read => {
            Box::new(GroupedReadScheduler::new(ctx, ordered))
        }
        IoSchedAlgo::GroupedRead => {
            log::warn!("grouped_read only applies to reads, using fifo for {}", kind);
            Box::new(FifoScheduler::new(kind, ctx))
        }
    }
}

pub struct Scheduler {
    running: Arc<AtomicBool>,
    config: Arc<LrsConfig>,
    ctx: SchedContext,
    peers: SchedPeers,
    dispatcher: Box<dyn DeviceDispatcher>,
    selector: Box<dyn PrioritySelector>,
    transport: Arc<Mutex<Box<dyn MediaTransport>>>,
    fs: Arc<dyn FsAdapter>,
    request_rx: Receiver<Request>,
    retry_rx: Receiver<SubRequest>,
    retry_tx: Sender<SubRequest>,
    response_tx: Sender<Response>,
    ongoing_formats: Arc<Mutex<HashSet<MediumId>>>,
    device_threads: Vec<(DeviceId, std::thread::JoinHandle<()>)>,
    pending_retries: VecDeque<SubRequest>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<LrsConfig>,
        store: Arc<dyn MetaStore>,
        transport: Arc<Mutex<Box<dyn MediaTransport>>>,
        fs: Arc<dyn FsAdapter>,
        request_rx: Receiver<Request>,
        response_tx: Sender<Response>,
    ) -> Result<Self, Error> {
        let ctx = SchedContext {
            cache: Arc::new(MediumCache::new()),
            store,
            config: Arc::clone(&config),
            global_devices: Arc::new(Mutex::new(Vec::new())),
        };

        let peers = SchedPeers {
            read: Arc::new(Mutex::new(make_io_sched(
                IoRequestKind::Read,
                config.read_algo,
                ctx.clone(),
                config.ordered_grouped_read,
            ))),
            write: Arc::new(Mutex::new(make_io_sched(
                IoRequestKind::Write,
                config.write_algo,
                ctx.clone(),
                config.ordered_grouped_read,
            ))),
            format: Arc::new(Mutex::new(make_io_sched(
                IoRequestKind::Format,
                config.format_algo,
                ctx.clone(),
                config.ordered_grouped_read,
            ))),
        };

        let (retry_tx, retry_rx) = crossbeam_channel::unbounded();

        let mut this = Scheduler {
            running: Arc::new(AtomicBool::new(true)),
            dispatcher: dispatch::dispatcher_for(&config),
            selector: Box::new(FifoNextRequest),
            config,
            ctx,
            peers,
            transport,
            fs,
            request_rx,
            retry_rx,
            retry_tx,
            response_tx,
            ongoing_formats: Arc::new(Mutex::new(HashSet::new())),
            device_threads: Vec::new(),
            pending_retries: VecDeque::new(),
        };

        // the library transport comes up first: open it and take
        // stock of what is inside
        {
            let mut transport = this.transport.lock().unwrap();
            let library = transport.library().to_string();
            this.ctx
                .store
                .audit(crate::store::AuditAction::LibraryOpen, &library, None);
            match transport.scan() {
                Ok(media) => {
                    this.ctx
                        .store
                        .audit(crate::store::AuditAction::LibraryScan, &library, None);
                    log::info!("library '{}' holds {} media", library, media.len());
                }
                Err(err) => {
                    this.ctx.store.audit(
                        crate::store::AuditAction::LibraryScan,
                        &library,
                        Some(&err.to_string()),
                    );
                    log::warn!("unable to scan library '{}' - {}", library, err);
                }
            }
        }

        // bring up one worker thread per usable drive
        for entry in this.ctx.store.list_devices()? {
            if entry.admin_status != AdminStatus::Unlocked {
                log::info!("skipping drive '{}' ({})", entry.id, entry.admin_status);
                continue;
            }
            if let Err(err) = this.start_device(entry) {
                log::error!("unable to start drive - {}", err);
            }
        }

        Ok(this)
    }

    fn start_device(&mut self, entry: lrs_api_types::DeviceEntry) -> Result<(), Error> {
        self.ctx.store.audit(
            crate::store::AuditAction::DeviceLookup,
            &entry.id.to_string(),
            None,
        );

        let device = Device::new(entry);
        let id = device.id().clone();

        let handle = spawn_device_thread(DeviceThreadContext {
            device: Arc::clone(&device),
            cache: Arc::clone(&self.ctx.cache),
            store: Arc::clone(&self.ctx.store),
            transport: Arc::clone(&self.transport),
            fs: Arc::clone(&self.fs),
            tuning: self.config.family_tuning(id.family),
            mount_prefix: self.config.mount_prefix.clone(),
            response_tx: self.response_tx.clone(),
            retry_tx: self.retry_tx.clone(),
            ongoing_formats: Arc::clone(&self.ongoing_formats),
        })?;

        self.ctx.global_devices.lock().unwrap().push(device);
        self.device_threads.push((id, handle));
        Ok(())
    }

    fn keep_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && RUNNING.load(Ordering::SeqCst)
    }

    /// Run until shutdown is requested (or the request channel goes
    /// away).
    pub fn run(mut self) {
        log::info!(
            "scheduler running with {} drives",
            self.ctx.global_devices.lock().unwrap().len()
        );

        while self.keep_running() {
            let mut busy = false;

            loop {
                match self.request_rx.try_recv() {
                    Ok(request) => {
                        self.intake(request);
                        busy = true;
                    }
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            while let Ok(sub_request) = self.retry_rx.try_recv() {
                self.pending_retries.push_back(sub_request);
            }

            for _ in 0..self.pending_retries.len() {
                let sub_request = self.pending_retries.pop_front().unwrap();
                if self.handle_retry(sub_request.clone()) {
                    busy = true;
                } else {
                    self.pending_retries.push_back(sub_request);
                }
            }

            {
                let devices = self.ctx.global_devices.lock().unwrap().clone();
                self.dispatcher.dispatch(&self.peers, &devices, &self.config);
            }

            while self.serve_next() {
                busy = true;
            }

            self.collect_failed();

            if !busy && self.keep_running() {
                self.idle_wait();
            }
        }

        self.shutdown();
    }

    fn idle_wait(&mut self) {
        match self
            .request_rx
            .recv_timeout(Duration::from_millis(SCHED_IDLE_WAKEUP_MS))
        {
            Ok(request) => self.intake(request),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn respond(&self, response: Response) {
        let _ = self.response_tx.send(response);
    }

    fn intake(&mut self, request: Request) {
        let id = request.id.clone();
        let req_kind = request.body.kind();
        log::debug!("{}", request);

        match request.body {
            RequestBody::Notify(notify) => self.handle_notify(id, notify),
            RequestBody::Monitor => {
                let devices = self
                    .ctx
                    .global_devices
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|device| device.status_entry())
                    .collect();
                self.respond(Response {
                    id,
                    body: ResponseBody::Monitor { devices },
                });
            }
            body => {
                let container = match RequestContainer::new(Request {
                    id: id.clone(),
                    body,
                }) {
                    Ok(container) => Arc::new(container),
                    Err(err) => {
                        log::error!("invalid {} request {} - {}", req_kind, id, err);
                        self.respond(Response::error(id, req_kind, -libc::EINVAL));
                        return;
                    }
                };

                match container.kind {
                    RequestKind::Release => release::process_release_request(
                        &self.ctx,
                        container,
                        &self.response_tx,
                    ),
                    RequestKind::Format => self.intake_format(container),
                    _ => {
                        let io_kind = match container.kind {
                            RequestKind::Read => IoRequestKind::Read,
                            _ => IoRequestKind::Write,
                        };
                        self.peers
                            .get(io_kind)
                            .lock()
                            .unwrap()
                            .push_request(container);
                    }
                }
            }
        }
    }

    fn intake_format(&mut self, container: Arc<RequestContainer>) {
        let medium = match &*container.lock() {
            Payload::Format(state) => state.spec.medium.clone(),
            _ => unreachable!(),
        };

        // prevent duplicate format dispatch for the same medium
        if !self
            .ongoing_formats
            .lock()
            .unwrap()
            .insert(medium.clone())
        {
            log::warn!("medium '{}' is already being formatted", medium);
            self.respond(Response::error(
                container.id.clone(),
                RequestKind::Format,
                -libc::EBUSY,
            ));
            return;
        }

        self.peers
            .get(IoRequestKind::Format)
            .lock()
            .unwrap()
            .push_request(container);
    }

    fn handle_notify(&mut self, id: proxmox_uuid::Uuid, notify: NotifyRequest) {
        let result: Result<(), Error> = match notify {
            NotifyRequest::DeviceAdd { device } => self
                .ctx
                .store
                .lookup_device(&device)
                .and_then(|entry| self.start_device(entry)),
            NotifyRequest::DeviceRemove { device } => self.stop_device(&device),
            NotifyRequest::MediumUpdate { medium } => self
                .ctx
                .cache
                .update(self.ctx.store.as_ref(), &medium)
                .map(|_| ()),
        };

        match result {
            Ok(()) => self.respond(Response {
                id,
                body: ResponseBody::Notify,
            }),
            Err(err) => {
                log::error!("notify failed - {}", err);
                self.respond(Response::error(id, RequestKind::Notify, -libc::EINVAL));
            }
        }
    }

    fn stop_device(&mut self, id: &DeviceId) -> Result<(), Error> {
        let device = {
            let mut devices = self.ctx.global_devices.lock().unwrap();
            let pos = devices
                .iter()
                .position(|device| device.id() == id)
                .ok_or_else(|| anyhow::format_err!("no such drive '{}'", id))?;
            devices.remove(pos)
        };

        for kind in SchedPeers::kinds() {
            self.peers.get(kind).lock().unwrap().remove_device(id);
        }

        device.request_stop();
        if let Some(pos) = self
            .device_threads
            .iter()
            .position(|(have, _)| have == id)
        {
            let (_, handle) = self.device_threads.remove(pos);
            let _ = handle.join();
        }

        Ok(())
    }

    /// First sub-request slot not yet handed to a device.
    fn next_unassigned_slot(request: &Arc<RequestContainer>) -> Option<usize> {
        match &*request.lock() {
            Payload::RwAlloc(state) => state
                .slots
                .iter()
                .position(|slot| slot.status == SlotStatus::Todo && slot.medium.is_none()),
            Payload::Format(state) => {
                if state.status == SlotStatus::Todo {
                    Some(0)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Serve the next request picked by the priority selector.
    /// Returns true when at least one sub-request was placed.
    fn serve_next(&mut self) -> bool {
        let heads = [
            self.peers.read.lock().unwrap().peek_request(&self.peers),
            self.peers.write.lock().unwrap().peek_request(&self.peers),
            self.peers.format.lock().unwrap().peek_request(&self.peers),
        ];

        let kind = match self.selector.next_request(&heads) {
            Some(kind) => kind,
            None => return false,
        };
        let index = match kind {
            IoRequestKind::Read => 0,
            IoRequestKind::Write => 1,
            IoRequestKind::Format => 2,
        };
        let request = heads[index].clone().unwrap();

        if kind == IoRequestKind::Format {
            return self.serve_format(kind, request);
        }

        let sched = self.peers.get(kind);
        let mut placed = false;
        loop {
            let io_index = match Self::next_unassigned_slot(&request) {
                Some(io_index) => io_index,
                None => {
                    // fully dispatched, out of the queue it goes
                    let _ = sched.lock().unwrap().remove_request(&request);
                    return true;
                }
            };

            let pick =
                sched
                    .lock()
                    .unwrap()
                    .get_device_medium_pair(&self.peers, &request, io_index);
            match pick {
                Ok(Some(device)) => {
                    let assigned = device.assign_sub_request(SubRequest {
                        request: Arc::clone(&request),
                        medium_index: io_index,
                        failure_on_medium: false,
                    });
                    if assigned {
                        placed = true;
                        continue;
                    }
                    // the drive got busy since the pick; try again later
                    let _ = sched.lock().unwrap().requeue(Arc::clone(&request));
                    return placed;
                }
                Ok(None) => {
                    let _ = sched.lock().unwrap().requeue(Arc::clone(&request));
                    return placed;
                }
                Err(err) => {
                    log::warn!("{:?} failed to allocate - {}", request, err);
                    let errno = match kind {
                        IoRequestKind::Write => -libc::ENOSPC,
                        _ => -libc::ENODEV,
                    };
                    request.mark_failed(errno);
                    let _ = sched.lock().unwrap().remove_request(&request);
                    self.emit_ready_response(&request);
                    return true;
                }
            }
        }
    }

    fn serve_format(&mut self, kind: IoRequestKind, request: Arc<RequestContainer>) -> bool {
        let sched = self.peers.get(kind);

        let pick = sched
            .lock()
            .unwrap()
            .get_device_medium_pair(&self.peers, &request, 0);
        match pick {
            Ok(Some(device)) => {
                let assigned = device.assign_sub_request(SubRequest {
                    request: Arc::clone(&request),
                    medium_index: 0,
                    failure_on_medium: false,
                });
                if assigned {
                    let _ = sched.lock().unwrap().remove_request(&request);
                    return true;
                }
                let _ = sched.lock().unwrap().requeue(request);
                false
            }
            Ok(None) => {
                let _ = sched.lock().unwrap().requeue(request);
                false
            }
            Err(err) => {
                log::warn!("{:?} failed to allocate - {}", request, err);
                request.mark_failed(-libc::ENODEV);
                let _ = sched.lock().unwrap().remove_request(&request);
                if let Payload::Format(state) = &*request.lock() {
                    self.ongoing_formats
                        .lock()
                        .unwrap()
                        .remove(&state.spec.medium);
                }
                self.emit_ready_response(&request);
                true
            }
        }
    }

    /// Hand a failed sub-request back to its scheduler for another
    /// placement. Returns false to keep it pending.
    fn handle_retry(&mut self, sub_request: SubRequest) -> bool {
        let request = Arc::clone(&sub_request.request);
        if request.is_failed() || request.response_taken() {
            return true; // nothing left to do
        }

        let io_kind = match request.kind {
            RequestKind::Read => IoRequestKind::Read,
            RequestKind::Write => IoRequestKind::Write,
            RequestKind::Format => IoRequestKind::Format,
            _ => return true,
        };

        let result = self
            .peers
            .get(io_kind)
            .lock()
            .unwrap()
            .retry(&self.peers, &sub_request);

        match result {
            Ok(Some(device)) => device.assign_sub_request(SubRequest {
                failure_on_medium: false,
                ..sub_request
            }),
            Ok(None) => false,
            Err(err) => {
                log::warn!("{:?}: retry failed - {}", sub_request, err);
                let errno = match io_kind {
                    IoRequestKind::Write => -libc::ENOSPC,
                    _ => -libc::EIO,
                };
                request.mark_failed(errno);
                if io_kind == IoRequestKind::Format {
                    if let Payload::Format(state) = &*request.lock() {
                        self.ongoing_formats
                            .lock()
                            .unwrap()
                            .remove(&state.spec.medium);
                    }
                }
                self.emit_ready_response(&request);
                true
            }
        }
    }

    /// Emit error responses for requests the algorithms cancelled.
    fn collect_failed(&mut self) {
        for kind in SchedPeers::kinds() {
            let failed = self.peers.get(kind).lock().unwrap().take_failed();
            for request in failed {
                let _ = self.peers.get(kind).lock().unwrap().remove_request(&request);
                self.emit_ready_response(&request);
            }
        }
    }

    fn emit_ready_response(&self, request: &Arc<RequestContainer>) {
        if let Some(response) = request.try_take_response() {
            self.respond(response);
        }
    }

    /// Stop every device thread, draining their pending work.
    fn shutdown(&mut self) {
        log::info!("scheduler stopping");

        for device in self.ctx.global_devices.lock().unwrap().iter() {
            device.request_stop();
        }
        for (id, handle) in self.device_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("device thread for '{}' panicked", id);
            }
        }

        log::info!("scheduler stopped");
    }
}

/// A running scheduler and its client-side channel ends
pub struct SchedulerHandle {
    pub request_tx: Sender<Request>,
    pub response_rx: Receiver<Response>,
    running: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the scheduler (and all device
    /// threads) to drain and exit.
    pub fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        drop(self.request_tx);
        let _ = self.thread.join();
    }
}

/// Spin up the scheduler thread with its channels.
pub fn spawn_scheduler(
    config: Arc<LrsConfig>,
    store: Arc<dyn MetaStore>,
    transport: Arc<Mutex<Box<dyn MediaTransport>>>,
    fs: Arc<dyn FsAdapter>,
) -> Result<SchedulerHandle, Error> {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (response_tx, response_rx) = crossbeam_channel::unbounded();

    let scheduler = Scheduler::new(config, store, transport, fs, request_rx, response_tx)?;
    let running = Arc::clone(&scheduler.running);

    let thread = std::thread::Builder::new()
        .name("lrs-sched".to_string())
        .spawn(move || scheduler.run())?;

    Ok(SchedulerHandle {
        request_tx,
        response_rx,
        running,
        thread,
    })
}
