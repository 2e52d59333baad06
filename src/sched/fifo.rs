//! FIFO I/O scheduler
//!
//! Requests are served strictly in arrival order. Only the queue tail
//! may be removed or requeued; a requeue resets the allocation
//! progress and puts the element back at the head (the end of the
//! line). The retry cursor lives on the request and is deliberately
//! separate from the progress counter.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Error};

use lrs_api_types::{DeviceId, IoRequestKind, Medium, MediumId};

use crate::device::{Device, OperationalStatus};
use crate::request::{Payload, RequestContainer, SubRequest};
use crate::store::WriteMediumFilter;

use super::io_sched::{
    exchange_device, fetch_and_check_medium_info, find_free_device, pick_available_device,
    Claim, ClaimOutcome, IoScheduler, SchedContext, SchedPeers,
};

struct FifoElement {
    request: Arc<RequestContainer>,
    num_media_allocated: usize,
}

pub struct FifoScheduler {
    kind: IoRequestKind,
    ctx: SchedContext,
    owner_prefix: String,
    queue: VecDeque<FifoElement>,
    devices: Vec<Arc<Device>>,
}

impl FifoScheduler {
    pub fn new(kind: IoRequestKind, ctx: SchedContext) -> Self {
        FifoScheduler {
            kind,
            ctx,
            owner_prefix: crate::store::process_lock_owner(),
            queue: VecDeque::new(),
            devices: Vec::new(),
        }
    }

    fn tail_matches(&self, request: &Arc<RequestContainer>) -> bool {
        self.queue
            .back()
            .map(|element| Arc::ptr_eq(&element.request, request))
            .unwrap_or(false)
    }

    /// Media already picked for other slots of the same request.
    fn assigned_media(request: &Arc<RequestContainer>) -> Vec<MediumId> {
        match &*request.lock() {
            Payload::RwAlloc(state) => state
                .slots
                .iter()
                .filter_map(|slot| slot.medium.as_ref().map(|medium| medium.id.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Place a known medium on a drive: the drive already binding it
    /// wins (pulling it over from another scheduler if needed), then
    /// the empty/loaded/mounted policy applies.
    fn place_medium(
        &mut self,
        peers: &SchedPeers,
        medium: &Arc<Medium>,
    ) -> Result<Option<Arc<Device>>, Error> {
        if let Some(holder) = self.ctx.find_holder(&medium.id) {
            let mine = self
                .devices
                .iter()
                .any(|device| device.id() == holder.id());
            if mine {
                if holder.sched_ready() {
                    return Ok(Some(holder));
                }
                return Ok(None); // busy, wait for it
            }

            // the holder belongs to another scheduler: swap one of
            // our free drives for it
            let offered = match find_free_device(&self.devices) {
                Some(offered) => offered,
                None => return Ok(None),
            };
            return Ok(exchange_device(
                peers,
                self.kind,
                &mut self.devices,
                &holder,
                offered,
            ));
        }

        if let Some(device) = pick_available_device(&self.devices, &self.ctx.config, medium) {
            return Ok(Some(device));
        }

        if self.ctx.fleet_has_compatible(medium) {
            return Ok(None); // wait for the dispatcher to shuffle drives
        }

        bail!("no compatible drive for medium '{}'", medium.id);
    }

    /// Read/format selection: next unassigned candidate, starting at
    /// `start_index`.
    fn select_read_pair(
        &mut self,
        peers: &SchedPeers,
        request: &Arc<RequestContainer>,
        io_index: usize,
        start_index: usize,
    ) -> Result<Option<Arc<Device>>, Error> {
        let (candidates, assigned) = {
            let guard = request.lock();
            match &*guard {
                Payload::RwAlloc(state) => (
                    state.slots[io_index].candidates.clone(),
                    state
                        .slots
                        .iter()
                        .filter_map(|slot| {
                            slot.medium.as_ref().map(|medium| medium.id.clone())
                        })
                        .collect::<Vec<_>>(),
                ),
                Payload::Format(state) => (vec![state.spec.medium.clone()], Vec::new()),
                _ => bail!("not an I/O request"),
            }
        };

        let mut none_compatible = true;
        for candidate in candidates.iter().skip(start_index) {
            if assigned.contains(candidate) {
                continue;
            }
            let medium = match fetch_and_check_medium_info(
                &self.ctx,
                candidate,
                self.kind,
                &self.owner_prefix,
            )? {
                Some(medium) => medium,
                None => continue, // dead, locked away or unusable
            };

            match self.place_medium(peers, &medium) {
                Ok(Some(device)) => {
                    if let Payload::RwAlloc(state) = &mut *request.lock() {
                        state.slots[io_index].medium = Some(medium);
                    }
                    return Ok(Some(device));
                }
                Ok(None) => {
                    none_compatible = false;
                    // candidate is placeable later; a read may still
                    // prefer the next candidate right now
                    continue;
                }
                Err(_) => continue, // no compatible drive for this one
            }
        }

        if none_compatible {
            bail!("no compatible drive for any candidate medium");
        }
        Ok(None)
    }

    /// Write selection: mounted with space, loaded with space, then a
    /// store-side medium selection.
    fn select_write_pair(
        &mut self,
        request: &Arc<RequestContainer>,
        io_index: usize,
        extra_exclude: Option<&MediumId>,
    ) -> Result<Option<Arc<Device>>, Error> {
        let (family, spec) = {
            let guard = request.lock();
            match &*guard {
                Payload::RwAlloc(state) => (
                    state.family,
                    state.slots[io_index]
                        .write_spec
                        .clone()
                        .ok_or_else(|| anyhow::format_err!("write slot without spec"))?,
                ),
                _ => bail!("not a write request"),
            }
        };

        let mut exclude = Self::assigned_media(request);
        if let Some(id) = extra_exclude {
            exclude.push(id.clone());
        }

        let medium_fits = |medium: &Medium| {
            medium.is_writable()
                && medium.stats.phys_spc_free >= spec.size
                && !exclude.contains(&medium.id)
                && spec
                    .tags
                    .iter()
                    .all(|tag| medium.tags.iter().any(|have| have == tag))
        };

        // a drive already mounted (then loaded) on a fitting medium
        // avoids the swap entirely
        for want_mounted in [true, false] {
            for device in &self.devices {
                if !device.sched_ready() {
                    continue;
                }
                let fits = {
                    let state = device.lock();
                    let loaded = match &state.status {
                        OperationalStatus::Mounted(medium, _) if want_mounted => Some(medium),
                        OperationalStatus::Loaded(medium) if !want_mounted => Some(medium),
                        _ => None,
                    };
                    loaded.map(|medium| medium_fits(medium)).unwrap_or(false)
                };
                if fits {
                    let medium = device.loaded_medium().unwrap();
                    if let Payload::RwAlloc(state) = &mut *request.lock() {
                        state.slots[io_index].medium = Some(medium);
                    }
                    return Ok(Some(Arc::clone(device)));
                }
            }
        }

        // ask the store for a fresh medium
        let filter = WriteMediumFilter {
            family,
            required_size: spec.size,
            tags: &spec.tags,
            grouping: spec.grouping.as_deref(),
            exclude: &exclude,
        };
        let medium = match self.ctx.store.select_writable_medium(&filter)? {
            Some(medium) => self.ctx.cache.insert(medium),
            None => bail!("no writable medium matches the request"),
        };

        match pick_available_device(&self.devices, &self.ctx.config, &medium) {
            Some(device) => {
                if let Payload::RwAlloc(state) = &mut *request.lock() {
                    state.slots[io_index].medium = Some(medium);
                }
                Ok(Some(device))
            }
            None => {
                if self.ctx.fleet_has_compatible(&medium) {
                    Ok(None)
                } else {
                    bail!("no compatible drive for medium '{}'", medium.id)
                }
            }
        }
    }
}

impl IoScheduler for FifoScheduler {
    fn kind(&self) -> IoRequestKind {
        self.kind
    }

    fn push_request(&mut self, request: Arc<RequestContainer>) {
        self.queue.push_front(FifoElement {
            request,
            num_media_allocated: 0,
        });
    }

    fn peek_request(&mut self, _peers: &SchedPeers) -> Option<Arc<RequestContainer>> {
        self.queue
            .back()
            .map(|element| Arc::clone(&element.request))
    }

    fn remove_request(&mut self, request: &Arc<RequestContainer>) -> Result<(), Error> {
        if !self.tail_matches(request) {
            bail!("only the queue tail may be removed");
        }
        self.queue.pop_back();
        Ok(())
    }

    fn requeue(&mut self, request: Arc<RequestContainer>) -> Result<(), Error> {
        if !self.tail_matches(&request) {
            bail!("only the queue tail may be requeued");
        }
        let mut element = self.queue.pop_back().unwrap();
        element.num_media_allocated = 0;
        self.queue.push_front(element);
        Ok(())
    }

    fn get_device_medium_pair(
        &mut self,
        peers: &SchedPeers,
        request: &Arc<RequestContainer>,
        io_index: usize,
    ) -> Result<Option<Arc<Device>>, Error> {
        if !self.tail_matches(request) {
            bail!("only the queue tail may be allocated");
        }

        let device = match self.kind {
            IoRequestKind::Write => self.select_write_pair(request, io_index, None)?,
            _ => self.select_read_pair(peers, request, io_index, io_index)?,
        };

        if device.is_some() {
            if let Some(element) = self.queue.back_mut() {
                element.num_media_allocated = io_index + 1;
            }
        }
        Ok(device)
    }

    fn retry(
        &mut self,
        peers: &SchedPeers,
        sub_request: &SubRequest,
    ) -> Result<Option<Arc<Device>>, Error> {
        let request = &sub_request.request;

        match self.kind {
            IoRequestKind::Write if sub_request.failure_on_medium => {
                // pick another medium (e.g. after ENOSPC)
                let failed = match &*request.lock() {
                    Payload::RwAlloc(state) => state.slots[sub_request.medium_index]
                        .medium
                        .as_ref()
                        .map(|medium| medium.id.clone()),
                    _ => None,
                };
                self.select_write_pair(request, sub_request.medium_index, failed.as_ref())
            }
            IoRequestKind::Read if sub_request.failure_on_medium => {
                // start from the retry cursor, skipping spent media
                let cursor = {
                    let mut guard = request.lock();
                    match &mut *guard {
                        Payload::RwAlloc(state) => {
                            let cursor = state.retry_cursor;
                            if cursor
                                >= state.slots[sub_request.medium_index].candidates.len()
                            {
                                bail!("no retry candidates left");
                            }
                            state.retry_cursor += 1;
                            cursor
                        }
                        _ => bail!("not a read request"),
                    }
                };
                self.select_read_pair(peers, request, sub_request.medium_index, cursor)
            }
            _ => {
                // transport/drive hiccup: same medium, any usable drive
                let medium = match &*request.lock() {
                    Payload::RwAlloc(state) => {
                        state.slots[sub_request.medium_index].medium.clone()
                    }
                    Payload::Format(state) => self
                        .ctx
                        .cache
                        .lookup(&state.spec.medium)
                        .or_else(|| {
                            self.ctx
                                .cache
                                .acquire(self.ctx.store.as_ref(), &state.spec.medium)
                                .ok()
                        }),
                    _ => None,
                };
                match medium {
                    Some(medium) => self.place_medium(peers, &medium),
                    None => bail!("retry without a selected medium"),
                }
            }
        }
    }

    fn add_device(&mut self, device: Arc<Device>) {
        device.lock().io_mask.insert(self.kind.into());
        self.devices.push(device);
    }

    fn remove_device(&mut self, id: &DeviceId) -> Option<Arc<Device>> {
        let pos = self.devices.iter().position(|device| device.id() == id)?;
        let device = self.devices.remove(pos);
        device.lock().io_mask.remove(self.kind.into());
        Some(device)
    }

    fn get_device(&self, index: usize) -> Option<Arc<Device>> {
        self.devices.get(index).map(Arc::clone)
    }

    fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn claim_device(&mut self, claim: Claim) -> ClaimOutcome {
        let ready = |devices: &[Arc<Device>], wanted: &DeviceId| {
            devices
                .iter()
                .find(|device| device.id() == wanted)
                .map(|device| device.sched_ready())
                .unwrap_or(false)
        };

        match claim {
            Claim::Borrow { wanted } => {
                if !ready(&self.devices, &wanted) {
                    return ClaimOutcome::Refused;
                }
                match self.remove_device(&wanted) {
                    Some(device) => ClaimOutcome::Granted(device),
                    None => ClaimOutcome::Refused,
                }
            }
            Claim::Exchange { wanted, offered } => {
                if !ready(&self.devices, &wanted) {
                    return ClaimOutcome::Refused;
                }
                match self.remove_device(&wanted) {
                    Some(device) => {
                        self.add_device(offered);
                        ClaimOutcome::Granted(device)
                    }
                    None => ClaimOutcome::Refused,
                }
            }
            Claim::Take { wanted } => match self.remove_device(&wanted) {
                Some(device) => ClaimOutcome::Granted(device),
                None => ClaimOutcome::Refused,
            },
        }
    }

    fn request_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use anyhow::Error;
    use proxmox_uuid::Uuid;

    use lrs_api_types::{
        AddressType, AdminStatus, DeviceEntry, FsStatus, FsType, Medium, MediumStats,
        ReadAllocRequest, Request, RequestBody, ResourceFamily, WriteAllocRequest,
        WriteMediumSpec, HEALTH_MAX,
    };
    use lrs_config::LrsConfig;

    use crate::cache::MediumCache;
    use crate::device::{IoTypeMask, OperationalStatus};
    use crate::store::LocalStore;

    use super::*;

    fn create_testdir(name: &str) -> Result<PathBuf, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir)
    }

    fn medium_id(name: &str) -> MediumId {
        MediumId::new(ResourceFamily::Tape, name, "lib0")
    }

    fn test_medium(name: &str, free: u64) -> Medium {
        let mut medium = Medium::blank(medium_id(name), FsType::Ltfs, AddressType::Path);
        medium.fs.status = FsStatus::Used;
        medium.stats = MediumStats {
            phys_spc_free: free,
            ..Default::default()
        };
        medium
    }

    fn test_device(name: &str) -> Arc<Device> {
        Device::new(DeviceEntry {
            id: DeviceId::new(ResourceFamily::Tape, name, "lib0"),
            admin_status: AdminStatus::Unlocked,
            path: format!("/dev/{}", name),
            model: None,
            technology: None,
            health: HEALTH_MAX,
        })
    }

    fn create_ctx(name: &str, media: &[(&str, u64)]) -> Result<SchedContext, Error> {
        let testdir = create_testdir(name)?;
        let store = Arc::new(LocalStore::open(&testdir)?);
        for (medium, free) in media {
            store.insert_medium(&test_medium(medium, *free))?;
        }
        Ok(SchedContext {
            cache: Arc::new(MediumCache::new()),
            store,
            config: Arc::new(LrsConfig::default()),
            global_devices: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn make_peers(ctx: &SchedContext) -> SchedPeers {
        SchedPeers {
            read: Arc::new(Mutex::new(Box::new(FifoScheduler::new(
                IoRequestKind::Read,
                ctx.clone(),
            )) as Box<dyn IoScheduler>)),
            write: Arc::new(Mutex::new(Box::new(FifoScheduler::new(
                IoRequestKind::Write,
                ctx.clone(),
            )) as Box<dyn IoScheduler>)),
            format: Arc::new(Mutex::new(Box::new(FifoScheduler::new(
                IoRequestKind::Format,
                ctx.clone(),
            )) as Box<dyn IoScheduler>)),
        }
    }

    fn read_request(n_required: usize, candidates: &[&str]) -> Arc<RequestContainer> {
        Arc::new(
            RequestContainer::new(Request {
                id: Uuid::generate(),
                body: RequestBody::Read(ReadAllocRequest {
                    n_required,
                    media: candidates.iter().map(|name| medium_id(name)).collect(),
                }),
            })
            .unwrap(),
        )
    }

    fn write_request(size: u64) -> Arc<RequestContainer> {
        Arc::new(
            RequestContainer::new(Request {
                id: Uuid::generate(),
                body: RequestBody::Write(WriteAllocRequest {
                    family: ResourceFamily::Tape,
                    media: vec![WriteMediumSpec {
                        size,
                        tags: Vec::new(),
                        grouping: None,
                    }],
                }),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_queue_order_and_requeue() -> Result<(), Error> {
        let ctx = create_ctx("queue_order", &[])?;
        let peers = make_peers(&ctx);
        let mut sched = FifoScheduler::new(IoRequestKind::Read, ctx);

        let first = read_request(1, &["m1"]);
        let second = read_request(1, &["m1"]);
        sched.push_request(Arc::clone(&first));
        sched.push_request(Arc::clone(&second));

        // push prepends, peek returns the tail: arrival order wins
        let head = sched.peek_request(&peers).unwrap();
        assert!(Arc::ptr_eq(&head, &first));

        // only the tail may be removed or requeued
        assert!(sched.remove_request(&second).is_err());
        assert!(sched.requeue(Arc::clone(&second)).is_err());

        // a requeue re-heads the element: `second` becomes the tail
        sched.requeue(Arc::clone(&first))?;
        let head = sched.peek_request(&peers).unwrap();
        assert!(Arc::ptr_eq(&head, &second));

        // push + remove restores the queue length
        sched.remove_request(&second)?;
        assert_eq!(sched.request_count(), 1);

        Ok(())
    }

    #[test]
    fn test_read_exchange_pulls_loaded_drive() -> Result<(), Error> {
        // D1 free in the read scheduler, D2 in the write scheduler
        // and mounted on m1: the read scheduler trades D1 for D2
        let ctx = create_ctx("read_exchange", &[("m1", 1024)])?;
        let peers = make_peers(&ctx);

        let d1 = test_device("drive1");
        let d2 = test_device("drive2");
        let m1 = ctx.cache.acquire(ctx.store.as_ref(), &medium_id("m1"))?;
        d2.lock().status =
            OperationalStatus::Mounted(Arc::clone(&m1), PathBuf::from("/mnt/lrs/drive2"));
        {
            let mut global = ctx.global_devices.lock().unwrap();
            global.push(Arc::clone(&d1));
            global.push(Arc::clone(&d2));
        }
        peers.write.lock().unwrap().add_device(Arc::clone(&d2));

        let mut sched = FifoScheduler::new(IoRequestKind::Read, ctx);
        sched.add_device(Arc::clone(&d1));

        let request = read_request(1, &["m1"]);
        sched.push_request(Arc::clone(&request));

        let picked = sched
            .get_device_medium_pair(&peers, &request, 0)?
            .expect("expected a device");
        assert_eq!(picked.id(), d2.id());

        // D2 now serves reads, D1 went to the write scheduler
        assert!(d2.lock().io_mask.contains(IoTypeMask::READ));
        assert!(!d2.lock().io_mask.contains(IoTypeMask::WRITE));
        assert!(d1.lock().io_mask.contains(IoTypeMask::WRITE));
        assert_eq!(sched.devices().len(), 1);
        assert_eq!(peers.write.lock().unwrap().devices().len(), 1);

        Ok(())
    }

    #[test]
    fn test_write_prefers_mounted_medium() -> Result<(), Error> {
        let ctx = create_ctx("write_mounted", &[("m1", 1 << 30), ("m2", 1 << 40)])?;
        let peers = make_peers(&ctx);
        let mut sched = FifoScheduler::new(IoRequestKind::Write, ctx.clone());

        let device = test_device("drive1");
        let m1 = ctx.cache.acquire(ctx.store.as_ref(), &medium_id("m1"))?;
        device.lock().status =
            OperationalStatus::Mounted(Arc::clone(&m1), PathBuf::from("/mnt/lrs/drive1"));
        ctx.global_devices
            .lock()
            .unwrap()
            .push(Arc::clone(&device));
        sched.add_device(Arc::clone(&device));

        // fits on the mounted medium: no store-side selection, no swap
        let request = write_request(512 << 20);
        sched.push_request(Arc::clone(&request));
        let picked = sched
            .get_device_medium_pair(&peers, &request, 0)?
            .expect("expected a device");
        assert_eq!(picked.id(), device.id());
        match &*request.lock() {
            Payload::RwAlloc(state) => {
                assert_eq!(state.slots[0].medium.as_ref().unwrap().id, medium_id("m1"));
            }
            _ => unreachable!(),
        }
        sched.remove_request(&request)?;

        // too big for the mounted medium: the store picks m2 and the
        // drive gets a media swap
        let request = write_request(1 << 35);
        sched.push_request(Arc::clone(&request));
        let picked = sched
            .get_device_medium_pair(&peers, &request, 0)?
            .expect("expected a device");
        assert_eq!(picked.id(), device.id());
        match &*request.lock() {
            Payload::RwAlloc(state) => {
                assert_eq!(state.slots[0].medium.as_ref().unwrap().id, medium_id("m2"));
            }
            _ => unreachable!(),
        }

        Ok(())
    }

    #[test]
    fn test_read_retry_cursor_skips_spent_media() -> Result<(), Error> {
        let ctx = create_ctx(
            "retry_cursor",
            &[("m1", 1024), ("m2", 1024), ("m3", 1024)],
        )?;
        let peers = make_peers(&ctx);
        let mut sched = FifoScheduler::new(IoRequestKind::Read, ctx.clone());

        let device = test_device("drive1");
        ctx.global_devices
            .lock()
            .unwrap()
            .push(Arc::clone(&device));
        sched.add_device(Arc::clone(&device));

        let request = read_request(1, &["m1", "m2", "m3"]);
        sched.push_request(Arc::clone(&request));

        let picked = sched.get_device_medium_pair(&peers, &request, 0)?;
        assert!(picked.is_some());

        // the first attempt failed on its medium; the retry cursor
        // starts past n_required and picks m2
        let sub_request = SubRequest {
            request: Arc::clone(&request),
            medium_index: 0,
            failure_on_medium: true,
        };
        let picked = sched.retry(&peers, &sub_request)?;
        assert!(picked.is_some());
        match &*request.lock() {
            Payload::RwAlloc(state) => {
                assert_eq!(state.slots[0].medium.as_ref().unwrap().id, medium_id("m2"));
                assert_eq!(state.retry_cursor, 2);
            }
            _ => unreachable!(),
        }

        let picked = sched.retry(&peers, &sub_request)?;
        assert!(picked.is_some());

        // out of candidates
        assert!(sched.retry(&peers, &sub_request).is_err());

        Ok(())
    }
}
