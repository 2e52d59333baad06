//! Grouped-read I/O scheduler
//!
//! Minimises tape swaps when many read requests target overlapping
//! media sets. Every candidate medium gets its own request queue; all
//! queue elements of one request share a single `{used, free}` pair,
//! so serving the request through one medium marks the others as
//! peers to sweep. Queues get associated to the drive serving them
//! and drain in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use lrs_api_types::{DeviceId, IoRequestKind, Medium, MediumId};

use crate::device::{Device, IoTypeMask};
use crate::request::{Payload, RequestContainer, SlotStatus, SubRequest};

use super::io_sched::{
    exchange_device, fetch_and_check_medium_info, find_free_device, pick_available_device,
    Claim, ClaimOutcome, IoScheduler, SchedContext, SchedPeers,
};

/// Which candidate media of one request are spent (`used`) and which
/// are still available for allocation or retry (`free`). Shared by
/// all queue elements of the request.
struct AllocPair {
    used: Vec<MediumId>,
    free: Vec<MediumId>,
}

impl AllocPair {
    fn mark_used(&mut self, id: &MediumId) {
        if let Some(pos) = self.free.iter().position(|have| have == id) {
            self.free.remove(pos);
            self.used.push(id.clone());
        }
    }

    fn mark_free(&mut self, id: &MediumId) {
        if let Some(pos) = self.used.iter().position(|have| have == id) {
            self.used.remove(pos);
            self.free.push(id.clone());
        }
    }
}

struct QueueElement {
    request: Arc<RequestContainer>,
    pair: Arc<Mutex<AllocPair>>,
}

/// Per-medium request queue
struct MediumQueue {
    medium: Arc<Medium>,
    queue: VecDeque<QueueElement>,
    /// Drive currently serving this queue
    device: Option<Arc<Device>>,
}

pub struct GroupedReadScheduler {
    ctx: SchedContext,
    /// Order queue elements by request age instead of insertion order
    ordered: bool,
    owner_prefix: String,
    queues: HashMap<MediumId, MediumQueue>,
    devices: Vec<Arc<Device>>,
    /// Request id -> shared pair, for sweeps and retries. Entries
    /// outlive queue membership: a dispatched request may still come
    /// back through `retry`.
    pairs: HashMap<String, (Arc<RequestContainer>, Arc<Mutex<AllocPair>>)>,
    /// Requests cancelled inside the algorithm (e.g. `-ENODEV`),
    /// picked up by the scheduler thread
    failed: Vec<Arc<RequestContainer>>,
    /// Ids of requests currently queued
    queued: HashSet<String>,
}

impl GroupedReadScheduler {
    pub fn new(ctx: SchedContext, ordered: bool) -> Self {
        GroupedReadScheduler {
            ctx,
            ordered,
            owner_prefix: crate::store::process_lock_owner(),
            queues: HashMap::new(),
            devices: Vec::new(),
            pairs: HashMap::new(),
            failed: Vec::new(),
            queued: HashSet::new(),
        }
    }

    fn insert_element(&mut self, medium: &MediumId, element: QueueElement) {
        let ordered = self.ordered;
        let queue = match self.queues.get_mut(medium) {
            Some(queue) => queue,
            None => return,
        };
        if ordered {
            let pos = queue
                .queue
                .iter()
                .position(|peer| peer.request.arrived > element.request.arrived)
                .unwrap_or(queue.queue.len());
            queue.queue.insert(pos, element);
        } else {
            queue.queue.push_back(element);
        }
    }

    fn associate(&mut self, medium: &MediumId, device: Arc<Device>) {
        // one queue per drive; drop the drive's previous association
        let previous: Vec<MediumId> = self
            .queues
            .iter()
            .filter(|(id, queue)| {
                *id != medium
                    && queue
                        .device
                        .as_ref()
                        .map(|have| have.id() == device.id())
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in previous {
            if let Some(queue) = self.queues.get_mut(&id) {
                queue.device = None;
            }
        }

        if let Some(queue) = self.queues.get_mut(medium) {
            queue.device = Some(device);
        }
    }

    fn ready_device_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|device| device.sched_ready())
            .count()
    }

    /// Sub-requests of `request` still waiting for a medium.
    fn unassigned_slots(request: &Arc<RequestContainer>) -> usize {
        match &*request.lock() {
            Payload::RwAlloc(state) => state
                .slots
                .iter()
                .filter(|slot| slot.status == SlotStatus::Todo && slot.medium.is_none())
                .count(),
            _ => 0,
        }
    }

    /// Drop stale heads (failed requests) from a queue.
    fn prune_queue(queue: &mut MediumQueue) {
        while let Some(front) = queue.queue.front() {
            if front.request.is_failed() || front.request.response_taken() {
                queue.queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Find (or win by exchange) a drive able to serve `medium`.
    fn place_queue_device(
        &mut self,
        peers: &SchedPeers,
        medium: &Arc<Medium>,
    ) -> Option<Arc<Device>> {
        if let Some(holder) = self.ctx.find_holder(&medium.id) {
            let mine = self
                .devices
                .iter()
                .any(|device| device.id() == holder.id());
            if mine {
                if holder.sched_ready() {
                    return Some(holder);
                }
                return None;
            }
            let offered = find_free_device(&self.devices)?;
            return exchange_device(
                peers,
                IoRequestKind::Read,
                &mut self.devices,
                &holder,
                offered,
            );
        }

        pick_available_device(&self.devices, &self.ctx.config, medium)
    }

    /// Cancel or relocate every element of a queue nothing can mount.
    fn handle_incompatible_queue(&mut self, medium: &MediumId) {
        let mut queue = match self.queues.remove(medium) {
            Some(queue) => queue,
            None => return,
        };

        log::warn!("no compatible drive for medium '{}'", medium);

        while let Some(element) = queue.queue.pop_front() {
            let other_candidates = {
                let mut pair = element.pair.lock().unwrap();
                pair.mark_used(medium); // never try this one again
                !pair.free.is_empty()
            };
            if other_candidates {
                continue; // the element lives on in its peer queues
            }
            // out of candidates: cancel with -ENODEV
            element.request.mark_failed(-libc::ENODEV);
            self.failed.push(element.request);
        }
    }
}

impl IoScheduler for GroupedReadScheduler {
    fn kind(&self) -> IoRequestKind {
        IoRequestKind::Read
    }

    fn push_request(&mut self, request: Arc<RequestContainer>) {
        let candidates = match &*request.lock() {
            Payload::RwAlloc(state) => state.slots[0].candidates.clone(),
            _ => {
                request.mark_failed(-libc::EINVAL);
                self.failed.push(request);
                return;
            }
        };

        let pair = Arc::new(Mutex::new(AllocPair {
            used: Vec::new(),
            free: candidates.clone(),
        }));

        let mut usable = 0;
        for candidate in &candidates {
            if !self.queues.contains_key(candidate) {
                match fetch_and_check_medium_info(
                    &self.ctx,
                    candidate,
                    IoRequestKind::Read,
                    &self.owner_prefix,
                ) {
                    Ok(Some(medium)) => {
                        self.queues.insert(
                            candidate.clone(),
                            MediumQueue {
                                medium,
                                queue: VecDeque::new(),
                                device: None,
                            },
                        );
                    }
                    _ => {
                        pair.lock().unwrap().mark_used(candidate);
                        continue;
                    }
                }
            }
            self.insert_element(
                candidate,
                QueueElement {
                    request: Arc::clone(&request),
                    pair: Arc::clone(&pair),
                },
            );
            usable += 1;
        }

        if usable == 0 {
            request.mark_failed(-libc::ENODEV);
            self.failed.push(request);
            return;
        }

        self.queued.insert(request.id.to_string());
        self.pairs
            .insert(request.id.to_string(), (Arc::clone(&request), pair));
    }

    fn peek_request(&mut self, peers: &SchedPeers) -> Option<Arc<RequestContainer>> {
        // drop pairs of requests that reached their terminal state
        self.pairs
            .retain(|_, (request, _)| !request.response_taken() && !request.is_failed());

        // 1. a device-associated queue whose head is allocatable now
        let ready = self.ready_device_count();
        let associated: Vec<MediumId> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.device.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &associated {
            if let Some(queue) = self.queues.get_mut(id) {
                Self::prune_queue(queue);
                if let Some(front) = queue.queue.front() {
                    let request = Arc::clone(&front.request);
                    if Self::unassigned_slots(&request) <= ready {
                        return Some(request);
                    }
                }
            }
        }

        // 2. find a new queue worth serving; queues whose medium is
        // already loaded in one of our drives come first
        let mut unassociated: Vec<MediumId> = Vec::new();
        for (id, queue) in self.queues.iter_mut() {
            Self::prune_queue(queue);
            if queue.device.is_none() && !queue.queue.is_empty() {
                unassociated.push(id.clone());
            }
        }
        unassociated.sort_by_key(|id| {
            let loaded_here = self
                .devices
                .iter()
                .any(|device| device.holds_medium(id));
            !loaded_here // loaded media first
        });

        let mut incompatible = Vec::new();
        let mut found = None;
        for id in unassociated {
            let medium = match self.queues.get(&id) {
                Some(queue) => Arc::clone(&queue.medium),
                None => continue,
            };
            match self.place_queue_device(peers, &medium) {
                Some(device) => {
                    self.associate(&id, Arc::clone(&device));
                    found = self
                        .queues
                        .get(&id)
                        .and_then(|queue| queue.queue.front())
                        .map(|front| Arc::clone(&front.request));
                    break;
                }
                None => {
                    if !self.ctx.fleet_has_compatible(&medium) {
                        incompatible.push(id);
                    }
                }
            }
        }

        for id in incompatible {
            self.handle_incompatible_queue(&id);
        }

        found
    }

    fn remove_request(&mut self, request: &Arc<RequestContainer>) -> Result<(), Error> {
        let key = request.id.to_string();
        if !self.queued.remove(&key) {
            bail!("request {} is not queued here", request.id);
        }
        let pair = match self.pairs.get(&key) {
            Some((_, pair)) => Arc::clone(pair),
            None => bail!("request {} has no allocation state", request.id),
        };
        if request.response_taken() || request.is_failed() {
            self.pairs.remove(&key);
        }

        // sweep every peer queue element through the shared pair
        let media: Vec<MediumId> = {
            let pair = pair.lock().unwrap();
            pair.used.iter().chain(pair.free.iter()).cloned().collect()
        };
        for id in media {
            if let Some(queue) = self.queues.get_mut(&id) {
                queue
                    .queue
                    .retain(|element| !Arc::ptr_eq(&element.request, request));
                if queue.queue.is_empty() && queue.device.is_none() {
                    self.queues.remove(&id);
                }
            }
        }

        Ok(())
    }

    fn requeue(&mut self, request: Arc<RequestContainer>) -> Result<(), Error> {
        let pair = match self.pairs.get(&request.id.to_string()) {
            Some((_, pair)) => Arc::clone(pair),
            None => bail!("request {} is not queued here", request.id),
        };

        // allocation progress is reset: spent media become free again
        // and the element returns to their queues
        let spent: Vec<MediumId> = {
            let mut guard = pair.lock().unwrap();
            let spent = guard.used.clone();
            for id in &spent {
                guard.mark_free(id);
            }
            spent
        };

        if let Payload::RwAlloc(state) = &mut *request.lock() {
            for slot in state.slots.iter_mut() {
                if slot.status == SlotStatus::Todo {
                    slot.medium = None;
                }
            }
        }

        for id in spent {
            if self.queues.contains_key(&id) {
                self.insert_element(
                    &id,
                    QueueElement {
                        request: Arc::clone(&request),
                        pair: Arc::clone(&pair),
                    },
                );
            }
        }

        Ok(())
    }

    fn get_device_medium_pair(
        &mut self,
        peers: &SchedPeers,
        request: &Arc<RequestContainer>,
        io_index: usize,
    ) -> Result<Option<Arc<Device>>, Error> {
        // queues whose first element belongs to this request;
        // already-associated ones preferred
        let mut fallback = None;
        let mut chosen = None;
        for (id, queue) in self.queues.iter() {
            let heads_here = queue
                .queue
                .front()
                .map(|front| Arc::ptr_eq(&front.request, request))
                .unwrap_or(false);
            if !heads_here {
                continue;
            }
            match &queue.device {
                Some(device) if device.sched_ready() => {
                    chosen = Some((id.clone(), Arc::clone(device)));
                    break;
                }
                Some(_) => {}
                None => {
                    if fallback.is_none() {
                        fallback = Some(id.clone());
                    }
                }
            }
        }

        if chosen.is_none() {
            if let Some(id) = fallback {
                let medium = self
                    .queues
                    .get(&id)
                    .map(|queue| Arc::clone(&queue.medium))
                    .unwrap();
                if let Some(device) = self.place_queue_device(peers, &medium) {
                    self.associate(&id, Arc::clone(&device));
                    chosen = Some((id, device));
                }
            }
        }

        let (medium_id, device) = match chosen {
            Some(chosen) => chosen,
            None => return Ok(None),
        };

        // serve: pop the element, mark the medium used
        let medium = {
            let queue = self.queues.get_mut(&medium_id).unwrap();
            let element = queue.queue.pop_front().unwrap();
            element.pair.lock().unwrap().mark_used(&medium_id);
            Arc::clone(&queue.medium)
        };

        if let Payload::RwAlloc(state) = &mut *request.lock() {
            state.slots[io_index].medium = Some(medium);
        }

        Ok(Some(device))
    }

    fn retry(
        &mut self,
        peers: &SchedPeers,
        sub_request: &SubRequest,
    ) -> Result<Option<Arc<Device>>, Error> {
        let request = &sub_request.request;
        let pair = match self.pairs.get(&request.id.to_string()) {
            Some((_, pair)) => Arc::clone(pair),
            None => bail!("request {} is not queued here", request.id),
        };

        let tried = match &*request.lock() {
            Payload::RwAlloc(state) => state.slots[sub_request.medium_index]
                .medium
                .as_ref()
                .map(|medium| medium.id.clone()),
            _ => None,
        };

        let candidates: Vec<MediumId> = pair.lock().unwrap().free.clone();

        // 1. an already-associated, available queue
        // 2. the longest queue with an available device
        let mut best: Option<(usize, MediumId, Arc<Device>)> = None;
        for id in &candidates {
            let queue = match self.queues.get(id) {
                Some(queue) => queue,
                None => continue,
            };
            if let Some(device) = &queue.device {
                if device.sched_ready() {
                    best = Some((usize::MAX, id.clone(), Arc::clone(device)));
                    break;
                }
            }
            if let Some(device) =
                pick_available_device(&self.devices, &self.ctx.config, &queue.medium)
            {
                let len = queue.queue.len();
                match &best {
                    Some((best_len, ..)) if *best_len >= len => {}
                    _ => best = Some((len, id.clone(), device)),
                }
            }
        }

        if let Some((_, id, device)) = best {
            let medium = self
                .queues
                .get_mut(&id)
                .map(|queue| {
                    queue
                        .queue
                        .retain(|element| !Arc::ptr_eq(&element.request, request));
                    Arc::clone(&queue.medium)
                })
                .unwrap();
            pair.lock().unwrap().mark_used(&id);
            self.associate(&id, Arc::clone(&device));
            if let Payload::RwAlloc(state) = &mut *request.lock() {
                state.slots[sub_request.medium_index].medium = Some(medium);
            }
            return Ok(Some(device));
        }

        // 3. default to the medium that was just tried, if healthy
        if !sub_request.failure_on_medium {
            if let Some(id) = tried {
                if let Some(medium) = self.ctx.cache.lookup(&id) {
                    if medium.health > 0 {
                        if let Some(device) = self.place_queue_device(peers, &medium) {
                            return Ok(Some(device));
                        }
                    }
                }
            }
        }

        // 4. the first fresh candidate has to wait for a drive
        Ok(None)
    }

    fn add_device(&mut self, device: Arc<Device>) {
        device.lock().io_mask.insert(IoTypeMask::READ);
        self.devices.push(device);
    }

    fn remove_device(&mut self, id: &DeviceId) -> Option<Arc<Device>> {
        let pos = self.devices.iter().position(|device| device.id() == id)?;
        let device = self.devices.remove(pos);
        device.lock().io_mask.remove(IoTypeMask::READ);

        // drop any queue association
        for queue in self.queues.values_mut() {
            if queue
                .device
                .as_ref()
                .map(|have| have.id() == id)
                .unwrap_or(false)
            {
                queue.device = None;
            }
        }

        Some(device)
    }

    fn get_device(&self, index: usize) -> Option<Arc<Device>> {
        self.devices.get(index).map(Arc::clone)
    }

    fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn claim_device(&mut self, claim: Claim) -> ClaimOutcome {
        let association_busy = |this: &Self, wanted: &DeviceId| {
            this.queues.values().any(|queue| {
                queue
                    .device
                    .as_ref()
                    .map(|have| have.id() == wanted)
                    .unwrap_or(false)
                    && !queue.queue.is_empty()
            })
        };

        match claim {
            Claim::Borrow { wanted } => {
                if association_busy(self, &wanted) {
                    return ClaimOutcome::Refused;
                }
                match self.remove_device(&wanted) {
                    Some(device) if device.sched_ready() => ClaimOutcome::Granted(device),
                    Some(device) => {
                        // not actually free; put it back
                        self.add_device(device);
                        ClaimOutcome::Refused
                    }
                    None => ClaimOutcome::Refused,
                }
            }
            Claim::Exchange { wanted, offered } => {
                // refused while the device still has work queued
                if association_busy(self, &wanted) {
                    return ClaimOutcome::Refused;
                }
                match self.remove_device(&wanted) {
                    Some(device) if device.sched_ready() => {
                        self.add_device(offered);
                        ClaimOutcome::Granted(device)
                    }
                    Some(device) => {
                        self.add_device(device);
                        ClaimOutcome::Refused
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
        self.queued.len()
    }

    fn take_failed(&mut self) -> Vec<Arc<RequestContainer>> {
        std::mem::take(&mut self.failed)
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use anyhow::Error;
    use proxmox_uuid::Uuid;

    use lrs_api_types::{
        AddressType, AdminStatus, DeviceEntry, FsStatus, FsType, Medium, ReadAllocRequest,
        Request, RequestBody, ResourceFamily, HEALTH_MAX,
    };
    use lrs_config::LrsConfig;

    use crate::cache::MediumCache;
    use crate::device::OperationalStatus;
    use crate::sched::fifo::FifoScheduler;
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

    fn test_medium(name: &str) -> Medium {
        let mut medium = Medium::blank(medium_id(name), FsType::Ltfs, AddressType::Path);
        medium.fs.status = FsStatus::Used;
        medium
    }

    fn test_device(name: &str) -> Arc<Device> {
        Device::new(DeviceEntry {
            id: lrs_api_types::DeviceId::new(ResourceFamily::Tape, name, "lib0"),
            admin_status: AdminStatus::Unlocked,
            path: format!("/dev/{}", name),
            model: None,
            technology: None,
            health: HEALTH_MAX,
        })
    }

    struct TestBed {
        ctx: SchedContext,
        peers: SchedPeers,
    }

    fn create_testbed(name: &str, media: &[&str]) -> Result<TestBed, Error> {
        let testdir = create_testdir(name)?;
        let store = Arc::new(LocalStore::open(&testdir)?);
        for medium in media {
            store.insert_medium(&test_medium(medium))?;
        }

        let ctx = SchedContext {
            cache: Arc::new(MediumCache::new()),
            store,
            config: Arc::new(LrsConfig::default()),
            global_devices: Arc::new(Mutex::new(Vec::new())),
        };

        let peers = SchedPeers {
            read: Arc::new(Mutex::new(Box::new(GroupedReadScheduler::new(
                ctx.clone(),
                false,
            )) as Box<dyn IoScheduler>)),
            write: Arc::new(Mutex::new(Box::new(FifoScheduler::new(
                IoRequestKind::Write,
                ctx.clone(),
            )) as Box<dyn IoScheduler>)),
            format: Arc::new(Mutex::new(Box::new(FifoScheduler::new(
                IoRequestKind::Format,
                ctx.clone(),
            )) as Box<dyn IoScheduler>)),
        };

        Ok(TestBed { ctx, peers })
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

    fn queue_len(sched: &GroupedReadScheduler, medium: &str) -> usize {
        sched
            .queues
            .get(&medium_id(medium))
            .map(|queue| queue.queue.len())
            .unwrap_or(0)
    }

    #[test]
    fn test_push_remove_restores_peer_queues() -> Result<(), Error> {
        let bed = create_testbed("push_remove", &["m1", "m2", "m3"])?;
        let mut sched = GroupedReadScheduler::new(bed.ctx.clone(), false);

        let r1 = read_request(1, &["m1", "m2"]);
        let r2 = read_request(1, &["m2", "m3"]);
        sched.push_request(Arc::clone(&r1));
        sched.push_request(Arc::clone(&r2));

        assert_eq!(sched.request_count(), 2);
        assert_eq!(queue_len(&sched, "m1"), 1);
        assert_eq!(queue_len(&sched, "m2"), 2);
        assert_eq!(queue_len(&sched, "m3"), 1);

        // removal sweeps every peer queue through the shared pair
        sched.remove_request(&r1)?;
        assert_eq!(queue_len(&sched, "m1"), 0);
        assert_eq!(queue_len(&sched, "m2"), 1);
        assert_eq!(queue_len(&sched, "m3"), 1);

        sched.remove_request(&r2)?;
        assert_eq!(sched.request_count(), 0);
        assert!(sched.remove_request(&r2).is_err());

        Ok(())
    }

    #[test]
    fn test_association_prefers_loaded_drive() -> Result<(), Error> {
        // two reads over {m1,m2} and {m2,m3}, one drive holding m2:
        // both are served off that drive without a new load
        let bed = create_testbed("association", &["m1", "m2", "m3"])?;
        let mut sched = GroupedReadScheduler::new(bed.ctx.clone(), false);

        let device = test_device("drive0");
        let m2 = bed
            .ctx
            .cache
            .acquire(bed.ctx.store.as_ref(), &medium_id("m2"))?;
        device.lock().status = OperationalStatus::Loaded(Arc::clone(&m2));
        bed.ctx
            .global_devices
            .lock()
            .unwrap()
            .push(Arc::clone(&device));
        sched.add_device(Arc::clone(&device));

        let r1 = read_request(1, &["m1", "m2"]);
        let r2 = read_request(1, &["m2", "m3"]);
        sched.push_request(Arc::clone(&r1));
        sched.push_request(Arc::clone(&r2));

        let head = sched.peek_request(&bed.peers).unwrap();
        assert!(Arc::ptr_eq(&head, &r1));

        // m2's queue got associated to the drive already holding it
        let assoc = sched
            .queues
            .get(&medium_id("m2"))
            .and_then(|queue| queue.device.clone())
            .unwrap();
        assert_eq!(assoc.id(), device.id());

        // both requests allocate m2 on that same drive, in order
        let picked = sched
            .get_device_medium_pair(&bed.peers, &r1, 0)?
            .unwrap();
        assert_eq!(picked.id(), device.id());
        match &*r1.lock() {
            Payload::RwAlloc(state) => {
                assert_eq!(state.slots[0].medium.as_ref().unwrap().id, medium_id("m2"));
            }
            _ => unreachable!(),
        }

        let picked = sched
            .get_device_medium_pair(&bed.peers, &r2, 0)?
            .unwrap();
        assert_eq!(picked.id(), device.id());
        assert_eq!(queue_len(&sched, "m2"), 0);

        Ok(())
    }

    #[test]
    fn test_requeue_restores_free_media() -> Result<(), Error> {
        let bed = create_testbed("requeue", &["m1", "m2"])?;
        let mut sched = GroupedReadScheduler::new(bed.ctx.clone(), false);

        let device = test_device("drive0");
        bed.ctx
            .global_devices
            .lock()
            .unwrap()
            .push(Arc::clone(&device));
        sched.add_device(device);

        let r1 = read_request(1, &["m1", "m2"]);
        sched.push_request(Arc::clone(&r1));

        sched.peek_request(&bed.peers);
        let device = sched.get_device_medium_pair(&bed.peers, &r1, 0)?;
        assert!(device.is_some());

        let (_, pair) = sched.pairs.get(&r1.id.to_string()).unwrap();
        assert_eq!(pair.lock().unwrap().used.len(), 1);

        // a requeue moves used media back to free and re-inserts the
        // element
        sched.requeue(Arc::clone(&r1))?;
        let (_, pair) = sched.pairs.get(&r1.id.to_string()).unwrap();
        assert_eq!(pair.lock().unwrap().used.len(), 0);
        assert_eq!(pair.lock().unwrap().free.len(), 2);
        assert_eq!(
            queue_len(&sched, "m1") + queue_len(&sched, "m2"),
            2 // back in its original queue plus the untouched peer
        );

        Ok(())
    }

    #[test]
    fn test_unmountable_media_cancelled_with_enodev() -> Result<(), Error> {
        let bed = create_testbed("enodev", &["m1"])?;
        let mut sched = GroupedReadScheduler::new(bed.ctx.clone(), false);

        // m1 needs a technology no drive has
        let mut medium = test_medium("m1");
        medium.technology = Some("lto9".to_string());
        bed.ctx.store.update_medium(&medium)?;

        let device = test_device("drive0");
        bed.ctx
            .global_devices
            .lock()
            .unwrap()
            .push(Arc::clone(&device));
        sched.add_device(device);

        let r1 = read_request(1, &["m1"]);
        sched.push_request(Arc::clone(&r1));

        assert!(sched.peek_request(&bed.peers).is_none());
        let failed = sched.take_failed();
        assert_eq!(failed.len(), 1);
        assert!(r1.is_failed());
        let response = r1.try_take_response().unwrap();
        match response.body {
            lrs_api_types::ResponseBody::Error(err) => {
                assert_eq!(err.error_code, -libc::ENODEV);
            }
            _ => panic!("expected an error response"),
        }

        Ok(())
    }
}
