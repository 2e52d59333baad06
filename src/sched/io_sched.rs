//! I/O scheduler capability set
//!
//! Each request type (read/write/format) gets one scheduler instance
//! implementing [`IoScheduler`]. The three instances cooperate
//! through [`SchedPeers`]: a scheduler may *claim* a drive another
//! scheduler owns (BORROW/EXCHANGE/TAKE), e.g. to serve a read whose
//! medium is already loaded in a write drive.

use std::sync::{Arc, Mutex};

use anyhow::Error;

use lrs_api_types::{DeviceId, IoRequestKind, Medium, MediumId};
use lrs_config::LrsConfig;

use crate::cache::MediumCache;
use crate::device::{Device, IoTypeMask, OperationalStatus};
use crate::request::{RequestContainer, SubRequest};
use crate::store::MetaStore;

/// Shared collaborators every scheduler algorithm needs
#[derive(Clone)]
pub struct SchedContext {
    pub cache: Arc<MediumCache>,
    pub store: Arc<dyn MetaStore>,
    pub config: Arc<LrsConfig>,
    /// All usable drives of the process, across schedulers
    pub global_devices: Arc<Mutex<Vec<Arc<Device>>>>,
}

impl SchedContext {
    /// Drive currently binding `medium`, anywhere in the fleet.
    pub fn find_holder(&self, medium: &MediumId) -> Option<Arc<Device>> {
        self.global_devices
            .lock()
            .unwrap()
            .iter()
            .find(|device| device.holds_medium(medium))
            .map(Arc::clone)
    }

    /// Whether any drive in the fleet could mount `medium`.
    pub fn fleet_has_compatible(&self, medium: &Medium) -> bool {
        self.global_devices
            .lock()
            .unwrap()
            .iter()
            .any(|device| compatible(&self.config, device, medium))
    }
}

/// Technology compatibility between a drive and a medium
pub fn compatible(config: &LrsConfig, device: &Device, medium: &Medium) -> bool {
    match &medium.technology {
        None => true,
        Some(tech) => {
            if device.technology() == tech {
                return true;
            }
            match (config.technology(tech), &device.entry.model) {
                (Some(tech), Some(model)) => {
                    tech.drive_models.iter().any(|have| have == model)
                }
                _ => false,
            }
        }
    }
}

/// A claim one scheduler makes against another
pub enum Claim {
    /// Take a free device, giving nothing back
    Borrow { wanted: DeviceId },
    /// Swap `offered` for the wanted device
    Exchange {
        wanted: DeviceId,
        offered: Arc<Device>,
    },
    /// Unconditionally reclaim (device dispatcher only)
    Take { wanted: DeviceId },
}

pub enum ClaimOutcome {
    Granted(Arc<Device>),
    Refused,
}

/// Object-safe scheduler algorithm interface
///
/// Implementations must never call into their peers from
/// `claim_device` - claims do not cascade.
pub trait IoScheduler: Send {
    fn kind(&self) -> IoRequestKind;

    fn push_request(&mut self, request: Arc<RequestContainer>);

    /// Next request this scheduler could serve, without removing it.
    fn peek_request(&mut self, peers: &SchedPeers) -> Option<Arc<RequestContainer>>;

    /// Drop a request (served or failed) from the queues.
    fn remove_request(&mut self, request: &Arc<RequestContainer>) -> Result<(), Error>;

    /// Put a peeked request back; allocation progress is reset.
    fn requeue(&mut self, request: Arc<RequestContainer>) -> Result<(), Error>;

    /// Pick the device and medium for sub-request `io_index` of
    /// `request`. `Ok(None)` means "not placeable right now".
    fn get_device_medium_pair(
        &mut self,
        peers: &SchedPeers,
        request: &Arc<RequestContainer>,
        io_index: usize,
    ) -> Result<Option<Arc<Device>>, Error>;

    /// Find a new device (and possibly medium) for a failed
    /// sub-request.
    fn retry(
        &mut self,
        peers: &SchedPeers,
        sub_request: &SubRequest,
    ) -> Result<Option<Arc<Device>>, Error>;

    fn add_device(&mut self, device: Arc<Device>);

    fn remove_device(&mut self, id: &DeviceId) -> Option<Arc<Device>>;

    fn get_device(&self, index: usize) -> Option<Arc<Device>>;

    fn devices(&self) -> &[Arc<Device>];

    fn claim_device(&mut self, claim: Claim) -> ClaimOutcome;

    /// Number of requests currently queued (fair-share weights).
    fn request_count(&self) -> usize;

    /// Requests the algorithm failed internally (e.g. cancelled with
    /// `-ENODEV`); the scheduler thread emits their error responses.
    fn take_failed(&mut self) -> Vec<Arc<RequestContainer>> {
        Vec::new()
    }
}

/// Handles to the three scheduler instances
///
/// All three run on the scheduler thread; the mutexes only serialise
/// claim calls between them.
#[derive(Clone)]
pub struct SchedPeers {
    pub read: Arc<Mutex<Box<dyn IoScheduler>>>,
    pub write: Arc<Mutex<Box<dyn IoScheduler>>>,
    pub format: Arc<Mutex<Box<dyn IoScheduler>>>,
}

impl SchedPeers {
    pub fn get(&self, kind: IoRequestKind) -> &Arc<Mutex<Box<dyn IoScheduler>>> {
        match kind {
            IoRequestKind::Read => &self.read,
            IoRequestKind::Write => &self.write,
            IoRequestKind::Format => &self.format,
        }
    }

    pub fn kinds() -> [IoRequestKind; 3] {
        [
            IoRequestKind::Read,
            IoRequestKind::Write,
            IoRequestKind::Format,
        ]
    }
}

/// Try to pull `wanted` (owned by some other scheduler) over to
/// `my_kind`, swapping `offered` for it.
///
/// The grantor updates its own device list and mask bit; this helper
/// updates the claimant's side. Returns the won device.
pub fn exchange_device(
    peers: &SchedPeers,
    my_kind: IoRequestKind,
    my_devices: &mut Vec<Arc<Device>>,
    wanted: &Arc<Device>,
    offered: Arc<Device>,
) -> Option<Arc<Device>> {
    let holder_mask = wanted.lock().io_mask;

    for kind in SchedPeers::kinds() {
        if kind == my_kind || !holder_mask.contains(kind.into()) {
            continue;
        }
        let outcome = peers.get(kind).lock().unwrap().claim_device(Claim::Exchange {
            wanted: wanted.id().clone(),
            offered: Arc::clone(&offered),
        });
        if let ClaimOutcome::Granted(granted) = outcome {
            // hand `offered` over ...
            my_devices.retain(|device| device.id() != offered.id());
            offered.lock().io_mask.remove(my_kind.into());
            // ... and adopt the won device
            granted.lock().io_mask.insert(my_kind.into());
            my_devices.push(Arc::clone(&granted));
            return Some(granted);
        }
    }

    None
}

/// Pick an available drive for `medium` using the
/// empty → loaded → mounted preference (the cheaper the handover, the
/// better), a drive already holding the medium winning outright.
pub fn pick_available_device(
    devices: &[Arc<Device>],
    config: &LrsConfig,
    medium: &Medium,
) -> Option<Arc<Device>> {
    let mut best: Option<(u8, Arc<Device>)> = None;

    for device in devices {
        if !device.sched_ready() || !compatible(config, device, medium) {
            continue;
        }
        let rank = {
            let state = device.lock();
            match &state.status {
                _ if state
                    .status
                    .medium()
                    .map(|loaded| loaded.id == medium.id)
                    .unwrap_or(false) =>
                {
                    0
                }
                OperationalStatus::Empty => 1,
                OperationalStatus::Loaded(_) => 2,
                OperationalStatus::Mounted(..) => 3,
                OperationalStatus::Failed => continue,
            }
        };
        match &best {
            Some((best_rank, _)) if *best_rank <= rank => {}
            _ => best = Some((rank, Arc::clone(device))),
        }
    }

    best.map(|(_, device)| device)
}

/// First free (ready) drive of a scheduler, used as exchange stock.
pub fn find_free_device(devices: &[Arc<Device>]) -> Option<Arc<Device>> {
    devices
        .iter()
        .find(|device| device.sched_ready())
        .map(Arc::clone)
}

/// Fetch a medium record and check it is usable for `kind`.
pub fn fetch_and_check_medium_info(
    ctx: &SchedContext,
    id: &MediumId,
    kind: IoRequestKind,
    lock_owner_prefix: &str,
) -> Result<Option<Arc<Medium>>, Error> {
    let medium = ctx.cache.acquire(ctx.store.as_ref(), id)?;

    let usable = match kind {
        IoRequestKind::Read => medium.is_readable(),
        IoRequestKind::Write => medium.is_writable(),
        IoRequestKind::Format => {
            medium.health > 0 && medium.admin_status != lrs_api_types::AdminStatus::Failed
        }
    };
    if !usable {
        return Ok(None);
    }

    // media in one of our own drives are locked by us; only a foreign
    // lock disqualifies
    if ctx.find_holder(id).is_none()
        && ctx.store.medium_locked_by_other(id, lock_owner_prefix)?
    {
        return Ok(None);
    }

    Ok(Some(medium))
}
