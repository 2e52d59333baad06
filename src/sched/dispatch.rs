//! Device dispatchers
//!
//! Runs periodically from the scheduler thread with the full drive
//! list and decides which drives serve which request types. The
//! trivial policy hands every drive to all three schedulers; the
//! fair-share policy partitions drives per technology by request
//! load.

use std::sync::Arc;

use lrs_config::LrsConfig;

use crate::device::Device;

use super::io_sched::{Claim, ClaimOutcome, SchedPeers};

pub trait DeviceDispatcher: Send {
    fn dispatch(&mut self, peers: &SchedPeers, devices: &[Arc<Device>], config: &LrsConfig);
}

/// Every drive serves every request type.
pub struct NoDispatch;

impl DeviceDispatcher for NoDispatch {
    fn dispatch(&mut self, peers: &SchedPeers, devices: &[Arc<Device>], _config: &LrsConfig) {
        for kind in SchedPeers::kinds() {
            let mut sched = peers.get(kind).lock().unwrap();
            for device in devices {
                let assigned = device.lock().io_mask.contains(kind.into());
                if !assigned {
                    sched.add_device(Arc::clone(device));
                }
            }
        }
    }
}

/// Compute the per-type device quotas for one technology.
///
/// A type without requests gets zero devices; the others get
/// `clamp(floor(weight × total), min, max)`. Excess is shaved off in
/// read/write/format order from types above their min; deficits are
/// filled toward the per-type target weight, redistributing whatever
/// maxed-out types cannot take.
pub fn compute_device_repartition(
    requests: [usize; 3],
    total_devices: usize,
    mut mins: [u32; 3],
    mut maxes: [u32; 3],
) -> [usize; 3] {
    let total_requests: usize = requests.iter().sum();
    if total_requests == 0 || total_devices == 0 {
        return [0, 0, 0];
    }

    // too few drives for the configured minima: relax them so nothing
    // deadlocks waiting for a drive that cannot exist
    let min_sum: u32 = mins.iter().sum();
    if min_sum as usize > total_devices {
        maxes = mins;
        let relaxed = if total_devices >= 3 { 1 } else { 0 };
        for min in mins.iter_mut() {
            *min = (*min).min(relaxed);
        }
    }

    let weight = |index: usize| requests[index] as f64 / total_requests as f64;

    let mut quotas = [0usize; 3];
    for index in 0..3 {
        if requests[index] == 0 {
            continue;
        }
        let share = (weight(index) * total_devices as f64).floor() as usize;
        quotas[index] = share
            .max(mins[index] as usize)
            .min(maxes[index] as usize);
    }

    // reduce excess, read/write/format order, never below min
    let mut sum: usize = quotas.iter().sum();
    while sum > total_devices {
        let mut reduced = false;
        for index in 0..3 {
            if sum > total_devices && quotas[index] > mins[index] as usize {
                quotas[index] -= 1;
                sum -= 1;
                reduced = true;
            }
        }
        if !reduced {
            break;
        }
    }

    // fill the deficit: always the type currently furthest below its
    // target weight, skipping maxed-out types
    loop {
        let sum: usize = quotas.iter().sum();
        if sum >= total_devices {
            break;
        }
        let mut best: Option<(usize, f64)> = None;
        for index in 0..3 {
            if requests[index] == 0 || quotas[index] >= maxes[index] as usize {
                continue;
            }
            let gap = weight(index) - quotas[index] as f64 / total_devices as f64;
            match best {
                Some((_, best_gap)) if best_gap >= gap => {}
                _ => best = Some((index, gap)),
            }
        }
        match best {
            Some((index, _)) => quotas[index] += 1,
            None => break, // everything maxed out
        }
    }

    quotas
}

/// The 1-drive/2-drive special cases: give the drive(s) to the
/// heaviest requesters. A full tie falls back to the general
/// repartition (and may leave every quota at its computed value).
fn heaviest_repartition(requests: [usize; 3], total_devices: usize) -> Option<[usize; 3]> {
    let mut order: Vec<usize> = (0..3).filter(|&index| requests[index] > 0).collect();
    order.sort_by(|&a, &b| requests[b].cmp(&requests[a]));

    match total_devices {
        1 => {
            let first = *order.first()?;
            // ambiguous winner: fall back
            if order.len() > 1 && requests[order[1]] == requests[first] {
                return None;
            }
            let mut quotas = [0; 3];
            quotas[first] = 1;
            Some(quotas)
        }
        2 => {
            if order.len() > 2 && requests[order[2]] == requests[order[1]] {
                return None; // three-way tie, intended fallback
            }
            let mut quotas = [0; 3];
            for &index in order.iter().take(2) {
                quotas[index] = 1;
            }
            if order.len() == 1 {
                quotas[order[0]] = 2;
            }
            Some(quotas)
        }
        _ => None,
    }
}

/// Partition drives per technology by per-type request counts.
pub struct FairShare;

impl FairShare {
    /// Reclaim devices of `technology` exceeding the new quota from
    /// each scheduler. Unassigned drives are free stock already.
    fn fetch_devices_to_give(
        peers: &SchedPeers,
        devices: &[Arc<Device>],
        technology: &str,
        quotas: &[usize; 3],
    ) -> Vec<Arc<Device>> {
        let mut stock: Vec<Arc<Device>> = devices
            .iter()
            .filter(|device| {
                device.technology() == technology
                    && device.lock().io_mask.is_empty()
            })
            .map(Arc::clone)
            .collect();

        for (index, kind) in SchedPeers::kinds().iter().enumerate() {
            let mut sched = peers.get(*kind).lock().unwrap();
            let owned: Vec<_> = sched
                .devices()
                .iter()
                .filter(|device| device.technology() == technology)
                .map(|device| device.id().clone())
                .collect();
            if owned.len() <= quotas[index] {
                continue;
            }
            // reclaim idle drives first
            let mut reclaimable = owned;
            reclaimable.sort_by_key(|id| {
                !devices
                    .iter()
                    .find(|device| device.id() == id)
                    .map(|device| device.sched_ready())
                    .unwrap_or(false)
            });
            let excess = reclaimable.len() - quotas[index];
            for id in reclaimable.into_iter().take(excess) {
                if let ClaimOutcome::Granted(device) =
                    sched.claim_device(Claim::Take { wanted: id })
                {
                    stock.push(device);
                }
            }
        }

        stock
    }

    /// Hand out stock until each scheduler reaches its quota.
    fn dispatch_devices(
        peers: &SchedPeers,
        technology: &str,
        quotas: &[usize; 3],
        mut stock: Vec<Arc<Device>>,
    ) {
        for (index, kind) in SchedPeers::kinds().iter().enumerate() {
            let mut sched = peers.get(*kind).lock().unwrap();
            let owned = sched
                .devices()
                .iter()
                .filter(|device| device.technology() == technology)
                .count();
            for _ in owned..quotas[index] {
                match stock.pop() {
                    Some(device) => sched.add_device(device),
                    None => return,
                }
            }
        }
    }
}

impl DeviceDispatcher for FairShare {
    fn dispatch(&mut self, peers: &SchedPeers, devices: &[Arc<Device>], config: &LrsConfig) {
        let mut technologies: Vec<&str> = devices
            .iter()
            .map(|device| device.technology())
            .collect();
        technologies.sort_unstable();
        technologies.dedup();

        let requests = [
            peers.read.lock().unwrap().request_count(),
            peers.write.lock().unwrap().request_count(),
            peers.format.lock().unwrap().request_count(),
        ];

        for technology in technologies {
            let total = devices
                .iter()
                .filter(|device| device.technology() == technology)
                .count();

            let (mins, maxes) = match config.technology(technology) {
                Some(tech) => (tech.fair_share_min, tech.fair_share_max),
                None => ([0, 0, 0], [u32::MAX, u32::MAX, u32::MAX]),
            };

            let quotas = match heaviest_repartition(requests, total) {
                Some(quotas) => quotas,
                None => compute_device_repartition(requests, total, mins, maxes),
            };

            log::debug!(
                "fair share for '{}': {} drives, requests {:?} -> quotas {:?}",
                technology,
                total,
                requests,
                quotas
            );

            let stock = Self::fetch_devices_to_give(peers, devices, technology, &quotas);
            Self::dispatch_devices(peers, technology, &quotas, stock);
        }
    }
}

/// Build the configured dispatcher.
pub fn dispatcher_for(config: &LrsConfig) -> Box<dyn DeviceDispatcher> {
    match config.dispatch_algo {
        lrs_api_types::DispatchAlgo::None => Box::new(NoDispatch),
        lrs_api_types::DispatchAlgo::FairShare => Box::new(FairShare),
    }
}
