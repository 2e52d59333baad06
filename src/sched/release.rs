//! Release routing
//!
//! A release closes (part of) an allocation: per medium it carries
//! the written size, the extent count and the client's return code.
//! Each entry is routed to the device currently binding that medium
//! and lands in its sync queue; the device thread performs the actual
//! durability work and emits the response.

use std::sync::Arc;

use crossbeam_channel::Sender;

use lrs_api_types::Response;

use crate::request::{Payload, RequestContainer, SlotStatus};

use super::io_sched::SchedContext;

/// Fan a release request out into per-device sync queues.
///
/// Entries whose medium no drive currently binds fail with `-ENODEV`;
/// the rest wake their device. The response is emitted once every
/// entry reached a terminal state.
pub fn process_release_request(
    ctx: &SchedContext,
    request: Arc<RequestContainer>,
    response_tx: &Sender<Response>,
) {
    let entries: Vec<(usize, lrs_api_types::ReleaseMediumSpec)> = {
        match &*request.lock() {
            Payload::Release(release) => release
                .entries
                .iter()
                .enumerate()
                .map(|(index, entry)| (index, entry.spec.clone()))
                .collect(),
            _ => {
                log::error!("{:?}: not a release request", request);
                return;
            }
        }
    };

    for (index, spec) in entries {
        match ctx.find_holder(&spec.medium) {
            Some(device) => {
                device.queue_release(
                    Arc::clone(&request),
                    index,
                    spec.written_size,
                    spec.nb_extents_written as u64,
                    spec.grouping.as_deref(),
                    spec.rc,
                );
            }
            None => {
                log::warn!(
                    "release for medium '{}' which no drive holds",
                    spec.medium
                );
                if let Payload::Release(release) = &mut *request.lock() {
                    release.entries[index].status = SlotStatus::Error;
                    if release.first_error.is_none() {
                        release.first_error = Some(-libc::ENODEV);
                    }
                }
            }
        }
    }

    // everything may already be terminal (e.g. nothing was routable)
    if let Some(response) = request.try_take_response() {
        let _ = response_tx.send(response);
    }
}
