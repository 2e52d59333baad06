//! Priority selectors
//!
//! Given the head request of each of the three I/O schedulers, pick
//! which one the scheduler thread serves next.

use std::sync::Arc;

use lrs_api_types::IoRequestKind;

use crate::request::RequestContainer;

pub trait PrioritySelector: Send {
    /// Heads are indexed read/write/format; `None` entries are empty
    /// schedulers.
    fn next_request(
        &mut self,
        heads: &[Option<Arc<RequestContainer>>; 3],
    ) -> Option<IoRequestKind>;
}

const KINDS: [IoRequestKind; 3] = [
    IoRequestKind::Read,
    IoRequestKind::Write,
    IoRequestKind::Format,
];

/// Oldest request by arrival time wins.
pub struct FifoNextRequest;

impl PrioritySelector for FifoNextRequest {
    fn next_request(
        &mut self,
        heads: &[Option<Arc<RequestContainer>>; 3],
    ) -> Option<IoRequestKind> {
        let mut best: Option<(IoRequestKind, std::time::Instant)> = None;
        for (index, head) in heads.iter().enumerate() {
            if let Some(request) = head {
                match best {
                    Some((_, arrived)) if arrived <= request.arrived => {}
                    _ => best = Some((KINDS[index], request.arrived)),
                }
            }
        }
        best.map(|(kind, _)| kind)
    }
}

/// Rotating cursor over read/write/format.
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin { cursor: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl PrioritySelector for RoundRobin {
    fn next_request(
        &mut self,
        heads: &[Option<Arc<RequestContainer>>; 3],
    ) -> Option<IoRequestKind> {
        for _ in 0..3 {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % 3;
            if heads[index].is_some() {
                return Some(KINDS[index]);
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use lrs_api_types::{
        MediumId, ReadAllocRequest, Request, RequestBody, ResourceFamily,
    };
    use proxmox_uuid::Uuid;

    use super::*;

    fn dummy_request() -> Arc<RequestContainer> {
        Arc::new(
            RequestContainer::new(Request {
                id: Uuid::generate(),
                body: RequestBody::Read(ReadAllocRequest {
                    n_required: 1,
                    media: vec![MediumId::new(ResourceFamily::Tape, "tape1", "lib0")],
                }),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_fifo_next_request() {
        let mut selector = FifoNextRequest;

        assert_eq!(selector.next_request(&[None, None, None]), None);

        let oldest = dummy_request();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = dummy_request();

        // null-safe, oldest arrival wins
        assert_eq!(
            selector.next_request(&[Some(newer.clone()), Some(oldest), None]),
            Some(IoRequestKind::Write)
        );
        assert_eq!(
            selector.next_request(&[Some(newer), None, None]),
            Some(IoRequestKind::Read)
        );
    }

    #[test]
    fn test_round_robin() {
        let mut selector = RoundRobin::new();
        let heads = [Some(dummy_request()), Some(dummy_request()), None];

        assert_eq!(selector.next_request(&heads), Some(IoRequestKind::Read));
        assert_eq!(selector.next_request(&heads), Some(IoRequestKind::Write));
        // format is empty, cursor skips it
        assert_eq!(selector.next_request(&heads), Some(IoRequestKind::Read));

        assert_eq!(selector.next_request(&[None, None, None]), None);
    }
}
