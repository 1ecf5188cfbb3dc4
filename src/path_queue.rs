//! Bounded FIFO of long-path requests, each advanced cooperatively by the
//! sliced A* driver over many update ticks.
//!
//! Grounded on `DetourCrowd.cpp`'s `m_pathq.update(...)` call. Request
//! handles are a `slotmap::new_key_type!` (`PathQueueRef`) rather than a
//! hand-rolled slot+generation pair, the same idiom used for every opaque id
//! this crate exposes.

use std::collections::VecDeque;

use glam::Vec3;
use slotmap::{new_key_type, SlotMap};
use tracing::warn;

use crate::mesh_query::{MeshQuery, SliceStatus, MAX_PATHQUEUE_NODES};
use crate::nav_mesh::{NavMesh, PolyRef, QueryFilter};

new_key_type! {
    /// Opaque handle to a request submitted to a [`PathQueue`].
    pub struct PathQueueRef;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestStatus {
    InProgress,
    Success,
    PartialSuccess,
    Failure,
    /// The handle does not correspond to a live request (already collected,
    /// or never existed).
    Invalid,
}

struct Request {
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: QueryFilter,
    status: RequestStatus,
    path: Vec<PolyRef>,
    started: bool,
}

pub const MAX_REQUESTS: usize = 8;

/// Long-lived A* driver: its own [`MeshQuery`] (and therefore its own
/// `NodePool`/`NodeHeap`), kept separate from the crowd's small per-agent
/// replan query so long background searches never starve short interactive
/// ones.
pub struct PathQueue {
    requests: SlotMap<PathQueueRef, Request>,
    order: VecDeque<PathQueueRef>,
    query: MeshQuery,
    capacity: usize,
}

impl PathQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: SlotMap::with_key(),
            order: VecDeque::new(),
            query: MeshQuery::new(MAX_PATHQUEUE_NODES),
            capacity,
        }
    }

    /// Allocates a slot and returns an opaque handle, or `None` if the queue
    /// is full (spec: exhausted at PathQueue leaves the agent in
    /// `WaitingForQueue`, retried next tick).
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: QueryFilter,
    ) -> Option<PathQueueRef> {
        if self.order.len() >= self.capacity {
            warn!(capacity = self.capacity, "path queue exhausted, request rejected");
            return None;
        }
        let handle = self.requests.insert(Request {
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            status: RequestStatus::InProgress,
            path: Vec::new(),
            started: false,
        });
        self.order.push_back(handle);
        Some(handle)
    }

    pub fn request_status(&self, handle: PathQueueRef) -> RequestStatus {
        self.requests.get(handle).map(|r| r.status).unwrap_or(RequestStatus::Invalid)
    }

    /// Copies a completed path and releases the slot.
    pub fn take_result(&mut self, handle: PathQueueRef) -> Option<Vec<PolyRef>> {
        let request = self.requests.get(handle)?;
        if request.status == RequestStatus::InProgress {
            return None;
        }
        let path = request.path.clone();
        self.requests.remove(handle);
        self.order.retain(|&h| h != handle);
        Some(path)
    }

    /// Advances queued requests round-robin, spending up to `max_iters` node
    /// expansions total across the whole queue this call.
    pub fn update(&mut self, mesh: &dyn NavMesh, max_iters: u32) {
        let mut budget = max_iters;
        let mut rounds_without_progress = 0;
        while budget > 0 && !self.order.is_empty() && rounds_without_progress < self.order.len() {
            let Some(&handle) = self.order.front() else { break };
            let Some(request) = self.requests.get_mut(handle) else {
                self.order.pop_front();
                continue;
            };

            if request.status != RequestStatus::InProgress {
                self.order.rotate_left(1);
                rounds_without_progress += 1;
                continue;
            }

            if !request.started {
                let filter = request.filter.clone();
                let result = self.query.init_sliced_find_path(
                    mesh,
                    request.start_ref,
                    request.end_ref,
                    request.start_pos,
                    request.end_pos,
                    &filter,
                );
                request.started = true;
                if result.is_err() {
                    request.status = RequestStatus::Failure;
                    self.order.rotate_left(1);
                    continue;
                }
            }

            let filter = request.filter.clone();
            let (iters, status) = self.query.update_sliced_find_path(mesh, &filter, budget.min(1));
            budget = budget.saturating_sub(iters.max(1));
            rounds_without_progress = 0;

            match status {
                SliceStatus::InProgress => {}
                SliceStatus::Success => {
                    request.path = self.query.finalize_sliced_find_path(256).unwrap_or_default();
                    request.status = RequestStatus::Success;
                }
                SliceStatus::PartialSuccess => {
                    request.path = self.query.finalize_sliced_find_path(256).unwrap_or_default();
                    request.status = RequestStatus::PartialSuccess;
                }
                SliceStatus::Failure => {
                    request.status = RequestStatus::Failure;
                }
            }
            self.order.rotate_left(1);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nav_mesh::PolyMesh;

    fn corridor_mesh() -> PolyMesh {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 1.0),
        ];
        let polygons = vec![vec![0, 1, 2, 3], vec![1, 4, 5, 2]];
        PolyMesh::new(vertices, polygons, vec![0, 0], vec![0xffff; 2]).unwrap()
    }

    #[test]
    fn request_resolves_to_success_within_a_few_updates() {
        let mesh = corridor_mesh();
        let mut queue = PathQueue::new(MAX_REQUESTS);
        let handle = queue
            .request(
                PolyRef(1),
                PolyRef(2),
                Vec3::new(0.5, 0.0, 0.5),
                Vec3::new(1.5, 0.0, 0.5),
                QueryFilter::new(),
            )
            .unwrap();
        for _ in 0..10 {
            queue.update(&mesh, 100);
            if queue.request_status(handle) != RequestStatus::InProgress {
                break;
            }
        }
        assert_eq!(queue.request_status(handle), RequestStatus::Success);
        let path = queue.take_result(handle).unwrap();
        assert_eq!(path, vec![PolyRef(1), PolyRef(2)]);
        assert_eq!(queue.request_status(handle), RequestStatus::Invalid);
    }

    #[test]
    fn queue_rejects_requests_past_capacity() {
        let mesh = corridor_mesh();
        let _ = mesh;
        let mut queue = PathQueue::new(1);
        let filter = QueryFilter::new();
        let first = queue.request(PolyRef(1), PolyRef(2), Vec3::ZERO, Vec3::ZERO, filter.clone());
        assert!(first.is_some());
        let second = queue.request(PolyRef(1), PolyRef(2), Vec3::ZERO, Vec3::ZERO, filter);
        assert!(second.is_none());
    }
}
