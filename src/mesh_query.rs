//! Issues queries against a [`NavMesh`]: nearest polygon, closest point on a
//! polygon, validity, straight-path extraction, raycast, and a resumable
//! (sliced) A* driver.
//!
//! The resumable search loop is grounded on `DetourCrowd.cpp`'s use of
//! `dtNavMeshQuery::updateSlicedFindPath` (call-site budgets and the
//! init/update/finalize split); no `DetourNavMeshQuery.cpp` was retrieved in
//! the pack, so the open/closed-list expansion itself is a standard
//! best-first search with closed-set pruning over [`NodePool`]/[`NodeHeap`].

use glam::Vec3;
use thiserror::Error;

use crate::geom::{point_in_convex_polygon, project_to_polygon, segment_intersect_2d};
use crate::nav_mesh::{NavMesh, PolyRef, QueryFilter};
use crate::node_pool::{NodeFlags, NodeHeap, NodeIndex, NodePool};

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum QueryError {
    #[error("polygon reference is invalid or does not pass the filter")]
    InvalidRef,
    #[error("no polygon was found within the search extents")]
    NotOnMesh,
    #[error("the search node pool is exhausted")]
    Exhausted,
}

/// Status of a resumable search.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SliceStatus {
    InProgress,
    Success,
    PartialSuccess,
    Failure,
}

struct SlicedSearch {
    start: PolyRef,
    end: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    last_best: NodeIndex,
    last_best_cost: f32,
    status: SliceStatus,
}

/// A mesh query context: one [`NodePool`] + [`NodeHeap`] plus an optional
/// in-flight sliced search. `MAX_COMMON_NODES = 512` sizes the pool the
/// crowd's own short inline replans use; `PathQueue` owns a second, larger
/// instance for long-lived background searches.
pub struct MeshQuery {
    pool: NodePool,
    heap: NodeHeap,
    slice: Option<SlicedSearch>,
}

pub const MAX_COMMON_NODES: usize = 512;
pub const MAX_PATHQUEUE_NODES: usize = 4096;

impl MeshQuery {
    const MAX_RAYCAST_VISITED: usize = 256;

    pub fn new(node_capacity: usize) -> Self {
        Self {
            pool: NodePool::new(node_capacity),
            heap: NodeHeap::new(node_capacity),
            slice: None,
        }
    }

    pub fn is_valid_poly_ref(&self, mesh: &dyn NavMesh, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        mesh.is_valid_poly_ref(poly_ref) && mesh.passes_filter(poly_ref, filter)
    }

    /// Finds the polygon whose closest boundary point to `center` lies
    /// within `half_extents`, scanning all polygons (no spatial index is
    /// assumed of [`NavMesh`] implementations).
    pub fn find_nearest_poly(
        &self,
        mesh: &dyn NavMesh,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for poly_ref in mesh.all_polys() {
            if !mesh.passes_filter(poly_ref, filter) {
                continue;
            }
            let Some(verts) = mesh.poly_vertices(poly_ref) else { continue };
            let (point, dist_sq) = self.closest_point_on_poly_verts(center, &verts);
            let dx = (point.x - center.x).abs();
            let dy = (point.y - center.y).abs();
            let dz = (point.z - center.z).abs();
            if dx > half_extents.x || dy > half_extents.y || dz > half_extents.z {
                continue;
            }
            if best.as_ref().map(|(_, _, d)| dist_sq < *d).unwrap_or(true) {
                best = Some((poly_ref, point, dist_sq));
            }
        }
        best.map(|(r, p, _)| (r, p))
    }

    fn closest_point_on_poly_verts(&self, p: Vec3, verts: &[Vec3]) -> (Vec3, f32) {
        let projected = project_to_polygon(p, verts);
        (projected, p.distance_squared(projected))
    }

    /// Projects `pos` onto `poly_ref`; `is_over_poly` is true if `pos` lies
    /// within the polygon's horizontal footprint (no clamping occurred).
    pub fn closest_point_on_poly(
        &self,
        mesh: &dyn NavMesh,
        poly_ref: PolyRef,
        pos: Vec3,
    ) -> Option<(Vec3, bool)> {
        let verts = mesh.poly_vertices(poly_ref)?;
        let over = point_in_convex_polygon(pos, &verts);
        Some((project_to_polygon(pos, &verts), over))
    }

    fn heuristic(a: Vec3, b: Vec3) -> f32 {
        a.distance(b)
    }

    /// Primes a resumable A* search from `start_ref`/`start_pos` toward
    /// `end_ref`/`end_pos`.
    pub fn init_sliced_find_path(
        &mut self,
        mesh: &dyn NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<(), QueryError> {
        if !self.is_valid_poly_ref(mesh, start_ref, filter) || !self.is_valid_poly_ref(mesh, end_ref, filter) {
            return Err(QueryError::InvalidRef);
        }
        self.pool.clear();
        self.heap.clear();
        let start_node = self.pool.get_node(start_ref, 0).ok_or(QueryError::Exhausted)?;
        {
            let node = self.pool.get_mut(start_node);
            node.position = start_pos;
            node.cost = 0.0;
            node.total = Self::heuristic(start_pos, end_pos);
            node.parent_index = 0;
            node.flags = NodeFlags::OPEN;
        }
        self.heap.push(&self.pool, start_node);
        self.slice = Some(SlicedSearch {
            start: start_ref,
            end: end_ref,
            start_pos,
            end_pos,
            last_best: start_node,
            last_best_cost: self.pool.get(start_node).total,
            status: SliceStatus::InProgress,
        });
        Ok(())
    }

    /// Expands at most `max_iters` nodes of the in-flight search.
    pub fn update_sliced_find_path(
        &mut self,
        mesh: &dyn NavMesh,
        filter: &QueryFilter,
        max_iters: u32,
    ) -> (u32, SliceStatus) {
        let Some(slice) = self.slice.as_mut() else {
            return (0, SliceStatus::Failure);
        };
        if slice.status != SliceStatus::InProgress {
            return (0, slice.status);
        }

        let mut iters = 0;
        while iters < max_iters {
            let Some(best_index) = self.heap.pop(&self.pool) else {
                slice.status = if slice.last_best != 0 {
                    SliceStatus::PartialSuccess
                } else {
                    SliceStatus::Failure
                };
                break;
            };
            iters += 1;

            let best_poly = self.pool.get(best_index).poly_ref;
            self.pool.get_mut(best_index).flags.remove(NodeFlags::OPEN);
            self.pool.get_mut(best_index).flags.insert(NodeFlags::CLOSED);

            if best_poly == slice.end {
                slice.last_best = best_index;
                slice.last_best_cost = 0.0;
                slice.status = SliceStatus::Success;
                break;
            }

            let best_cost = self.pool.get(best_index).cost;
            let best_pos = self.pool.get(best_index).position;
            let best_total = self.pool.get(best_index).total;
            if best_total - best_cost < slice.last_best_cost {
                slice.last_best = best_index;
                slice.last_best_cost = best_total - best_cost;
            }

            let Some(edges) = mesh.edge_count(best_poly) else { continue };
            for edge in 0..edges {
                let Some(neighbor_ref) = mesh.neighbor(best_poly, edge) else { continue };
                if !(mesh.is_valid_poly_ref(neighbor_ref) && mesh.passes_filter(neighbor_ref, filter)) {
                    continue;
                }
                let Some(area) = mesh.poly_area(neighbor_ref) else { continue };
                let edge_cost = filter.area_cost(area);
                if edge_cost <= 0.0 {
                    continue;
                }
                let neighbor_pos = mesh
                    .poly_vertices(neighbor_ref)
                    .map(|v| v.iter().fold(Vec3::ZERO, |acc, &p| acc + p) / v.len() as f32)
                    .unwrap_or(best_pos);

                let Some(neighbor_index) = self.pool.get_node(neighbor_ref, 0) else {
                    slice.status = SliceStatus::Failure;
                    continue;
                };
                let new_cost = best_cost + best_pos.distance(neighbor_pos) * edge_cost;
                let existing = self.pool.get(neighbor_index);
                let already_closed = existing.flags.contains(NodeFlags::CLOSED);
                let already_open = existing.flags.contains(NodeFlags::OPEN);
                if (already_open || already_closed) && new_cost >= existing.cost {
                    continue;
                }

                let node = self.pool.get_mut(neighbor_index);
                node.parent_index = best_index;
                node.cost = new_cost;
                node.total = new_cost + Self::heuristic(neighbor_pos, slice.end_pos);
                node.position = neighbor_pos;
                node.flags.remove(NodeFlags::CLOSED);

                if already_open {
                    self.heap.modify(&self.pool, neighbor_index);
                } else {
                    self.pool.get_mut(neighbor_index).flags.insert(NodeFlags::OPEN);
                    self.heap.push(&self.pool, neighbor_index);
                }
            }

            if self.heap.is_empty() {
                slice.status = if slice.last_best != 0 {
                    SliceStatus::PartialSuccess
                } else {
                    SliceStatus::Failure
                };
                break;
            }
        }

        (iters, slice.status)
    }

    fn recover_path(&self, mut node_index: NodeIndex, max_path: usize) -> Vec<PolyRef> {
        let mut reversed = Vec::new();
        while node_index != 0 && reversed.len() < max_path {
            let node = self.pool.get(node_index);
            reversed.push(node.poly_ref);
            node_index = node.parent_index;
        }
        reversed.reverse();
        reversed
    }

    /// Reconstructs the best known polygon sequence for a search that
    /// reached [`SliceStatus::Success`] or [`SliceStatus::PartialSuccess`].
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<Vec<PolyRef>, QueryError> {
        let slice = self.slice.take().ok_or(QueryError::InvalidRef)?;
        match slice.status {
            SliceStatus::Success | SliceStatus::PartialSuccess => {
                Ok(self.recover_path(slice.last_best, max_path))
            }
            _ => Err(QueryError::InvalidRef),
        }
    }

    /// Like [`Self::finalize_sliced_find_path`], but re-roots onto the best
    /// node that also appears in `existing_path`, so a replan that only
    /// partially improves the route still produces a corridor sharing a
    /// prefix with the one the agent was already following.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing_path: &[PolyRef],
        max_path: usize,
    ) -> Result<Vec<PolyRef>, QueryError> {
        let slice = self.slice.take().ok_or(QueryError::InvalidRef)?;
        if existing_path.is_empty() {
            return Err(QueryError::InvalidRef);
        }

        // Walk the closed set looking for the best-cost node whose poly_ref
        // also appears in existing_path; fall back to last_best otherwise.
        let mut best_index = slice.last_best;
        let mut best_cost = f32::MAX;
        for poly_ref in existing_path {
            if let Some(candidates) = Some(self.pool.find_nodes(*poly_ref)) {
                for candidate in candidates {
                    let node = self.pool.get(candidate);
                    if node.flags.contains(NodeFlags::CLOSED) && node.total < best_cost {
                        best_cost = node.total;
                        best_index = candidate;
                    }
                }
            }
        }
        Ok(self.recover_path(best_index, max_path))
    }

    /// Casts a ray from `start` to `end`, walking mesh connectivity from
    /// `start_ref` through whichever edge the ray actually crosses in each
    /// polygon (not restricted to any particular corridor). Returns the
    /// fraction along `(start, end)` where the cast stopped (`1.0` if it
    /// reached `end` unobstructed) and the sequence of polygons visited.
    pub fn raycast(
        &self,
        mesh: &dyn NavMesh,
        filter: &QueryFilter,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
    ) -> (f32, Vec<PolyRef>) {
        let mut visited = vec![start_ref];
        let mut cur_ref = start_ref;
        loop {
            let Some(verts) = mesh.poly_vertices(cur_ref) else { return (0.0, visited) };
            let n = verts.len();
            if n < 2 {
                return (0.0, visited);
            }
            let mut crossing: Option<(usize, f32)> = None;
            for i in 0..n {
                let a = verts[i];
                let b = verts[(i + 1) % n];
                if let Some((_, frac)) = segment_intersect_2d(start, end, a, b) {
                    if crossing.map(|(_, best)| frac < best).unwrap_or(true) {
                        crossing = Some((i, frac));
                    }
                }
            }
            let Some((edge_index, frac)) = crossing else {
                return (1.0, visited);
            };
            let Some(neighbor_ref) = mesh.neighbor(cur_ref, edge_index) else {
                return (frac, visited);
            };
            if !self.is_valid_poly_ref(mesh, neighbor_ref, filter) {
                return (frac, visited);
            }
            visited.push(neighbor_ref);
            cur_ref = neighbor_ref;
            if visited.len() >= Self::MAX_RAYCAST_VISITED {
                return (frac, visited);
            }
        }
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
            Vec3::new(3.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 1.0),
        ];
        let polygons =
            vec![vec![0, 1, 2, 3], vec![1, 4, 5, 2], vec![4, 6, 7, 5]];
        PolyMesh::new(vertices, polygons, vec![0, 0, 0], vec![0xffff; 3]).unwrap()
    }

    #[test]
    fn sliced_search_finds_path_across_three_polygons() {
        let mesh = corridor_mesh();
        let filter = QueryFilter::new();
        let mut query = MeshQuery::new(MAX_COMMON_NODES);
        query
            .init_sliced_find_path(
                &mesh,
                PolyRef(1),
                PolyRef(3),
                Vec3::new(0.5, 0.0, 0.5),
                Vec3::new(2.5, 0.0, 0.5),
                &filter,
            )
            .unwrap();
        let mut status = SliceStatus::InProgress;
        for _ in 0..10 {
            let (_, s) = query.update_sliced_find_path(&mesh, &filter, 20);
            status = s;
            if status != SliceStatus::InProgress {
                break;
            }
        }
        assert_eq!(status, SliceStatus::Success);
        let path = query.finalize_sliced_find_path(256).unwrap();
        assert_eq!(path, vec![PolyRef(1), PolyRef(2), PolyRef(3)]);
    }

    #[test]
    fn invalid_start_ref_fails_init() {
        let mesh = corridor_mesh();
        let filter = QueryFilter::new();
        let mut query = MeshQuery::new(MAX_COMMON_NODES);
        let result = query.init_sliced_find_path(
            &mesh,
            PolyRef(99),
            PolyRef(1),
            Vec3::ZERO,
            Vec3::ZERO,
            &filter,
        );
        assert_eq!(result, Err(QueryError::InvalidRef));
    }

    #[test]
    fn raycast_walks_connected_polygons_and_reports_a_clear_hit() {
        let mesh = corridor_mesh();
        let filter = QueryFilter::new();
        let query = MeshQuery::new(MAX_COMMON_NODES);
        let (frac, visited) = query.raycast(
            &mesh,
            &filter,
            PolyRef(1),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(2.5, 0.0, 0.5),
        );
        assert!(frac >= 0.99, "expected a clear cast, got {frac}");
        assert_eq!(visited, vec![PolyRef(1), PolyRef(2), PolyRef(3)]);
    }

    #[test]
    fn raycast_stops_at_the_mesh_boundary() {
        let mesh = corridor_mesh();
        let filter = QueryFilter::new();
        let query = MeshQuery::new(MAX_COMMON_NODES);
        let (frac, visited) = query.raycast(
            &mesh,
            &filter,
            PolyRef(1),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(0.5, 0.0, 5.0),
        );
        assert!(frac < 1.0);
        assert_eq!(visited, vec![PolyRef(1)]);
    }

    #[test]
    fn find_nearest_poly_returns_containing_polygon() {
        let mesh = corridor_mesh();
        let filter = QueryFilter::new();
        let query = MeshQuery::new(MAX_COMMON_NODES);
        let (poly_ref, point) = query
            .find_nearest_poly(&mesh, Vec3::new(0.5, 0.0, 0.5), Vec3::splat(1.0), &filter)
            .unwrap();
        assert_eq!(poly_ref, PolyRef(1));
        assert!(point.distance(Vec3::new(0.5, 0.0, 0.5)) < 1e-4);
    }
}
