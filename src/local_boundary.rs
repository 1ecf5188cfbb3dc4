//! Cached set of nearby impassable wall segments around an agent.
//!
//! Grounded on `DetourCrowd.cpp`'s boundary-refresh trigger
//! (25% of `collisionQueryRange` drift from the cached center). No literal
//! `DetourLocalBoundary.cpp` was retrieved in the pack; segment collection
//! walks polygon edges directly through the [`NavMesh`] trait instead of
//! being transliterated from a missing original.

use glam::Vec3;

use crate::nav_mesh::{NavMesh, PolyRef, QueryFilter};

pub const MAX_SEGMENTS: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub start: Vec3,
    pub end: Vec3,
    pub owning_poly: PolyRef,
}

pub struct LocalBoundary {
    center: Vec3,
    segments: Vec<Segment>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self { center: Vec3::ZERO, segments: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.center = Vec3::ZERO;
        self.segments.clear();
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Segment {
        self.segments[index]
    }

    /// Walks polygons reachable from `center_ref` within `range` and
    /// collects their outward-facing (unconnected) edges as wall segments.
    pub fn update(
        &mut self,
        mesh: &dyn NavMesh,
        filter: &QueryFilter,
        center_ref: PolyRef,
        center_pos: Vec3,
        range: f32,
    ) {
        self.center = center_pos;
        self.segments.clear();

        let mut visited = vec![center_ref];
        let mut frontier = vec![center_ref];
        while let Some(poly_ref) = frontier.pop() {
            let Some(verts) = mesh.poly_vertices(poly_ref) else { continue };
            // Real geometric edges only: off-mesh links hang off the end of
            // `edge_count` without a matching vertex pair and are not walls.
            let edge_count = verts.len();
            for edge in 0..edge_count {
                let a = verts[edge];
                let b = verts[(edge + 1) % edge_count];
                match mesh.neighbor(poly_ref, edge) {
                    Some(neighbor) if mesh.passes_filter(neighbor, filter) => {
                        if !visited.contains(&neighbor) {
                            let mid = (a + b) * 0.5;
                            if mid.distance(center_pos) <= range {
                                visited.push(neighbor);
                                frontier.push(neighbor);
                            }
                        }
                    }
                    _ => {
                        if self.segments.len() < MAX_SEGMENTS {
                            self.segments.push(Segment { start: a, end: b, owning_poly: poly_ref });
                        }
                    }
                }
            }
        }
    }

    /// False if any polygon underpinning a cached segment is no longer
    /// valid.
    pub fn is_valid(&self, mesh: &dyn NavMesh, filter: &QueryFilter) -> bool {
        self.segments
            .iter()
            .all(|s| mesh.is_valid_poly_ref(s.owning_poly) && mesh.passes_filter(s.owning_poly, filter))
    }
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nav_mesh::PolyMesh;

    fn single_quad() -> PolyMesh {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        PolyMesh::new(vertices, vec![vec![0, 1, 2, 3]], vec![0], vec![0xffff]).unwrap()
    }

    #[test]
    fn isolated_polygon_collects_all_four_edges_as_walls() {
        let mesh = single_quad();
        let filter = QueryFilter::new();
        let mut boundary = LocalBoundary::new();
        boundary.update(&mesh, &filter, PolyRef(1), Vec3::new(0.5, 0.0, 0.5), 5.0);
        assert_eq!(boundary.segment_count(), 4);
    }

    #[test]
    fn invalid_once_filter_excludes_owning_polygon() {
        let mesh = single_quad();
        let mut filter = QueryFilter::new();
        let mut boundary = LocalBoundary::new();
        boundary.update(&mesh, &filter, PolyRef(1), Vec3::new(0.5, 0.0, 0.5), 5.0);
        assert!(boundary.is_valid(&mesh, &filter));
        filter.set_area_cost(0, 0.0);
        assert!(!boundary.is_valid(&mesh, &filter));
    }
}
