//! Per-agent ordered sequence of polygon references representing a
//! validated path, plus the current position snapped onto its head and the
//! target position snapped onto its tail.
//!
//! Grounded on `DetourCrowd.cpp`'s corridor call sites
//! (`updateMoveRequest`'s splice logic, phase 5's off-mesh handoff, phase
//! 10's `movePosition`). The straight-path funnel in [`Self::find_corners`]
//! is adapted from `landmass::path`'s cross-product funnel advance, walking
//! a flat polygon corridor instead of island/portal segments.

use glam::Vec3;

use crate::geom::triangle_area2;
use crate::mesh_query::MeshQuery;
use crate::nav_mesh::{NavMesh, PolyRef, QueryFilter};

pub const CORRIDOR_MAX: usize = 256;
pub const MAX_CORNERS: usize = 4;

macro_rules! bitflags2 {
    (pub struct $name:ident: u8 { $(const $variant:ident = $value:expr;)* }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
        pub struct $name(pub u8);
        impl $name {
            $(pub const $variant: Self = Self($value);)*
            pub const fn empty() -> Self { Self(0) }
            pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
        }
        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
        }
    };
}

bitflags2! {
    pub struct CornerFlags: u8 {
        const END_OF_PATH = 0x01;
        const OFF_MESH_CONNECTION = 0x02;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Corner {
    pub position: Vec3,
    pub flags: CornerFlags,
    pub poly_ref: PolyRef,
}

pub struct PathCorridor {
    path: Vec<PolyRef>,
    position: Vec3,
    target: Vec3,
}

impl PathCorridor {
    pub fn new() -> Self {
        Self { path: Vec::new(), position: Vec3::ZERO, target: Vec3::ZERO }
    }

    pub fn reset(&mut self, poly_ref: PolyRef, pos: Vec3) {
        self.path.clear();
        self.path.push(poly_ref);
        self.position = pos;
        self.target = pos;
    }

    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.path = path.iter().copied().take(CORRIDOR_MAX).collect();
        self.target = target;
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn first_poly(&self) -> Option<PolyRef> {
        self.path.first().copied()
    }

    pub fn last_poly(&self) -> Option<PolyRef> {
        self.path.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// First `lookahead` polygons all pass `is_valid_poly_ref`.
    pub fn is_valid(&self, mesh: &dyn NavMesh, filter: &QueryFilter, lookahead: usize) -> bool {
        if self.path.is_empty() {
            return false;
        }
        self.path
            .iter()
            .take(lookahead)
            .all(|&p| mesh.is_valid_poly_ref(p) && mesh.passes_filter(p, filter))
    }

    /// Walks `new_pos` along adjacent polygons using a constrained slide,
    /// trimming the head of the corridor to the polygon that now contains
    /// the agent, preserving the tail.
    pub fn move_position(&mut self, mesh: &dyn NavMesh, filter: &QueryFilter, new_pos: Vec3) {
        if self.path.is_empty() {
            return;
        }
        let mut current_index = 0usize;
        let mut pos = new_pos;
        // Constrained slide: walk forward through the corridor while the
        // target point lies outside the current polygon's footprint but
        // inside a neighbor already on the corridor.
        for _ in 0..self.path.len() {
            let Some(poly_ref) = self.path.get(current_index).copied() else { break };
            let Some(verts) = mesh.poly_vertices(poly_ref) else { break };
            if crate::geom::point_in_convex_polygon(pos, &verts) {
                break;
            }
            let Some(next_index) = current_index.checked_add(1) else { break };
            if next_index >= self.path.len() {
                break;
            }
            let _ = filter;
            current_index = next_index;
        }
        if let Some(poly_ref) = self.path.get(current_index).copied() {
            if let Some(verts) = mesh.poly_vertices(poly_ref) {
                pos = crate::geom::project_to_polygon(pos, &verts);
            }
        }
        self.path.drain(0..current_index);
        self.position = pos;
    }

    pub fn move_target_position(&mut self, mesh: &dyn NavMesh, new_target: Vec3) {
        if let Some(&last) = self.path.last() {
            if let Some(verts) = mesh.poly_vertices(last) {
                self.target = crate::geom::project_to_polygon(new_target, &verts);
                return;
            }
        }
        self.target = new_target;
    }

    /// Forces the head polygon to `poly_ref` and position to `pos` without
    /// touching the tail. Used for recovery after a failed validity check.
    pub fn fix_path_start(&mut self, poly_ref: PolyRef, pos: Vec3) {
        if self.path.is_empty() {
            self.path.push(poly_ref);
        } else {
            self.path[0] = poly_ref;
        }
        self.position = pos;
    }

    /// Straight-path extraction from the current position to the target,
    /// via a funnel over corridor polygon edges. Returns a prefix of
    /// turning points (at most `max_corners`); an empty corridor yields no
    /// corners.
    pub fn find_corners(&self, mesh: &dyn NavMesh, max_corners: usize) -> Vec<Corner> {
        if self.path.is_empty() {
            return Vec::new();
        }
        if self.path.len() == 1 {
            return vec![Corner {
                position: self.target,
                flags: CornerFlags::END_OF_PATH,
                poly_ref: self.path[0],
            }];
        }

        let mut corners = Vec::new();
        let mut apex = self.position;
        let mut left = apex;
        let mut right = apex;
        let mut left_index = 0usize;
        let mut right_index = 0usize;

        let portals = self.portals(mesh);

        let mut i = 1;
        while i < portals.len() && corners.len() < max_corners {
            let (pl, pr) = portals[i];

            // Update right edge.
            if triangle_area2(apex, right, pr) <= 0.0 {
                if apex == right || triangle_area2(apex, left, pr) > 0.0 {
                    right = pr;
                    right_index = i;
                } else {
                    corners.push(Corner {
                        position: left,
                        flags: CornerFlags::empty(),
                        poly_ref: self.path[left_index.min(self.path.len() - 1)],
                    });
                    apex = left;
                    right_index = left_index;
                    right = apex;
                    left = apex;
                    i = left_index;
                }
            }
            // Update left edge.
            if triangle_area2(apex, left, pl) >= 0.0 {
                if apex == left || triangle_area2(apex, right, pl) < 0.0 {
                    left = pl;
                    left_index = i;
                } else {
                    corners.push(Corner {
                        position: right,
                        flags: CornerFlags::empty(),
                        poly_ref: self.path[right_index.min(self.path.len() - 1)],
                    });
                    apex = right;
                    left_index = right_index;
                    right = apex;
                    left = apex;
                    i = right_index;
                }
            }
            i += 1;
        }

        let mut flags = CornerFlags::END_OF_PATH;
        if let Some(&last) = self.path.last() {
            if mesh.off_mesh_connection(last).is_some() {
                flags = flags | CornerFlags::OFF_MESH_CONNECTION;
            }
        }
        corners.push(Corner { position: self.target, flags, poly_ref: *self.path.last().unwrap() });
        corners.truncate(max_corners);
        corners
    }

    /// Left/right portal points for each shared edge between consecutive
    /// corridor polygons (index 0 is a degenerate portal at the agent's
    /// position).
    fn portals(&self, mesh: &dyn NavMesh) -> Vec<(Vec3, Vec3)> {
        let mut portals = vec![(self.position, self.position)];
        for window in self.path.windows(2) {
            let (a, b) = (window[0], window[1]);
            let Some(a_verts) = mesh.poly_vertices(a) else { continue };
            let Some(b_verts) = mesh.poly_vertices(b) else { continue };
            if let Some((l, r)) = shared_edge(&a_verts, &b_verts) {
                portals.push((l, r));
            } else {
                portals.push((self.target, self.target));
            }
        }
        portals.push((self.target, self.target));
        portals
    }

    /// Raycasts from the current position toward a point `range` units
    /// along the direction to `look_ahead`; if the ray clears, substitutes
    /// the visible polygon sequence for the head of the corridor (a
    /// shortcut).
    pub fn optimize_path_visibility(
        &mut self,
        mesh: &dyn NavMesh,
        filter: &QueryFilter,
        query: &MeshQuery,
        look_ahead: Vec3,
        range: f32,
    ) {
        let Some(&start_ref) = self.path.first() else { return };
        let dist = self.position.distance(look_ahead);
        if dist < 1e-4 {
            return;
        }
        let clamped = dist.min(range.max(1e-4));
        let goal = self.position + (look_ahead - self.position) / dist * clamped;

        let (frac, visited) = query.raycast(mesh, filter, start_ref, self.position, goal);
        if visited.len() <= 1 || frac < 0.99 {
            return;
        }

        // visited is unobstructed from self.position; splice it in as the
        // new head, keeping whatever tail of the old corridor lies beyond
        // where the two sequences reconverge.
        let tail_start = visited
            .last()
            .and_then(|last| self.path.iter().position(|p| p == last))
            .map(|i| i + 1)
            .unwrap_or(self.path.len());
        let mut new_path = visited;
        new_path.extend_from_slice(&self.path[tail_start.min(self.path.len())..]);
        new_path.truncate(CORRIDOR_MAX);
        self.path = new_path;
    }

    /// Local re-search within a bounded iteration budget to improve the
    /// head of the corridor after mesh topology or filter changes.
    pub fn optimize_path_topology(
        &mut self,
        mesh: &dyn NavMesh,
        filter: &QueryFilter,
        query: &mut MeshQuery,
        max_iters: u32,
    ) -> bool {
        let (Some(&start), Some(&end)) = (self.path.first(), self.path.last()) else {
            return false;
        };
        if start == end {
            return false;
        }
        if query.init_sliced_find_path(mesh, start, end, self.position, self.target, filter).is_err() {
            return false;
        }
        let (_, status) = query.update_sliced_find_path(mesh, filter, max_iters);
        if status != crate::mesh_query::SliceStatus::Success {
            return false;
        }
        let Ok(new_path) = query.finalize_sliced_find_path(CORRIDOR_MAX) else { return false };
        if new_path.len() < self.path.len() {
            self.path = new_path;
            true
        } else {
            false
        }
    }

    /// On success removes `link_poly_ref` and the polygon preceding it from
    /// the corridor and returns the link's `(start, end)` endpoints.
    pub fn move_over_offmesh_connection(
        &mut self,
        mesh: &dyn NavMesh,
        link_poly_ref: PolyRef,
    ) -> Option<(Vec3, Vec3)> {
        let conn = mesh.off_mesh_connection(link_poly_ref)?;
        let link_pos = self.path.iter().position(|&p| p == link_poly_ref)?;
        if link_pos == 0 {
            return None;
        }
        self.path.drain(0..=link_pos);
        self.position = conn.end;
        Some((conn.start, conn.end))
    }
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_edge(a: &[Vec3], b: &[Vec3]) -> Option<(Vec3, Vec3)> {
    let na = a.len();
    let nb = b.len();
    for i in 0..na {
        let (a0, a1) = (a[i], a[(i + 1) % na]);
        for j in 0..nb {
            let (b0, b1) = (b[j], b[(j + 1) % nb]);
            if (a0.distance_squared(b1) < 1e-6 && a1.distance_squared(b0) < 1e-6)
                || (a0.distance_squared(b0) < 1e-6 && a1.distance_squared(b1) < 1e-6)
            {
                return Some((a0, a1));
            }
        }
    }
    None
}
