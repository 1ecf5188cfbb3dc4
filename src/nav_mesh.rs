//! The navigation-mesh collaborator contract, plus a minimal concrete mesh
//! used to exercise and test the crowd pipeline.
//!
//! Building navmeshes (voxelization, region partitioning, contour/polygon
//! meshing) and tile caching are out of scope for this crate; [`NavMesh`] is
//! the read-only interface a host's own mesh-baking pipeline must implement.
//! [`PolyMesh`] is a small, manually-constructible reference implementation,
//! grounded on `landmass`'s `NavigationMesh::validate`, simplified to one
//! contiguous mesh with no islands, no height mesh, and no runtime tile
//! add/remove.

use std::collections::HashMap;

use disjoint::DisjointSet;
use glam::Vec3;
use thiserror::Error;

/// Opaque identifier of a polygon. `0` is reserved for "none".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PolyRef(pub u64);

impl PolyRef {
    pub const NONE: PolyRef = PolyRef(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// A predicate over polygons: an allowed area-type bitmask, an area-to-cost
/// table, and an include/exclude polygon-flag mask.
#[derive(Clone, Debug)]
pub struct QueryFilter {
    include_flags: u16,
    exclude_flags: u16,
    area_cost: [f32; 64],
}

impl QueryFilter {
    pub fn new() -> Self {
        Self { include_flags: 0xffff, exclude_flags: 0, area_cost: [1.0; 64] }
    }

    pub fn with_flags(include_flags: u16, exclude_flags: u16) -> Self {
        Self { include_flags, exclude_flags, ..Self::new() }
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        self.area_cost[area as usize % 64] = cost;
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost[area as usize % 64]
    }

    /// Whether a polygon with the given `flags` passes this filter.
    pub fn passes_flags(&self, flags: u16) -> bool {
        (flags & self.include_flags) != 0 && (flags & self.exclude_flags) == 0
    }
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// An off-mesh connection: a scripted link between two points not joined by
/// shared polygon edges (jump, teleport, door). Carries its own area/flags so
/// a [`QueryFilter`] can include or exclude it like any other polygon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OffMeshConnection {
    pub poly_ref: PolyRef,
    pub start: Vec3,
    pub end: Vec3,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: u16,
}

/// The read-only polygon mesh a [`crate::crowd::Crowd`] queries against.
///
/// Implementations own polygon storage, connectivity, and off-mesh link
/// resolution; this crate never mutates a mesh.
pub trait NavMesh {
    /// Vertex positions of `poly_ref`, in winding order.
    fn poly_vertices(&self, poly_ref: PolyRef) -> Option<Vec<Vec3>>;

    /// Number of edges (== number of vertices) of `poly_ref`.
    fn edge_count(&self, poly_ref: PolyRef) -> Option<usize>;

    /// `PolyRef` of the polygon adjacent across edge `edge_index`, if any.
    fn neighbor(&self, poly_ref: PolyRef, edge_index: usize) -> Option<PolyRef>;

    fn poly_area(&self, poly_ref: PolyRef) -> Option<u8>;

    fn poly_flags(&self, poly_ref: PolyRef) -> Option<u16>;

    fn off_mesh_connection(&self, poly_ref: PolyRef) -> Option<OffMeshConnection>;

    fn is_off_mesh_connection(&self, poly_ref: PolyRef) -> bool {
        self.off_mesh_connection(poly_ref).is_some()
    }

    /// Whether `poly_ref` currently refers to live mesh data (tile present,
    /// salt matches). Meshes with no tile lifecycle may always return true.
    fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool;

    fn passes_filter(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        match (self.poly_area(poly_ref), self.poly_flags(poly_ref)) {
            (Some(area), Some(flags)) => {
                filter.area_cost(area) > 0.0 && filter.passes_flags(flags)
            }
            _ => false,
        }
    }

    /// All polygons, for brute-force nearest-polygon queries. Hosts with
    /// spatial acceleration structures may override `find_nearest_poly`
    /// in [`crate::mesh_query::MeshQuery`] instead of relying on this.
    fn all_polys(&self) -> Box<dyn Iterator<Item = PolyRef> + '_>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("polygon {0} has fewer than 3 vertices")]
    NotEnoughVertices(usize),
    #[error("polygon {0} is not convex")]
    ConcavePolygon(usize),
    #[error("polygon {0} has a degenerate edge")]
    DegenerateEdge(usize),
    #[error("edge ({0}, {1}) is shared by more than two polygons")]
    DoublyConnectedEdge(usize, usize),
}

#[derive(Clone, Debug, PartialEq)]
struct Connectivity {
    polygon_index: usize,
    #[allow(dead_code)]
    reverse_edge: usize,
}

#[derive(Clone, Debug, PartialEq)]
struct Polygon {
    vertices: Vec<usize>,
    connectivity: Vec<Option<Connectivity>>,
    area: u8,
    flags: u16,
    region: usize,
}

/// A small, single-contiguous-mesh `NavMesh` for tests and simple hosts.
///
/// Construct with [`PolyMesh::new`], which validates winding, convexity, and
/// edge connectivity before producing a usable mesh.
#[derive(Debug, PartialEq)]
pub struct PolyMesh {
    vertices: Vec<Vec3>,
    polygons: Vec<Polygon>,
    off_mesh_connections: HashMap<u64, OffMeshConnection>,
    /// Off-mesh connection id -> (start polygon index, end polygon index),
    /// the two real polygons the connection teleports between.
    off_mesh_endpoints: HashMap<u64, (usize, usize)>,
    /// Real polygon index -> off-mesh connection refs reachable from it.
    /// Synthetic edges appended after a polygon's real ones: `neighbor`
    /// indexes into this once `edge_index >= poly.vertices.len()`.
    extra_links: HashMap<usize, Vec<PolyRef>>,
    next_off_mesh_id: u64,
}

enum EdgeState {
    Boundary(usize, usize),
    Connected,
}

impl PolyMesh {
    /// `polygons[i]` is a CCW list of indices into `vertices`, with matching
    /// `areas[i]`/`flags[i]`.
    pub fn new(
        vertices: Vec<Vec3>,
        polygons: Vec<Vec<usize>>,
        areas: Vec<u8>,
        flags: Vec<u16>,
    ) -> Result<Self, ValidationError> {
        assert_eq!(polygons.len(), areas.len());
        assert_eq!(polygons.len(), flags.len());

        for (i, poly) in polygons.iter().enumerate() {
            if poly.len() < 3 {
                return Err(ValidationError::NotEnoughVertices(i));
            }
            if !is_convex_ccw(&vertices, poly) {
                return Err(ValidationError::ConcavePolygon(i));
            }
        }

        let mut edges: HashMap<(usize, usize), EdgeState> = HashMap::new();
        let mut connectivity: Vec<Vec<Option<Connectivity>>> =
            polygons.iter().map(|p| vec![None; p.len()]).collect();

        for (poly_index, poly) in polygons.iter().enumerate() {
            for edge_index in 0..poly.len() {
                let a = poly[edge_index];
                let b = poly[(edge_index + 1) % poly.len()];
                if a == b || vertices[a].distance_squared(vertices[b]) < 1e-10 {
                    return Err(ValidationError::DegenerateEdge(poly_index));
                }
                let key = (a.min(b), a.max(b));
                match edges.get(&key) {
                    None => {
                        edges.insert(key, EdgeState::Boundary(poly_index, edge_index));
                    }
                    Some(EdgeState::Boundary(other_poly, other_edge)) => {
                        let (other_poly, other_edge) = (*other_poly, *other_edge);
                        connectivity[poly_index][edge_index] =
                            Some(Connectivity { polygon_index: other_poly, reverse_edge: other_edge });
                        connectivity[other_poly][other_edge] =
                            Some(Connectivity { polygon_index: poly_index, reverse_edge: edge_index });
                        edges.insert(key, EdgeState::Connected);
                    }
                    Some(EdgeState::Connected) => {
                        return Err(ValidationError::DoublyConnectedEdge(a, b));
                    }
                }
            }
        }

        let mut regions = DisjointSet::with_len(polygons.len());
        for (poly_index, conns) in connectivity.iter().enumerate() {
            for conn in conns.iter().flatten() {
                regions.join(poly_index, conn.polygon_index);
            }
        }
        let region_of: Vec<usize> = (0..polygons.len()).map(|i| regions.root_of(i)).collect();

        let polygons = polygons
            .into_iter()
            .zip(connectivity)
            .zip(areas)
            .zip(flags)
            .enumerate()
            .map(|(i, (((vertices, connectivity), area), flags))| Polygon {
                vertices,
                connectivity,
                area,
                flags,
                region: region_of[i],
            })
            .collect();

        Ok(Self {
            vertices,
            polygons,
            off_mesh_connections: HashMap::new(),
            off_mesh_endpoints: HashMap::new(),
            extra_links: HashMap::new(),
            next_off_mesh_id: 1,
        })
    }

    /// Adds a scripted off-mesh link, wiring it into the connectivity graph
    /// as a synthetic edge from the polygon nearest `start` (and, if
    /// `bidirectional`, from the polygon nearest `end` too). Returns `None`
    /// if the mesh has no polygons to anchor the link to.
    pub fn add_off_mesh_connection(
        &mut self,
        start: Vec3,
        end: Vec3,
        bidirectional: bool,
        area: u8,
        flags: u16,
    ) -> Option<PolyRef> {
        let start_idx = self.nearest_poly_index(start)?;
        let end_idx = self.nearest_poly_index(end)?;

        let id = self.next_off_mesh_id;
        self.next_off_mesh_id += 1;
        // Off-mesh connections get poly refs above the polygon count so they
        // never alias a real polygon index.
        let poly_ref = PolyRef((self.polygons.len() as u64) + 1_000_000 + id);
        self.off_mesh_connections.insert(
            poly_ref.0,
            OffMeshConnection { poly_ref, start, end, bidirectional, area, flags },
        );
        self.off_mesh_endpoints.insert(poly_ref.0, (start_idx, end_idx));
        self.extra_links.entry(start_idx).or_default().push(poly_ref);
        if bidirectional {
            self.extra_links.entry(end_idx).or_default().push(poly_ref);
        }
        Some(poly_ref)
    }

    /// Brute-force nearest polygon by footprint distance, for anchoring a
    /// new off-mesh connection. `mesh_query.rs`'s `MeshQuery::find_nearest_poly`
    /// can't be reused here: it lives above this module in the dependency
    /// graph.
    fn nearest_poly_index(&self, point: Vec3) -> Option<usize> {
        self.polygons
            .iter()
            .enumerate()
            .map(|(idx, poly)| {
                let verts: Vec<Vec3> = poly.vertices.iter().map(|&v| self.vertices[v]).collect();
                let projected = crate::geom::project_to_polygon(point, &verts);
                (idx, point.distance_squared(projected))
            })
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
    }

    pub fn poly_count(&self) -> usize {
        self.polygons.len()
    }

    pub fn region_of(&self, poly_ref: PolyRef) -> Option<usize> {
        self.poly_index(poly_ref).map(|i| self.polygons[i].region)
    }

    fn poly_index(&self, poly_ref: PolyRef) -> Option<usize> {
        let idx = poly_ref.0.checked_sub(1)? as usize;
        (idx < self.polygons.len()).then_some(idx)
    }

    fn poly_ref_of(&self, index: usize) -> PolyRef {
        PolyRef(index as u64 + 1)
    }

    pub fn center(&self, poly_ref: PolyRef) -> Option<Vec3> {
        let poly = &self.polygons[self.poly_index(poly_ref)?];
        let sum: Vec3 = poly.vertices.iter().map(|&v| self.vertices[v]).sum();
        Some(sum / poly.vertices.len() as f32)
    }
}

fn is_convex_ccw(vertices: &[Vec3], poly: &[usize]) -> bool {
    let n = poly.len();
    let mut saw_positive = false;
    let mut saw_negative = false;
    for i in 0..n {
        let a = vertices[poly[i]];
        let b = vertices[poly[(i + 1) % n]];
        let c = vertices[poly[(i + 2) % n]];
        let cross = (b.x - a.x) * (c.z - a.z) - (b.z - a.z) * (c.x - a.x);
        if cross > 1e-6 {
            saw_positive = true;
        } else if cross < -1e-6 {
            saw_negative = true;
        }
    }
    saw_positive && !saw_negative
}

impl NavMesh for PolyMesh {
    fn poly_vertices(&self, poly_ref: PolyRef) -> Option<Vec<Vec3>> {
        if let Some(idx) = self.poly_index(poly_ref) {
            let poly = &self.polygons[idx];
            return Some(poly.vertices.iter().map(|&v| self.vertices[v]).collect());
        }
        let conn = self.off_mesh_connections.get(&poly_ref.0)?;
        Some(vec![conn.start, conn.end])
    }

    fn edge_count(&self, poly_ref: PolyRef) -> Option<usize> {
        if let Some(idx) = self.poly_index(poly_ref) {
            let extra = self.extra_links.get(&idx).map_or(0, |links| links.len());
            return Some(self.polygons[idx].vertices.len() + extra);
        }
        let conn = self.off_mesh_connections.get(&poly_ref.0)?;
        Some(if conn.bidirectional { 2 } else { 1 })
    }

    fn neighbor(&self, poly_ref: PolyRef, edge_index: usize) -> Option<PolyRef> {
        if let Some(idx) = self.poly_index(poly_ref) {
            let poly = &self.polygons[idx];
            let n = poly.vertices.len();
            if edge_index < n {
                let conn = poly.connectivity.get(edge_index)?.as_ref()?;
                return Some(self.poly_ref_of(conn.polygon_index));
            }
            return self.extra_links.get(&idx)?.get(edge_index - n).copied();
        }
        let conn = self.off_mesh_connections.get(&poly_ref.0)?;
        let &(start_idx, end_idx) = self.off_mesh_endpoints.get(&poly_ref.0)?;
        match edge_index {
            0 => Some(self.poly_ref_of(end_idx)),
            1 if conn.bidirectional => Some(self.poly_ref_of(start_idx)),
            _ => None,
        }
    }

    fn poly_area(&self, poly_ref: PolyRef) -> Option<u8> {
        if let Some(idx) = self.poly_index(poly_ref) {
            return Some(self.polygons[idx].area);
        }
        self.off_mesh_connections.get(&poly_ref.0).map(|c| c.area)
    }

    fn poly_flags(&self, poly_ref: PolyRef) -> Option<u16> {
        if let Some(idx) = self.poly_index(poly_ref) {
            return Some(self.polygons[idx].flags);
        }
        self.off_mesh_connections.get(&poly_ref.0).map(|c| c.flags)
    }

    fn off_mesh_connection(&self, poly_ref: PolyRef) -> Option<OffMeshConnection> {
        self.off_mesh_connections.get(&poly_ref.0).copied()
    }

    fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        self.poly_index(poly_ref).is_some() || self.off_mesh_connections.contains_key(&poly_ref.0)
    }

    fn all_polys(&self) -> Box<dyn Iterator<Item = PolyRef> + '_> {
        Box::new((0..self.polygons.len()).map(|i| self.poly_ref_of(i)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn quad_mesh() -> PolyMesh {
        // Two unit quads sharing an edge, laid out along X at z in [0, 1].
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 1.0),
        ];
        let polygons = vec![vec![0, 1, 2, 3], vec![1, 4, 5, 2]];
        PolyMesh::new(vertices, polygons, vec![0, 0], vec![0xffff, 0xffff]).unwrap()
    }

    #[test]
    fn adjacent_quads_are_connected_across_shared_edge() {
        let mesh = quad_mesh();
        assert_eq!(mesh.neighbor(PolyRef(1), 0), None);
        assert_eq!(mesh.neighbor(PolyRef(1), 1), Some(PolyRef(2)));
        assert_eq!(mesh.neighbor(PolyRef(2), 3), Some(PolyRef(1)));
    }

    #[test]
    fn shared_region_spans_connected_polygons() {
        let mesh = quad_mesh();
        assert_eq!(mesh.region_of(PolyRef(1)), mesh.region_of(PolyRef(2)));
    }

    #[test]
    fn rejects_concave_polygon() {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 2.0),
        ];
        let result = PolyMesh::new(vertices, vec![vec![0, 1, 2, 3, 4]], vec![0], vec![0xffff]);
        assert_eq!(result, Err(ValidationError::ConcavePolygon(0)));
    }

    #[test]
    fn filter_respects_area_cost_and_flag_mask() {
        let mut filter = QueryFilter::new();
        filter.set_area_cost(3, 0.0);
        assert!(!(filter.area_cost(3) > 0.0));
        let restricted = QueryFilter::with_flags(0x01, 0x02);
        assert!(restricted.passes_flags(0x01));
        assert!(!restricted.passes_flags(0x03));
    }

    fn two_islands() -> PolyMesh {
        // Two quads with no shared vertices, only reachable via an off-mesh
        // connection.
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(11.0, 0.0, 0.0),
            Vec3::new(11.0, 0.0, 1.0),
            Vec3::new(10.0, 0.0, 1.0),
        ];
        let polygons = vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]];
        PolyMesh::new(vertices, polygons, vec![0, 0], vec![0xffff, 0xffff]).unwrap()
    }

    #[test]
    fn off_mesh_connection_links_nearest_polygons_into_the_graph() {
        let mut mesh = two_islands();
        let link = mesh
            .add_off_mesh_connection(
                Vec3::new(1.0, 0.0, 0.5),
                Vec3::new(10.0, 0.0, 0.5),
                true,
                0,
                0xffff,
            )
            .expect("both endpoints sit over a polygon");

        assert_eq!(mesh.edge_count(PolyRef(1)), Some(5));
        assert_eq!(mesh.edge_count(PolyRef(2)), Some(5));
        assert_eq!(mesh.neighbor(PolyRef(1), 4), Some(link));
        assert_eq!(mesh.neighbor(PolyRef(2), 4), Some(link));

        assert_eq!(mesh.neighbor(link, 0), Some(PolyRef(2)));
        assert_eq!(mesh.neighbor(link, 1), Some(PolyRef(1)));
        assert!(mesh.is_valid_poly_ref(link));
        assert_eq!(mesh.poly_vertices(link), Some(vec![Vec3::new(1.0, 0.0, 0.5), Vec3::new(10.0, 0.0, 0.5)]));
    }

    #[test]
    fn off_mesh_connection_passes_a_permissive_filter() {
        let mut mesh = two_islands();
        let link = mesh
            .add_off_mesh_connection(Vec3::new(1.0, 0.0, 0.5), Vec3::new(10.0, 0.0, 0.5), false, 0, 0xffff)
            .unwrap();
        let filter = QueryFilter::new();
        assert!(mesh.passes_filter(link, &filter));
        assert_eq!(mesh.neighbor(link, 1), None);
    }
}
