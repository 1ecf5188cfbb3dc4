//! Bucketed 2-D (X/Z) spatial index of agent slot indices.
//!
//! Grounded on the call-site usage in `DetourCrowd.cpp` (`addItem`/
//! `queryItems` around the per-tick proximity phase); no prior file maps
//! directly onto a hash grid (a k-d tree covers the equivalent query
//! elsewhere in this corpus, but grid bucketing is a structurally different
//! index and is not built on top of one here).

use std::collections::HashMap;

use ord_subset::OrdVar;

/// Bounded grid keyed on integer cell coordinates. Memory usage is fixed at
/// `max_items` entries; `add_item` beyond that is a silent no-op, matching
/// the fixed capacity of the agent pool the grid indexes into.
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    cells: HashMap<(i32, i32), Vec<u32>>,
    item_centers: HashMap<u32, (f32, f32)>,
    item_count: usize,
    max_items: usize,
}

impl ProximityGrid {
    pub fn new(max_items: usize, cell_size: f32) -> Self {
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            item_centers: HashMap::new(),
            item_count: 0,
            max_items,
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.item_centers.clear();
        self.item_count = 0;
    }

    fn cell_of(&self, x: f32, z: f32) -> (i32, i32) {
        ((x * self.inv_cell_size).floor() as i32, (z * self.inv_cell_size).floor() as i32)
    }

    /// Inserts `id` into every cell overlapped by the AABB
    /// `[xmin, xmax] x [zmin, zmax]`.
    pub fn add_item(&mut self, id: u32, xmin: f32, zmin: f32, xmax: f32, zmax: f32) {
        if self.item_count >= self.max_items {
            return;
        }
        let (cx0, cz0) = self.cell_of(xmin, zmin);
        let (cx1, cz1) = self.cell_of(xmax, zmax);
        for cx in cx0..=cx1 {
            for cz in cz0..=cz1 {
                self.cells.entry((cx, cz)).or_default().push(id);
            }
        }
        self.item_centers.insert(id, ((xmin + xmax) * 0.5, (zmin + zmax) * 0.5));
        self.item_count += 1;
    }

    /// Returns ids overlapping `[xmin, xmax] x [zmin, zmax]`, closest to
    /// `(center_x, center_z)` first, up to `max` entries. Overflow beyond
    /// `max` drops the farthest candidates rather than an arbitrary subset.
    pub fn query_items(
        &self,
        center_x: f32,
        center_z: f32,
        xmin: f32,
        zmin: f32,
        xmax: f32,
        zmax: f32,
        max: usize,
    ) -> Vec<u32> {
        let (cx0, cz0) = self.cell_of(xmin, zmin);
        let (cx1, cz1) = self.cell_of(xmax, zmax);
        let mut out: Vec<u32> = Vec::new();
        for cx in cx0..=cx1 {
            for cz in cz0..=cz1 {
                let Some(ids) = self.cells.get(&(cx, cz)) else { continue };
                for &id in ids {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
            }
        }
        if out.len() > max {
            out.sort_by_key(|id| {
                let (px, pz) = self.item_centers.get(id).copied().unwrap_or((center_x, center_z));
                let (dx, dz) = (px - center_x, pz - center_z);
                OrdVar::new_unchecked(dx * dx + dz * dz)
            });
            out.truncate(max);
        }
        out
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_finds_items_in_overlapping_cells() {
        let mut grid = ProximityGrid::new(16, 1.0);
        grid.add_item(0, 0.0, 0.0, 0.5, 0.5);
        grid.add_item(1, 5.0, 5.0, 5.5, 5.5);
        let found = grid.query_items(0.0, 0.0, -1.0, -1.0, 1.0, 1.0, 16);
        assert_eq!(found, vec![0]);
    }

    #[test]
    fn query_deduplicates_items_spanning_multiple_cells() {
        let mut grid = ProximityGrid::new(16, 1.0);
        grid.add_item(0, -0.5, -0.5, 2.5, 2.5);
        let found = grid.query_items(1.0, 1.0, -1.0, -1.0, 3.0, 3.0, 16);
        assert_eq!(found, vec![0]);
    }

    #[test]
    fn clear_resets_item_count_and_cells() {
        let mut grid = ProximityGrid::new(1, 1.0);
        grid.add_item(0, 0.0, 0.0, 0.1, 0.1);
        grid.add_item(1, 0.0, 0.0, 0.1, 0.1);
        assert_eq!(grid.query_items(0.0, 0.0, -1.0, -1.0, 1.0, 1.0, 16).len(), 1);
        grid.clear();
        grid.add_item(1, 0.0, 0.0, 0.1, 0.1);
        assert_eq!(grid.query_items(0.0, 0.0, -1.0, -1.0, 1.0, 1.0, 16), vec![1]);
    }

    #[test]
    fn overflow_keeps_the_closest_items_to_the_query_center() {
        let mut grid = ProximityGrid::new(8, 4.0);
        // Four items at increasing distance from the origin, all inside one
        // cell so insertion order alone would keep the wrong two.
        grid.add_item(3, 3.0, 0.0, 3.0, 0.0);
        grid.add_item(1, 1.0, 0.0, 1.0, 0.0);
        grid.add_item(2, 2.0, 0.0, 2.0, 0.0);
        grid.add_item(0, 0.0, 0.0, 0.0, 0.0);
        let found = grid.query_items(0.0, 0.0, -1.0, -1.0, 4.0, 4.0, 2);
        assert_eq!(found, vec![0, 1]);
    }
}
