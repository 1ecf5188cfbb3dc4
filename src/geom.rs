//! Small 2D (X/Z-plane) geometry helpers shared by the mesh query, path
//! corridor, and local boundary. Adapted from `landmass`'s `geometry.rs`
//! (segment intersection) and the cross-product funnel test used by its
//! straight-path extraction in `path.rs`.

use glam::Vec3;

/// Twice the signed area of triangle `(a, b, c)` projected onto the X/Z
/// plane. Positive when `a, b, c` winds counter-clockwise.
pub fn triangle_area2(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let ab = b - a;
    let ac = c - a;
    ab.x * ac.z - ac.x * ab.z
}

/// Distance from a point `p` to the nearest point on segment `(a, b)`,
/// projected onto the X/Z plane, along with the nearest point itself.
pub fn closest_point_on_segment(p: Vec3, a: Vec3, b: Vec3) -> (Vec3, f32) {
    let ab = Vec3::new(b.x - a.x, 0.0, b.z - a.z);
    let len_sq = ab.length_squared();
    let t = if len_sq < 1e-12 {
        0.0
    } else {
        (((p.x - a.x) * ab.x + (p.z - a.z) * ab.z) / len_sq).clamp(0.0, 1.0)
    };
    let closest = a + ab * t;
    (closest, p.distance_squared(Vec3::new(closest.x, p.y, closest.z)))
}

/// Whether segment `(a, b)` crosses segment `(c, d)` in the X/Z plane, and
/// if so, the intersection point and the fraction along `(a, b)`.
pub fn segment_intersect_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> Option<(Vec3, f32)> {
    let r = triangle_area2(a, b, c);
    let s = triangle_area2(a, b, d);
    if (r > 0.0) == (s > 0.0) {
        return None;
    }
    let t = triangle_area2(c, d, a);
    let u = triangle_area2(c, d, b);
    if (t > 0.0) == (u > 0.0) {
        return None;
    }
    let denom = t - u;
    if denom.abs() < 1e-9 {
        return None;
    }
    let frac = t / denom;
    Some((a + (b - a) * frac, frac))
}

/// Whether `p` lies within convex polygon `verts` (X/Z plane, any winding).
pub fn point_in_convex_polygon(p: Vec3, verts: &[Vec3]) -> bool {
    let n = verts.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0f32;
    for i in 0..n {
        let a = verts[i];
        let b = verts[(i + 1) % n];
        let cross = triangle_area2(a, b, p);
        if cross.abs() < 1e-6 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Projects `p` onto the plane of convex polygon `verts` and clamps it to
/// lie inside, returning the resulting point.
pub fn project_to_polygon(p: Vec3, verts: &[Vec3]) -> Vec3 {
    if point_in_convex_polygon(p, verts) {
        let height = polygon_height_at(p, verts).unwrap_or(p.y);
        return Vec3::new(p.x, height, p.z);
    }
    let n = verts.len();
    let mut best = verts[0];
    let mut best_dist = f32::MAX;
    for i in 0..n {
        let (closest, dist) = closest_point_on_segment(p, verts[i], verts[(i + 1) % n]);
        if dist < best_dist {
            best_dist = dist;
            best = closest;
        }
    }
    best
}

/// Barycentric-style height interpolation using the polygon's first
/// triangle fan; returns `None` for degenerate polygons.
fn polygon_height_at(p: Vec3, verts: &[Vec3]) -> Option<f32> {
    let n = verts.len();
    for i in 1..n - 1 {
        let (a, b, c) = (verts[0], verts[i], verts[i + 1]);
        let area = triangle_area2(a, b, c);
        if area.abs() < 1e-9 {
            continue;
        }
        let w_a = triangle_area2(p, b, c) / area;
        let w_b = triangle_area2(a, p, c) / area;
        let w_c = 1.0 - w_a - w_b;
        if w_a >= -1e-3 && w_b >= -1e-3 && w_c >= -1e-3 {
            return Some(w_a * a.y + w_b * b.y + w_c * c.y);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use googletest::{expect_that, matchers::*};

    use super::*;

    #[test]
    fn triangle_area_sign_matches_winding() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 1.0);
        assert!(triangle_area2(a, b, c) > 0.0);
        assert!(triangle_area2(a, c, b) < 0.0);
    }

    #[googletest::test]
    fn segment_intersect_finds_crossing_point() {
        let hit = segment_intersect_2d(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        );
        let (point, frac) = hit.expect("segments should cross");
        expect_that!(point.x, approx_eq(1.0));
        expect_that!(point.z, approx_eq(1.0));
        expect_that!(frac, approx_eq(0.5));
    }

    #[test]
    fn parallel_segments_do_not_intersect() {
        let hit = segment_intersect_2d(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn point_in_convex_polygon_detects_containment() {
        let quad = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        assert!(point_in_convex_polygon(Vec3::new(0.5, 0.0, 0.5), &quad));
        assert!(!point_in_convex_polygon(Vec3::new(2.0, 0.0, 0.5), &quad));
    }

    #[googletest::test]
    fn project_to_polygon_clamps_outside_points_to_the_nearest_edge() {
        let quad = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        let projected = project_to_polygon(Vec3::new(2.0, 0.0, 0.5), &quad);
        expect_that!(projected.x, approx_eq(1.0));
        expect_that!(projected.z, approx_eq(0.5));
    }
}
