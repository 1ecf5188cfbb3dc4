//! Velocity-space obstacle avoidance: grid and adaptive samplers that pick a
//! new velocity minimizing a weighted cost over neighbor and segment
//! obstacles.
//!
//! No `DetourObstacleAvoidance.h/.cpp` source was retrieved in the pack
//! (only `DetourNode.h` and `DetourCrowd.cpp` were kept); this module follows
//! the cost-function shape and sampler structure implied by `DetourCrowd.cpp`'s
//! call sites (`sampleVelocityAdaptive`/`sampleVelocityGrid` feeding `nvel`).
//! This is a grid/adaptive velocity-space sampler, a different algorithm
//! family from an ORCA half-plane solver.

use glam::Vec3;

/// A circular obstacle: another agent's current state.
#[derive(Clone, Copy, Debug)]
pub struct CircleObstacle {
    pub position: Vec3,
    pub radius: f32,
    pub velocity: Vec3,
    pub desired_velocity: Vec3,
}

/// A static line-segment obstacle (a boundary wall).
#[derive(Clone, Copy, Debug)]
pub struct SegmentObstacle {
    pub start: Vec3,
    pub end: Vec3,
}

/// One of eight tunable presets, indexed by `obstacleAvoidanceType`.
#[derive(Clone, Copy, Debug)]
pub struct AvoidanceParams {
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    pub horizon_time: f32,
    pub grid_size: u32,
    pub adaptive_divs: u32,
    pub adaptive_rings: u32,
    pub adaptive_depth: u32,
}

impl Default for AvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horizon_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sampler {
    Grid,
    Adaptive,
}

pub struct ObstacleAvoidanceQuery {
    samples_taken: u32,
}

impl ObstacleAvoidanceQuery {
    pub fn new() -> Self {
        Self { samples_taken: 0 }
    }

    /// Samples taken by the most recent [`Self::sample_velocity`] call.
    pub fn last_sample_count(&self) -> u32 {
        self.samples_taken
    }

    /// Picks a new velocity `nvel` minimizing the cost function given
    /// `vel`/`dvel` and the surrounding obstacles. Never fails: falls back
    /// to `dvel` if no sample improves on it.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity(
        &mut self,
        sampler: Sampler,
        position: Vec3,
        radius: f32,
        max_speed: f32,
        vel: Vec3,
        dvel: Vec3,
        circles: &[CircleObstacle],
        segments: &[SegmentObstacle],
        params: &AvoidanceParams,
    ) -> Vec3 {
        self.samples_taken = 0;
        // Open Question (b): seed = dvel unless |dvel| == 0, then vel.
        let seed = if dvel.length_squared() > 1e-8 { dvel } else { vel };

        let cost = |v: Vec3| -> f32 {
            self.cost_of(v, position, radius, max_speed, vel, dvel, circles, segments, params)
        };

        match sampler {
            Sampler::Grid => Self::sample_grid(seed, max_speed, params, cost),
            Sampler::Adaptive => Self::sample_adaptive(seed, max_speed, params, cost),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cost_of(
        &mut self,
        v: Vec3,
        position: Vec3,
        radius: f32,
        max_speed: f32,
        vel: Vec3,
        dvel: Vec3,
        circles: &[CircleObstacle],
        segments: &[SegmentObstacle],
        params: &AvoidanceParams,
    ) -> f32 {
        self.samples_taken += 1;
        let v_des = params.weight_des_vel * v.distance(dvel) / max_speed.max(1e-4);
        let v_cur = params.weight_cur_vel * v.distance(vel) / max_speed.max(1e-4);
        let side = params.weight_side * side_bias(v, dvel);
        let toi = time_to_collision(position, radius, v, circles, segments);
        let penalty = params.weight_toi * toi_penalty(toi, params.horizon_time);
        v_des + v_cur + side + penalty
    }

    fn sample_grid(
        seed: Vec3,
        max_speed: f32,
        params: &AvoidanceParams,
        mut cost: impl FnMut(Vec3) -> f32,
    ) -> Vec3 {
        let n = params.grid_size.max(1);
        let center = seed * params.vel_bias;
        let mut best = seed;
        let mut best_cost = cost(seed);
        for iy in 0..n {
            for ix in 0..n {
                let fx = (ix as f32 / (n - 1).max(1) as f32) * 2.0 - 1.0;
                let fy = (iy as f32 / (n - 1).max(1) as f32) * 2.0 - 1.0;
                let candidate = center + Vec3::new(fx, 0.0, fy) * max_speed;
                if candidate.length() > max_speed + 1e-4 {
                    continue;
                }
                let c = cost(candidate);
                if c < best_cost {
                    best_cost = c;
                    best = candidate;
                }
            }
        }
        best
    }

    fn sample_adaptive(
        seed: Vec3,
        max_speed: f32,
        params: &AvoidanceParams,
        mut cost: impl FnMut(Vec3) -> f32,
    ) -> Vec3 {
        let mut center = seed * params.vel_bias;
        let mut best = seed;
        let mut best_cost = cost(seed);
        let mut pattern_radius = max_speed;

        for _pass in 0..params.adaptive_depth.max(1) {
            for ring in 1..=params.adaptive_rings.max(1) {
                let radius = pattern_radius * ring as f32 / params.adaptive_rings.max(1) as f32;
                for div in 0..params.adaptive_divs.max(1) {
                    let angle = (div as f32 / params.adaptive_divs.max(1) as f32) * std::f32::consts::TAU;
                    let candidate = center + Vec3::new(angle.cos(), 0.0, angle.sin()) * radius;
                    if candidate.length() > max_speed + 1e-4 {
                        continue;
                    }
                    let c = cost(candidate);
                    if c < best_cost {
                        best_cost = c;
                        best = candidate;
                    }
                }
            }
            center = best;
            pattern_radius *= 0.5;
        }
        best
    }
}

impl Default for ObstacleAvoidanceQuery {
    fn default() -> Self {
        Self::new()
    }
}

fn side_bias(v: Vec3, dvel: Vec3) -> f32 {
    if dvel.length_squared() < 1e-8 {
        return 0.0;
    }
    let dvel_dir = dvel.normalize();
    let side = Vec3::new(-dvel_dir.z, 0.0, dvel_dir.x);
    (v.dot(side)).max(0.0)
}

/// Time until `v`, starting at `position` with the given `radius`, collides
/// with the nearest obstacle. Returns `f32::MAX` if no collision occurs
/// within the horizon.
fn time_to_collision(
    position: Vec3,
    radius: f32,
    v: Vec3,
    circles: &[CircleObstacle],
    segments: &[SegmentObstacle],
) -> f32 {
    let mut best = f32::MAX;
    for circle in circles {
        if let Some(t) = sweep_circle_toi(position, radius, v, circle.position, circle.radius, circle.velocity) {
            best = best.min(t);
        }
    }
    for segment in segments {
        if let Some(t) = sweep_segment_toi(position, radius, v, segment.start, segment.end) {
            best = best.min(t);
        }
    }
    best
}

fn sweep_circle_toi(
    pos_a: Vec3,
    radius_a: f32,
    vel_a: Vec3,
    pos_b: Vec3,
    radius_b: f32,
    vel_b: Vec3,
) -> Option<f32> {
    let rel_pos = pos_a - pos_b;
    let rel_vel = vel_a - vel_b;
    let combined_radius = radius_a + radius_b;

    let a = rel_vel.length_squared();
    let b = rel_pos.dot(rel_vel);
    let c = rel_pos.length_squared() - combined_radius * combined_radius;

    if c < 0.0 {
        return Some(0.0);
    }
    if a < 1e-9 {
        return None;
    }
    let discriminant = b * b - a * c;
    if discriminant < 0.0 {
        return None;
    }
    let t = (-b - discriminant.sqrt()) / a;
    if t < 0.0 {
        None
    } else {
        Some(t)
    }
}

fn sweep_segment_toi(pos: Vec3, radius: f32, vel: Vec3, a: Vec3, b: Vec3) -> Option<f32> {
    let (closest, dist_sq) = crate::geom::closest_point_on_segment(pos, a, b);
    if dist_sq <= radius * radius {
        return Some(0.0);
    }
    sweep_circle_toi(pos, radius, vel, closest, 0.0, Vec3::ZERO)
}

fn toi_penalty(toi: f32, horizon: f32) -> f32 {
    if toi >= horizon {
        0.0
    } else {
        let t = (horizon - toi) / horizon.max(1e-4);
        t * t
    }
}
