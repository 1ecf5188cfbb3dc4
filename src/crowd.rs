//! The crowd update pipeline: a fixed-capacity agent pool advanced one tick
//! at a time through eleven strictly-ordered phases.
//!
//! Grounded directly on `DetourCrowd.cpp`'s `dtCrowd::update` (phase order,
//! constants, formulas).

use glam::Vec3;
use ord_subset::OrdVar;
use tracing::{debug, instrument, warn};

use crate::agent::{
    decide_repath, Agent, AgentParams, AgentState, NeighbourRecord, RepathDecision, TargetState,
    UpdateFlags, MAX_NEIGHBOURS, MAX_NEIS,
};
use crate::mesh_query::{MeshQuery, SliceStatus, MAX_COMMON_NODES};
use crate::nav_mesh::{NavMesh, PolyRef, QueryFilter};
use crate::obstacle_avoidance::{AvoidanceParams, CircleObstacle, ObstacleAvoidanceQuery, Sampler, SegmentObstacle};
use crate::path_corridor::MAX_CORNERS;
use crate::path_queue::{PathQueue, RequestStatus};
use crate::proximity_grid::ProximityGrid;
use thiserror::Error;

pub const MAX_ITERS_PER_UPDATE: u32 = 100;
pub const MAX_PATH_RESULT: usize = 256;
pub const PATH_LOOKAHEAD_CHECK: usize = 10;
pub const TOPOLOGY_OPT_THRESHOLD: f32 = 0.5;
pub const TARGET_REPLAN_DELAY: f32 = 1.0;
pub const COLLISION_ITERATIONS: u32 = 4;
pub const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
pub const OFFMESH_TRIGGER_FACTOR: f32 = 2.25;
pub const SLOW_DOWN_RADIUS_FACTOR: f32 = 2.0;
pub const MAX_OBSTACLE_AVOIDANCE_PARAMS: usize = 8;

const INLINE_REPLAN_ITERS: u32 = 20;
const TOPOLOGY_OPT_ITERS: u32 = 32;

#[derive(Debug, Error)]
pub enum CrowdError {
    #[error("agent position could not be snapped to the navmesh")]
    NotOnMesh,
    #[error("agent pool is full")]
    Exhausted,
}

/// Per-tick statistics, replacing the original's debug-draw hooks with
/// plain data a host can surface on its own overlays.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrowdUpdateStats {
    pub velocity_samples: u32,
    pub agents_replanned: u32,
    pub agents_failed: u32,
}

/// Snapshot returned by [`Crowd::debug_agent`] for host-side overlays.
#[derive(Debug, Clone)]
pub struct AgentDebugInfo {
    pub corridor: Vec<PolyRef>,
    pub corners: Vec<crate::path_corridor::Corner>,
    pub npos: Vec3,
    pub nvel: Vec3,
    pub neighbour_count: usize,
}

pub struct CrowdConfig {
    pub max_agents: usize,
    pub max_agent_radius: f32,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self { max_agents: 64, max_agent_radius: 1.0 }
    }
}

pub struct Crowd {
    agents: Vec<Agent>,
    filters: Vec<QueryFilter>,
    avoidance_params: Vec<AvoidanceParams>,
    proximity_grid: ProximityGrid,
    path_queue: PathQueue,
    query: MeshQuery,
    avoidance: ObstacleAvoidanceQuery,
    max_agent_radius: f32,
}

impl Crowd {
    pub fn new(config: CrowdConfig) -> Self {
        Self {
            agents: (0..config.max_agents).map(|_| Agent::new(AgentParams::default())).collect(),
            filters: vec![QueryFilter::new()],
            avoidance_params: vec![AvoidanceParams::default(); MAX_OBSTACLE_AVOIDANCE_PARAMS],
            proximity_grid: ProximityGrid::new(config.max_agents * 4, config.max_agent_radius * 3.0),
            path_queue: PathQueue::new(crate::path_queue::MAX_REQUESTS),
            query: MeshQuery::new(MAX_COMMON_NODES),
            avoidance: ObstacleAvoidanceQuery::new(),
            max_agent_radius: config.max_agent_radius,
        }
    }

    pub fn set_filter(&mut self, slot: usize, filter: QueryFilter) {
        if slot >= self.filters.len() {
            self.filters.resize(slot + 1, QueryFilter::new());
        }
        self.filters[slot] = filter;
    }

    fn filter(&self, agent: &Agent) -> &QueryFilter {
        self.filters.get(agent.params.query_filter_type as usize).unwrap_or(&self.filters[0])
    }

    pub fn set_obstacle_avoidance_params(&mut self, slot: usize, params: AvoidanceParams) {
        if slot < self.avoidance_params.len() {
            self.avoidance_params[slot] = params;
        }
    }

    pub fn obstacle_avoidance_params(&self, slot: usize) -> AvoidanceParams {
        self.avoidance_params[slot.min(self.avoidance_params.len() - 1)]
    }

    /// Finds the first inactive slot, snaps to the nearest polygon, and
    /// activates it. Returns `None` if the pool is full or the position
    /// cannot be snapped onto the mesh (in which case no slot is consumed).
    pub fn add_agent(&mut self, mesh: &dyn NavMesh, position: Vec3, params: AgentParams) -> Option<usize> {
        let slot = self.agents.iter().position(|a| !a.active)?;
        let half_extents = Vec3::new(self.max_agent_radius * 2.0, self.max_agent_radius * 4.0, self.max_agent_radius * 2.0);
        let filter = self.filters.get(params.query_filter_type as usize).cloned().unwrap_or_default();
        let Some((poly_ref, snapped)) = self.query.find_nearest_poly(mesh, position, half_extents, &filter) else {
            warn!(?position, "add_agent: position could not be snapped to navmesh");
            return None;
        };

        let agent = &mut self.agents[slot];
        *agent = Agent::new(params);
        agent.active = true;
        agent.state = AgentState::Walking;
        agent.npos = snapped;
        agent.corridor.reset(poly_ref, snapped);
        agent.boundary.reset();
        Some(slot)
    }

    /// Deactivates the slot; it remains allocated for reuse.
    pub fn remove_agent(&mut self, idx: usize) {
        if let Some(agent) = self.agents.get_mut(idx) {
            agent.active = false;
            agent.pending_path_request = None;
        }
    }

    pub fn agent(&self, idx: usize) -> Option<&Agent> {
        self.agents.get(idx).filter(|a| a.active)
    }

    /// A debug-overlay snapshot of one agent's corridor and avoidance state,
    /// replacing `DetourCrowd.cpp`'s `dtCrowdAgentDebugInfo` draw hooks with
    /// plain data a host can render however it likes.
    pub fn debug_agent(&self, idx: usize) -> Option<AgentDebugInfo> {
        let agent = self.agent(idx)?;
        Some(AgentDebugInfo {
            corridor: agent.corridor.path().to_vec(),
            corners: agent.corners.clone(),
            npos: agent.npos,
            nvel: agent.nvel,
            neighbour_count: agent.neighbours.len(),
        })
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: AgentParams) -> bool {
        let Some(agent) = self.agents.get_mut(idx) else { return false };
        if !agent.active {
            return false;
        }
        agent.params = params;
        true
    }

    pub fn active_agents(&self) -> impl Iterator<Item = usize> + '_ {
        self.agents.iter().enumerate().filter(|(_, a)| a.active).map(|(i, _)| i)
    }

    pub fn request_move_target(&mut self, mesh: &dyn NavMesh, idx: usize, poly_ref: PolyRef, pos: Vec3) -> bool {
        if poly_ref.is_none() {
            return false;
        }
        let Some(agent) = self.agents.get_mut(idx) else { return false };
        if !agent.active {
            return false;
        }
        if !mesh.is_valid_poly_ref(poly_ref) {
            return false;
        }
        agent.reset_target();
        agent.target_ref = poly_ref;
        agent.target_pos = pos;
        agent.target_state = TargetState::Requesting;
        agent.target_replan_time = 0.0;
        true
    }

    pub fn request_move_velocity(&mut self, idx: usize, vel: Vec3) -> bool {
        let Some(agent) = self.agents.get_mut(idx) else { return false };
        if !agent.active {
            return false;
        }
        agent.target_vel = vel;
        agent.target_state = TargetState::Velocity;
        true
    }

    pub fn reset_move_target(&mut self, idx: usize) -> bool {
        let Some(agent) = self.agents.get_mut(idx) else { return false };
        if !agent.active {
            return false;
        }
        agent.reset_target();
        true
    }

    fn request_move_target_replan(&mut self, idx: usize) {
        self.agents[idx].target_state = TargetState::Requesting;
    }

    /// Advances every active agent by `dt` seconds through the eleven-phase
    /// pipeline (path validity, move request service, topology
    /// optimization, proximity, corners, steering, velocity planning,
    /// integration, collision, corridor advance, off-mesh animation).
    #[instrument(skip(self, mesh), fields(active_agents = self.active_agents().count()))]
    pub fn update(&mut self, mesh: &dyn NavMesh, dt: f32) -> CrowdUpdateStats {
        let active: Vec<usize> = self.active_agents().collect();
        let mut stats = CrowdUpdateStats::default();

        self.phase1_path_validity(mesh, &active, dt, &mut stats);
        self.phase2_move_request_service(mesh, &active, &mut stats);
        self.phase3_topology_optimization(mesh, &active, dt);
        self.phase4_proximity_and_neighbours(mesh, &active);
        self.phase5_corners_and_offmesh_trigger(mesh, &active);
        self.phase6_steering(&active, dt);
        self.phase7_velocity_planning(&active, &mut stats);
        self.phase8_integration(&active, dt);
        self.phase9_collision_relaxation(&active);
        self.phase10_corridor_advance(mesh, &active);
        self.phase11_offmesh_animation(&active, dt);

        stats
    }

    fn phase1_path_validity(&mut self, mesh: &dyn NavMesh, active: &[usize], dt: f32, stats: &mut CrowdUpdateStats) {
        let half_extents = Vec3::new(self.max_agent_radius * 2.0, self.max_agent_radius * 4.0, self.max_agent_radius * 2.0);
        for &idx in active {
            if self.agents[idx].state != AgentState::Walking {
                continue;
            }
            self.agents[idx].target_replan_time += dt;

            let filter = self.filter(&self.agents[idx]).clone();
            let head = self.agents[idx].corridor.first_poly();
            let head_valid = head.map(|p| mesh.is_valid_poly_ref(p) && mesh.passes_filter(p, &filter)).unwrap_or(false);
            if !head_valid {
                let pos = self.agents[idx].npos;
                match self.query.find_nearest_poly(mesh, pos, half_extents, &filter) {
                    Some((poly_ref, snapped)) => {
                        self.agents[idx].corridor.fix_path_start(poly_ref, snapped);
                        self.agents[idx].npos = snapped;
                    }
                    None => {
                        self.agents[idx].state = AgentState::Invalid;
                        stats.agents_failed += 1;
                        continue;
                    }
                }
            }

            if self.agents[idx].target_state != TargetState::None && self.agents[idx].target_state != TargetState::Failed {
                let target_ref = self.agents[idx].target_ref;
                if !mesh.is_valid_poly_ref(target_ref) || !mesh.passes_filter(target_ref, &filter) {
                    let pos = self.agents[idx].target_pos;
                    match self.query.find_nearest_poly(mesh, pos, half_extents, &filter) {
                        Some((poly_ref, snapped)) => {
                            self.agents[idx].target_ref = poly_ref;
                            self.agents[idx].target_pos = snapped;
                        }
                        // No reachable polygon still passes the filter near
                        // the target: the request cannot be serviced. Per
                        // the no-auto-retry rule, this is terminal until the
                        // host resets and re-requests.
                        None => {
                            self.agents[idx].target_state = TargetState::Failed;
                            stats.agents_failed += 1;
                        }
                    }
                }
            }

            let corridor_valid = self.agents[idx].corridor.is_valid(mesh, &filter, PATH_LOOKAHEAD_CHECK);
            let replan_elapsed = self.agents[idx].target_replan_time > TARGET_REPLAN_DELAY;
            match decide_repath(&self.agents[idx], corridor_valid, replan_elapsed) {
                RepathDecision::ClearNoTarget => self.agents[idx].reset_target(),
                RepathDecision::Replan => {
                    self.request_move_target_replan(idx);
                    debug!(agent = idx, "path invalid or stale, requesting replan");
                }
                RepathDecision::DoNothing => {}
            }
        }
    }

    fn phase2_move_request_service(&mut self, mesh: &dyn NavMesh, active: &[usize], stats: &mut CrowdUpdateStats) {
        const QUEUE_BUFFER: usize = 8;
        let mut queue_buffer: Vec<(usize, f32)> = Vec::new();

        for &idx in active {
            if self.agents[idx].state != AgentState::Walking || self.agents[idx].target_state != TargetState::Requesting {
                continue;
            }
            let filter = self.filter(&self.agents[idx]).clone();
            let Some(start) = self.agents[idx].corridor.first_poly() else { continue };
            let start_pos = self.agents[idx].corridor.position();
            let end = self.agents[idx].target_ref;
            let end_pos = self.agents[idx].target_pos;

            if self.query.init_sliced_find_path(mesh, start, end, start_pos, end_pos, &filter).is_err() {
                self.agents[idx].target_state = TargetState::Failed;
                stats.agents_failed += 1;
                continue;
            }
            let mut status = SliceStatus::InProgress;
            for _ in 0..INLINE_REPLAN_ITERS {
                let (_, s) = self.query.update_sliced_find_path(mesh, &filter, 1);
                status = s;
                if status != SliceStatus::InProgress {
                    break;
                }
            }

            let is_replan = self.agents[idx].target_replan_time > 0.0;
            let existing_path: Vec<PolyRef> = self.agents[idx].corridor.path().to_vec();
            let path = if status == SliceStatus::Success {
                self.query.finalize_sliced_find_path(MAX_PATH_RESULT).ok()
            } else if is_replan {
                self.query.finalize_sliced_find_path_partial(&existing_path, MAX_PATH_RESULT).ok()
            } else {
                None
            };

            match path {
                Some(path) if path.last() == Some(&end) => {
                    self.splice_corridor(idx, mesh, &path, end_pos, false);
                    stats.agents_replanned += 1;
                }
                _ => {
                    queue_buffer.push((idx, self.agents[idx].target_replan_time));
                    self.agents[idx].target_state = TargetState::WaitingForQueue;
                }
            }
        }

        queue_buffer.sort_by_key(|&(_, wait_time)| std::cmp::Reverse(OrdVar::new_unchecked(wait_time)));
        queue_buffer.truncate(QUEUE_BUFFER);
        for (idx, _) in queue_buffer {
            let filter = self.filter(&self.agents[idx]).clone();
            let Some(start) = self.agents[idx].corridor.first_poly() else { continue };
            let start_pos = self.agents[idx].corridor.position();
            let end = self.agents[idx].target_ref;
            let end_pos = self.agents[idx].target_pos;
            match self.path_queue.request(start, end, start_pos, end_pos, filter) {
                Some(handle) => {
                    self.agents[idx].pending_path_request = Some(handle);
                    self.agents[idx].target_state = TargetState::WaitingForPath;
                }
                None => {
                    // stays WaitingForQueue, retried next tick.
                }
            }
        }

        self.path_queue.update(mesh, MAX_ITERS_PER_UPDATE);

        for &idx in active {
            if self.agents[idx].target_state != TargetState::WaitingForPath {
                continue;
            }
            let Some(handle) = self.agents[idx].pending_path_request else { continue };
            match self.path_queue.request_status(handle) {
                RequestStatus::InProgress => {}
                RequestStatus::Success | RequestStatus::PartialSuccess => {
                    let partial = self.path_queue.request_status(handle) == RequestStatus::PartialSuccess;
                    if let Some(path) = self.path_queue.take_result(handle) {
                        let end_pos = self.agents[idx].target_pos;
                        self.splice_corridor(idx, mesh, &path, end_pos, partial);
                        stats.agents_replanned += 1;
                    }
                    self.agents[idx].pending_path_request = None;
                }
                RequestStatus::Failure | RequestStatus::Invalid => {
                    self.path_queue.take_result(handle);
                    self.agents[idx].pending_path_request = None;
                    let target_still_valid = mesh.is_valid_poly_ref(self.agents[idx].target_ref);
                    self.agents[idx].target_state =
                        if target_still_valid { TargetState::Requesting } else { TargetState::Failed };
                    if self.agents[idx].target_state == TargetState::Failed {
                        stats.agents_failed += 1;
                    }
                }
            }
        }
    }

    /// Splices the prefix of the old corridor (up to but not including its
    /// last polygon) onto `new_path`, collapses adjacent `a,b,a` triples,
    /// and projects the target onto the final polygon if the splice falls
    /// short of `target_ref`.
    fn splice_corridor(&mut self, idx: usize, mesh: &dyn NavMesh, new_path: &[PolyRef], target_pos: Vec3, partial: bool) {
        let old_path = self.agents[idx].corridor.path().to_vec();
        let prefix: Vec<PolyRef> = if old_path.len() > 1 { old_path[..old_path.len() - 1].to_vec() } else { Vec::new() };

        let mut spliced = prefix;
        spliced.extend_from_slice(new_path);
        collapse_triples(&mut spliced);
        spliced.truncate(crate::path_corridor::CORRIDOR_MAX);

        let final_target = match (spliced.last(), mesh.poly_vertices(*spliced.last().unwrap_or(&PolyRef::NONE))) {
            (Some(_), Some(verts)) if !verts.is_empty() => {
                crate::geom::project_to_polygon(target_pos, &verts)
            }
            _ => target_pos,
        };

        self.agents[idx].corridor.set_corridor(final_target, &spliced);
        self.agents[idx].boundary.reset();
        self.agents[idx].target_state = TargetState::Valid;
        self.agents[idx].target_replan_time = 0.0;
        self.agents[idx].partial = partial;
    }

    fn phase3_topology_optimization(&mut self, mesh: &dyn NavMesh, active: &[usize], dt: f32) {
        let mut best: Option<(usize, f32)> = None;
        for &idx in active {
            let agent = &mut self.agents[idx];
            if agent.state != AgentState::Walking || !agent.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO) {
                continue;
            }
            agent.topology_opt_time += dt;
            if agent.topology_opt_time >= TOPOLOGY_OPT_THRESHOLD {
                if best.map(|(_, t)| agent.topology_opt_time > t).unwrap_or(true) {
                    best = Some((idx, agent.topology_opt_time));
                }
            }
        }
        if let Some((idx, _)) = best {
            let filter = self.filter(&self.agents[idx]).clone();
            self.agents[idx].corridor.optimize_path_topology(mesh, &filter, &mut self.query, TOPOLOGY_OPT_ITERS);
            self.agents[idx].topology_opt_time = 0.0;
        }
    }

    fn phase4_proximity_and_neighbours(&mut self, mesh: &dyn NavMesh, active: &[usize]) {
        self.proximity_grid.clear();
        for &idx in active {
            let agent = &self.agents[idx];
            if agent.state != AgentState::Walking {
                continue;
            }
            let r = agent.params.radius;
            self.proximity_grid.add_item(
                idx as u32,
                agent.npos.x - r,
                agent.npos.z - r,
                agent.npos.x + r,
                agent.npos.z + r,
            );
        }

        for &idx in active {
            if self.agents[idx].state != AgentState::Walking || !self.agents[idx].has_move_target() {
                continue;
            }
            let filter = self.filter(&self.agents[idx]).clone();
            let agent = &self.agents[idx];
            let drift = agent.npos.distance(agent.boundary.center());
            let needs_refresh = drift > 0.25 * agent.params.collision_query_range || !agent.boundary.is_valid(mesh, &filter);
            let center_ref = agent.corridor.first_poly();
            let range = agent.params.collision_query_range;
            let pos = agent.npos;
            if needs_refresh {
                if let Some(center_ref) = center_ref {
                    self.agents[idx].boundary.update(mesh, &filter, center_ref, pos, range);
                }
            }
        }

        for &idx in active {
            if self.agents[idx].state != AgentState::Walking {
                self.agents[idx].neighbours.clear();
                continue;
            }
            let agent = &self.agents[idx];
            let range = agent.params.collision_query_range;
            let candidates = self.proximity_grid.query_items(
                agent.npos.x,
                agent.npos.z,
                agent.npos.x - range,
                agent.npos.z - range,
                agent.npos.x + range,
                agent.npos.z + range,
                MAX_NEIS,
            );
            let mut records: Vec<NeighbourRecord> = candidates
                .into_iter()
                .filter_map(|other_id| {
                    let other_idx = other_id as usize;
                    if other_idx == idx {
                        return None;
                    }
                    let other = &self.agents[other_idx];
                    if other.state != AgentState::Walking {
                        return None;
                    }
                    let dy = (agent.npos.y - other.npos.y).abs();
                    let avg_height = (agent.params.height + other.params.height) * 0.5;
                    if dy >= avg_height {
                        return None;
                    }
                    let horizontal = Vec3::new(agent.npos.x - other.npos.x, 0.0, agent.npos.z - other.npos.z);
                    let dist_sq = horizontal.length_squared();
                    if dist_sq > range * range {
                        return None;
                    }
                    Some(NeighbourRecord { agent_index: other_idx, dist_sq })
                })
                .collect();
            records.sort_by_key(|r| OrdVar::new_unchecked(r.dist_sq));
            records.truncate(MAX_NEIGHBOURS);
            self.agents[idx].neighbours = records;
        }
    }

    fn phase5_corners_and_offmesh_trigger(&mut self, mesh: &dyn NavMesh, active: &[usize]) {
        for &idx in active {
            if self.agents[idx].state != AgentState::Walking || !self.agents[idx].has_move_target() {
                continue;
            }
            if self.agents[idx].target_state == TargetState::Velocity {
                continue;
            }
            let corners = self.agents[idx].corridor.find_corners(mesh, MAX_CORNERS);
            self.agents[idx].corners = corners;

            if self.agents[idx].params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !self.agents[idx].corners.is_empty() {
                let look_ahead = if self.agents[idx].corners.len() > 1 {
                    self.agents[idx].corners[1].position
                } else {
                    self.agents[idx].corners[0].position
                };
                let filter = self.filter(&self.agents[idx]).clone();
                let range = self.agents[idx].params.path_optimization_range;
                self.agents[idx].corridor.optimize_path_visibility(mesh, &filter, &self.query, look_ahead, range);
            }

            let Some(last_corner) = self.agents[idx].corners.last().copied() else { continue };
            if !last_corner.flags.contains(crate::path_corridor::CornerFlags::OFF_MESH_CONNECTION) {
                continue;
            }
            let trigger_radius = OFFMESH_TRIGGER_FACTOR * self.agents[idx].params.radius;
            if self.agents[idx].npos.distance(last_corner.position) > trigger_radius {
                continue;
            }
            let Some((start, end)) = self.agents[idx].corridor.move_over_offmesh_connection(mesh, last_corner.poly_ref) else {
                continue;
            };
            let max_speed = self.agents[idx].params.max_speed.max(1e-3);
            let tmax = start.distance(end) / (2.0 * max_speed);
            self.agents[idx].animation = crate::agent::OffMeshAnimation {
                active: true,
                start_pos: start,
                end_pos: end,
                init_pos: self.agents[idx].npos,
                t: 0.0,
                tmax,
            };
            self.agents[idx].state = AgentState::OffMesh;
            self.agents[idx].corners.clear();
            self.agents[idx].neighbours.clear();
        }
    }

    fn phase6_steering(&mut self, active: &[usize], _dt: f32) {
        for &idx in active {
            let agent = &mut self.agents[idx];
            if agent.state != AgentState::Walking || !agent.has_move_target() {
                continue;
            }

            if agent.target_state == TargetState::Velocity {
                agent.dvel = agent.target_vel;
            } else if let Some(&first_corner) = agent.corners.first() {
                let to_corner = first_corner.position - agent.npos;
                let dist_to_goal = to_corner.length();
                let direction = if agent.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS)
                    && agent.corners.len() > 1
                {
                    let to_second = agent.corners[1].position - agent.npos;
                    (to_corner.normalize_or_zero() * 0.6 + to_second.normalize_or_zero() * 0.4).normalize_or_zero()
                } else {
                    to_corner.normalize_or_zero()
                };

                let slow_down_radius = SLOW_DOWN_RADIUS_FACTOR * agent.params.radius;
                let speed_scale = if dist_to_goal < slow_down_radius {
                    (dist_to_goal / slow_down_radius).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                agent.dvel = direction * agent.params.max_speed * speed_scale;
            }

            if agent.params.update_flags.contains(UpdateFlags::SEPARATION) && !agent.neighbours.is_empty() {
                let range = agent.params.collision_query_range;
                let mut push = Vec3::ZERO;
                // Needs read access to other agents' positions, so drop
                // this mutable borrow and re-index instead of holding it.
                let neighbours = agent.neighbours.clone();
                drop(agent);
                for n in &neighbours {
                    let other_pos = self.agents[n.agent_index].npos;
                    let agent = &self.agents[idx];
                    let delta = agent.npos - other_pos;
                    let d = delta.length().max(1e-4);
                    if d < range {
                        let weight = agent.params.separation_weight * (1.0 - (d / range).powi(2)) / d;
                        push += delta * weight;
                    }
                }
                if !neighbours.is_empty() {
                    push /= neighbours.len() as f32;
                }
                let agent = &mut self.agents[idx];
                agent.dvel += push;
                let speed = agent.dvel.length();
                let desired_speed = agent.params.max_speed;
                if speed > desired_speed && speed > 1e-6 {
                    agent.dvel = agent.dvel / speed * desired_speed;
                }
            }
        }
    }

    fn phase7_velocity_planning(&mut self, active: &[usize], stats: &mut CrowdUpdateStats) {
        for &idx in active {
            if self.agents[idx].state != AgentState::Walking {
                continue;
            }
            if !self.agents[idx].params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                self.agents[idx].nvel = self.agents[idx].dvel;
                continue;
            }

            let circles: Vec<CircleObstacle> = self.agents[idx]
                .neighbours
                .iter()
                .map(|n| {
                    let other = &self.agents[n.agent_index];
                    CircleObstacle {
                        position: other.npos,
                        radius: other.params.radius,
                        velocity: other.vel,
                        desired_velocity: other.dvel,
                    }
                })
                .collect();

            let position = self.agents[idx].npos;
            let segments: Vec<SegmentObstacle> = (0..self.agents[idx].boundary.segment_count())
                .filter_map(|i| {
                    let seg = self.agents[idx].boundary.segment(i);
                    // Drop back-facing walls: keep only segments whose
                    // signed area relative to the agent is positive.
                    if crate::geom::triangle_area2(position, seg.start, seg.end) > 0.0 {
                        Some(SegmentObstacle { start: seg.start, end: seg.end })
                    } else {
                        None
                    }
                })
                .collect();

            let params = self.obstacle_avoidance_params(self.agents[idx].params.obstacle_avoidance_type as usize);
            let agent = &self.agents[idx];
            let nvel = self.avoidance.sample_velocity(
                Sampler::Adaptive,
                agent.npos,
                agent.params.radius,
                agent.params.max_speed,
                agent.vel,
                agent.dvel,
                &circles,
                &segments,
                &params,
            );
            stats.velocity_samples += self.avoidance.last_sample_count();
            self.agents[idx].nvel = nvel;
        }
    }

    fn phase8_integration(&mut self, active: &[usize], dt: f32) {
        for &idx in active {
            let agent = &mut self.agents[idx];
            if agent.state != AgentState::Walking {
                continue;
            }
            let delta = agent.nvel - agent.vel;
            let max_delta = agent.params.max_acceleration * dt;
            let delta = if delta.length() > max_delta {
                delta.normalize_or_zero() * max_delta
            } else {
                delta
            };
            agent.vel += delta;
            if agent.vel.length() > 1e-4 {
                agent.npos += agent.vel * dt;
            } else {
                agent.vel = Vec3::ZERO;
            }
        }
    }

    fn phase9_collision_relaxation(&mut self, active: &[usize]) {
        for _ in 0..COLLISION_ITERATIONS {
            let mut displacements = vec![Vec3::ZERO; self.agents.len()];
            for &idx in active {
                if self.agents[idx].state != AgentState::Walking {
                    continue;
                }
                let agent_a = &self.agents[idx];
                let mut disp = Vec3::ZERO;
                let mut count = 0;
                for &other_idx in active {
                    if other_idx == idx || self.agents[other_idx].state != AgentState::Walking {
                        continue;
                    }
                    let agent_b = &self.agents[other_idx];
                    let combined_radius = agent_a.params.radius + agent_b.params.radius;
                    let delta = Vec3::new(agent_a.npos.x - agent_b.npos.x, 0.0, agent_a.npos.z - agent_b.npos.z);
                    let d = delta.length();
                    if d >= combined_radius {
                        continue;
                    }
                    count += 1;
                    if d < 1e-4 {
                        let perp = Vec3::new(-agent_a.dvel.z, 0.0, agent_a.dvel.x).normalize_or_zero();
                        let sign = if idx > other_idx { 1.0 } else { -1.0 };
                        disp += perp * sign * 0.01;
                    } else {
                        let push = ((combined_radius - d) * 0.5 * COLLISION_RESOLVE_FACTOR) / d;
                        disp += delta * push;
                    }
                }
                if count > 0 {
                    disp /= count as f32;
                }
                displacements[idx] = disp;
            }
            for &idx in active {
                self.agents[idx].npos += displacements[idx];
                self.agents[idx].disp = displacements[idx];
            }
        }
    }

    fn phase10_corridor_advance(&mut self, mesh: &dyn NavMesh, active: &[usize]) {
        for &idx in active {
            if self.agents[idx].state != AgentState::Walking {
                continue;
            }
            let filter = self.filter(&self.agents[idx]).clone();
            let new_pos = self.agents[idx].npos;
            self.agents[idx].corridor.move_position(mesh, &filter, new_pos);
            self.agents[idx].npos = self.agents[idx].corridor.position();

            let no_path_target =
                self.agents[idx].target_state == TargetState::None || self.agents[idx].target_state == TargetState::Velocity;
            if no_path_target {
                if let Some(first) = self.agents[idx].corridor.first_poly() {
                    let pos = self.agents[idx].corridor.position();
                    self.agents[idx].corridor.reset(first, pos);
                }
            }
        }
    }

    fn phase11_offmesh_animation(&mut self, active: &[usize], dt: f32) {
        for &idx in active {
            let agent = &mut self.agents[idx];
            if !agent.animation.active {
                continue;
            }
            agent.animation.t += dt;
            if agent.animation.t > agent.animation.tmax {
                agent.animation.active = false;
                agent.state = AgentState::Walking;
                agent.vel = Vec3::ZERO;
                continue;
            }
            let ta = 0.15 * agent.animation.tmax;
            let tb = agent.animation.tmax;
            let t = agent.animation.t;
            agent.npos = if t < ta {
                agent.animation.init_pos.lerp(agent.animation.start_pos, (t / ta.max(1e-6)).clamp(0.0, 1.0))
            } else {
                let u = ((t - ta) / (tb - ta).max(1e-6)).clamp(0.0, 1.0);
                agent.animation.start_pos.lerp(agent.animation.end_pos, u)
            };
            agent.vel = Vec3::ZERO;
            agent.dvel = Vec3::ZERO;
        }
    }
}

fn collapse_triples(path: &mut Vec<PolyRef>) {
    let mut i = 0;
    while i + 2 < path.len() {
        if path[i] == path[i + 2] {
            path.remove(i + 2);
            path.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nav_mesh::PolyMesh;

    fn flat_quad(size: f32) -> PolyMesh {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(size, 0.0, 0.0),
            Vec3::new(size, 0.0, size),
            Vec3::new(0.0, 0.0, size),
        ];
        PolyMesh::new(vertices, vec![vec![0, 1, 2, 3]], vec![0], vec![0xffff]).unwrap()
    }

    #[test]
    fn add_agent_snaps_onto_mesh_and_activates_slot() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 4, max_agent_radius: 0.5 });
        let idx = crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams::default()).unwrap();
        assert_eq!(idx, 0);
        assert!(crowd.agent(idx).unwrap().is_walking());
    }

    #[test]
    fn remove_then_add_agent_reuses_the_same_slot() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 2, max_agent_radius: 0.5 });
        let idx = crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams::default()).unwrap();
        crowd.remove_agent(idx);
        assert!(crowd.agent(idx).is_none());
        let idx2 = crowd.add_agent(&mesh, Vec3::new(2.0, 0.0, 2.0), AgentParams::default()).unwrap();
        assert_eq!(idx, idx2);
    }

    #[test]
    fn pool_exhaustion_returns_none_without_corrupting_state() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        assert!(crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams::default()).is_some());
        assert!(crowd.add_agent(&mesh, Vec3::new(2.0, 0.0, 2.0), AgentParams::default()).is_none());
    }

    #[test]
    fn single_agent_moves_toward_its_requested_target() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        let idx = crowd
            .add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams { max_speed: 1.0, max_acceleration: 4.0, ..Default::default() })
            .unwrap();
        crowd.request_move_target(&mesh, idx, PolyRef(1), Vec3::new(9.0, 0.0, 1.0));
        for _ in 0..12 {
            crowd.update(&mesh, 1.0);
        }
        let agent = crowd.agent(idx).unwrap();
        assert!(agent.npos.x > 5.0, "agent should have advanced toward the target, got {:?}", agent.npos);
    }

    #[test]
    fn out_of_range_index_operations_return_false_without_mutating_state() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        assert!(!crowd.request_move_target(&mesh, 7, PolyRef(1), Vec3::ZERO));
        assert!(!crowd.reset_move_target(7));
        assert!(!crowd.update_agent_parameters(7, AgentParams::default()));
    }

    #[test]
    fn debug_agent_reports_corridor_and_position_for_active_slot() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        let idx = crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams::default()).unwrap();
        let info = crowd.debug_agent(idx).unwrap();
        assert_eq!(info.corridor, vec![PolyRef(1)]);
        assert!(crowd.debug_agent(idx + 1).is_none());
    }

    #[test]
    fn collapse_triples_removes_adjacent_back_and_forth() {
        let mut path = vec![PolyRef(1), PolyRef(2), PolyRef(1), PolyRef(3)];
        collapse_triples(&mut path);
        assert_eq!(path, vec![PolyRef(1), PolyRef(3)]);
    }

    /// A chain of `polys` unit quads along X, each sharing its right edge's
    /// vertex pair with the next quad's left edge so `PolyMesh::new` links
    /// them into one straight corridor.
    fn unit_strip(polys: usize) -> PolyMesh {
        let mut shared_vertices = Vec::new();
        let mut shared_polygons: Vec<Vec<usize>> = Vec::new();
        for i in 0..polys {
            let x = i as f32;
            if i == 0 {
                shared_vertices.push(Vec3::new(x, 0.0, 0.0));
                shared_vertices.push(Vec3::new(x, 0.0, 1.0));
            }
            let left_bottom = shared_vertices.len() - 2;
            let left_top = shared_vertices.len() - 1;
            shared_vertices.push(Vec3::new(x + 1.0, 0.0, 0.0));
            shared_vertices.push(Vec3::new(x + 1.0, 0.0, 1.0));
            let right_bottom = shared_vertices.len() - 2;
            let right_top = shared_vertices.len() - 1;
            shared_polygons.push(vec![left_bottom, right_bottom, right_top, left_top]);
        }
        let areas = vec![0u8; polys];
        let flags = vec![0xffffu16; polys];
        PolyMesh::new(shared_vertices, shared_polygons, areas, flags).unwrap()
    }

    /// A near quad (area 0) sharing an edge with a long, far quad (area 9)
    /// whose footprint starts well outside `find_nearest_poly`'s search
    /// extents from the near quad. Excluding area 9 leaves nothing within
    /// range of a target deep in the far quad, so recovery has no fallback.
    fn near_and_far_quads() -> PolyMesh {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(100.0, 0.0, 1.0),
        ];
        let polygons = vec![vec![0, 1, 2, 3], vec![1, 4, 5, 2]];
        PolyMesh::new(vertices, polygons, vec![0, 9], vec![0xffff, 0xffff]).unwrap()
    }

    fn two_islands_with_link() -> (PolyMesh, PolyRef) {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(9.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 1.0),
            Vec3::new(9.0, 0.0, 1.0),
        ];
        let polygons = vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]];
        let mut mesh = PolyMesh::new(vertices, polygons, vec![0, 0], vec![0xffff, 0xffff]).unwrap();
        let link = mesh
            .add_off_mesh_connection(Vec3::new(1.0, 0.0, 0.5), Vec3::new(9.0, 0.0, 0.5), false, 0, 0xffff)
            .unwrap();
        (mesh, link)
    }

    #[test]
    fn two_agents_swap_targets_without_ever_overlapping_and_both_arrive() {
        let mesh = flat_quad(10.0);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 2, max_agent_radius: 0.5 });
        let a = crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 5.0), AgentParams::default()).unwrap();
        let b = crowd.add_agent(&mesh, Vec3::new(9.0, 0.0, 5.0), AgentParams::default()).unwrap();
        crowd.request_move_target(&mesh, a, PolyRef(1), Vec3::new(9.0, 0.0, 5.0));
        crowd.request_move_target(&mesh, b, PolyRef(1), Vec3::new(1.0, 0.0, 5.0));

        let min_separation = 0.5 * (crowd.agent(a).unwrap().params.radius + crowd.agent(b).unwrap().params.radius);
        for _ in 0..30 {
            crowd.update(&mesh, 0.1);
            let dist = crowd.agent(a).unwrap().npos.distance(crowd.agent(b).unwrap().npos);
            assert!(dist >= min_separation, "agents came within {dist}, below the {min_separation} bound");
        }

        assert!(crowd.agent(a).unwrap().npos.distance(Vec3::new(9.0, 0.0, 5.0)) < 1.0);
        assert!(crowd.agent(b).unwrap().npos.distance(Vec3::new(1.0, 0.0, 5.0)) < 1.0);
    }

    #[test]
    fn target_on_an_excluded_area_fails_within_two_ticks() {
        let mesh = near_and_far_quads();
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        let idx = crowd.add_agent(&mesh, Vec3::new(0.5, 0.0, 0.5), AgentParams::default()).unwrap();
        crowd.request_move_target(&mesh, idx, PolyRef(2), Vec3::new(90.0, 0.0, 0.5));
        crowd.update(&mesh, 0.1);
        assert_eq!(crowd.agent(idx).unwrap().target_state, TargetState::Valid);

        let mut blocked = QueryFilter::new();
        blocked.set_area_cost(9, 0.0);
        crowd.set_filter(0, blocked);

        let mut ticks_to_fail = None;
        for tick in 1..=2 {
            crowd.update(&mesh, 0.1);
            if crowd.agent(idx).unwrap().target_state == TargetState::Failed {
                ticks_to_fail = Some(tick);
                break;
            }
        }
        assert_eq!(ticks_to_fail, Some(1), "expected Failed within the first tick after exclusion");
    }

    #[test]
    fn path_queue_overflow_admits_exactly_its_capacity_per_tick() {
        let mesh = unit_strip(30);
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 16, max_agent_radius: 0.5 });
        let target = PolyRef(30);
        let mut idxs = Vec::new();
        for _ in 0..16 {
            let idx = crowd.add_agent(&mesh, Vec3::new(0.5, 0.0, 0.5), AgentParams::default()).unwrap();
            crowd.request_move_target(&mesh, idx, target, Vec3::new(29.5, 0.0, 0.5));
            idxs.push(idx);
        }

        crowd.update(&mesh, 0.1);

        let waiting_for_path = idxs.iter().filter(|&&i| crowd.agent(i).unwrap().target_state == TargetState::WaitingForPath).count();
        let waiting_for_queue = idxs.iter().filter(|&&i| crowd.agent(i).unwrap().target_state == TargetState::WaitingForQueue).count();
        assert_eq!(waiting_for_path, 8);
        assert_eq!(waiting_for_queue, 8);
    }

    #[test]
    fn agent_crosses_an_off_mesh_connection_and_resumes_walking() {
        let (mesh, link) = two_islands_with_link();
        let mut crowd = Crowd::new(CrowdConfig { max_agents: 1, max_agent_radius: 0.5 });
        let idx = crowd.add_agent(&mesh, Vec3::new(0.5, 0.0, 0.5), AgentParams::default()).unwrap();
        crowd.request_move_target(&mesh, idx, link, Vec3::new(9.0, 0.0, 0.5));

        let mut saw_offmesh = false;
        for _ in 0..200 {
            crowd.update(&mesh, 0.1);
            if crowd.agent(idx).unwrap().state == AgentState::OffMesh {
                saw_offmesh = true;
            }
            if saw_offmesh && crowd.agent(idx).unwrap().state == AgentState::Walking {
                break;
            }
        }

        assert!(saw_offmesh, "agent never entered the off-mesh animation state");
        let agent = crowd.agent(idx).unwrap();
        assert_eq!(agent.state, AgentState::Walking);
        assert!(agent.npos.x > 5.0, "agent should have crossed onto the far island, got {:?}", agent.npos);
    }

    #[test]
    fn two_independent_crowds_given_the_same_calls_stay_bitwise_identical() {
        fn run() -> Vec<(Vec3, Vec3, TargetState)> {
            let mesh = flat_quad(10.0);
            let mut crowd = Crowd::new(CrowdConfig { max_agents: 3, max_agent_radius: 0.5 });
            let a = crowd.add_agent(&mesh, Vec3::new(1.0, 0.0, 1.0), AgentParams::default()).unwrap();
            let b = crowd.add_agent(&mesh, Vec3::new(5.0, 0.0, 5.0), AgentParams::default()).unwrap();
            let c = crowd.add_agent(&mesh, Vec3::new(8.0, 0.0, 2.0), AgentParams::default()).unwrap();
            crowd.request_move_target(&mesh, a, PolyRef(1), Vec3::new(9.0, 0.0, 9.0));
            crowd.request_move_target(&mesh, b, PolyRef(1), Vec3::new(1.0, 0.0, 9.0));
            crowd.request_move_target(&mesh, c, PolyRef(1), Vec3::new(2.0, 0.0, 2.0));

            let mut history = Vec::new();
            for _ in 0..20 {
                crowd.update(&mesh, 0.1);
                for &idx in &[a, b, c] {
                    let agent = crowd.agent(idx).unwrap();
                    history.push((agent.npos, agent.vel, agent.target_state));
                }
            }
            history
        }

        assert_eq!(run(), run());
    }
}
