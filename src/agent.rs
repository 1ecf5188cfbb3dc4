//! A single agent's pool slot: physical parameters, kinematic state, target
//! state, and the corner/neighbor caches the crowd pipeline refreshes each
//! tick.
//!
//! Grounded on `DetourCrowd.cpp`'s `dtCrowdAgent`/`dtCrowdAgentAnimation`
//! structs. The pool slot is a fixed-capacity array entry with literal index
//! reuse, not a generational handle, since slots are recycled by
//! `Crowd::add_agent`/`remove_agent` rather than referenced externally by a
//! stable key; the free-function-over-state-enum dispatch style carries over
//! for the phase 1/2 path-validity decisions in `crowd.rs`.

use glam::Vec3;

use crate::local_boundary::LocalBoundary;
use crate::path_corridor::{Corner, PathCorridor};
use crate::path_queue::PathQueueRef;

pub const MAX_NEIGHBOURS: usize = 6;
pub const MAX_NEIS: usize = 32;

macro_rules! bitflags3 {
    (pub struct $name:ident: u8 { $(const $variant:ident = $value:expr;)* }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
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
        impl Default for $name {
            fn default() -> Self { Self::empty() }
        }
    };
}

bitflags3! {
    pub struct UpdateFlags: u8 {
        const ANTICIPATE_TURNS = 0x01;
        const OBSTACLE_AVOIDANCE = 0x02;
        const SEPARATION = 0x04;
        const OPTIMIZE_VIS = 0x08;
        const OPTIMIZE_TOPO = 0x10;
    }
}

/// Parameters supplied to `Crowd::add_agent`/`update_agent_parameters`.
#[derive(Clone, Copy, Debug)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_speed: f32,
    pub max_acceleration: f32,
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    pub query_filter_type: u8,
    pub obstacle_avoidance_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: 0.5,
            height: 2.0,
            max_speed: 3.5,
            max_acceleration: 8.0,
            collision_query_range: 0.5 * 5.0,
            path_optimization_range: 0.5 * 15.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::ANTICIPATE_TURNS
                | UpdateFlags::OBSTACLE_AVOIDANCE
                | UpdateFlags::SEPARATION,
            query_filter_type: 0,
            obstacle_avoidance_type: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AgentState {
    Invalid,
    Walking,
    OffMesh,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetState {
    None,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Valid,
    Failed,
    Velocity,
}

#[derive(Clone, Copy, Debug)]
pub struct NeighbourRecord {
    pub agent_index: usize,
    pub dist_sq: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct OffMeshAnimation {
    pub active: bool,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    pub init_pos: Vec3,
    pub t: f32,
    pub tmax: f32,
}

impl Default for OffMeshAnimation {
    fn default() -> Self {
        Self {
            active: false,
            start_pos: Vec3::ZERO,
            end_pos: Vec3::ZERO,
            init_pos: Vec3::ZERO,
            t: 0.0,
            tmax: 0.0,
        }
    }
}

/// A pool slot. `active` stays false for free slots; all other fields are
/// only meaningful while `active`.
pub struct Agent {
    pub active: bool,
    pub params: AgentParams,
    pub state: AgentState,
    pub target_state: TargetState,
    pub target_ref: crate::nav_mesh::PolyRef,
    pub target_pos: Vec3,
    pub target_vel: Vec3,
    pub partial: bool,
    pub pending_path_request: Option<PathQueueRef>,

    pub npos: Vec3,
    pub vel: Vec3,
    pub dvel: Vec3,
    pub nvel: Vec3,
    pub disp: Vec3,

    pub corridor: PathCorridor,
    pub boundary: LocalBoundary,
    pub corners: Vec<Corner>,
    pub neighbours: Vec<NeighbourRecord>,

    pub topology_opt_time: f32,
    pub target_replan_time: f32,

    pub animation: OffMeshAnimation,
}

impl Agent {
    pub fn new(params: AgentParams) -> Self {
        Self {
            active: false,
            params,
            state: AgentState::Invalid,
            target_state: TargetState::None,
            target_ref: crate::nav_mesh::PolyRef::NONE,
            target_pos: Vec3::ZERO,
            target_vel: Vec3::ZERO,
            partial: false,
            pending_path_request: None,
            npos: Vec3::ZERO,
            vel: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            disp: Vec3::ZERO,
            corridor: PathCorridor::new(),
            boundary: LocalBoundary::new(),
            corners: Vec::new(),
            neighbours: Vec::new(),
            topology_opt_time: 0.0,
            target_replan_time: 0.0,
            animation: OffMeshAnimation::default(),
        }
    }

    pub fn is_walking(&self) -> bool {
        self.active && self.state == AgentState::Walking
    }

    pub fn has_move_target(&self) -> bool {
        matches!(self.target_state, TargetState::Valid | TargetState::Velocity)
    }

    pub fn reset_target(&mut self) {
        self.target_state = TargetState::None;
        self.target_ref = crate::nav_mesh::PolyRef::NONE;
        self.target_pos = Vec3::ZERO;
        self.partial = false;
        self.pending_path_request = None;
        self.corners.clear();
        self.neighbours.clear();
    }
}

/// What the crowd pipeline should do about an agent's path this tick,
/// decided at the top of phase 1/2. A free function over an enum rather than
/// a method, since it only consults read-only corridor/target state.
#[derive(Debug, PartialEq, Eq)]
pub enum RepathDecision {
    DoNothing,
    Replan,
    ClearNoTarget,
}

pub fn decide_repath(agent: &Agent, corridor_valid: bool, replan_elapsed: bool) -> RepathDecision {
    if agent.target_state == TargetState::None {
        return RepathDecision::ClearNoTarget;
    }
    if !corridor_valid {
        return RepathDecision::Replan;
    }
    if replan_elapsed && agent.target_state == TargetState::Valid {
        let last_is_target = agent.corridor.last_poly() == Some(agent.target_ref);
        if !last_is_target && agent.corridor.path().len() < 4 {
            return RepathDecision::Replan;
        }
    }
    RepathDecision::DoNothing
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_update_flags_match_documented_defaults() {
        let params = AgentParams::default();
        assert!(params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS));
        assert!(params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE));
        assert!(params.update_flags.contains(UpdateFlags::SEPARATION));
        assert!(!params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO));
    }

    #[test]
    fn no_target_yields_clear_no_target() {
        let agent = Agent::new(AgentParams::default());
        assert_eq!(decide_repath(&agent, true, false), RepathDecision::ClearNoTarget);
    }

    #[test]
    fn invalid_corridor_forces_replan() {
        let mut agent = Agent::new(AgentParams::default());
        agent.target_state = TargetState::Valid;
        assert_eq!(decide_repath(&agent, false, false), RepathDecision::Replan);
    }
}
