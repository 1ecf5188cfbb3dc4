#![doc = include_str!("../README.md")]

pub mod agent;
pub mod crowd;
pub mod geom;
pub mod local_boundary;
pub mod mesh_query;
pub mod nav_mesh;
pub mod node_pool;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod path_queue;
pub mod proximity_grid;

pub use glam::Vec3;

pub use agent::{AgentParams, AgentState, TargetState, UpdateFlags};
pub use crowd::{AgentDebugInfo, Crowd, CrowdConfig, CrowdError, CrowdUpdateStats};
pub use nav_mesh::{NavMesh, OffMeshConnection, PolyMesh, PolyRef, QueryFilter, ValidationError};
pub use obstacle_avoidance::AvoidanceParams;
pub use path_corridor::Corner;
