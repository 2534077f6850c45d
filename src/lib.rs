#![warn(clippy::all)]

pub mod buffer_view;
pub mod context;
pub mod error;
pub mod layout;
pub mod mrt;
pub mod pingpong;
pub mod simulation;
pub mod uniforms;
pub mod shaders {
    #[allow(warnings)]
    pub mod fullscreen;
}

pub use buffer_view::{complexify_path, Vec2Buffer, Vec3Buffer, Vec4Buffer};
pub use context::{
    Capabilities, ComputeContext, CpuContext, FilterMode, GpuContext, SamplingPolicy, WrapMode,
};
pub use error::{BufferError, CapabilityError, ContextError, EngineError, InitError, LayoutError};
pub use mrt::{CycleConfig, CycleProgram, RenderCycle};
pub use pingpong::{EngineConfig, VariableEngine, VariableId};
pub use simulation::Simulation;
pub use uniforms::{as_uniforms, update_uniforms, Uniforms};
