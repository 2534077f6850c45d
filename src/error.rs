//! Error types shared by the engines and their utilities.
//!
//! Configuration mistakes (bad lengths, bad indices, unresolved dependencies) and missing host capabilities are both
//! reported as values. Nothing here is retried: every variant describes a programmer error or a host that cannot run
//! the simulation at all.

use thiserror::Error;

use crate::layout::FieldKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("invalid data length {len}: not a multiple of {arity}")]
    InvalidLength { len: usize, arity: usize },
    #[error("invalid index {index}: buffer holds {len} elements")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("invalid range {start}..={end}: buffer holds {len} elements")]
    InvalidRange { start: usize, end: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("field `{field}` has {components} components, only 1 to 4 are supported")]
    UnsupportedValue { field: String, components: usize },
    #[error("field `{0}` appears more than once")]
    DuplicateField(String),
    #[error("field `{0}` is not part of the record")]
    MissingField(String),
    #[error("field `{field}` is a {found:?}, the layout expects a {expected:?}")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("record {index} is out of range for {len} records")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A host capability the engine needs but the context does not report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("no support for floating point render targets")]
    FloatRenderTargets,
    #[error("no support for vertex shader textures")]
    VertexTextures,
    #[error("linear filtering of float textures is not supported")]
    FloatFiltering,
    #[error("{requested} float attachments requested, the host supports at most {max}")]
    TooManyAttachments { requested: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no suitable GPU adapter was found")]
    AdapterUnavailable,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("program `{label}` failed to build: {message}")]
    Program { label: String, message: String },
    #[error("expected {expected} texels, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("attachment {attachment} is out of range for a target with {count} attachments")]
    AttachmentOutOfRange { attachment: usize, count: usize },
    #[error("program `{program}` writes {expected} attachments, the output has {actual}")]
    AttachmentCount {
        program: String,
        expected: usize,
        actual: usize,
    },
    #[error("program `{program}` has no input named `{name}`")]
    UnboundInput { program: String, name: String },
    #[error("program `{program}` would read and write the same target")]
    AliasedTarget { program: String },
    #[error("program `{program}` expects {expected} uniform bytes, got {actual}")]
    UniformSize {
        program: String,
        expected: usize,
        actual: usize,
    },
    #[error("target {0:?} is unknown to this context")]
    UnknownTarget(crate::context::TargetId),
    #[error("readback failed: {0}")]
    Readback(String),
}

/// Reported by `initialize`/construction. No resources are allocated when validation fails.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("Variable dependency not found. Variable={variable}, dependency={dependency}")]
    MissingDependency { variable: String, dependency: String },
    #[error("name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("name `{0}` collides with an identifier reserved by the engine")]
    ReservedName(String),
    #[error("a render cycle needs at least one channel")]
    NoChannels,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has not been initialized")]
    NotInitialized,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("no variable `{0}` in this engine")]
    UnknownVariable(String),
    #[error("uniform `{0}` was not declared before initialization")]
    UnknownUniform(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Context(#[from] ContextError),
}
