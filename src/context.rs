//! The host side of the engines: something that can allocate float render targets, build full-screen programs and
//! draw them.
//!
//! Two hosts exist. [`GpuContext`] drives `wgpu`; [`CpuContext`] runs programs as Rust closures, one call per texel,
//! which is what the tests use.

mod cpu;
mod gpu;

pub use cpu::{kernel, CpuBindings, CpuContext, CpuProgram, CpuTarget, Fragment, Kernel};
pub use gpu::{GpuBindings, GpuContext, GpuProgram, GpuTarget};

use std::fmt::Write as _;

use crate::error::ContextError;

/// Every target texel is four `f32` components.
pub const TEXEL_BYTES: u32 = 16;

/// Binding slots of a program's input bind group.
pub const FRAME_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;
pub const FIRST_INPUT_BINDING: u32 = 2;
/// Bind group that holds the caller's uniform block, if any.
pub const PARAMS_GROUP: u32 = 1;

/// Identifiers the engines declare themselves. Variables, channels and inputs may not use them.
pub const RESERVED_NAMES: [&str; 4] = ["frame", "input_sampler", "params", "Frame"];

/// Identity of a render target. Two handles refer to the same resource iff their ids are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u64);

pub trait RenderTarget {
    fn id(&self) -> TargetId;
    fn size(&self) -> [u32; 2];
    fn attachment_count(&self) -> usize;

    fn texel_count(&self) -> usize {
        let [width, height] = self.size();
        width as usize * height as usize
    }
}

/// What a host can do. Checked once when an engine is initialized.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Capabilities {
    pub float_render_targets: bool,
    pub vertex_texture_sampling: bool,
    pub float32_filterable: bool,
    pub compute_shaders: bool,
    pub max_color_attachments: u32,
    pub max_color_attachment_bytes_per_sample: u32,
}

impl Capabilities {
    /// How many RGBA32F attachments a single draw may write.
    pub fn max_float_attachments(&self) -> usize {
        self.max_color_attachments
            .min(self.max_color_attachment_bytes_per_sample / TEXEL_BYTES) as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

impl WrapMode {
    /// Map an integer texel coordinate into `0..extent`.
    pub fn apply(self, coord: i64, extent: u32) -> u32 {
        let extent = extent as i64;
        let wrapped = match self {
            WrapMode::ClampToEdge => coord.clamp(0, extent - 1),
            WrapMode::Repeat => coord.rem_euclid(extent),
            WrapMode::MirrorRepeat => {
                let period = coord.rem_euclid(2 * extent);
                if period < extent {
                    period
                } else {
                    2 * extent - 1 - period
                }
            }
        };
        wrapped as u32
    }

    pub fn address_mode(self) -> wgpu::AddressMode {
        match self {
            WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            WrapMode::Repeat => wgpu::AddressMode::Repeat,
            WrapMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

impl FilterMode {
    pub fn filter_mode(self) -> wgpu::FilterMode {
        match self {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }
}

/// How a program samples its inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub wrap: WrapMode,
    pub filter: FilterMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDesc {
    pub label: String,
    pub size: [u32; 2],
    /// One RGBA32F texture per attachment, in this order.
    pub attachments: Vec<String>,
}

impl TargetDesc {
    pub fn single(label: impl Into<String>, size: [u32; 2]) -> Self {
        let label = label.into();
        Self {
            attachments: vec![label.clone()],
            label,
            size,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingEntry {
    pub name: String,
    pub binding: u32,
}

/// Which input texture a program finds at which binding slot.
///
/// Inputs are numbered from [`FIRST_INPUT_BINDING`] in declaration order. Programs are written against these slots;
/// [`Self::wgsl_declarations`] renders the matching declarations for callers that want to prepend them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingTable {
    entries: Vec<BindingEntry>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an input. Returns `false` (and changes nothing) if the name is already bound.
    pub fn push(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.binding_of(&name).is_some() {
            return false;
        }
        let binding = FIRST_INPUT_BINDING + self.entries.len() as u32;
        self.entries.push(BindingEntry { name, binding });
        true
    }

    pub fn binding_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.binding)
    }

    pub fn entries(&self) -> &[BindingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// WGSL declarations of the frame uniform, the sampler and every input texture.
    pub fn wgsl_declarations(&self) -> String {
        let mut out = String::from("struct Frame {\n    resolution: vec2<f32>,\n    _pad: vec2<f32>,\n}\n");
        let _ = writeln!(out, "@group(0) @binding({FRAME_BINDING}) var<uniform> frame: Frame;");
        let _ = writeln!(out, "@group(0) @binding({SAMPLER_BINDING}) var input_sampler: sampler;");
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "@group(0) @binding({}) var {}: texture_2d<f32>;",
                entry.binding, entry.name
            );
        }
        out
    }
}

/// Everything a host needs to build a program besides its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramLayout {
    pub label: String,
    pub size: [u32; 2],
    pub bindings: BindingTable,
    pub attachments: usize,
    pub sampling: SamplingPolicy,
    /// Size of the caller's uniform block in bytes. Zero means the program has no params group.
    pub uniform_size: usize,
}

/// One attachment of a target.
#[derive(Debug)]
pub struct Attachment<'a, T> {
    pub target: &'a T,
    pub index: usize,
}

impl<T> Clone for Attachment<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Attachment<'_, T> {}

/// A named input of a program.
#[derive(Debug)]
pub struct Input<'a, T> {
    pub name: &'a str,
    pub attachment: Attachment<'a, T>,
}

impl<T> Clone for Input<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Input<'_, T> {}

impl<'a, T> Input<'a, T> {
    pub fn new(name: &'a str, target: &'a T, index: usize) -> Self {
        Self {
            name,
            attachment: Attachment { target, index },
        }
    }
}

/// A host able to run full-screen programs over float render targets.
///
/// Calls execute in submission order. Draws may be batched until [`Self::flush`].
pub trait ComputeContext {
    /// Program source as callers supply it. The engines never look inside.
    type Source: Clone;
    type Target: RenderTarget;
    type Program;
    /// Inputs resolved against a program's binding table, ready to draw with.
    type Bindings;

    fn capabilities(&self) -> &Capabilities;

    fn create_target(&mut self, desc: &TargetDesc) -> Result<Self::Target, ContextError>;

    fn write_target(
        &mut self,
        target: &Self::Target,
        attachment: usize,
        texels: &[glam::Vec4],
    ) -> Result<(), ContextError>;

    /// Blocking readback, for tests and debugging. Flushes pending work first.
    fn read_target(
        &mut self,
        target: &Self::Target,
        attachment: usize,
    ) -> Result<Vec<glam::Vec4>, ContextError>;

    fn release_target(&mut self, target: Self::Target);

    fn create_program(
        &mut self,
        source: &Self::Source,
        layout: &ProgramLayout,
    ) -> Result<Self::Program, ContextError>;

    fn write_uniforms(
        &mut self,
        program: &mut Self::Program,
        bytes: &[u8],
    ) -> Result<(), ContextError>;

    fn create_bindings(
        &mut self,
        program: &Self::Program,
        inputs: &[Input<'_, Self::Target>],
    ) -> Result<Self::Bindings, ContextError>;

    /// Run `program` over every texel of `output`. Fails if `output` is one of the bound inputs.
    fn draw(
        &mut self,
        program: &Self::Program,
        bindings: &Self::Bindings,
        output: &Self::Target,
    ) -> Result<(), ContextError>;

    /// The built-in copy program: `output[0]` receives `input[0]` texel for texel.
    fn copy(&mut self, input: &Self::Target, output: &Self::Target) -> Result<(), ContextError>;

    fn flush(&mut self);
}

pub(crate) fn check_attachment<T: RenderTarget>(
    target: &T,
    attachment: usize,
) -> Result<(), ContextError> {
    if attachment >= target.attachment_count() {
        return Err(ContextError::AttachmentOutOfRange {
            attachment,
            count: target.attachment_count(),
        });
    }
    Ok(())
}
