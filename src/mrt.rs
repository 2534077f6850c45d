//! All channels of a simulation in one multi-attachment double buffer, advanced by one shared step program.
//!
//! The step program sees every attachment of the back buffer as `back_<channel>` and writes all channels of the
//! front buffer in a single draw. `render` swaps the two halves by value before drawing, so the pixel data never
//! moves.

use std::collections::HashSet;

use indexmap::IndexMap;
use puffin::profile_function;

use crate::{
    context::{
        Attachment, BindingTable, ComputeContext, FilterMode, Input, ProgramLayout, SamplingPolicy,
        TargetDesc, RESERVED_NAMES,
    },
    error::{CapabilityError, ContextError, EngineError, InitError},
    layout::FieldValue,
    uniforms::{assign_uniforms, pack_uniforms, Uniforms},
};

/// Prefix under which the step program reads the previous state of each channel.
pub const BACK_PREFIX: &str = "back_";

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CycleConfig {
    pub size: [u32; 2],
    /// Attachment order of both halves.
    pub channels: Vec<String>,
    #[serde(default)]
    pub sampling: SamplingPolicy,
}

impl CycleConfig {
    pub fn new<S: Into<String>>(size: [u32; 2], channels: impl IntoIterator<Item = S>) -> Self {
        Self {
            size,
            channels: channels.into_iter().map(Into::into).collect(),
            sampling: SamplingPolicy::default(),
        }
    }
}

/// Program source plus the uniform cells it declares.
#[derive(Clone, Debug)]
pub struct CycleProgram<S> {
    pub source: S,
    pub uniforms: Uniforms,
}

impl<S> CycleProgram<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            uniforms: Uniforms::new(),
        }
    }

    pub fn with_uniforms(source: S, uniforms: Uniforms) -> Self {
        Self { source, uniforms }
    }
}

/// One half of the double buffer, with the step bindings that read it.
struct Half<C: ComputeContext> {
    target: C::Target,
    reads: C::Bindings,
}

struct Stage<C: ComputeContext> {
    program: C::Program,
    uniforms: Uniforms,
    dirty: bool,
}

impl<C: ComputeContext> Stage<C> {
    fn upload(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        if self.dirty {
            let bytes = pack_uniforms(&self.uniforms)?;
            ctx.write_uniforms(&mut self.program, &bytes)?;
            self.dirty = false;
        }
        Ok(())
    }
}

pub struct RenderCycle<C: ComputeContext> {
    config: CycleConfig,
    init: Stage<C>,
    step: Stage<C>,
    init_bindings: C::Bindings,
    back: Half<C>,
    front: Half<C>,
    inputs: Vec<(String, C::Target)>,
}

fn back_name(channel: &str) -> String {
    format!("{BACK_PREFIX}{channel}")
}

impl<C: ComputeContext> RenderCycle<C> {
    /// Allocate both halves, build the init and step programs and seed both halves with the init program.
    ///
    /// `inputs` are extra textures bound to both programs under their names, after the `back_<channel>` entries.
    /// The cycle takes ownership of them and releases them in [`Self::dispose`].
    pub fn new(
        ctx: &mut C,
        config: CycleConfig,
        init: CycleProgram<C::Source>,
        step: CycleProgram<C::Source>,
        inputs: Vec<(String, C::Target)>,
    ) -> Result<Self, InitError> {
        profile_function!();
        validate(ctx, &config, &init, &step, &inputs)?;

        let mut init_table = BindingTable::new();
        let mut step_table = BindingTable::new();
        for channel in &config.channels {
            step_table.push(back_name(channel));
        }
        for (name, _) in &inputs {
            init_table.push(name.as_str());
            step_table.push(name.as_str());
        }

        let desc = |label: &str| TargetDesc {
            label: label.into(),
            size: config.size,
            attachments: config.channels.clone(),
        };
        let back = ctx.create_target(&desc("back"))?;
        let front = match ctx.create_target(&desc("front")) {
            Ok(front) => front,
            Err(err) => {
                ctx.release_target(back);
                return Err(err.into());
            }
        };
        let built = build(
            ctx,
            &config,
            [(&init, init_table), (&step, step_table)],
            [&back, &front],
            &inputs,
        );
        let Built {
            init_program,
            step_program,
            init_bindings,
            reads: [back_reads, front_reads],
        } = match built {
            Ok(built) => built,
            Err(err) => {
                ctx.release_target(back);
                ctx.release_target(front);
                return Err(err);
            }
        };

        let cycle = Self {
            init: Stage {
                program: init_program,
                uniforms: init.uniforms,
                dirty: false,
            },
            step: Stage {
                program: step_program,
                uniforms: step.uniforms,
                dirty: false,
            },
            init_bindings,
            back: Half {
                target: back,
                reads: back_reads,
            },
            front: Half {
                target: front,
                reads: front_reads,
            },
            inputs,
            config,
        };
        // uniforms were written at build time
        if let Err(err) = cycle.seed(ctx) {
            cycle.dispose(ctx);
            return Err(err.into());
        }
        log::info!(
            "render cycle with channels {:?} at {:?}",
            cycle.config.channels,
            cycle.config.size
        );
        Ok(cycle)
    }

    fn seed(&self, ctx: &mut C) -> Result<(), ContextError> {
        ctx.draw(&self.init.program, &self.init_bindings, &self.back.target)?;
        ctx.draw(&self.init.program, &self.init_bindings, &self.front.target)?;
        ctx.flush();
        Ok(())
    }

    /// Run the init program into `back`, then into `front`.
    pub fn init(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        profile_function!();
        self.init.upload(ctx)?;
        Ok(self.seed(ctx)?)
    }

    /// Swap the halves, then draw the step program reading `back` into `front`.
    pub fn render(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        profile_function!();
        std::mem::swap(&mut self.back, &mut self.front);
        self.step.upload(ctx)?;
        ctx.draw(&self.step.program, &self.back.reads, &self.front.target)?;
        ctx.flush();
        Ok(())
    }

    /// The freshly computed attachments, by channel name.
    pub fn texture_uniforms(&self) -> IndexMap<&str, Attachment<'_, C::Target>> {
        self.config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| {
                (
                    channel.as_str(),
                    Attachment {
                        target: &self.front.target,
                        index,
                    },
                )
            })
            .collect()
    }

    pub fn back(&self) -> &C::Target {
        &self.back.target
    }

    pub fn front(&self) -> &C::Target {
        &self.front.target
    }

    pub fn channels(&self) -> &[String] {
        &self.config.channels
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn init_uniforms(&self) -> &Uniforms {
        &self.init.uniforms
    }

    pub fn step_uniforms(&self) -> &Uniforms {
        &self.step.uniforms
    }

    /// Change init uniforms declared at construction. Takes effect on the next [`Self::init`].
    pub fn update_init_uniforms<K, V>(
        &mut self,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), EngineError>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        assign_uniforms(&mut self.init.uniforms, values)?;
        self.init.dirty = true;
        Ok(())
    }

    /// Change step uniforms declared at construction. Takes effect on the next [`Self::render`].
    pub fn update_step_uniforms<K, V>(
        &mut self,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), EngineError>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        assign_uniforms(&mut self.step.uniforms, values)?;
        self.step.dirty = true;
        Ok(())
    }

    pub fn dispose(self, ctx: &mut C) {
        ctx.flush();
        ctx.release_target(self.back.target);
        ctx.release_target(self.front.target);
        for (_, target) in self.inputs {
            ctx.release_target(target);
        }
    }
}

fn validate<C: ComputeContext>(
    ctx: &C,
    config: &CycleConfig,
    init: &CycleProgram<C::Source>,
    step: &CycleProgram<C::Source>,
    inputs: &[(String, C::Target)],
) -> Result<(), InitError> {
    if config.channels.is_empty() {
        return Err(InitError::NoChannels);
    }

    let capabilities = ctx.capabilities();
    if !capabilities.float_render_targets {
        return Err(CapabilityError::FloatRenderTargets.into());
    }
    if !(capabilities.vertex_texture_sampling || capabilities.compute_shaders) {
        return Err(CapabilityError::VertexTextures.into());
    }
    let max = capabilities.max_float_attachments();
    if config.channels.len() > max {
        return Err(CapabilityError::TooManyAttachments {
            requested: config.channels.len(),
            max,
        }
        .into());
    }
    if config.sampling.filter == FilterMode::Linear && !capabilities.float32_filterable {
        return Err(CapabilityError::FloatFiltering.into());
    }

    let mut names = HashSet::new();
    let bound = config
        .channels
        .iter()
        .map(|channel| back_name(channel))
        .chain(inputs.iter().map(|(name, _)| name.clone()));
    for name in config.channels.iter().cloned().chain(bound) {
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(InitError::ReservedName(name));
        }
        if !names.insert(name.clone()) {
            return Err(InitError::DuplicateName(name));
        }
    }
    for name in init.uniforms.keys().chain(step.uniforms.keys()) {
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(InitError::ReservedName(name.clone()));
        }
    }
    Ok(())
}

struct Built<C: ComputeContext> {
    init_program: C::Program,
    step_program: C::Program,
    init_bindings: C::Bindings,
    reads: [C::Bindings; 2],
}

fn build<C: ComputeContext>(
    ctx: &mut C,
    config: &CycleConfig,
    [(init, init_table), (step, step_table)]: [(&CycleProgram<C::Source>, BindingTable); 2],
    halves: [&C::Target; 2],
    inputs: &[(String, C::Target)],
) -> Result<Built<C>, InitError> {
    let init_program = build_stage(ctx, config, "init", init, init_table)?;
    let step_program = build_stage(ctx, config, "step", step, step_table)?;

    let extra: Vec<_> = inputs
        .iter()
        .map(|(name, target)| Input::new(name.as_str(), target, 0))
        .collect();
    let init_bindings = ctx.create_bindings(&init_program, &extra)?;
    let [back, front] = halves;
    let back_reads = bind_step(ctx, &step_program, &config.channels, back, &extra)?;
    let front_reads = bind_step(ctx, &step_program, &config.channels, front, &extra)?;
    Ok(Built {
        init_program,
        step_program,
        init_bindings,
        reads: [back_reads, front_reads],
    })
}

fn build_stage<C: ComputeContext>(
    ctx: &mut C,
    config: &CycleConfig,
    label: &str,
    program: &CycleProgram<C::Source>,
    bindings: BindingTable,
) -> Result<C::Program, InitError> {
    let uniforms = pack_uniforms(&program.uniforms)?;
    let layout = ProgramLayout {
        label: label.into(),
        size: config.size,
        bindings,
        attachments: config.channels.len(),
        sampling: config.sampling,
        uniform_size: uniforms.len(),
    };
    let mut built = ctx.create_program(&program.source, &layout)?;
    if !uniforms.is_empty() {
        ctx.write_uniforms(&mut built, &uniforms)?;
    }
    Ok(built)
}

/// Step bindings that read every attachment of `half` as `back_<channel>`.
fn bind_step<C: ComputeContext>(
    ctx: &mut C,
    step: &C::Program,
    channels: &[String],
    half: &C::Target,
    extra: &[Input<'_, C::Target>],
) -> Result<C::Bindings, ContextError> {
    let names: Vec<String> = channels.iter().map(|c| back_name(c)).collect();
    let mut inputs: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(index, name)| Input::new(name.as_str(), half, index))
        .collect();
    inputs.extend(extra.iter().copied());
    ctx.create_bindings(step, &inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_names_are_prefixed() {
        assert_eq!(back_name("velocity"), "back_velocity");
    }
}
