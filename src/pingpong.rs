//! One double buffer per variable, one full-screen draw per variable per tick.
//!
//! Each variable's program reads the previous frame of itself and of every dependency it declared. Dependencies are
//! wired through a [`BindingTable`] built at initialization; the current/next designation is a single [`Slot`] that
//! flips once per tick, after every variable has been drawn, so all variables in a tick read the same snapshot.

use std::collections::{HashMap, HashSet};

use glam::Vec4;
use puffin::profile_function;

use crate::{
    buffer_view::{Storage, Vec4Buffer},
    context::{
        BindingTable, ComputeContext, FilterMode, Input, ProgramLayout, SamplingPolicy,
        TargetDesc, RESERVED_NAMES,
    },
    error::{CapabilityError, ContextError, EngineError, InitError},
    layout::FieldValue,
    uniforms::{assign_uniforms, pack_uniforms, update_uniforms, Uniforms},
};

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EngineConfig {
    pub size: [u32; 2],
    #[serde(default)]
    pub sampling: SamplingPolicy,
}

impl EngineConfig {
    pub fn new(size: [u32; 2]) -> Self {
        Self {
            size,
            sampling: SamplingPolicy::default(),
        }
    }
}

/// Handle of a registered variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariableId(usize);

/// Which half of every double buffer holds the current state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Slot {
    #[default]
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

struct Resources<C: ComputeContext> {
    targets: [C::Target; 2],
    program: C::Program,
    /// `bindings[s]` reads slot `s` of every dependency.
    bindings: [C::Bindings; 2],
}

struct Variable<C: ComputeContext> {
    name: String,
    source: C::Source,
    initial: C::Target,
    dependencies: Vec<String>,
    sampling: SamplingPolicy,
    uniforms: Uniforms,
    uniforms_dirty: bool,
    resources: Option<Resources<C>>,
}

impl<C: ComputeContext> Variable<C> {
    /// Dependencies in declaration order, duplicates removed.
    fn binding_table(&self) -> BindingTable {
        let mut table = BindingTable::new();
        for dependency in &self.dependencies {
            if !table.push(dependency.as_str()) {
                log::debug!(
                    "variable `{}`: dependency `{dependency}` declared twice, binding it once",
                    self.name
                );
            }
        }
        table
    }
}

pub struct VariableEngine<C: ComputeContext> {
    config: EngineConfig,
    variables: Vec<Variable<C>>,
    slot: Slot,
    initialized: bool,
}

impl<C: ComputeContext> VariableEngine<C> {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            variables: Vec::new(),
            slot: Slot::default(),
            initialized: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocate an initial-condition texture at the engine's size, filled from `data` or zeroed.
    pub fn create_texture<S: Storage>(
        &self,
        ctx: &mut C,
        data: Option<&Vec4Buffer<S>>,
    ) -> Result<C::Target, EngineError> {
        let [width, height] = self.config.size;
        let texels = width as usize * height as usize;
        if let Some(data) = data {
            if data.len() != texels {
                // checked before allocating
                return Err(ContextError::SizeMismatch {
                    expected: texels,
                    actual: data.len(),
                }
                .into());
            }
        }

        let target = ctx.create_target(&TargetDesc::single("initial", self.config.size))?;
        let texels: Vec<Vec4> = match data {
            Some(data) => data.iter().collect(),
            None => vec![Vec4::ZERO; texels],
        };
        if let Err(err) = ctx.write_target(&target, 0, &texels) {
            ctx.release_target(target);
            return Err(err.into());
        }
        Ok(target)
    }

    /// Add a variable. Nothing is allocated until [`Self::initialize`].
    pub fn register_variable(
        &mut self,
        name: impl Into<String>,
        source: C::Source,
        initial: C::Target,
    ) -> VariableId {
        let name = name.into();
        log::debug!("registering variable `{name}`");
        self.variables.push(Variable {
            name,
            source,
            initial,
            dependencies: Vec::new(),
            sampling: self.config.sampling,
            uniforms: Uniforms::new(),
            uniforms_dirty: false,
            resources: None,
        });
        VariableId(self.variables.len() - 1)
    }

    pub fn variable(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(VariableId)
    }

    pub fn name(&self, id: VariableId) -> Option<&str> {
        self.variables.get(id.0).map(|v| v.name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.variables.iter().map(|v| v.name.as_str())
    }

    fn get_mut(&mut self, id: VariableId) -> Result<&mut Variable<C>, EngineError> {
        self.variables
            .get_mut(id.0)
            .ok_or_else(|| EngineError::UnknownVariable(format!("{id:?}")))
    }

    fn get(&self, id: VariableId) -> Result<&Variable<C>, EngineError> {
        self.variables
            .get(id.0)
            .ok_or_else(|| EngineError::UnknownVariable(format!("{id:?}")))
    }

    /// Replace the variable's dependency list. Its program reads each dependency's previous frame under the
    /// dependency's name.
    pub fn declare_dependencies<S: Into<String>>(
        &mut self,
        id: VariableId,
        dependencies: impl IntoIterator<Item = S>,
    ) -> Result<(), EngineError> {
        if self.initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        self.get_mut(id)?.dependencies = dependencies.into_iter().map(Into::into).collect();
        Ok(())
    }

    pub fn set_sampling(&mut self, id: VariableId, sampling: SamplingPolicy) -> Result<(), EngineError> {
        if self.initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        self.get_mut(id)?.sampling = sampling;
        Ok(())
    }

    /// Set the variable's own uniforms. Before initialization new names are added; afterwards the uniform block is
    /// fixed and only existing names may change.
    pub fn update_uniforms<K, V>(
        &mut self,
        id: VariableId,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), EngineError>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let initialized = self.initialized;
        let variable = self.get_mut(id)?;
        if initialized {
            assign_uniforms(&mut variable.uniforms, values)?;
        } else {
            update_uniforms(&mut variable.uniforms, values);
        }
        variable.uniforms_dirty = true;
        Ok(())
    }

    pub fn uniforms(&self, id: VariableId) -> Result<&Uniforms, EngineError> {
        Ok(&self.get(id)?.uniforms)
    }

    fn validate(&self, ctx: &C) -> Result<(), InitError> {
        if self.initialized {
            return Err(InitError::AlreadyInitialized);
        }

        let capabilities = ctx.capabilities();
        if !capabilities.float_render_targets {
            return Err(CapabilityError::FloatRenderTargets.into());
        }
        if !capabilities.vertex_texture_sampling {
            return Err(CapabilityError::VertexTextures.into());
        }

        let mut names = HashSet::new();
        for variable in &self.variables {
            if RESERVED_NAMES.contains(&variable.name.as_str()) {
                return Err(InitError::ReservedName(variable.name.clone()));
            }
            if !names.insert(variable.name.as_str()) {
                return Err(InitError::DuplicateName(variable.name.clone()));
            }
        }

        for variable in &self.variables {
            if let Some(dependency) = variable
                .dependencies
                .iter()
                .find(|d| !names.contains(d.as_str()))
            {
                return Err(InitError::MissingDependency {
                    variable: variable.name.clone(),
                    dependency: dependency.clone(),
                });
            }
            if variable.sampling.filter == FilterMode::Linear && !capabilities.float32_filterable {
                return Err(CapabilityError::FloatFiltering.into());
            }
            if let Some(name) = variable
                .uniforms
                .keys()
                .find(|name| RESERVED_NAMES.contains(&name.as_str()))
            {
                return Err(InitError::ReservedName(name.clone()));
            }
        }
        Ok(())
    }

    /// Allocate both halves of every variable, seed them from the initial textures and build programs and bindings.
    ///
    /// Everything is validated first; on a validation error nothing has been allocated.
    pub fn initialize(&mut self, ctx: &mut C) -> Result<(), InitError> {
        profile_function!();
        self.validate(ctx)?;

        let built = self.build_variables(ctx)?;
        let bindings = match self.bind_variables(ctx, &built) {
            Ok(bindings) => bindings,
            Err(err) => {
                release_all(ctx, built);
                return Err(err);
            }
        };

        for ((variable, (targets, program)), bindings) in
            self.variables.iter_mut().zip(built).zip(bindings)
        {
            variable.uniforms_dirty = false;
            variable.resources = Some(Resources {
                targets,
                program,
                bindings,
            });
        }
        ctx.flush();
        self.slot = Slot::A;
        self.initialized = true;
        log::info!(
            "initialized {} variables at {:?}",
            self.variables.len(),
            self.config.size
        );
        Ok(())
    }

    fn build_variables(&self, ctx: &mut C) -> Result<Vec<Built<C>>, InitError> {
        let mut built = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            match self.build_variable(ctx, variable) {
                Ok(b) => built.push(b),
                Err(err) => {
                    release_all(ctx, built);
                    return Err(err);
                }
            }
            log::debug!("variable `{}` allocated", variable.name);
        }
        Ok(built)
    }

    fn build_variable(&self, ctx: &mut C, variable: &Variable<C>) -> Result<Built<C>, InitError> {
        let size = self.config.size;
        let a = ctx.create_target(&TargetDesc::single(format!("{}.a", variable.name), size))?;
        let b = match ctx.create_target(&TargetDesc::single(format!("{}.b", variable.name), size)) {
            Ok(b) => b,
            Err(err) => {
                ctx.release_target(a);
                return Err(err.into());
            }
        };
        let targets = [a, b];
        match self.build_program(ctx, variable, &targets) {
            Ok(program) => Ok((targets, program)),
            Err(err) => {
                for target in targets {
                    ctx.release_target(target);
                }
                Err(err)
            }
        }
    }

    fn build_program(
        &self,
        ctx: &mut C,
        variable: &Variable<C>,
        targets: &[C::Target; 2],
    ) -> Result<C::Program, InitError> {
        // both halves start out equal so the first tick reads valid data whichever slot is current
        for target in targets {
            ctx.copy(&variable.initial, target)?;
        }
        let uniforms = pack_uniforms(&variable.uniforms)?;
        let layout = ProgramLayout {
            label: variable.name.clone(),
            size: self.config.size,
            bindings: variable.binding_table(),
            attachments: 1,
            sampling: variable.sampling,
            uniform_size: uniforms.len(),
        };
        let mut program = ctx.create_program(&variable.source, &layout)?;
        if !uniforms.is_empty() {
            ctx.write_uniforms(&mut program, &uniforms)?;
        }
        Ok(program)
    }

    /// Two binding sets per variable: one reading slot A of every dependency, one reading slot B.
    fn bind_variables(
        &self,
        ctx: &mut C,
        built: &[Built<C>],
    ) -> Result<Vec<[C::Bindings; 2]>, InitError> {
        let index: HashMap<&str, usize> = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.as_str(), i))
            .collect();

        let mut all = Vec::with_capacity(built.len());
        for (variable, (_, program)) in self.variables.iter().zip(built) {
            let table = variable.binding_table();
            let inputs = |slot: Slot| {
                table
                    .entries()
                    .iter()
                    .map(|entry| match index.get(entry.name.as_str()) {
                        Some(&i) => Ok(Input::new(entry.name.as_str(), &built[i].0[slot.index()], 0)),
                        None => Err(InitError::MissingDependency {
                            variable: variable.name.clone(),
                            dependency: entry.name.clone(),
                        }),
                    })
                    .collect::<Result<Vec<_>, InitError>>()
            };
            let a = ctx.create_bindings(program, &inputs(Slot::A)?)?;
            let b = ctx.create_bindings(program, &inputs(Slot::B)?)?;
            all.push([a, b]);
        }
        Ok(all)
    }

    /// Advance every variable by one step, then flip the slot once.
    pub fn tick(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        profile_function!();
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        let current = self.slot;
        let next = current.other();
        for variable in &mut self.variables {
            let resources = variable
                .resources
                .as_mut()
                .ok_or(EngineError::NotInitialized)?;
            if variable.uniforms_dirty {
                let bytes = pack_uniforms(&variable.uniforms)?;
                ctx.write_uniforms(&mut resources.program, &bytes)?;
                variable.uniforms_dirty = false;
            }
            ctx.draw(
                &resources.program,
                &resources.bindings[current.index()],
                &resources.targets[next.index()],
            )?;
        }
        ctx.flush();
        self.slot = next;
        Ok(())
    }

    fn resources(&self, id: VariableId) -> Result<&Resources<C>, EngineError> {
        self.get(id)?
            .resources
            .as_ref()
            .ok_or(EngineError::NotInitialized)
    }

    /// The half written by the last tick. Re-query after every tick.
    pub fn current_output(&self, id: VariableId) -> Result<&C::Target, EngineError> {
        Ok(&self.resources(id)?.targets[self.slot.index()])
    }

    /// The half the last tick read from.
    pub fn previous_output(&self, id: VariableId) -> Result<&C::Target, EngineError> {
        Ok(&self.resources(id)?.targets[self.slot.other().index()])
    }

    pub fn initial_texture(&self, id: VariableId) -> Result<&C::Target, EngineError> {
        Ok(&self.get(id)?.initial)
    }

    /// Current outputs of all variables, by name.
    pub fn outputs(&self) -> Vec<(&str, &C::Target)> {
        self.variables
            .iter()
            .filter_map(|v| {
                let resources = v.resources.as_ref()?;
                Some((v.name.as_str(), &resources.targets[self.slot.index()]))
            })
            .collect()
    }

    /// Release every target the engine owns, initial textures included.
    pub fn dispose(self, ctx: &mut C) {
        ctx.flush();
        for variable in self.variables {
            if let Some(resources) = variable.resources {
                for target in resources.targets {
                    ctx.release_target(target);
                }
            }
            ctx.release_target(variable.initial);
        }
    }
}

type Built<C> = (
    [<C as ComputeContext>::Target; 2],
    <C as ComputeContext>::Program,
);

fn release_all<C: ComputeContext>(ctx: &mut C, built: Vec<Built<C>>) {
    for (targets, _) in built {
        for target in targets {
            ctx.release_target(target);
        }
    }
}
