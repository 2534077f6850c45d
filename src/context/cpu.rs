use std::{collections::HashMap, fmt, sync::Arc};

use glam::{IVec2, UVec2, Vec2, Vec4};

use super::{
    check_attachment, Capabilities, ComputeContext, FilterMode, Input, ProgramLayout,
    RenderTarget, SamplingPolicy, TargetDesc, TargetId,
};
use crate::error::ContextError;

/// A fragment program: called once per output texel, writes one value per attachment.
pub type Kernel = Arc<dyn Fn(&Fragment<'_>, &mut [Vec4]) + Send + Sync>;

pub fn kernel(f: impl Fn(&Fragment<'_>, &mut [Vec4]) + Send + Sync + 'static) -> Kernel {
    Arc::new(f)
}

struct InputView<'a> {
    name: &'a str,
    size: [u32; 2],
    texels: &'a [Vec4],
}

/// What a [`Kernel`] sees while shading one texel.
pub struct Fragment<'a> {
    coord: UVec2,
    size: [u32; 2],
    sampling: SamplingPolicy,
    inputs: &'a [InputView<'a>],
    uniforms: &'a [u8],
}

impl Fragment<'_> {
    /// Integer texel coordinate being shaded.
    pub fn coord(&self) -> UVec2 {
        self.coord
    }

    /// Linear index of the texel, row major.
    pub fn index(&self) -> usize {
        (self.coord.y * self.size[0] + self.coord.x) as usize
    }

    /// Normalized position of the texel center, the same as `position.xy / frame.resolution`.
    pub fn uv(&self) -> Vec2 {
        (self.coord.as_vec2() + 0.5) / self.resolution()
    }

    pub fn resolution(&self) -> Vec2 {
        Vec2::new(self.size[0] as f32, self.size[1] as f32)
    }

    fn input(&self, name: &str) -> Option<&InputView<'_>> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// The input's texel at this fragment's own coordinate. Unbound names read as zero.
    pub fn texel(&self, name: &str) -> Vec4 {
        self.load(name, self.coord.as_ivec2())
    }

    /// The input's texel at `coord`, wrapped according to the program's sampling policy.
    pub fn load(&self, name: &str, coord: IVec2) -> Vec4 {
        let Some(input) = self.input(name) else {
            return Vec4::ZERO;
        };
        let [width, height] = input.size;
        let x = self.sampling.wrap.apply(coord.x as i64, width);
        let y = self.sampling.wrap.apply(coord.y as i64, height);
        input.texels[(y * width + x) as usize]
    }

    /// Sample the input at normalized `uv`, filtered according to the program's sampling policy.
    pub fn sample(&self, name: &str, uv: Vec2) -> Vec4 {
        let Some(input) = self.input(name) else {
            return Vec4::ZERO;
        };
        let size = Vec2::new(input.size[0] as f32, input.size[1] as f32);
        match self.sampling.filter {
            FilterMode::Nearest => self.load(name, (uv * size).floor().as_ivec2()),
            FilterMode::Linear => {
                let p = uv * size - 0.5;
                let base = p.floor();
                let f = p - base;
                let base = base.as_ivec2();
                let a = self.load(name, base);
                let b = self.load(name, base + IVec2::X);
                let c = self.load(name, base + IVec2::Y);
                let d = self.load(name, base + IVec2::ONE);
                a.lerp(b, f.x).lerp(c.lerp(d, f.x), f.y)
            }
        }
    }

    pub fn uniform_bytes(&self) -> &[u8] {
        self.uniforms
    }

    /// Read the leading bytes of the uniform block as `T`.
    pub fn uniform<T: bytemuck::Pod>(&self) -> Option<T> {
        let bytes = self.uniforms.get(..std::mem::size_of::<T>())?;
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CpuTarget {
    id: TargetId,
    size: [u32; 2],
    attachments: usize,
}

impl RenderTarget for CpuTarget {
    fn id(&self) -> TargetId {
        self.id
    }

    fn size(&self) -> [u32; 2] {
        self.size
    }

    fn attachment_count(&self) -> usize {
        self.attachments
    }
}

pub struct CpuProgram {
    kernel: Kernel,
    layout: ProgramLayout,
    uniforms: Vec<u8>,
}

impl fmt::Debug for CpuProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuProgram")
            .field("layout", &self.layout)
            .field("uniforms", &self.uniforms.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct BoundInput {
    name: String,
    id: TargetId,
    size: [u32; 2],
    attachment: usize,
}

#[derive(Debug)]
pub struct CpuBindings {
    inputs: Vec<BoundInput>,
}

/// Runs programs on the calling thread. Every draw is complete when the call returns.
#[derive(Debug)]
pub struct CpuContext {
    capabilities: Capabilities,
    surfaces: HashMap<TargetId, Vec<Vec<Vec4>>>,
    next_id: u64,
    draws: u64,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::with_capabilities(Capabilities {
            float_render_targets: true,
            vertex_texture_sampling: true,
            float32_filterable: true,
            compute_shaders: true,
            max_color_attachments: 8,
            max_color_attachment_bytes_per_sample: 8 * super::TEXEL_BYTES,
        })
    }
}

impl CpuContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host that reports `capabilities`, e.g. to exercise capability checks.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            surfaces: HashMap::new(),
            next_id: 0,
            draws: 0,
        }
    }

    /// Targets allocated and not yet released.
    pub fn live_targets(&self) -> usize {
        self.surfaces.len()
    }

    /// Draws issued so far, copies included.
    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    fn surface(&self, id: TargetId) -> Result<&Vec<Vec<Vec4>>, ContextError> {
        self.surfaces.get(&id).ok_or(ContextError::UnknownTarget(id))
    }
}

impl ComputeContext for CpuContext {
    type Source = Kernel;
    type Target = CpuTarget;
    type Program = CpuProgram;
    type Bindings = CpuBindings;

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<CpuTarget, ContextError> {
        let id = TargetId(self.next_id);
        self.next_id += 1;
        let [width, height] = desc.size;
        let texels = width as usize * height as usize;
        self.surfaces
            .insert(id, vec![vec![Vec4::ZERO; texels]; desc.attachments.len()]);
        log::trace!("cpu target `{}` {:?} -> {id:?}", desc.label, desc.size);
        Ok(CpuTarget {
            id,
            size: desc.size,
            attachments: desc.attachments.len(),
        })
    }

    fn write_target(
        &mut self,
        target: &CpuTarget,
        attachment: usize,
        texels: &[Vec4],
    ) -> Result<(), ContextError> {
        check_attachment(target, attachment)?;
        if texels.len() != target.texel_count() {
            return Err(ContextError::SizeMismatch {
                expected: target.texel_count(),
                actual: texels.len(),
            });
        }
        let surface = self
            .surfaces
            .get_mut(&target.id)
            .ok_or(ContextError::UnknownTarget(target.id))?;
        surface[attachment].copy_from_slice(texels);
        Ok(())
    }

    fn read_target(
        &mut self,
        target: &CpuTarget,
        attachment: usize,
    ) -> Result<Vec<Vec4>, ContextError> {
        check_attachment(target, attachment)?;
        Ok(self.surface(target.id)?[attachment].clone())
    }

    fn release_target(&mut self, target: CpuTarget) {
        self.surfaces.remove(&target.id);
    }

    fn create_program(
        &mut self,
        source: &Kernel,
        layout: &ProgramLayout,
    ) -> Result<CpuProgram, ContextError> {
        Ok(CpuProgram {
            kernel: source.clone(),
            layout: layout.clone(),
            uniforms: vec![0; layout.uniform_size],
        })
    }

    fn write_uniforms(
        &mut self,
        program: &mut CpuProgram,
        bytes: &[u8],
    ) -> Result<(), ContextError> {
        if bytes.len() != program.layout.uniform_size {
            return Err(ContextError::UniformSize {
                program: program.layout.label.clone(),
                expected: program.layout.uniform_size,
                actual: bytes.len(),
            });
        }
        program.uniforms.copy_from_slice(bytes);
        Ok(())
    }

    fn create_bindings(
        &mut self,
        program: &CpuProgram,
        inputs: &[Input<'_, CpuTarget>],
    ) -> Result<CpuBindings, ContextError> {
        let inputs = inputs
            .iter()
            .map(|input| {
                if program.layout.bindings.binding_of(input.name).is_none() {
                    return Err(ContextError::UnboundInput {
                        program: program.layout.label.clone(),
                        name: input.name.to_owned(),
                    });
                }
                let target = input.attachment.target;
                check_attachment(target, input.attachment.index)?;
                Ok(BoundInput {
                    name: input.name.to_owned(),
                    id: target.id,
                    size: target.size,
                    attachment: input.attachment.index,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(CpuBindings { inputs })
    }

    fn draw(
        &mut self,
        program: &CpuProgram,
        bindings: &CpuBindings,
        output: &CpuTarget,
    ) -> Result<(), ContextError> {
        if bindings.inputs.iter().any(|input| input.id == output.id) {
            return Err(ContextError::AliasedTarget {
                program: program.layout.label.clone(),
            });
        }
        if output.attachments != program.layout.attachments {
            return Err(ContextError::AttachmentCount {
                program: program.layout.label.clone(),
                expected: program.layout.attachments,
                actual: output.attachments,
            });
        }

        let mut views = Vec::with_capacity(bindings.inputs.len());
        for input in &bindings.inputs {
            let surface = self.surface(input.id)?;
            views.push(InputView {
                name: input.name.as_str(),
                size: input.size,
                texels: &surface[input.attachment],
            });
        }

        let [width, height] = output.size;
        let attachments = output.attachments;
        let mut results = vec![Vec::with_capacity(output.texel_count()); attachments];
        let mut out = vec![Vec4::ZERO; attachments];
        for y in 0..height {
            for x in 0..width {
                out.fill(Vec4::ZERO);
                let fragment = Fragment {
                    coord: UVec2::new(x, y),
                    size: output.size,
                    sampling: program.layout.sampling,
                    inputs: &views,
                    uniforms: &program.uniforms,
                };
                (program.kernel)(&fragment, &mut out);
                for (result, value) in results.iter_mut().zip(&out) {
                    result.push(*value);
                }
            }
        }

        let surface = self
            .surfaces
            .get_mut(&output.id)
            .ok_or(ContextError::UnknownTarget(output.id))?;
        *surface = results;
        self.draws += 1;
        Ok(())
    }

    fn copy(&mut self, input: &CpuTarget, output: &CpuTarget) -> Result<(), ContextError> {
        if input.id == output.id {
            return Err(ContextError::AliasedTarget {
                program: "copy".into(),
            });
        }
        if input.texel_count() != output.texel_count() {
            return Err(ContextError::SizeMismatch {
                expected: output.texel_count(),
                actual: input.texel_count(),
            });
        }
        let texels = self.surface(input.id)?[0].clone();
        let surface = self
            .surfaces
            .get_mut(&output.id)
            .ok_or(ContextError::UnknownTarget(output.id))?;
        surface[0] = texels;
        self.draws += 1;
        Ok(())
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingTable;

    fn layout(label: &str, size: [u32; 2], inputs: &[&str]) -> ProgramLayout {
        let mut bindings = BindingTable::new();
        for input in inputs {
            bindings.push(*input);
        }
        ProgramLayout {
            label: label.into(),
            size,
            bindings,
            attachments: 1,
            sampling: SamplingPolicy::default(),
            uniform_size: 0,
        }
    }

    #[test]
    fn draw_reads_inputs_and_writes_output() {
        let mut ctx = CpuContext::new();
        let src = ctx.create_target(&TargetDesc::single("src", [2, 2])).unwrap();
        let dst = ctx.create_target(&TargetDesc::single("dst", [2, 2])).unwrap();
        let values: Vec<Vec4> = (0..4).map(|i| Vec4::splat(i as f32)).collect();
        ctx.write_target(&src, 0, &values).unwrap();

        let kernel = kernel(|frag, out| out[0] = frag.texel("src") * 2.0);
        let program = ctx
            .create_program(&kernel, &layout("double", [2, 2], &["src"]))
            .unwrap();
        let bindings = ctx
            .create_bindings(&program, &[Input::new("src", &src, 0)])
            .unwrap();
        ctx.draw(&program, &bindings, &dst).unwrap();

        let doubled = ctx.read_target(&dst, 0).unwrap();
        assert_eq!(doubled, values.iter().map(|v| *v * 2.0).collect::<Vec<_>>());
    }

    #[test]
    fn draw_refuses_to_write_an_input() {
        let mut ctx = CpuContext::new();
        let target = ctx.create_target(&TargetDesc::single("t", [1, 1])).unwrap();
        let kernel = kernel(|_, _| {});
        let program = ctx
            .create_program(&kernel, &layout("self", [1, 1], &["t"]))
            .unwrap();
        let bindings = ctx
            .create_bindings(&program, &[Input::new("t", &target, 0)])
            .unwrap();
        assert!(matches!(
            ctx.draw(&program, &bindings, &target),
            Err(ContextError::AliasedTarget { .. })
        ));
    }

    #[test]
    fn bindings_must_match_the_table() {
        let mut ctx = CpuContext::new();
        let target = ctx.create_target(&TargetDesc::single("t", [1, 1])).unwrap();
        let kernel = kernel(|_, _| {});
        let program = ctx
            .create_program(&kernel, &layout("p", [1, 1], &["a"]))
            .unwrap();
        assert!(matches!(
            ctx.create_bindings(&program, &[Input::new("b", &target, 0)]),
            Err(ContextError::UnboundInput { .. })
        ));
        assert!(matches!(
            ctx.create_bindings(&program, &[Input::new("a", &target, 1)]),
            Err(ContextError::AttachmentOutOfRange { .. })
        ));
    }

    #[test]
    fn sampling_follows_policy() {
        let mut ctx = CpuContext::new();
        let src = ctx.create_target(&TargetDesc::single("src", [2, 1])).unwrap();
        let dst = ctx.create_target(&TargetDesc::single("dst", [2, 1])).unwrap();
        ctx.write_target(&src, 0, &[Vec4::ZERO, Vec4::ONE]).unwrap();

        let kernel = kernel(|frag, out| {
            out[0] = frag.sample("src", Vec2::new(0.5, 0.5));
        });
        let mut linear = layout("linear", [2, 1], &["src"]);
        linear.sampling.filter = FilterMode::Linear;
        let program = ctx.create_program(&kernel, &linear).unwrap();
        let bindings = ctx
            .create_bindings(&program, &[Input::new("src", &src, 0)])
            .unwrap();
        ctx.draw(&program, &bindings, &dst).unwrap();
        assert_eq!(ctx.read_target(&dst, 0).unwrap()[0], Vec4::splat(0.5));

        let program = ctx
            .create_program(&kernel, &layout("nearest", [2, 1], &["src"]))
            .unwrap();
        let bindings = ctx
            .create_bindings(&program, &[Input::new("src", &src, 0)])
            .unwrap();
        ctx.draw(&program, &bindings, &dst).unwrap();
        assert_eq!(ctx.read_target(&dst, 0).unwrap()[0], Vec4::ONE);
    }

    #[test]
    fn inputs_keep_their_own_size() {
        let mut ctx = CpuContext::new();
        let params = ctx.create_target(&TargetDesc::single("params", [2, 2])).unwrap();
        let dst = ctx.create_target(&TargetDesc::single("dst", [4, 4])).unwrap();
        let values: Vec<Vec4> = (0..4).map(|i| Vec4::splat(i as f32)).collect();
        ctx.write_target(&params, 0, &values).unwrap();

        let kernel = kernel(|frag, out| out[0] = frag.sample("params", frag.uv()));
        let program = ctx
            .create_program(&kernel, &layout("upscale", [4, 4], &["params"]))
            .unwrap();
        let bindings = ctx
            .create_bindings(&program, &[Input::new("params", &params, 0)])
            .unwrap();
        ctx.draw(&program, &bindings, &dst).unwrap();

        let upscaled = ctx.read_target(&dst, 0).unwrap();
        assert_eq!(upscaled[0], Vec4::splat(0.));
        assert_eq!(upscaled[3], Vec4::splat(1.));
        // texel (0, 3) lies in the lower left quadrant
        assert_eq!(upscaled[12], Vec4::splat(2.));
        assert_eq!(upscaled[15], Vec4::splat(3.));
    }

    #[test]
    fn output_must_match_the_attachment_count() {
        let mut ctx = CpuContext::new();
        let desc = TargetDesc {
            label: "mrt".into(),
            size: [1, 1],
            attachments: vec!["a".into(), "b".into()],
        };
        let target = ctx.create_target(&desc).unwrap();
        let kernel = kernel(|_, _| {});
        let program = ctx.create_program(&kernel, &layout("single", [1, 1], &[])).unwrap();
        let bindings = ctx.create_bindings(&program, &[]).unwrap();
        assert!(matches!(
            ctx.draw(&program, &bindings, &target),
            Err(ContextError::AttachmentCount { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn uniforms_are_size_checked() {
        let mut ctx = CpuContext::new();
        let kernel = kernel(|_, _| {});
        let mut with_params = layout("p", [1, 1], &[]);
        with_params.uniform_size = 16;
        let mut program = ctx.create_program(&kernel, &with_params).unwrap();
        assert!(ctx.write_uniforms(&mut program, &[0; 8]).is_err());
        ctx.write_uniforms(&mut program, &[0; 16]).unwrap();
    }
}
