#![warn(clippy::all, rust_2018_idioms)]

//! Headless demo: a Thomas attractor advanced by both engines, on the GPU if one is available.

use std::error::Error;

use glam::{Vec3, Vec4};
use nanorand::WyRand;
use wgpu_gpgpu::{
    as_uniforms, complexify_path,
    context::{
        kernel, BindingTable, ComputeContext, CpuContext, Fragment, GpuContext, Kernel, RenderTarget,
        TargetDesc,
    },
    uniforms::uniform_layout,
    CycleConfig, CycleProgram, EngineConfig, RenderCycle, Simulation, Uniforms, Vec3Buffer,
    Vec4Buffer, VariableEngine,
};

const SIZE: [u32; 2] = [64, 64];
const STEPS: usize = 256;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ThomasParams {
    dt: f32,
    b: f32,
}

fn thomas_uniforms() -> Uniforms {
    as_uniforms([("dt", 0.05f32), ("b", 0.19)])
}

fn thomas(p: Vec4, b: f32) -> Vec4 {
    Vec4::new(
        p.y.sin() - b * p.x,
        p.z.sin() - b * p.y,
        p.x.sin() - b * p.z,
        0.,
    )
}

/// Sources for the variable engine (`position`, `velocity`) and the render cycle (`init`, `step`).
struct Programs<S> {
    position: S,
    velocity: S,
    init: S,
    step: S,
}

fn cpu_programs() -> Programs<Kernel> {
    fn params(frag: &Fragment<'_>) -> ThomasParams {
        frag.uniform().unwrap_or(ThomasParams { dt: 0., b: 0. })
    }
    Programs {
        position: kernel(|frag, out| {
            let p = frag.texel("position") + frag.texel("velocity") * params(frag).dt;
            out[0] = p.truncate().extend(1.);
        }),
        velocity: kernel(|frag, out| {
            out[0] = thomas(frag.texel("position"), params(frag).b);
        }),
        init: kernel(|frag, out| {
            out[0] = frag.texel("seed");
            out[1] = Vec4::ZERO;
        }),
        step: kernel(|frag, out| {
            let ThomasParams { dt, b } = params(frag);
            let p = frag.texel("back_position");
            let v = thomas(p, b);
            out[0] = (p + v * dt).truncate().extend(1.);
            out[1] = v;
        }),
    }
}

const WGSL_THOMAS: &str = "
@group(1) @binding(0) var<uniform> params: Params;

fn thomas(p: vec3f) -> vec3f {
    return vec3f(sin(p.y), sin(p.z), sin(p.x)) - params.b * p;
}
";

fn gpu_programs() -> Result<Programs<String>, Box<dyn Error>> {
    let params = uniform_layout(&thomas_uniforms())?.wgsl_struct("Params");
    let header = |inputs: &[&str]| {
        let mut table = BindingTable::new();
        for input in inputs {
            table.push(*input);
        }
        format!("{}{params}{WGSL_THOMAS}", table.wgsl_declarations())
    };
    Ok(Programs {
        position: header(&["position", "velocity"])
            + "
@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    let coord = vec2i(frag.xy);
    let p = textureLoad(position, coord, 0);
    let v = textureLoad(velocity, coord, 0);
    return vec4f(p.xyz + v.xyz * params.dt, 1.);
}
",
        velocity: header(&["position"])
            + "
@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    let p = textureLoad(position, vec2i(frag.xy), 0);
    return vec4f(thomas(p.xyz), 0.);
}
",
        init: header(&["seed"])
            + "
struct Channels {
    @location(0) position: vec4f,
    @location(1) velocity: vec4f,
}

@fragment
fn fs_main(@builtin(position) frag: vec4f) -> Channels {
    var out: Channels;
    out.position = textureLoad(seed, vec2i(frag.xy), 0);
    out.velocity = vec4f(0.);
    return out;
}
",
        step: header(&["back_position", "back_velocity", "seed"])
            + "
struct Channels {
    @location(0) position: vec4f,
    @location(1) velocity: vec4f,
}

@fragment
fn fs_main(@builtin(position) frag: vec4f) -> Channels {
    let p = textureLoad(back_position, vec2i(frag.xy), 0).xyz;
    let v = thomas(p);
    var out: Channels;
    out.position = vec4f(p + v * params.dt, 1.);
    out.velocity = vec4f(v, 0.);
    return out;
}
",
    })
}

/// Starting positions: a jittered line through the attractor's basin.
fn seed_positions(rng: &mut WyRand) -> Result<Vec4Buffer, Box<dyn Error>> {
    let count = (SIZE[0] * SIZE[1]) as usize;
    let mut path = Vec3Buffer::empty(count);
    path.set(0, Vec3::new(-1.5, 0.5, 0.2))?;
    path.set(count - 1, Vec3::new(1.5, -0.5, -0.2))?;
    complexify_path(&mut path, 0, count - 1, 0.3, rng)?;
    Ok(Vec4Buffer::from_elements(path.iter().map(|p| p.extend(1.))))
}

fn summarize<C: ComputeContext>(
    label: &str,
    ctx: &mut C,
    simulation: &dyn Simulation<C>,
) -> Result<(), Box<dyn Error>> {
    for (name, attachment) in simulation.outputs() {
        let texels = ctx.read_target(attachment.target, attachment.index)?;
        let mean = texels.iter().copied().sum::<Vec4>() / texels.len().max(1) as f32;
        let extent = texels
            .iter()
            .map(|t| t.truncate().length())
            .fold(0f32, f32::max);
        log::info!(
            "{label}: `{name}` {:?} mean {mean:.3}, max |xyz| {extent:.3}",
            attachment.target.size()
        );
    }
    Ok(())
}

fn simulate<C: ComputeContext>(
    ctx: &mut C,
    programs: Programs<C::Source>,
) -> Result<(), Box<dyn Error>> {
    let mut rng = WyRand::new_seed(42);
    let seed = seed_positions(&mut rng)?;

    let mut engine = VariableEngine::new(EngineConfig::new(SIZE));
    let initial = engine.create_texture(ctx, Some(&seed))?;
    let position = engine.register_variable("position", programs.position, initial);
    let initial = engine.create_texture::<Vec<f32>>(ctx, None)?;
    let velocity = engine.register_variable("velocity", programs.velocity, initial);
    engine.declare_dependencies(position, ["position", "velocity"])?;
    engine.declare_dependencies(velocity, ["position"])?;
    for id in [position, velocity] {
        engine.update_uniforms(id, thomas_uniforms())?;
    }
    engine.initialize(ctx)?;
    for _ in 0..STEPS {
        engine.tick(ctx)?;
    }
    puffin::GlobalProfiler::lock().new_frame();
    summarize("variables", ctx, &engine)?;
    engine.dispose(ctx);

    let seed_target = ctx.create_target(&TargetDesc::single("seed", SIZE))?;
    ctx.write_target(&seed_target, 0, &seed.iter().collect::<Vec<_>>())?;
    let mut cycle = RenderCycle::new(
        ctx,
        CycleConfig::new(SIZE, ["position", "velocity"]),
        CycleProgram::new(programs.init),
        CycleProgram::with_uniforms(programs.step, thomas_uniforms()),
        vec![("seed".to_owned(), seed_target)],
    )?;
    wgpu_gpgpu::simulation::run(&mut cycle, ctx, STEPS)?;
    puffin::GlobalProfiler::lock().new_frame();
    summarize("cycle", ctx, &cycle)?;
    cycle.dispose(ctx);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).

    // Set `PUFFIN=1` to record CPU scopes and serve them to `puffin_viewer`.
    let _server = if std::env::var_os("PUFFIN").is_some() {
        puffin::set_scopes_on(true);
        let addr = format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT);
        log::info!("serving profile data on {addr}");
        Some(puffin_http::Server::new(&addr)?)
    } else {
        None
    };

    match GpuContext::headless() {
        Ok(mut ctx) => simulate(&mut ctx, gpu_programs()?),
        Err(err) => {
            log::warn!("no GPU ({err}), running on the CPU");
            simulate(&mut CpuContext::new(), cpu_programs())
        }
    }
}
