//! Runs on real hardware when an adapter is available, and passes vacuously otherwise.

use glam::{Vec3, Vec4};
use wgpu_gpgpu::{
    context::{BindingTable, ComputeContext, GpuContext, RenderTarget},
    layout::{
        adapter::{StorageAdapter, UniformAdapter},
        DynamicRecord, FieldValue, Packing, Record,
    },
    ContextError, CycleConfig, CycleProgram, EngineConfig, InitError, Vec4Buffer, VariableEngine,
};

const SIZE: [u32; 2] = [80, 3];

fn gpu() -> Option<GpuContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    match GpuContext::headless() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            log::warn!("skipping GPU test: {err}");
            None
        }
    }
}

fn program(inputs: &[&str], body: &str) -> String {
    let mut table = BindingTable::new();
    for input in inputs {
        table.push(*input);
    }
    format!("{}{body}", table.wgsl_declarations())
}

#[test]
fn missing_capabilities_are_errors_not_panics() {
    let _ = env_logger::builder().is_test(true).try_init();
    let result = std::panic::catch_unwind(GpuContext::headless);
    assert!(result.is_ok(), "creating a headless context panicked");
}

#[test]
fn gpu_timings_reach_puffin() {
    let Some(mut ctx) = gpu() else { return };
    let timers = wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
    let mut engine = VariableEngine::new(EngineConfig::new(SIZE));
    let initial = engine.create_texture::<Vec<f32>>(&mut ctx, None).unwrap();
    let id = engine.register_variable(
        "cells",
        program(
            &["cells"],
            "@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    return textureLoad(cells, vec2i(frag.xy), 0) + 1.;
}",
        ),
        initial,
    );
    engine.declare_dependencies(id, ["cells"]).unwrap();
    engine.initialize(&mut ctx).unwrap();
    for _ in 0..4 {
        engine.tick(&mut ctx).unwrap();
        // readback waits on the device, so earlier profiler frames finish
        ctx.read_target(engine.current_output(id).unwrap(), 0).unwrap();
    }
    if ctx.device().features().contains(timers) {
        assert!(ctx.profiled_frames() > 0);
    }
    engine.dispose(&mut ctx);
}

#[test]
fn variables_advance_from_one_snapshot() {
    let Some(mut ctx) = gpu() else { return };
    let mut engine = VariableEngine::new(EngineConfig::new(SIZE));
    let texels = (SIZE[0] * SIZE[1]) as usize;

    let initial = engine.create_texture::<Vec<f32>>(&mut ctx, None).unwrap();
    let a = engine.register_variable(
        "a",
        program(
            &["b"],
            "@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    return textureLoad(b, vec2i(frag.xy), 0) + 10.;
}",
        ),
        initial,
    );
    let initial = engine.create_texture::<Vec<f32>>(&mut ctx, None).unwrap();
    let b = engine.register_variable(
        "b",
        program(
            &["a"],
            "@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    return textureLoad(a, vec2i(frag.xy), 0) + 1.;
}",
        ),
        initial,
    );
    engine.declare_dependencies(a, ["b"]).unwrap();
    engine.declare_dependencies(b, ["a"]).unwrap();
    engine.initialize(&mut ctx).unwrap();

    engine.tick(&mut ctx).unwrap();
    let a_values = ctx.read_target(engine.current_output(a).unwrap(), 0).unwrap();
    let b_values = ctx.read_target(engine.current_output(b).unwrap(), 0).unwrap();
    assert_eq!(a_values.len(), texels);
    assert!(a_values.iter().all(|v| *v == Vec4::splat(10.)));
    assert!(b_values.iter().all(|v| *v == Vec4::splat(1.)));
    engine.dispose(&mut ctx);
}

#[test]
fn seeding_copies_the_initial_texture() {
    let Some(mut ctx) = gpu() else { return };
    let mut engine = VariableEngine::new(EngineConfig::new(SIZE));
    let data = Vec4Buffer::from_elements((0..SIZE[0] * SIZE[1]).map(|i| Vec4::splat(i as f32)));
    let initial = engine.create_texture(&mut ctx, Some(&data)).unwrap();
    let id = engine.register_variable(
        "cells",
        program(
            &["cells"],
            "@fragment
fn fs_main(@builtin(position) frag: vec4f) -> @location(0) vec4f {
    return textureLoad(cells, vec2i(frag.xy), 0);
}",
        ),
        initial,
    );
    engine.declare_dependencies(id, ["cells"]).unwrap();
    engine.initialize(&mut ctx).unwrap();

    let expected: Vec<Vec4> = data.iter().collect();
    let current = engine.current_output(id).unwrap();
    assert_eq!(current.size(), SIZE);
    assert_eq!(ctx.read_target(current, 0).unwrap(), expected);
    let previous = engine.previous_output(id).unwrap();
    assert_eq!(ctx.read_target(previous, 0).unwrap(), expected);
    engine.dispose(&mut ctx);
}

#[test]
fn cycle_writes_every_channel() {
    let Some(mut ctx) = gpu() else { return };
    let channels = "struct Channels {
    @location(0) position: vec4f,
    @location(1) velocity: vec4f,
}
";
    let init = program(
        &[],
        &format!(
            "{channels}
@fragment
fn fs_main(@builtin(position) frag: vec4f) -> Channels {{
    var out: Channels;
    out.position = vec4f(0.);
    out.velocity = vec4f(1.);
    return out;
}}"
        ),
    );
    let step = program(
        &["back_position", "back_velocity"],
        &format!(
            "{channels}
@fragment
fn fs_main(@builtin(position) frag: vec4f) -> Channels {{
    let coord = vec2i(frag.xy);
    var out: Channels;
    out.velocity = textureLoad(back_velocity, coord, 0);
    out.position = textureLoad(back_position, coord, 0) + out.velocity;
    return out;
}}"
        ),
    );
    let mut cycle = wgpu_gpgpu::RenderCycle::new(
        &mut ctx,
        CycleConfig::new(SIZE, ["position", "velocity"]),
        CycleProgram::new(init),
        CycleProgram::new(step),
        Vec::new(),
    )
    .unwrap();
    for _ in 0..3 {
        cycle.render(&mut ctx).unwrap();
    }
    let position = ctx.read_target(cycle.front(), 0).unwrap();
    assert!(position.iter().all(|v| *v == Vec4::splat(3.)));
    cycle.dispose(&mut ctx);
}

#[test]
fn invalid_programs_are_reported() {
    let Some(mut ctx) = gpu() else { return };
    let mut engine = VariableEngine::new(EngineConfig::new(SIZE));
    let initial = engine.create_texture::<Vec<f32>>(&mut ctx, None).unwrap();
    engine.register_variable("broken", "fn fs_main( {".to_owned(), initial);
    assert!(matches!(
        engine.initialize(&mut ctx),
        Err(InitError::Context(ContextError::Program { .. }))
    ));
}

#[test]
fn adapters_mirror_their_buffers() {
    let Some(ctx) = gpu() else { return };
    let proto: DynamicRecord = [
        ("pos".to_owned(), FieldValue::from(Vec3::ZERO)),
        ("mass".to_owned(), FieldValue::from(1.0f32)),
    ]
    .into_iter()
    .collect();

    let mut bodies = StorageAdapter::new(ctx.device(), proto.clone(), 4, Packing::Packed, "bodies").unwrap();
    assert_eq!(bodies.len(), 4);
    assert_eq!(bodies.layout().record_size(), 4);
    assert_eq!(bodies.buffer().size(), 4 * 4 * 4);
    let mut body = proto.clone();
    body.set_field("mass", 2.0f32.into());
    bodies.set(2, &body).unwrap();
    bodies.flush(ctx.queue());
    assert_eq!(bodies.get(2).unwrap()["mass"], FieldValue::Scalar(2.));
    assert_eq!(bodies.get(1).unwrap()["mass"], FieldValue::Scalar(1.));
    let attributes = bodies.vertex_attributes(3);
    assert_eq!(attributes[1].shader_location, 4);
    assert_eq!(attributes[1].offset, 12);

    let mut params = UniformAdapter::new(ctx.device(), proto, "params").unwrap();
    assert_eq!(params.buffer().size() % 16, 0);
    params
        .update_fields(
            ctx.queue(),
            [("mass", FieldValue::Scalar(5.)), ("missing", FieldValue::Scalar(1.))],
        )
        .unwrap();
    assert_eq!(params.get().unwrap()["mass"], FieldValue::Scalar(5.));
}

#[test]
fn empty_uniform_records_are_accepted() {
    let Some(ctx) = gpu() else { return };
    let mut params = UniformAdapter::new(ctx.device(), DynamicRecord::new(), "empty").unwrap();
    assert_eq!(params.buffer().size(), 16);
    params.update(ctx.queue(), &DynamicRecord::new()).unwrap();
    assert!(params.get().unwrap().is_empty());
}
