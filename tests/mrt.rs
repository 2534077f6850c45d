use glam::Vec4;
use wgpu_gpgpu::{
    as_uniforms,
    context::{kernel, Capabilities, ComputeContext, CpuContext, CpuTarget, RenderTarget, TargetDesc},
    layout::FieldValue,
    simulation, CapabilityError, CycleConfig, CycleProgram, EngineError, InitError, RenderCycle,
    Simulation,
};

const SIZE: [u32; 2] = [3, 2];

/// position starts at the texel index, velocity at `speed`; each step adds velocity to position.
fn counter(ctx: &mut CpuContext) -> RenderCycle<CpuContext> {
    RenderCycle::new(
        ctx,
        CycleConfig::new(SIZE, ["position", "velocity"]),
        CycleProgram::with_uniforms(
            kernel(|frag, out| {
                let speed = frag.uniform::<f32>().unwrap_or_default();
                out[0] = Vec4::splat(frag.index() as f32);
                out[1] = Vec4::splat(speed);
            }),
            as_uniforms([("speed", 1.0f32)]),
        ),
        CycleProgram::with_uniforms(
            kernel(|frag, out| {
                let scale = frag.uniform::<f32>().unwrap_or_default();
                let velocity = frag.texel("back_velocity");
                out[0] = frag.texel("back_position") + velocity * scale;
                out[1] = velocity;
            }),
            as_uniforms([("scale", 1.0f32)]),
        ),
        Vec::new(),
    )
    .unwrap()
}

fn read(ctx: &mut CpuContext, target: &CpuTarget, attachment: usize) -> Vec<Vec4> {
    ctx.read_target(target, attachment).unwrap()
}

#[test]
fn construction_seeds_both_halves() {
    let mut ctx = CpuContext::new();
    let cycle = counter(&mut ctx);
    assert_ne!(cycle.back().id(), cycle.front().id());
    for attachment in 0..2 {
        let back = read(&mut ctx, cycle.back(), attachment);
        let front = read(&mut ctx, cycle.front(), attachment);
        assert_eq!(back, front);
    }
    assert_eq!(read(&mut ctx, cycle.front(), 0)[4], Vec4::splat(4.));
    assert_eq!(read(&mut ctx, cycle.front(), 1)[4], Vec4::ONE);
}

#[test]
fn render_swaps_halves_and_steps_all_channels() {
    let mut ctx = CpuContext::new();
    let mut cycle = counter(&mut ctx);

    for step in 1..=5 {
        let back = cycle.back().id();
        let front = cycle.front().id();
        cycle.render(&mut ctx).unwrap();
        assert_eq!(cycle.back().id(), front);
        assert_eq!(cycle.front().id(), back);

        let position = read(&mut ctx, cycle.front(), 0);
        let velocity = read(&mut ctx, cycle.front(), 1);
        assert_eq!(position[2], Vec4::splat(2. + step as f32));
        assert!(velocity.iter().all(|v| *v == Vec4::ONE));
    }
}

#[test]
fn texture_uniforms_name_the_front_attachments() {
    let mut ctx = CpuContext::new();
    let mut cycle = counter(&mut ctx);
    cycle.render(&mut ctx).unwrap();

    let textures = cycle.texture_uniforms();
    let names: Vec<_> = textures.keys().copied().collect();
    assert_eq!(names, ["position", "velocity"]);
    assert_eq!(textures["velocity"].target.id(), cycle.front().id());
    assert_eq!(textures["velocity"].index, 1);
    assert_eq!(cycle.channels(), ["position", "velocity"]);
}

#[test]
fn uniform_updates_apply_to_their_program() {
    let mut ctx = CpuContext::new();
    let mut cycle = counter(&mut ctx);

    cycle.update_step_uniforms([("scale", 3.0f32)]).unwrap();
    cycle.render(&mut ctx).unwrap();
    assert_eq!(read(&mut ctx, cycle.front(), 0)[0], Vec4::splat(3.));

    cycle.update_init_uniforms([("speed", 2.0f32)]).unwrap();
    cycle.init(&mut ctx).unwrap();
    assert_eq!(read(&mut ctx, cycle.back(), 1)[0], Vec4::splat(2.));
    assert_eq!(read(&mut ctx, cycle.front(), 1)[0], Vec4::splat(2.));

    assert!(matches!(
        cycle.update_step_uniforms([("speed", 1.0f32)]),
        Err(EngineError::UnknownUniform(name)) if name == "speed"
    ));
}

#[test]
fn extra_inputs_reach_both_programs() {
    let mut ctx = CpuContext::new();
    let field = ctx.create_target(&TargetDesc::single("field", SIZE)).unwrap();
    ctx.write_target(&field, 0, &[Vec4::splat(0.25); 6]).unwrap();

    let mut cycle = RenderCycle::new(
        &mut ctx,
        CycleConfig::new(SIZE, ["value"]),
        CycleProgram::new(kernel(|frag, out| out[0] = frag.texel("field"))),
        CycleProgram::new(kernel(|frag, out| {
            out[0] = frag.texel("back_value") + frag.texel("field");
        })),
        vec![("field".to_owned(), field)],
    )
    .unwrap();
    assert_eq!(read(&mut ctx, cycle.front(), 0)[0], Vec4::splat(0.25));

    cycle.render(&mut ctx).unwrap();
    assert_eq!(read(&mut ctx, cycle.front(), 0)[0], Vec4::splat(0.5));

    cycle.dispose(&mut ctx);
    assert_eq!(ctx.live_targets(), 0);
}

#[test]
fn extra_inputs_may_have_their_own_size() {
    let mut ctx = CpuContext::new();
    let params = ctx.create_target(&TargetDesc::single("params_tex", [2, 2])).unwrap();
    ctx.write_target(&params, 0, &[Vec4::ZERO, Vec4::ZERO, Vec4::splat(10.), Vec4::ZERO])
        .unwrap();

    let cycle = RenderCycle::new(
        &mut ctx,
        CycleConfig::new([4, 4], ["value"]),
        CycleProgram::new(kernel(|frag, out| out[0] = frag.sample("params_tex", frag.uv()))),
        CycleProgram::new(kernel(|frag, out| out[0] = frag.texel("back_value"))),
        vec![("params_tex".to_owned(), params)],
    )
    .unwrap();
    let values = read(&mut ctx, cycle.front(), 0);
    // texel (0, 3) samples the lower left parameter texel
    assert_eq!(values[12], Vec4::splat(10.));
    assert_eq!(values[0], Vec4::ZERO);
    cycle.dispose(&mut ctx);
}

#[test]
fn hosts_without_float_targets_or_texture_reads_are_refused() {
    let capable = Capabilities {
        float_render_targets: true,
        vertex_texture_sampling: true,
        float32_filterable: false,
        compute_shaders: true,
        max_color_attachments: 8,
        max_color_attachment_bytes_per_sample: 128,
    };
    let build = |capabilities: Capabilities| {
        let mut ctx = CpuContext::with_capabilities(capabilities);
        let result = RenderCycle::new(
            &mut ctx,
            CycleConfig::new(SIZE, ["value"]),
            CycleProgram::new(kernel(|_, _| {})),
            CycleProgram::new(kernel(|_, _| {})),
            Vec::new(),
        );
        (result.err(), ctx.live_targets())
    };

    let (err, live) = build(Capabilities {
        float_render_targets: false,
        ..capable.clone()
    });
    assert!(matches!(
        err,
        Some(InitError::Capability(CapabilityError::FloatRenderTargets))
    ));
    assert_eq!(live, 0);

    let (err, live) = build(Capabilities {
        vertex_texture_sampling: false,
        compute_shaders: false,
        ..capable.clone()
    });
    assert!(matches!(
        err,
        Some(InitError::Capability(CapabilityError::VertexTextures))
    ));
    assert_eq!(live, 0);

    let (err, _) = build(capable);
    assert!(err.is_none());
}

#[test]
fn rejected_uniform_batches_leave_values_untouched() {
    let mut ctx = CpuContext::new();
    let mut cycle = counter(&mut ctx);
    assert!(cycle.update_step_uniforms([("scale", 3.0f32), ("speed", 1.0)]).is_err());
    cycle.render(&mut ctx).unwrap();
    assert_eq!(cycle.step_uniforms()["scale"].value, FieldValue::Scalar(1.));
    assert_eq!(read(&mut ctx, cycle.front(), 0)[0], Vec4::splat(1.));
}

#[test]
fn attachment_budget_is_checked() {
    let mut ctx = CpuContext::with_capabilities(Capabilities {
        float_render_targets: true,
        vertex_texture_sampling: true,
        float32_filterable: false,
        compute_shaders: true,
        max_color_attachments: 8,
        max_color_attachment_bytes_per_sample: 32,
    });
    let result = RenderCycle::new(
        &mut ctx,
        CycleConfig::new(SIZE, ["position", "velocity", "color"]),
        CycleProgram::new(kernel(|_, _| {})),
        CycleProgram::new(kernel(|_, _| {})),
        Vec::new(),
    );
    assert!(matches!(
        result,
        Err(InitError::Capability(CapabilityError::TooManyAttachments { requested: 3, max: 2 }))
    ));
    assert_eq!(ctx.live_targets(), 0);
}

#[test]
fn channel_names_are_checked() {
    let mut ctx = CpuContext::new();
    let build = |ctx: &mut CpuContext, channels: &[&str]| {
        RenderCycle::new(
            ctx,
            CycleConfig::new(SIZE, channels.iter().copied()),
            CycleProgram::new(kernel(|_, _| {})),
            CycleProgram::new(kernel(|_, _| {})),
            Vec::new(),
        )
    };
    assert!(matches!(build(&mut ctx, &[]), Err(InitError::NoChannels)));
    assert!(matches!(
        build(&mut ctx, &["color", "color"]),
        Err(InitError::DuplicateName(name)) if name == "color"
    ));
    assert!(matches!(
        build(&mut ctx, &["frame"]),
        Err(InitError::ReservedName(name)) if name == "frame"
    ));
    assert_eq!(ctx.live_targets(), 0);
}

#[test]
fn both_engines_step_through_the_common_trait() {
    let mut ctx = CpuContext::new();
    let mut cycle = counter(&mut ctx);
    simulation::run(&mut cycle, &mut ctx, 3).unwrap();

    let outputs = Simulation::outputs(&cycle);
    assert_eq!(outputs.len(), 2);
    let (name, position) = outputs[0];
    assert_eq!(name, "position");
    let values = ctx.read_target(position.target, position.index).unwrap();
    assert_eq!(values[0], Vec4::splat(3.));
}
