use std::{borrow::Cow, sync::Arc};

use glam::Vec4;
use puffin::profile_function;
use wgpu::util::DeviceExt;
use wgpu_profiler::{GpuProfiler, GpuProfilerSettings};

use super::{
    check_attachment, BindingTable, Capabilities, ComputeContext, FilterMode, Input, ProgramLayout,
    RenderTarget, SamplingPolicy, TargetDesc, TargetId, TEXEL_BYTES,
};
use crate::{
    error::{CapabilityError, ContextError},
    shaders::fullscreen::{self, copy_source, frame, input_sampler, inputs, params},
};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// A set of RGBA32F textures of the same size, one per attachment.
#[derive(Debug)]
pub struct GpuTarget {
    id: TargetId,
    size: [u32; 2],
    textures: Vec<wgpu::Texture>,
    views: Vec<wgpu::TextureView>,
}

impl GpuTarget {
    pub fn texture(&self, attachment: usize) -> Option<&wgpu::Texture> {
        self.textures.get(attachment)
    }

    pub fn view(&self, attachment: usize) -> Option<&wgpu::TextureView> {
        self.views.get(attachment)
    }
}

impl RenderTarget for GpuTarget {
    fn id(&self) -> TargetId {
        self.id
    }

    fn size(&self) -> [u32; 2] {
        self.size
    }

    fn attachment_count(&self) -> usize {
        self.textures.len()
    }
}

struct Params {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

pub struct GpuProgram {
    layout: ProgramLayout,
    pipeline: wgpu::RenderPipeline,
    input_layout: wgpu::BindGroupLayout,
    frame_buf: wgpu::Buffer,
    sampler: wgpu::Sampler,
    params: Option<Params>,
}

impl GpuProgram {
    pub fn layout(&self) -> &ProgramLayout {
        &self.layout
    }
}

pub struct GpuBindings {
    bind_group: wgpu::BindGroup,
    inputs: Vec<TargetId>,
}

/// Runs programs through `wgpu`. Draws are recorded into one encoder and submitted on [`ComputeContext::flush`].
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: Capabilities,
    fullscreen: wgpu::ShaderModule,
    copy: Arc<GpuProgram>,
    pending: Option<wgpu::CommandEncoder>,
    profiler: GpuProfiler,
    profiled_frames: u64,
    next_id: u64,
}

/// GPU scope timings, one puffin frame per flush.
pub static PUFFIN_GPU_PROFILER: std::sync::LazyLock<std::sync::Mutex<puffin::GlobalProfiler>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(puffin::GlobalProfiler::default()));

/// What every program needs from the host before anything is built.
fn require_render_targets(capabilities: &Capabilities) -> Result<(), CapabilityError> {
    if !capabilities.float_render_targets {
        return Err(CapabilityError::FloatRenderTargets);
    }
    Ok(())
}

impl GpuContext {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        adapter: &wgpu::Adapter,
    ) -> Result<Self, ContextError> {
        // without this feature the device is limited to the guaranteed format features
        let format_features = if device
            .features()
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        {
            adapter.get_texture_format_features(TARGET_FORMAT)
        } else {
            TARGET_FORMAT.guaranteed_format_features(device.features())
        };
        let limits = device.limits();
        let capabilities = Capabilities {
            float_render_targets: format_features
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT),
            // every WGSL stage can read textures
            vertex_texture_sampling: true,
            float32_filterable: device
                .features()
                .contains(wgpu::Features::FLOAT32_FILTERABLE),
            compute_shaders: adapter
                .get_downlevel_capabilities()
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            max_color_attachments: limits.max_color_attachments,
            max_color_attachment_bytes_per_sample: limits.max_color_attachment_bytes_per_sample,
        };
        log::debug!("gpu capabilities: {capabilities:?}");
        require_render_targets(&capabilities)?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fullscreen = fullscreen::create_shader_module(&device);
        let mut copy_bindings = BindingTable::new();
        copy_bindings.push(copy_source::NAME);
        let copy = build_program(
            &device,
            &capabilities,
            &fullscreen,
            &fullscreen,
            fullscreen::ENTRY_FS_COPY,
            &ProgramLayout {
                label: "copy".into(),
                size: [1, 1],
                bindings: copy_bindings,
                attachments: 1,
                sampling: SamplingPolicy::default(),
                uniform_size: 0,
            },
        );
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ContextError::Program {
                label: "copy".into(),
                message: error.to_string(),
            });
        }
        let profiler = GpuProfiler::new(GpuProfilerSettings::default())
            .map_err(|err| ContextError::Program {
                label: "profiler".into(),
                message: format!("{err:?}"),
            })?;

        Ok(Self {
            device,
            queue,
            capabilities,
            fullscreen,
            copy: Arc::new(copy),
            pending: None,
            profiler,
            profiled_frames: 0,
            next_id: 0,
        })
    }

    /// Request a default adapter and device with no surface attached.
    pub fn headless() -> Result<Self, ContextError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(ContextError::AdapterUnavailable)?;
        log::info!("using adapter {:?}", adapter.get_info());

        let wanted = wgpu::Features::FLOAT32_FILTERABLE
            | wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES
            | GpuProfiler::ALL_WGPU_TIMER_FEATURES;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("wgpu_gpgpu"),
                required_features: adapter.features() & wanted,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))?;
        Self::new(device, queue, &adapter)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Profiler frames forwarded to [`PUFFIN_GPU_PROFILER`] so far.
    pub fn profiled_frames(&self) -> u64 {
        self.profiled_frames
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.pending.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("wgpu_gpgpu"),
                })
        })
    }

    fn bind_inputs(
        &self,
        program: &GpuProgram,
        inputs: &[Input<'_, GpuTarget>],
    ) -> Result<GpuBindings, ContextError> {
        let table = &program.layout.bindings;
        if let Some(input) = inputs
            .iter()
            .find(|input| table.binding_of(input.name).is_none())
        {
            return Err(ContextError::UnboundInput {
                program: program.layout.label.clone(),
                name: input.name.to_owned(),
            });
        }

        let mut entries = vec![
            frame::bind_group_entry(program.frame_buf.as_entire_buffer_binding()),
            input_sampler::bind_group_entry(&program.sampler),
        ];
        let mut ids = Vec::with_capacity(table.len());
        for entry in table.entries() {
            // every slot of the layout must be filled
            let Some(input) = inputs.iter().find(|input| input.name == entry.name) else {
                return Err(ContextError::UnboundInput {
                    program: program.layout.label.clone(),
                    name: entry.name.clone(),
                });
            };
            let target = input.attachment.target;
            check_attachment(target, input.attachment.index)?;
            entries.push(inputs::bind_group_entry(
                entry.binding,
                &target.views[input.attachment.index],
            ));
            ids.push(target.id);
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.layout.label),
            layout: &program.input_layout,
            entries: &entries,
        });
        Ok(GpuBindings {
            bind_group,
            inputs: ids,
        })
    }
}

fn build_program(
    device: &wgpu::Device,
    capabilities: &Capabilities,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    entry_point: &str,
    layout: &ProgramLayout,
) -> GpuProgram {
    let label = layout.label.as_str();
    let filtering =
        layout.sampling.filter == FilterMode::Linear && capabilities.float32_filterable;
    if layout.sampling.filter == FilterMode::Linear && !filtering {
        log::warn!("program `{label}`: float32 textures are not filterable here, sampling nearest");
    }

    let mut entries = vec![
        frame::LAYOUT,
        wgpu::BindGroupLayoutEntry {
            ty: wgpu::BindingType::Sampler(if filtering {
                wgpu::SamplerBindingType::Filtering
            } else {
                wgpu::SamplerBindingType::NonFiltering
            }),
            ..input_sampler::LAYOUT
        },
    ];
    entries.extend(
        layout
            .bindings
            .entries()
            .iter()
            .map(|entry| inputs::layout(entry.binding, filtering)),
    );
    let input_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });

    let params_layout = (layout.uniform_size > 0).then(|| {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("params"),
            entries: &[params::LAYOUT],
        })
    });
    let params = params_layout.as_ref().map(|params_layout| {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: layout.uniform_size as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("params"),
            layout: params_layout,
            entries: &[params::bind_group_entry(buffer.as_entire_buffer_binding())],
        });
        Params { buffer, bind_group }
    });

    let mut bind_group_layouts = vec![&input_layout];
    bind_group_layouts.extend(params_layout.as_ref());
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &bind_group_layouts,
        push_constant_ranges: &[],
    });

    let targets = vec![
        Some(wgpu::ColorTargetState {
            format: TARGET_FORMAT,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        });
        layout.attachments
    ];
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: fullscreen::vertex_state(vertex),
        fragment: Some(fullscreen::fragment_state(fragment, entry_point, &targets)),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });

    let frame_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("Frame"),
        contents: bytemuck::bytes_of(&fullscreen::Frame::new(layout.size)),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let filter = if filtering {
        wgpu::FilterMode::Linear
    } else {
        wgpu::FilterMode::Nearest
    };
    let address_mode = layout.sampling.wrap.address_mode();
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mag_filter: filter,
        min_filter: filter,
        ..Default::default()
    });

    GpuProgram {
        layout: layout.clone(),
        pipeline,
        input_layout,
        frame_buf,
        sampler,
        params,
    }
}

impl ComputeContext for GpuContext {
    /// WGSL with a `fs_main` fragment entry point.
    type Source = String;
    type Target = GpuTarget;
    type Program = GpuProgram;
    type Bindings = GpuBindings;

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<GpuTarget, ContextError> {
        let [width, height] = desc.size;
        let (textures, views) = desc
            .attachments
            .iter()
            .map(|name| {
                let label = format!("{}.{name}", desc.label);
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&label),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: TARGET_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[TARGET_FORMAT],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&label),
                    ..Default::default()
                });
                (texture, view)
            })
            .unzip();

        let id = TargetId(self.next_id);
        self.next_id += 1;
        log::debug!("gpu target `{}` {:?} -> {id:?}", desc.label, desc.size);
        Ok(GpuTarget {
            id,
            size: desc.size,
            textures,
            views,
        })
    }

    fn write_target(
        &mut self,
        target: &GpuTarget,
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
        // queue writes land before the next submission, so recorded draws go first
        self.flush();
        let [width, height] = target.size;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.textures[attachment],
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * TEXEL_BYTES),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_target(
        &mut self,
        target: &GpuTarget,
        attachment: usize,
    ) -> Result<Vec<Vec4>, ContextError> {
        profile_function!();
        check_attachment(target, attachment)?;
        let [width, height] = target.size;
        let unpadded_row = width * TEXEL_BYTES;
        let padded_row = unpadded_row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded_row as wgpu::BufferAddress * height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.encoder().copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.textures[attachment],
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.flush();

        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|err| ContextError::Readback(err.to_string()))?
            .map_err(|err| ContextError::Readback(err.to_string()))?;

        let texels = {
            let mapped = slice.get_mapped_range();
            mapped
                .chunks_exact(padded_row as usize)
                .flat_map(|row| row[..unpadded_row as usize].chunks_exact(TEXEL_BYTES as usize))
                .map(|texel| Vec4::from_array(bytemuck::pod_read_unaligned::<[f32; 4]>(texel)))
                .collect()
        };
        buffer.unmap();
        Ok(texels)
    }

    fn release_target(&mut self, target: GpuTarget) {
        self.flush();
        log::debug!("releasing gpu target {:?}", target.id);
        for texture in &target.textures {
            texture.destroy();
        }
    }

    fn create_program(
        &mut self,
        source: &String,
        layout: &ProgramLayout,
    ) -> Result<GpuProgram, ContextError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&layout.label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });
        let program = build_program(
            &self.device,
            &self.capabilities,
            &self.fullscreen,
            &module,
            fullscreen::ENTRY_FS_MAIN,
            layout,
        );
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ContextError::Program {
                label: layout.label.clone(),
                message: error.to_string(),
            });
        }
        log::debug!(
            "program `{}`: {} inputs, {} attachments",
            layout.label,
            layout.bindings.len(),
            layout.attachments
        );
        Ok(program)
    }

    fn write_uniforms(
        &mut self,
        program: &mut GpuProgram,
        bytes: &[u8],
    ) -> Result<(), ContextError> {
        if bytes.len() != program.layout.uniform_size {
            return Err(ContextError::UniformSize {
                program: program.layout.label.clone(),
                expected: program.layout.uniform_size,
                actual: bytes.len(),
            });
        }
        let Some(params) = &program.params else {
            return Ok(());
        };
        self.flush();
        self.queue.write_buffer(&params.buffer, 0, bytes);
        Ok(())
    }

    fn create_bindings(
        &mut self,
        program: &GpuProgram,
        inputs: &[Input<'_, GpuTarget>],
    ) -> Result<GpuBindings, ContextError> {
        self.bind_inputs(program, inputs)
    }

    fn draw(
        &mut self,
        program: &GpuProgram,
        bindings: &GpuBindings,
        output: &GpuTarget,
    ) -> Result<(), ContextError> {
        profile_function!();
        if bindings.inputs.contains(&output.id) {
            return Err(ContextError::AliasedTarget {
                program: program.layout.label.clone(),
            });
        }
        if output.attachment_count() != program.layout.attachments {
            return Err(ContextError::AttachmentCount {
                program: program.layout.label.clone(),
                expected: program.layout.attachments,
                actual: output.attachment_count(),
            });
        }

        let encoder = self.pending.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("wgpu_gpgpu"),
                })
        });
        let mut scope = self
            .profiler
            .scope(program.layout.label.as_str(), encoder, &self.device);
        let color_attachments: Vec<_> = output
            .views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        {
            let mut rpass = scope.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&program.layout.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(&program.pipeline);
            rpass.set_bind_group(inputs::GROUP, &bindings.bind_group, &[]);
            if let Some(params) = &program.params {
                rpass.set_bind_group(params::GROUP, &params.bind_group, &[]);
            }
            rpass.draw(0..4, 0..1);
        }
        Ok(())
    }

    fn copy(&mut self, input: &GpuTarget, output: &GpuTarget) -> Result<(), ContextError> {
        if input.size != output.size {
            return Err(ContextError::SizeMismatch {
                expected: output.texel_count(),
                actual: input.texel_count(),
            });
        }
        let copy = Arc::clone(&self.copy);
        let bindings = self.bind_inputs(&copy, &[Input::new(copy_source::NAME, input, 0)])?;
        self.draw(&copy, &bindings, output)
    }

    fn flush(&mut self) {
        profile_function!();
        let Some(mut encoder) = self.pending.take() else {
            return;
        };
        self.profiler.resolve_queries(&mut encoder);
        self.queue.submit(Some(encoder.finish()));
        if let Err(err) = self.profiler.end_frame() {
            log::warn!("gpu profiler: {err:?}");
        }
        if let Some(results) = self
            .profiler
            .process_finished_frame(self.queue.get_timestamp_period())
        {
            for result in &results {
                log::trace!("gpu scope `{}`: {:?}", result.label, result.time);
            }
            match PUFFIN_GPU_PROFILER.lock() {
                Ok(mut puffin_profiler) => {
                    wgpu_profiler::puffin::output_frame_to_puffin(&mut puffin_profiler, &results);
                    puffin_profiler.new_frame();
                    self.profiled_frames += 1;
                }
                Err(err) => log::warn!("gpu profiler: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_without_float_targets_are_refused() {
        let mut capabilities = Capabilities {
            float_render_targets: true,
            vertex_texture_sampling: true,
            float32_filterable: false,
            compute_shaders: true,
            max_color_attachments: 8,
            max_color_attachment_bytes_per_sample: 32,
        };
        assert!(require_render_targets(&capabilities).is_ok());
        capabilities.float_render_targets = false;
        assert_eq!(
            require_render_targets(&capabilities),
            Err(CapabilityError::FloatRenderTargets)
        );
        let err = ContextError::from(CapabilityError::FloatRenderTargets);
        assert!(matches!(err, ContextError::Capability(CapabilityError::FloatRenderTargets)));
    }
}
