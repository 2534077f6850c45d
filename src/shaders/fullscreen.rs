#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck :: Pod, bytemuck :: Zeroable)]
pub struct Frame {
    pub resolution: [f32; 2],
    pub _pad: [f32; 2],
}
const _: () = assert!(
    std::mem::size_of::<Frame>() == 16,
    "size of Frame does not match WGSL"
);
const _: () = assert!(
    std::mem::offset_of!(Frame, resolution) == 0,
    "offset of Frame.resolution does not match WGSL"
);
impl Frame {
    pub fn new(size: [u32; 2]) -> Self {
        Self {
            resolution: size.map(|x| x as f32),
            _pad: [0.0; 2],
        }
    }
}
pub mod frame {
    pub const GROUP: u32 = 0u32;
    pub const BINDING: u32 = 0u32;
    pub const LAYOUT: wgpu::BindGroupLayoutEntry = wgpu::BindGroupLayoutEntry {
        binding: BINDING,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    pub type Resource<'a> = wgpu::BufferBinding<'a>;
    pub fn bind_group_entry(resource: Resource) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding: BINDING,
            resource: wgpu::BindingResource::Buffer(resource),
        }
    }
}
pub mod input_sampler {
    pub const GROUP: u32 = 0u32;
    pub const BINDING: u32 = 1u32;
    pub const LAYOUT: wgpu::BindGroupLayoutEntry = wgpu::BindGroupLayoutEntry {
        binding: BINDING,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
        count: None,
    };
    pub type Resource<'a> = &'a wgpu::Sampler;
    pub fn bind_group_entry(resource: Resource) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding: BINDING,
            resource: wgpu::BindingResource::Sampler(resource),
        }
    }
}
/// The input textures of a program, one per binding from `FIRST_BINDING` on.
pub mod inputs {
    pub const GROUP: u32 = 0u32;
    pub const FIRST_BINDING: u32 = 2u32;
    pub fn layout(binding: u32, filterable: bool) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }
    }
    pub type Resource<'a> = &'a wgpu::TextureView;
    pub fn bind_group_entry(binding: u32, resource: Resource) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::TextureView(resource),
        }
    }
}
pub mod copy_source {
    pub const GROUP: u32 = 0u32;
    pub const BINDING: u32 = 2u32;
    pub const NAME: &str = "copy_source";
}
pub mod params {
    pub const GROUP: u32 = 1u32;
    pub const BINDING: u32 = 0u32;
    pub const LAYOUT: wgpu::BindGroupLayoutEntry = wgpu::BindGroupLayoutEntry {
        binding: BINDING,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    pub type Resource<'a> = wgpu::BufferBinding<'a>;
    pub fn bind_group_entry(resource: Resource) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding: BINDING,
            resource: wgpu::BindingResource::Buffer(resource),
        }
    }
}
pub const ENTRY_VS_FULLSCREEN: &str = "vs_fullscreen";
pub const ENTRY_FS_COPY: &str = "fs_copy";
/// Entry point every user fragment program must define.
pub const ENTRY_FS_MAIN: &str = "fs_main";
pub fn vertex_state(module: &wgpu::ShaderModule) -> wgpu::VertexState<'_> {
    wgpu::VertexState {
        module,
        entry_point: ENTRY_VS_FULLSCREEN,
        buffers: &[],
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    }
}
pub fn fragment_state<'a>(
    module: &'a wgpu::ShaderModule,
    entry_point: &'a str,
    targets: &'a [Option<wgpu::ColorTargetState>],
) -> wgpu::FragmentState<'a> {
    wgpu::FragmentState {
        module,
        entry_point,
        targets,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    }
}
pub const SOURCE: &str = "struct Frame {
    resolution: vec2<f32>,
    _pad: vec2<f32>,
}

@group(0) @binding(0) var<uniform> frame: Frame;
@group(0) @binding(1) var input_sampler: sampler;
@group(0) @binding(2) var copy_source: texture_2d<f32>;

struct FullscreenVsToFs {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
};

@vertex
fn vs_fullscreen(@builtin(vertex_index) vertex_index: u32) -> FullscreenVsToFs {
    let corner = vec2f(f32(vertex_index & 1u), f32(vertex_index >> 1u));

    var result: FullscreenVsToFs;
    result.position = vec4f(corner * 2. - 1., 0., 1.);
    result.uv = vec2f(corner.x, 1. - corner.y);
    return result;
}

@fragment
fn fs_copy(@builtin(position) position: vec4f) -> @location(0) vec4f {
    return textureSampleLevel(copy_source, input_sampler, position.xy / vec2f(textureDimensions(copy_source)), 0.);
}
";
pub fn create_shader_module(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("fullscreen"),
        source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(SOURCE)),
    })
}
