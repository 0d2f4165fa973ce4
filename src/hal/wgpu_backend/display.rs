//! Blit of a presented swap image onto the window surface

use super::context::GpuContext;
use crate::hal::{GpuResult, ImageId};

/// Full-screen triangle sampling one device image
pub struct DisplayPipeline {
    pipeline: wgpu::RenderPipeline,
    image_layout: wgpu::BindGroupLayout,
    nearest: wgpu::Sampler,
    linear: wgpu::Sampler,
}

fn fragment_entry(binding: u32, ty: wgpu::BindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty,
        count: None,
    }
}

impl DisplayPipeline {
    pub fn new(ctx: &GpuContext) -> Self {
        let device = ctx.device.raw_device();
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Swap Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/display.wgsl").into()),
        });

        let image_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Swap Blit Layout"),
            entries: &[
                fragment_entry(
                    0,
                    wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                ),
                fragment_entry(1, wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)),
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Swap Blit Pipeline Layout"),
            bind_group_layouts: &[&image_layout],
            push_constant_ranges: &[],
        });

        // Default primitive state: triangle list, no culling
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Swap Blit Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(ctx.format().into())],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = |label: &str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                mag_filter: filter,
                min_filter: filter,
                ..Default::default()
            })
        };

        Self {
            pipeline,
            image_layout,
            nearest: sampler("Swap Sampler (Nearest)", wgpu::FilterMode::Nearest),
            linear: sampler("Swap Sampler (Linear)", wgpu::FilterMode::Linear),
        }
    }

    /// Bind group sampling `image`. Swap images are recreated on resize, so
    /// callers rebuild this whenever the image id changes.
    pub fn bind_image(&self, ctx: &GpuContext, image: ImageId, use_linear: bool) -> GpuResult<wgpu::BindGroup> {
        let sampler = if use_linear { &self.linear } else { &self.nearest };
        ctx.device.with_texture_view(image, |view| {
            ctx.device.raw_device().create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Swap Image Bind Group"),
                layout: &self.image_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ],
            })
        })
    }

    /// Draw the bound swap image over the whole surface and present it
    pub fn render(&self, ctx: &GpuContext, bind_group: &wgpu::BindGroup) -> Result<(), wgpu::SurfaceError> {
        let frame = ctx.surface.get_current_texture()?;
        let target = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let device = ctx.device.raw_device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Swap Blit Encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Swap Blit Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        ctx.device.raw_queue().submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}
