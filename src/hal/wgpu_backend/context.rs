//! Adapter and device setup, windowed or headless

use std::sync::Arc;

use winit::window::Window;

use super::{WgpuDevice, wanted_features};
use crate::hal::{GpuError, GpuResult};

async fn open_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
) -> GpuResult<(wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .ok_or_else(|| GpuError::Unsupported("no suitable GPU adapter".into()))?;

    let info = adapter.get_info();
    log::info!("Using GPU: {} ({:?})", info.name, info.backend);

    let available = adapter.features();
    if !available.contains(wgpu::Features::PUSH_CONSTANTS) {
        return Err(GpuError::Unsupported(format!("{} lacks push constants", info.name)));
    }

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Splat Device"),
                required_features: wanted_features(available),
                required_limits: adapter.limits(),
                memory_hints: Default::default(),
            },
            None,
        )
        .await
        .map_err(|e| GpuError::Backend(format!("Failed to create device: {}", e)))?;

    Ok((adapter, device, queue))
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Device with no graphics family, for offscreen rendering
pub fn headless_device() -> GpuResult<WgpuDevice> {
    pollster::block_on(async {
        let instance = instance();
        let (adapter, device, queue) = open_device(&instance, None).await?;
        Ok(WgpuDevice::new(adapter.get_info().name, device, queue, false))
    })
}

/// Window surface plus the device that renders into it
pub struct GpuContext {
    pub surface: wgpu::Surface<'static>,
    pub device: Arc<WgpuDevice>,
    pub config: wgpu::SurfaceConfiguration,
    pub size: (u32, u32),
    // Keep window alive (surface borrows from it)
    window: Arc<Window>,
}

impl GpuContext {
    pub fn new(window: Arc<Window>) -> GpuResult<Self> {
        pollster::block_on(Self::new_async(window))
    }

    async fn new_async(window: Arc<Window>) -> GpuResult<Self> {
        let size = window.inner_size();
        let size = (size.width.max(1), size.height.max(1));

        let instance = instance();
        // Surface must exist before the adapter request on some platforms
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| GpuError::Backend(format!("Failed to create surface: {}", e)))?;
        let (adapter, device, queue) = open_device(&instance, Some(&surface)).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        // Swap images already hold display-referred values
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| GpuError::Unsupported("surface has no formats".into()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.0,
            height: size.1,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            surface,
            device: Arc::new(WgpuDevice::new(adapter.get_info().name, device, queue, true)),
            config,
            size,
            window,
        })
    }

    pub fn resize(&mut self, new_size: (u32, u32)) {
        if new_size.0 > 0 && new_size.1 > 0 {
            self.size = new_size;
            self.config.width = new_size.0;
            self.config.height = new_size.1;
            self.surface.configure(self.device.raw_device(), &self.config);
        }
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}
