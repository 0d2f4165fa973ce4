//! GPU splat viewer using wgpu + winit

use std::sync::Arc;

use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use super::orbit::OrbitCamera;
use super::session::Session;
use crate::config::{CompileSettings, EngineConfig};
use crate::hal::ImageId;
use crate::hal::wgpu_backend::context::GpuContext;
use crate::hal::wgpu_backend::display::DisplayPipeline;
use crate::splat::{CloudSettings, clustered_cloud};

/// Configuration for the GPU viewer
#[derive(Clone)]
pub struct GpuViewerConfig {
    /// Initial window size in logical pixels
    pub window_size: (u32, u32),
    pub frames_in_flight: u32,
    pub cloud: CloudSettings,
    pub clusters: u32,
    pub engine: EngineConfig,
    pub title: String,
}

impl Default for GpuViewerConfig {
    fn default() -> Self {
        Self {
            window_size: (1280, 720),
            frames_in_flight: 2,
            cloud: CloudSettings {
                count: 200_000,
                ..Default::default()
            },
            clusters: 8,
            engine: EngineConfig::default(),
            title: "Splat Raster - GPU Viewer (ESC to exit)".to_string(),
        }
    }
}

struct ViewerState {
    // Dropped before the context that owns the device
    session: Session,
    display_pipeline: DisplayPipeline,
    display_target: Option<(ImageId, wgpu::BindGroup)>,
    gpu_ctx: GpuContext,

    orbit: OrbitCamera,
    use_linear: bool,
    dragging: bool,
    last_cursor: Option<(f64, f64)>,
}

impl ViewerState {
    fn new(window: Arc<Window>, config: &GpuViewerConfig) -> Result<Self, String> {
        let gpu_ctx = GpuContext::new(window).map_err(|e| e.to_string())?;
        let display_pipeline = DisplayPipeline::new(&gpu_ctx);

        let mut session = Session::new(
            gpu_ctx.device.clone(),
            gpu_ctx.size,
            config.frames_in_flight,
            config.engine.clone(),
        )
        .map_err(|e| e.to_string())?;
        let cloud = clustered_cloud(&config.cloud, config.clusters);
        session
            .load(
                &cloud,
                CompileSettings {
                    sh_degree: config.cloud.sh_degree,
                },
            )
            .map_err(|e| e.to_string())?;

        Ok(Self {
            session,
            display_pipeline,
            display_target: None,
            gpu_ctx,
            orbit: OrbitCamera::default(),
            use_linear: false,
            dragging: false,
            last_cursor: None,
        })
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.gpu_ctx.resize((width, height));
        if let Err(e) = self.session.resize(width, height) {
            log::error!("Resize failed: {}", e);
        }
        self.display_target = None;
    }

    fn update_and_render(&mut self) {
        let output = match self.session.frame(&self.orbit.camera()) {
            Ok(output) => output,
            Err(e) => {
                log::error!("Frame failed: {}", e);
                return;
            }
        };
        let Some(swap_image) = output.swap_image else {
            return;
        };

        let stale = self
            .display_target
            .as_ref()
            .is_none_or(|(image, _)| *image != swap_image);
        if stale {
            match self.display_pipeline.bind_image(&self.gpu_ctx, swap_image, self.use_linear) {
                Ok(bind_group) => self.display_target = Some((swap_image, bind_group)),
                Err(e) => {
                    log::error!("Cannot display swap image: {}", e);
                    return;
                }
            }
        }

        if let Some((_, bind_group)) = &self.display_target {
            if let Err(e) = self.display_pipeline.render(&self.gpu_ctx, bind_group) {
                log::error!("Render error: {:?}", e);
            }
        }
    }
}

/// Application handler for winit event loop
struct GpuViewerApp {
    config: GpuViewerConfig,
    state: Option<ViewerState>,
}

impl GpuViewerApp {
    fn new(config: GpuViewerConfig) -> Self {
        Self { config, state: None }
    }
}

impl ApplicationHandler for GpuViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        let (width, height) = self.config.window_size;
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(winit::dpi::LogicalSize::new(width as f64, height as f64));

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match ViewerState::new(window, &self.config) {
            Ok(state) => {
                println!("=== GPU Splat Viewer ===");
                println!("Controls:");
                println!("  Left Drag  - Orbit");
                println!("  Arrows     - Orbit");
                println!("  +/-        - Zoom");
                println!("  L          - Toggle linear filtering");
                println!("  ESC        - Exit");
                println!();

                self.state = Some(state);
            }
            Err(e) => {
                log::error!("Failed to create viewer state: {}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let state = match &mut self.state {
            Some(s) => s,
            None => return,
        };

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                state.resize(size.width, size.height);
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key {
                KeyCode::Escape => event_loop.exit(),
                KeyCode::ArrowLeft => state.orbit.rotate(-0.05, 0.0),
                KeyCode::ArrowRight => state.orbit.rotate(0.05, 0.0),
                KeyCode::ArrowUp => state.orbit.rotate(0.0, 0.05),
                KeyCode::ArrowDown => state.orbit.rotate(0.0, -0.05),
                KeyCode::Equal | KeyCode::NumpadAdd => state.orbit.zoom(0.9),
                KeyCode::Minus | KeyCode::NumpadSubtract => state.orbit.zoom(1.1),
                KeyCode::KeyL => {
                    state.use_linear = !state.use_linear;
                    state.display_target = None;
                    println!("Linear filtering: {}", if state.use_linear { "ON" } else { "OFF" });
                }
                _ => {}
            },

            WindowEvent::MouseInput {
                state: btn_state,
                button: MouseButton::Left,
                ..
            } => {
                state.dragging = btn_state == ElementState::Pressed;
                if !state.dragging {
                    state.last_cursor = None;
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                if state.dragging {
                    if let Some((x, y)) = state.last_cursor {
                        let dx = (position.x - x) as f32;
                        let dy = (position.y - y) as f32;
                        state.orbit.rotate(-dx * 0.005, dy * 0.005);
                    }
                    state.last_cursor = Some((position.x, position.y));
                }
            }

            WindowEvent::RedrawRequested => {
                state.update_and_render();
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.gpu_ctx.request_redraw();
        }
    }
}

/// Run the GPU viewer. Expects logging to be initialised by the caller.
pub fn run_gpu_viewer(config: GpuViewerConfig) -> Result<(), String> {
    let event_loop = EventLoop::new().map_err(|e| format!("Failed to create event loop: {}", e))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = GpuViewerApp::new(config);
    event_loop
        .run_app(&mut app)
        .map_err(|e| format!("Event loop error: {}", e))?;

    Ok(())
}
