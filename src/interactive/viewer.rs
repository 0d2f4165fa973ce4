//! CPU preview window: the software device renders, minifb displays

use std::sync::Arc;
use std::time::Instant;

use minifb::{Key, KeyRepeat, Window, WindowOptions};

use super::orbit::OrbitCamera;
use super::session::Session;
use crate::config::{CompileSettings, EngineConfig, MAX_SH_DEGREE};
use crate::hal::software::{SoftwareConfig, SoftwareDevice};
use crate::render::rgba_to_rgb32;
use crate::splat::{CloudSettings, PointCloud, clustered_cloud};

/// Configuration for the preview window
#[derive(Clone)]
pub struct ViewerConfig {
    /// Framebuffer size in pixels
    pub size: (u32, u32),
    pub frames_in_flight: u32,
    /// Run compute on its own queue family, exercising the ownership handoff
    pub async_compute: bool,
    pub cloud: CloudSettings,
    /// Instanced groups the cloud is split into
    pub clusters: u32,
    pub engine: EngineConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            size: (320, 240),
            frames_in_flight: 2,
            async_compute: false,
            cloud: CloudSettings {
                count: 4_000,
                ..Default::default()
            },
            clusters: 4,
            engine: EngineConfig::default(),
        }
    }
}

/// Orbit a generated cloud rendered on the host
pub struct InteractiveViewer {
    config: ViewerConfig,
    session: Session,
    cloud: PointCloud,
    orbit: OrbitCamera,
    sh_degree: u8,
    window: Window,
    buffer: Vec<u32>,
}

impl InteractiveViewer {
    pub fn new(config: ViewerConfig) -> Result<Self, String> {
        let device = Arc::new(SoftwareDevice::new(SoftwareConfig {
            async_compute: config.async_compute,
            ..Default::default()
        }));
        let mut session = Session::new(device, config.size, config.frames_in_flight, config.engine.clone())
            .map_err(|e| e.to_string())?;

        let cloud = clustered_cloud(&config.cloud, config.clusters);
        let sh_degree = config.cloud.sh_degree;
        session
            .load(&cloud, CompileSettings { sh_degree })
            .map_err(|e| e.to_string())?;

        let window = Window::new(
            "Splat Preview (ESC to exit)",
            config.size.0 as usize,
            config.size.1 as usize,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )
        .map_err(|e| e.to_string())?;

        Ok(Self {
            config,
            session,
            cloud,
            orbit: OrbitCamera::default(),
            sh_degree,
            window,
            buffer: Vec::new(),
        })
    }

    fn recompile(&mut self) -> Result<(), String> {
        self.session
            .load(&self.cloud, CompileSettings { sh_degree: self.sh_degree })
            .map_err(|e| e.to_string())
    }

    /// Spin each cluster about its own axis, exercising transform updates
    fn spin_clusters(&mut self, angle: f32) -> Result<(), String> {
        let rotation = glam::Mat4::from_rotation_y(angle);
        let entities: Vec<_> = self.cloud.entities().collect();
        for entity in entities {
            if let Some(transform) = self.cloud.transform(entity) {
                self.cloud.set_transform(entity, transform * rotation);
            }
        }
        self.session
            .engine_mut()
            .update_transforms(&self.cloud)
            .map_err(|e| e.to_string())
    }

    pub fn run(&mut self) -> Result<(), String> {
        self.window.set_target_fps(60);

        println!("=== Splat Preview ===");
        println!("Controls:");
        println!("  Arrows     - Orbit");
        println!("  W/S        - Zoom in/out");
        println!("  0/1/2/3    - Spherical harmonics degree");
        println!("  R          - Spin clusters");
        println!("  ESC        - Exit");
        println!();

        let mut last_report = Instant::now();
        let mut frames = 0u32;

        while self.window.is_open() && !self.window.is_key_down(Key::Escape) {
            if self.window.is_key_down(Key::Left) {
                self.orbit.rotate(-0.03, 0.0);
            }
            if self.window.is_key_down(Key::Right) {
                self.orbit.rotate(0.03, 0.0);
            }
            if self.window.is_key_down(Key::Up) {
                self.orbit.rotate(0.0, 0.03);
            }
            if self.window.is_key_down(Key::Down) {
                self.orbit.rotate(0.0, -0.03);
            }
            if self.window.is_key_down(Key::W) {
                self.orbit.zoom(0.97);
            }
            if self.window.is_key_down(Key::S) {
                self.orbit.zoom(1.03);
            }

            for (key, degree) in [(Key::Key0, 0u8), (Key::Key1, 1), (Key::Key2, 2), (Key::Key3, 3)] {
                if self.window.is_key_pressed(key, KeyRepeat::No) && degree <= MAX_SH_DEGREE {
                    self.sh_degree = degree;
                    self.recompile()?;
                    println!("SH degree: {}", degree);
                }
            }
            if self.window.is_key_pressed(Key::R, KeyRepeat::No) {
                self.spin_clusters(0.3)?;
            }

            let output = self.session.frame(&self.orbit.camera()).map_err(|e| e.to_string())?;
            let pixels = self.session.pixels(output.report.slot).map_err(|e| e.to_string())?;
            rgba_to_rgb32(&pixels, &mut self.buffer);

            let (width, height) = self.config.size;
            self.window
                .update_with_buffer(&self.buffer, width as usize, height as usize)
                .map_err(|e| e.to_string())?;

            frames += 1;
            if last_report.elapsed().as_secs_f32() >= 2.0 {
                let fps = frames as f32 / last_report.elapsed().as_secs_f32();
                log::info!(
                    "{:.1} fps, {} tiles rendered, capacity {}",
                    fps,
                    output.report.tiles_rendered,
                    output.report.tile_capacity
                );
                frames = 0;
                last_report = Instant::now();
            }
        }

        Ok(())
    }
}
