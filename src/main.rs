use std::sync::Arc;
use std::time::Instant;

use splat_raster::hal::software::{SoftwareConfig, SoftwareDevice};
use splat_raster::hal::wgpu_backend::context::headless_device;
use splat_raster::interactive::{
    GpuViewerConfig, InteractiveViewer, OrbitCamera, Session, ViewerConfig, run_gpu_viewer,
};
use splat_raster::splat::{CloudSettings, clustered_cloud};
use splat_raster::{CompileSettings, EngineConfig, EngineResult, save_ppm};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let config = match option_value(&args, "--config") {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    if has_flag(&args, "--interactive") {
        run_interactive(config);
    } else if has_flag(&args, "--preview") {
        run_preview(config);
    } else if has_flag(&args, "--benchmark") {
        run_benchmark(config);
    } else if let Some(path) = option_value(&args, "--headless") {
        if let Err(e) = run_headless(config, path, has_flag(&args, "--gpu")) {
            log::error!("Headless render failed: {}", e);
            std::process::exit(1);
        }
    } else {
        println!("Splat Raster");
        println!("Run with --interactive for the wgpu viewer");
        println!("Run with --preview for the software preview window");
        println!("Run with --benchmark to time the software pipeline");
        println!("Run with --headless <out.ppm> to render one frame to a file (add --gpu for wgpu)");
        println!("Add --config <file.toml> to override engine settings");
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().skip(1).any(|arg| arg == flag)
}

fn option_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|at| args.get(at + 1))
        .map(String::as_str)
}

fn software_session(config: EngineConfig, size: (u32, u32), async_compute: bool) -> EngineResult<Session> {
    let device = Arc::new(SoftwareDevice::new(SoftwareConfig {
        async_compute,
        ..Default::default()
    }));
    Session::new(device, size, 2, config)
}

fn run_headless(config: EngineConfig, path: &str, gpu: bool) -> Result<(), Box<dyn std::error::Error>> {
    let size = (512, 512);
    let settings = CloudSettings {
        count: 20_000,
        sh_degree: 3,
        ..Default::default()
    };
    let cloud = clustered_cloud(&settings, 6);

    let mut session = if gpu {
        Session::new(Arc::new(headless_device()?), size, 2, config)?
    } else {
        software_session(config, size, false)?
    };
    session.load(&cloud, CompileSettings { sh_degree: settings.sh_degree })?;
    let output = session.frame(&OrbitCamera::default().camera())?;
    let pixels = session.pixels(output.report.slot)?;
    save_ppm(path, size.0, size.1, &pixels)?;

    println!(
        "Wrote {} ({} Gaussians, {} tiles rendered)",
        path,
        cloud.points().len(),
        output.report.tiles_rendered
    );
    Ok(())
}

fn run_benchmark(config: EngineConfig) {
    println!("=== Software Pipeline Benchmark ===\n");

    let counts = [1_000u32, 10_000, 50_000];
    let size = (256, 256);
    let iterations = 20;

    for async_compute in [false, true] {
        for count in counts {
            let result = benchmark_one(config.clone(), size, count, iterations, async_compute);
            match result {
                Ok((avg_ms, tiles)) => {
                    println!(
                        "Gaussians: {:>6}  async: {:<5}  {:.3} ms/frame  ({:.1} FPS, {} tiles)",
                        count,
                        async_compute,
                        avg_ms,
                        1000.0 / avg_ms,
                        tiles
                    );
                }
                Err(e) => log::error!("Benchmark with {} Gaussians failed: {}", count, e),
            }
        }
        println!();
    }
}

fn benchmark_one(
    config: EngineConfig,
    size: (u32, u32),
    count: u32,
    iterations: u32,
    async_compute: bool,
) -> EngineResult<(f64, u32)> {
    let settings = CloudSettings {
        count,
        ..Default::default()
    };
    let cloud = clustered_cloud(&settings, 4);
    let mut session = software_session(config, size, async_compute)?;
    session.load(&cloud, CompileSettings { sh_degree: settings.sh_degree })?;

    let mut orbit = OrbitCamera::default();
    // Warm-up frame sizes the tile buffers
    session.frame(&orbit.camera())?;

    let start = Instant::now();
    let mut tiles = 0;
    for _ in 0..iterations {
        orbit.rotate(0.05, 0.0);
        tiles = session.frame(&orbit.camera())?.report.tiles_rendered;
    }
    let avg_ms = start.elapsed().as_secs_f64() * 1000.0 / iterations as f64;
    Ok((avg_ms, tiles))
}

fn run_interactive(config: EngineConfig) {
    let viewer_config = GpuViewerConfig {
        engine: config,
        ..Default::default()
    };
    if let Err(e) = run_gpu_viewer(viewer_config) {
        log::error!("Viewer error: {}", e);
    }
}

fn run_preview(config: EngineConfig) {
    let viewer_config = ViewerConfig {
        engine: config,
        ..Default::default()
    };

    match InteractiveViewer::new(viewer_config) {
        Ok(mut viewer) => {
            if let Err(e) = viewer.run() {
                log::error!("Error: {}", e);
            }
        }
        Err(e) => {
            log::error!("Failed to create viewer: {}", e);
        }
    }
}
