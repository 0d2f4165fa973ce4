//! End-to-end frames on the software device

use std::sync::{Arc, Weak};

use glam::{Mat4, Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{CompileSettings, EngineConfig};
use crate::engine::{ComputeEngine, Phase, SlotState};
use crate::error::EngineError;
use crate::hal::software::kernels::{radix_coalesce, radix_histogram, tile_ranges};
use crate::hal::software::{SoftwareConfig, SoftwareDevice, SubmissionRecord};
use crate::hal::{DeviceCapabilities, GpuDevice, GpuError, ImageLayout};
use crate::interactive::Session;
use crate::layout::{ProgramKind, RADIX_BLOCK, radix_pass_count, tile_grid};
use crate::present::HeadlessPresenter;
use crate::render::write_ppm;
use crate::splat::project::project_point;
use crate::splat::{CameraState, CloudSettings, GaussianPoint, PointCloud, random_cloud, sort_key};

// 3x3 tiles; the image center sits inside the middle tile
const SIZE: (u32, u32) = (48, 48);

fn device(async_compute: bool) -> Arc<SoftwareDevice> {
    Arc::new(SoftwareDevice::new(SoftwareConfig {
        async_compute,
        ..Default::default()
    }))
}

fn session_on(device: &Arc<SoftwareDevice>, frames_in_flight: u32, config: EngineConfig) -> Session {
    Session::new(device.clone(), SIZE, frames_in_flight, config).unwrap()
}

fn red_dot(at: Vec3) -> GaussianPoint {
    GaussianPoint::new(at, Vec3::splat(0.01), Quat::IDENTITY, 1.0).with_base_color([1.0, 0.0, 0.0])
}

fn pixel(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let at = ((y * width + x) * 4) as usize;
    [pixels[at], pixels[at + 1], pixels[at + 2], pixels[at + 3]]
}

/// The graphics submission that copied an output image into a swap image
fn draw_submissions(device: &SoftwareDevice) -> Vec<SubmissionRecord> {
    let graphics = device.info().queues.graphics;
    device
        .submissions()
        .into_iter()
        .filter(|s| Some(s.family) == graphics && s.dispatches.is_empty() && s.copies > 0)
        .collect()
}

fn blue_background() -> EngineConfig {
    EngineConfig {
        background: [0.0, 0.0, 1.0],
        ..Default::default()
    }
}

#[test]
fn test_empty_scene_clears_to_background_and_presents() {
    let device = device(false);
    let mut session = session_on(&device, 2, blue_background());
    session.load(&PointCloud::new(), CompileSettings::default()).unwrap();
    device.clear_submissions();

    let output = session.frame(&CameraState::default()).unwrap();
    assert_eq!(output.report.tiles_rendered, 0);

    let submissions = device.submissions();
    for kind in [ProgramKind::Project, ProgramKind::Prefix, ProgramKind::Keygen, ProgramKind::Radix] {
        assert_eq!(submissions.iter().map(|s| s.dispatched(kind)).sum::<usize>(), 0);
    }
    assert_eq!(submissions.iter().map(|s| s.dispatched(ProgramKind::Blend)).sum::<usize>(), 1);

    let swap = output.swap_image.unwrap();
    assert_eq!(device.image_layout(swap).unwrap(), ImageLayout::PresentSrc);

    let pixels = session.pixels(output.report.slot).unwrap();
    assert!(pixels.chunks_exact(4).all(|p| p == [0, 0, 255, 255]));
}

#[test]
fn test_single_gaussian_covers_one_tile() {
    let device = device(false);
    let mut session = session_on(&device, 2, blue_background());
    session
        .load(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();

    let output = session.frame(&CameraState::default()).unwrap();
    assert_eq!(output.report.tiles_rendered, 1);
    assert_eq!(output.report.radix_passes, radix_pass_count(9));

    let pixels = session.pixels(output.report.slot).unwrap();
    let center = pixel(&pixels, SIZE.0, 24, 24);
    assert!(center[0] > 50, "center {:?}", center);
    assert!(center[1] < 10);
    assert_eq!(pixel(&pixels, SIZE.0, 2, 2), [0, 0, 255, 255]);
    assert_eq!(pixel(&pixels, SIZE.0, 45, 45), [0, 0, 255, 255]);
}

#[test]
fn test_tiles_rendered_matches_host_projection() {
    let settings = CloudSettings {
        count: 600,
        seed: 7,
        ..Default::default()
    };
    let cloud = random_cloud(&settings);
    let camera = CameraState::default();
    let uniform = camera.uniform(SIZE.0, SIZE.1, [0.0; 3]);
    let expected: u32 = cloud
        .points()
        .iter()
        .map(|p| project_point(p, Mat4::IDENTITY, &uniform, 0).tile_count())
        .sum();

    let device = device(false);
    let mut session = session_on(&device, 1, EngineConfig::default());
    session.load(&cloud, CompileSettings { sh_degree: 0 }).unwrap();
    let output = session.frame(&camera).unwrap();
    assert_eq!(output.report.tiles_rendered, expected);
}

/// Run every radix pass over `keys`, carrying `values` along
fn radix_sort(keys: &[u64], values: &[u32], tile_count: u32) -> (Vec<u64>, Vec<u32>) {
    let n = keys.len();
    let nb = n.div_ceil(RADIX_BLOCK as usize);
    let mut src = (keys.to_vec(), values.to_vec());
    let mut dst = (vec![0u64; n], vec![0u32; n]);
    let mut blocks = vec![0u32; nb * 4];
    let mut global = vec![0u32; nb * 4];
    for pass in 0..radix_pass_count(tile_count) {
        radix_histogram(&src.0, n, n, pass, &mut blocks).unwrap();
        radix_coalesce(&src.0, &src.1, &blocks, n, n, pass, &mut global, &mut dst.0, &mut dst.1).unwrap();
        std::mem::swap(&mut src, &mut dst);
    }
    src
}

#[test]
fn test_radix_passes_sort_random_tile_keys() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let tile_count = 40 * 23;
    let n = 3 * RADIX_BLOCK as usize + 17;
    let keys: Vec<u64> = (0..n)
        .map(|_| sort_key(rng.gen_range(0..tile_count), rng.gen_range(0.1f32..500.0)))
        .collect();
    let sorted = radix_sort(&keys, &(0..n as u32).collect::<Vec<_>>(), tile_count);

    let mut expected: Vec<(u64, u32)> = keys.iter().copied().zip(0..n as u32).collect();
    expected.sort_by_key(|&(key, _)| key);
    let pairs: Vec<(u64, u32)> = sorted.0.iter().copied().zip(sorted.1.iter().copied()).collect();
    assert_eq!(pairs, expected);

    let mut ranges = vec![[0u32; 2]; tile_count as usize];
    tile_ranges(&sorted.0, n, n, &mut ranges).unwrap();
    for (tile, range) in ranges.iter().enumerate() {
        let inside = (range[0]..range[1]).map(|i| (sorted.0[i as usize] >> 32) as usize);
        assert!(inside.clone().all(|t| t == tile));
        let count = sorted.0.iter().filter(|&&k| (k >> 32) as usize == tile).count();
        assert_eq!((range[1] - range[0]) as usize, count);
    }
}

#[test]
fn test_sorting_sorted_keys_is_identity() {
    let mut rng = StdRng::seed_from_u64(11);
    let tile_count = 16 * 16;
    let n = 2 * RADIX_BLOCK as usize + 5;
    // Few distinct depths so equal keys exercise stability
    let keys: Vec<u64> = (0..n)
        .map(|_| sort_key(rng.gen_range(0..tile_count), rng.gen_range(1..8) as f32))
        .collect();
    let once = radix_sort(&keys, &(0..n as u32).collect::<Vec<_>>(), tile_count);
    let twice = radix_sort(&once.0, &once.1, tile_count);
    assert_eq!(twice, once);
}

#[test]
fn test_single_tile_keys_sort_by_depth() {
    let mut rng = StdRng::seed_from_u64(3);
    let tile_count = 16 * 16;
    let n = RADIX_BLOCK as usize + 40;
    let depths: Vec<f32> = (0..n).map(|_| rng.gen_range(0.1f32..100.0)).collect();
    let keys: Vec<u64> = depths.iter().map(|&d| sort_key(7, d)).collect();
    let (sorted, values) = radix_sort(&keys, &(0..n as u32).collect::<Vec<_>>(), tile_count);

    let mut seen = values.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..n as u32).collect::<Vec<_>>());
    for (key, &value) in sorted.iter().zip(&values) {
        assert_eq!(*key, keys[value as usize]);
    }
    assert!(values.windows(2).all(|w| depths[w[0] as usize] <= depths[w[1] as usize]));

    let mut ranges = vec![[0u32; 2]; tile_count as usize];
    tile_ranges(&sorted, n, n, &mut ranges).unwrap();
    for (tile, range) in ranges.iter().enumerate() {
        let expected = if tile == 7 { [0, n as u32] } else { [0, 0] };
        assert_eq!(*range, expected, "tile {}", tile);
    }
}

// 16x16 tiles
const WIDE: (u32, u32) = (256, 256);

fn wide_session(device: &Arc<SoftwareDevice>, config: EngineConfig) -> Session {
    Session::new(device.clone(), WIDE, 1, config).unwrap()
}

/// Per-tile [start, end) ranges the last frame on `slot` left behind
fn frame_ranges(device: &SoftwareDevice, session: &Session, slot: u32) -> Vec<[u32; 2]> {
    let buffer = session.engine().ranges_buffer(slot).unwrap();
    let bytes = device.buffer_contents(buffer).unwrap();
    let (tiles_x, tiles_y) = tile_grid(WIDE.0, WIDE.1);
    bytes
        .chunks_exact(8)
        .take((tiles_x * tiles_y) as usize)
        .map(|pair| {
            let word = |at: usize| u32::from_le_bytes([pair[at], pair[at + 1], pair[at + 2], pair[at + 3]]);
            [word(0), word(4)]
        })
        .collect()
}

#[test]
fn test_no_gaussians_leave_every_range_empty() {
    let device = device(false);
    let mut session = wide_session(&device, blue_background());
    session.load(&PointCloud::new(), CompileSettings::default()).unwrap();

    let output = session.frame(&CameraState::default()).unwrap();
    assert_eq!(output.report.tiles_rendered, 0);
    let ranges = frame_ranges(&device, &session, output.report.slot);
    assert_eq!(ranges.len(), 256);
    assert!(ranges.iter().all(|r| *r == [0, 0]));

    let pixels = session.pixels(output.report.slot).unwrap();
    assert_eq!(pixels.len(), (WIDE.0 * WIDE.1 * 4) as usize);
    assert!(pixels.chunks_exact(4).all(|p| p == [0, 0, 255, 255]));
}

#[test]
fn test_gaussian_in_corner_tile_owns_first_range() {
    let camera = CameraState::default();
    // Lands near pixel (8, 8), the middle of tile (0, 0)
    let reach = (128.0 - 8.0) * 5.0 / camera.focal(WIDE.1);
    let point = red_dot(Vec3::new(-reach, reach, 0.0));
    let splat = project_point(&point, Mat4::IDENTITY, &camera.uniform(WIDE.0, WIDE.1, [0.0; 3]), 0);
    assert_eq!((splat.tile_min, splat.tile_max), ([0, 0], [1, 1]));

    let device = device(false);
    let mut session = wide_session(&device, blue_background());
    session
        .load(&PointCloud::from_points(vec![point]), CompileSettings::default())
        .unwrap();
    let output = session.frame(&camera).unwrap();
    assert_eq!(output.report.tiles_rendered, 1);

    let ranges = frame_ranges(&device, &session, output.report.slot);
    assert_eq!(ranges[0], [0, 1]);
    assert!(ranges[1..].iter().all(|r| *r == [0, 0]));

    let pixels = session.pixels(output.report.slot).unwrap();
    assert!(pixel(&pixels, WIDE.0, 8, 8)[0] > 50);
    assert_eq!(pixel(&pixels, WIDE.0, 200, 200), [0, 0, 255, 255]);
}

#[test]
fn test_ranges_cover_sorted_entries_without_gaps() {
    let cloud = random_cloud(&CloudSettings {
        count: 600,
        seed: 7,
        ..Default::default()
    });
    let camera = CameraState::default();
    let uniform = camera.uniform(WIDE.0, WIDE.1, [0.0; 3]);
    let (tiles_x, tiles_y) = tile_grid(WIDE.0, WIDE.1);
    let mut counts = vec![0u32; (tiles_x * tiles_y) as usize];
    for point in cloud.points() {
        let splat = project_point(point, Mat4::IDENTITY, &uniform, 0);
        for ty in splat.tile_min[1]..splat.tile_max[1] {
            for tx in splat.tile_min[0]..splat.tile_max[0] {
                counts[(ty * tiles_x + tx) as usize] += 1;
            }
        }
    }

    let device = device(false);
    let mut session = wide_session(&device, EngineConfig::default());
    session.load(&cloud, CompileSettings { sh_degree: 0 }).unwrap();
    let output = session.frame(&camera).unwrap();
    let total = output.report.tiles_rendered;
    assert_eq!(total, counts.iter().sum::<u32>());
    assert!(total > 0);

    // Non-empty tiles tile [0, total) in tile order
    let ranges = frame_ranges(&device, &session, output.report.slot);
    let mut next = 0;
    for (tile, (range, &count)) in ranges.iter().zip(&counts).enumerate() {
        if count == 0 {
            assert_eq!(*range, [0, 0], "tile {}", tile);
        } else {
            assert_eq!(*range, [next, next + count], "tile {}", tile);
            next += count;
        }
    }
    assert_eq!(next, total);
}

#[test]
fn test_draw_waits_on_handoff_only_under_async() {
    for (async_compute, waits) in [(false, 1), (true, 2)] {
        let device = device(async_compute);
        let mut session = session_on(&device, 2, EngineConfig::default());
        session
            .load(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
            .unwrap();
        device.clear_submissions();

        session.frame(&CameraState::default()).unwrap();
        let draws = draw_submissions(&device);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].waits.len(), waits, "async compute {}", async_compute);
    }
}

#[test]
fn test_async_compute_releases_output_to_graphics() {
    let device = device(true);
    let queues = device.info().queues;
    assert!(queues.async_compute());
    let mut session = session_on(&device, 2, EngineConfig::default());
    session
        .load(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();
    device.clear_submissions();

    session.frame(&CameraState::default()).unwrap();
    let sort = device
        .submissions()
        .into_iter()
        .find(|s| s.dispatched(ProgramKind::Blend) == 1)
        .unwrap();
    assert_eq!(sort.family, queues.compute);
    assert_eq!(sort.signals.len(), 1);
    assert_eq!(draw_submissions(&device)[0].waits[1], sort.signals[0]);
}

#[test]
fn test_compile_twice_releases_previous_scene() {
    let device = device(false);
    let mut session = session_on(&device, 2, EngineConfig::default());
    let cloud = random_cloud(&CloudSettings {
        count: 500,
        ..Default::default()
    });

    session.load(&cloud, CompileSettings { sh_degree: 3 }).unwrap();
    session.engine().transfers().wait_empty();
    let buffers = device.live_buffers();
    let bytes = device.allocated_bytes();

    session.load(&cloud, CompileSettings { sh_degree: 3 }).unwrap();
    session.engine().transfers().wait_empty();
    assert_eq!(device.live_buffers(), buffers);
    assert_eq!(device.allocated_bytes(), bytes);
}

#[test]
fn test_tile_buffers_only_grow() {
    let device = device(false);
    let config = EngineConfig {
        initial_tile_capacity: 4,
        ..Default::default()
    };
    let mut session = session_on(&device, 1, config);
    let cloud = random_cloud(&CloudSettings {
        count: 400,
        ..Default::default()
    });
    session.load(&cloud, CompileSettings::default()).unwrap();

    let first = session.frame(&CameraState::default()).unwrap().report;
    assert!(first.grew);
    assert!(first.tile_capacity >= first.tiles_rendered);
    assert_eq!(first.tile_capacity % RADIX_BLOCK, 0);

    // Every Gaussian lies behind this camera
    let away = CameraState::look_at(Vec3::new(0.0, 0.0, 50.0), Vec3::new(0.0, 0.0, 100.0), Vec3::Y, 60f32.to_radians());
    let second = session.frame(&away).unwrap().report;
    assert!(first.tiles_rendered > 0);
    assert_eq!(second.tiles_rendered, 0);
    assert!(!second.grew);
    assert_eq!(second.tile_capacity, first.tile_capacity);

    let engine = session.engine();
    assert_eq!(engine.max_tiles_rendered(0), Some(first.tiles_rendered));
    assert_eq!(engine.tile_capacity(0), Some(first.tile_capacity));
}

#[test]
fn test_slot_walks_the_frame_cycle() {
    let device = device(false);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 1, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let mut engine = ComputeEngine::new(device.clone(), weak, EngineConfig::default()).unwrap();
    engine
        .compile(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();
    assert_eq!(engine.slot_state(0), Some(SlotState::Idle));

    engine.compute(&CameraState::default()).unwrap();
    assert_eq!(engine.slot_state(0), Some(SlotState::PreFrameSubmitted(Phase::Sort)));

    let swap = presenter.acquire().unwrap();
    engine.draw(swap).unwrap();
    assert_eq!(engine.slot_state(0), Some(SlotState::PresentReady));

    let again = engine.draw(swap).unwrap_err();
    assert!(matches!(again, EngineError::InvalidSlotTransition { .. }));

    presenter.present().unwrap();
    engine.compute(&CameraState::default()).unwrap();
    assert_eq!(engine.slot_state(0), Some(SlotState::PreFrameSubmitted(Phase::Sort)));
}

#[test]
fn test_failed_growth_leaves_slot_reusable() {
    let device = device(false);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 1, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let config = EngineConfig {
        initial_tile_capacity: 4,
        ..Default::default()
    };
    let mut engine = ComputeEngine::new(device.clone(), weak, config).unwrap();
    let cloud = random_cloud(&CloudSettings {
        count: 4000,
        ..Default::default()
    });
    engine.compile(&cloud, CompileSettings::default()).unwrap();
    engine.transfers().wait_empty();
    let capacity = engine.tile_capacity(0).unwrap();

    // Nothing more fits, so the tile buffers cannot grow
    device.set_memory_limit(Some(device.allocated_bytes()));
    let err = engine.compute(&CameraState::default()).unwrap_err();
    assert!(matches!(err, EngineError::Gpu(GpuError::OutOfMemory { .. })), "{:?}", err);
    assert_eq!(engine.slot_state(0), Some(SlotState::Idle));
    assert_eq!(engine.tile_capacity(0), Some(capacity));

    let away = CameraState::look_at(Vec3::new(0.0, 0.0, 50.0), Vec3::new(0.0, 0.0, 100.0), Vec3::Y, 60f32.to_radians());
    let report = engine.compute(&away).unwrap();
    assert_eq!(report.tiles_rendered, 0);
    assert_eq!(engine.slot_state(0), Some(SlotState::PreFrameSubmitted(Phase::Sort)));

    device.set_memory_limit(None);
    let report = engine.compute(&CameraState::default()).unwrap();
    assert!(report.grew);
    assert!(report.tile_capacity >= report.tiles_rendered);
}

#[test]
fn test_compute_only_frames_repeat_under_async() {
    let device = device(true);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 2, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let mut engine = ComputeEngine::new(device.clone(), weak, EngineConfig::default()).unwrap();
    engine
        .compile(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();

    for _ in 0..5 {
        engine.compute(&CameraState::default()).unwrap();
        presenter.advance();
    }
}

#[test]
fn test_read_output_without_draw_under_async() {
    let device = device(true);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 1, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let mut engine = ComputeEngine::new(device.clone(), weak, blue_background()).unwrap();
    engine
        .compile(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();

    let report = engine.compute(&CameraState::default()).unwrap();
    let pixels = engine.read_output(report.slot).unwrap();
    assert_eq!(pixels.len(), (SIZE.0 * SIZE.1 * 4) as usize);
    assert_eq!(pixel(&pixels, SIZE.0, 2, 2), [0, 0, 255, 255]);

    // The next frame on the same slot still runs
    presenter.advance();
    engine.compute(&CameraState::default()).unwrap();
}

#[test]
fn test_allocation_failure_is_reported() {
    let device = Arc::new(SoftwareDevice::new(SoftwareConfig {
        memory_limit: Some(4 << 20),
        ..Default::default()
    }));
    let config = EngineConfig {
        initial_tile_capacity: 1 << 20,
        ..Default::default()
    };
    let err = Session::new(device, SIZE, 2, config).err().unwrap();
    assert!(matches!(err, EngineError::Gpu(GpuError::OutOfMemory { .. })), "{:?}", err);
}

#[test]
fn test_missing_capabilities_reject_device() {
    let device = Arc::new(SoftwareDevice::new(SoftwareConfig {
        capabilities: DeviceCapabilities::default(),
        ..Default::default()
    }));
    match Session::new(device, SIZE, 2, EngineConfig::default()) {
        Err(EngineError::NoCapableDevice { missing }) => assert_eq!(missing.len(), 4),
        other => panic!("expected NoCapableDevice, got {:?}", other.err()),
    }
}

#[test]
fn test_dropped_presenter_is_reported() {
    let device = device(false);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 2, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let mut engine = ComputeEngine::new(device.clone(), weak, EngineConfig::default()).unwrap();
    drop(presenter);

    let err = engine.compute(&CameraState::default()).unwrap_err();
    assert_eq!(err, EngineError::PresentationGone);
}

#[test]
fn test_resize_rebuilds_per_frame_images() {
    let device = device(false);
    let mut session = session_on(&device, 2, blue_background());
    session
        .load(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();
    session.frame(&CameraState::default()).unwrap();
    assert_eq!(session.presenter().resize_listeners(), 1);

    session.resize(80, 48).unwrap();
    let output = session.frame(&CameraState::default()).unwrap();
    assert_eq!(session.engine().extent(), (80, 48));
    assert_eq!(output.report.radix_passes, radix_pass_count(5 * 3));
    assert_eq!(session.pixels(output.report.slot).unwrap().len(), 80 * 48 * 4);
}

#[test]
fn test_engine_drop_unregisters_resize_callback() {
    let device = device(false);
    let presenter = Arc::new(HeadlessPresenter::new(device.clone(), 2, SIZE.0, SIZE.1).unwrap());
    let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
    let engine = ComputeEngine::new(device.clone(), weak, EngineConfig::default()).unwrap();
    assert_eq!(presenter.resize_listeners(), 1);
    drop(engine);
    assert_eq!(presenter.resize_listeners(), 0);
}

#[test]
fn test_transform_update_moves_group() {
    let device = device(false);
    let mut session = session_on(&device, 1, blue_background());
    let mut cloud = PointCloud::new();
    let entity = cloud.push_group(vec![red_dot(Vec3::ZERO)], Mat4::IDENTITY);
    session.load(&cloud, CompileSettings::default()).unwrap();

    let output = session.frame(&CameraState::default()).unwrap();
    let before = session.pixels(output.report.slot).unwrap();
    assert!(pixel(&before, SIZE.0, 24, 24)[0] > 50);

    // One world unit at distance 5 is about eight pixels
    assert!(cloud.set_transform(entity, Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))));
    session.engine_mut().update_transforms(&cloud).unwrap();
    let output = session.frame(&CameraState::default()).unwrap();
    let after = session.pixels(output.report.slot).unwrap();
    assert_eq!(pixel(&after, SIZE.0, 24, 24), [0, 0, 255, 255]);
    assert!(pixel(&after, SIZE.0, 32, 24)[0] > 50);
}

#[test]
fn test_frame_exports_as_ppm() {
    let device = device(false);
    let mut session = session_on(&device, 2, blue_background());
    session.load(&PointCloud::new(), CompileSettings::default()).unwrap();
    let output = session.frame(&CameraState::default()).unwrap();
    let pixels = session.pixels(output.report.slot).unwrap();

    let mut out = Vec::new();
    write_ppm(&mut out, SIZE.0, SIZE.1, &pixels, 1).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("P3\n48 48\n255\n0 0 255 "));
}

#[test]
fn test_compute_only_device_advances_without_drawing() {
    let device = Arc::new(SoftwareDevice::new(SoftwareConfig {
        presentation: false,
        ..Default::default()
    }));
    let mut session = session_on(&device, 2, EngineConfig::default());
    session
        .load(&PointCloud::from_points(vec![red_dot(Vec3::ZERO)]), CompileSettings::default())
        .unwrap();
    for _ in 0..3 {
        let output = session.frame(&CameraState::default()).unwrap();
        assert!(output.swap_image.is_none());
    }
    assert!(draw_submissions(&device).is_empty());
}
