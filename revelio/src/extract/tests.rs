//! Extraction pipeline tests.
//!
//! Tests that call [`extract`] share a process lock: the tuning knobs in
//! [`crate::tunables`] are process-wide, so tests that shrink them must not
//! overlap with the rest of the suite.

use std::sync::{Mutex, MutexGuard};

use super::*;
use crate::image::{NoiseKind, PixelData};
use crate::tunables;

static EXTRACT_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    EXTRACT_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Render Gaussian sources `(x, y, amplitude, sigma)` onto a zero field.
fn gaussian_field(
    width: usize,
    height: usize,
    sources: &[(f64, f64, f64, f64)],
) -> Vec<f32> {
    let mut data = vec![0.0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut v = 0.0f64;
            for &(sx, sy, amp, sigma) in sources {
                let dx = x as f64 - sx;
                let dy = y as f64 - sy;
                v += amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
            data[y * width + x] += v as f32;
        }
    }
    data
}

fn absolute_config(thresh: f64, minarea: usize) -> ExtractConfig {
    ExtractConfig {
        thresh,
        thresh_kind: ThreshKind::Absolute,
        minarea,
        kernel: None,
        ..Default::default()
    }
}

#[test]
fn test_constant_image_yields_no_objects() {
    let _guard = lock();
    let data = vec![0.0f32; 64 * 64];
    let image = Image::new(PixelData::F32(&data), 64, 64).unwrap();
    let catalog = extract(&image, &absolute_config(1.0, 5)).unwrap();
    assert!(catalog.is_empty());
}

#[test]
fn test_single_gaussian_source() {
    let _guard = lock();
    let data = gaussian_field(32, 32, &[(16.0, 16.0, 10.0, 2.0)]);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();
    let catalog = extract(&image, &absolute_config(3.0, 5)).unwrap();

    assert_eq!(catalog.len(), 1);
    assert!((catalog.x[0] - 16.0).abs() < 0.05, "x = {}", catalog.x[0]);
    assert!((catalog.y[0] - 16.0).abs() < 0.05, "y = {}", catalog.y[0]);
    assert!(catalog.tnpix[0] >= 5);
    assert_eq!(catalog.tnpix[0], catalog.npix[0]);

    // Symmetric source: equal axes, and well under the full sigma of 2
    // because the isophotal footprint truncates the profile.
    assert!((catalog.a[0] - catalog.b[0]).abs() < 0.05);
    assert!(catalog.a[0] > 1.0 && catalog.a[0] < 2.5, "a = {}", catalog.a[0]);

    assert_eq!(catalog.flags[0] & OBJ_TRUNC, 0);
    assert_eq!(catalog.flags[0] & OBJ_MERGED, 0);

    // Bounding box and peak agree with the injected source.
    assert!(catalog.xmin[0] <= 16 && 16 <= catalog.xmax[0]);
    assert_eq!((catalog.xpeak[0], catalog.ypeak[0]), (16, 16));
    assert!((catalog.peak[0] - 10.0).abs() < 0.1);
}

#[test]
fn test_heterogeneous_noise_conv_vs_matched() {
    let _guard = lock();
    let width = 16;
    let height = 16;

    // Noise sigma 1 on and below the diagonal, 4 above it.
    let sigma: Vec<f32> = (0..height)
        .flat_map(|y| (0..width).map(move |x| if x > y { 4.0 } else { 1.0 }))
        .collect();

    // A kernel-shaped source of amplitude 3 at the center.
    let shape = [
        (0isize, 0isize, 1.0f32),
        (1, 0, 0.5),
        (-1, 0, 0.5),
        (0, 1, 0.5),
        (0, -1, 0.5),
    ];
    let mut data = vec![0.0f32; width * height];
    for &(dx, dy, w) in &shape {
        let x = (8 + dx) as usize;
        let y = (8 + dy) as usize;
        data[y * width + x] = 3.0 * w;
    }

    // Same shape as the source, normalized to unit sum.
    let kernel = Kernel::new(
        vec![0.0, 0.5, 0.0, 0.5, 1.0, 0.5, 0.0, 0.5, 0.0]
            .into_iter()
            .map(|v| v / 3.0)
            .collect(),
        3,
        3,
    )
    .unwrap();

    let image = Image::new(PixelData::F32(&data), width, height)
        .unwrap()
        .with_noise_array(PixelData::F32(&sigma), NoiseKind::Stddev)
        .unwrap();

    let base = ExtractConfig {
        thresh: 3.0,
        thresh_kind: ThreshKind::Relative,
        minarea: 1,
        kernel: Some(kernel),
        ..Default::default()
    };

    let conv_catalog = extract(
        &image,
        &ExtractConfig {
            filter_mode: FilterMode::Conv,
            ..base.clone()
        },
    )
    .unwrap();
    assert_eq!(conv_catalog.len(), 0, "convolution should stay below 3 sigma");

    let matched_catalog = extract(
        &image,
        &ExtractConfig {
            filter_mode: FilterMode::Matched,
            ..base
        },
    )
    .unwrap();
    assert_eq!(matched_catalog.len(), 1, "matched filter should recover the source");
    assert_eq!(
        (matched_catalog.xcpeak[0], matched_catalog.ycpeak[0]),
        (8, 8)
    );
}

#[test]
fn test_two_blended_sources_deblend() {
    let _guard = lock();
    let sources = [(14.0, 16.0, 10.0, 0.9), (17.0, 16.0, 7.0, 0.9)];
    let data = gaussian_field(32, 32, &sources);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();

    let split = extract(
        &image,
        &ExtractConfig {
            deblend_cont: 0.005,
            ..absolute_config(1.0, 5)
        },
    )
    .unwrap();
    assert_eq!(split.len(), 2, "low contrast must separate the pair");
    for i in 0..2 {
        assert_ne!(split.flags[i] & OBJ_MERGED, 0, "children carry MERGED");
    }
    let mut xs = [split.x[0], split.x[1]];
    xs.sort_by(f64::total_cmp);
    assert!((xs[0] - 14.0).abs() < 0.5, "first peak at {}", xs[0]);
    assert!((xs[1] - 17.0).abs() < 0.5, "second peak at {}", xs[1]);

    let merged = extract(
        &image,
        &ExtractConfig {
            deblend_cont: 0.5,
            ..absolute_config(1.0, 5)
        },
    )
    .unwrap();
    assert_eq!(merged.len(), 1, "high contrast must keep the pair merged");
    assert_eq!(merged.flags[0] & OBJ_MERGED, 0);
}

#[test]
fn test_edge_source_flagged_truncated() {
    let _guard = lock();
    let data = gaussian_field(32, 32, &[(1.0, 16.0, 10.0, 1.2)]);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();
    let catalog = extract(&image, &absolute_config(1.0, 5)).unwrap();

    assert_eq!(catalog.len(), 1);
    assert_ne!(catalog.flags[0] & OBJ_TRUNC, 0);
    assert_eq!(catalog.xmin[0], 0);
}

#[test]
fn test_pixstack_exhaustion() {
    let _guard = lock();
    let data = vec![1.0f32; 32 * 32];
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();

    tunables::set_extract_pixstack(100);
    let result = extract(&image, &absolute_config(0.5, 1));
    tunables::set_extract_pixstack(tunables::DEFAULT_PIXSTACK);

    assert!(matches!(result, Err(Error::PixstackFull { capacity: 100 })));
}

#[test]
fn test_object_limit_exhaustion() {
    let _guard = lock();
    // Three parallel vertical stripes are alive at once during the scan.
    let mut data = vec![0.0f32; 32 * 32];
    for y in 5..15 {
        for x in [2usize, 10, 18] {
            data[y * 32 + x] = 5.0;
        }
    }
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();

    tunables::set_extract_object_limit(2);
    let result = extract(&image, &absolute_config(1.0, 1));
    tunables::set_extract_object_limit(tunables::DEFAULT_OBJECT_LIMIT);

    assert!(matches!(result, Err(Error::ObjectsLimit { capacity: 2 })));

    // With the default limit the same image yields three objects.
    let catalog = extract(&image, &absolute_config(1.0, 1)).unwrap();
    assert_eq!(catalog.len(), 3);
}

#[test]
fn test_sub_object_limit_exhaustion() {
    let _guard = lock();
    let sources = [(14.0, 16.0, 10.0, 0.9), (17.0, 16.0, 7.0, 0.9)];
    let data = gaussian_field(32, 32, &sources);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();

    tunables::set_sub_object_limit(1);
    let result = extract(&image, &absolute_config(1.0, 5));
    tunables::set_sub_object_limit(tunables::DEFAULT_SUB_OBJECT_LIMIT);

    assert!(matches!(result, Err(Error::DeblendOverflow { capacity: 1 })));
}

#[test]
fn test_extraction_is_deterministic() {
    let _guard = lock();
    let sources = [
        (8.0, 9.0, 12.0, 1.4),
        (20.0, 22.0, 8.0, 1.8),
        (25.0, 7.0, 5.0, 1.1),
        (14.0, 17.0, 6.0, 1.3),
    ];
    let data = gaussian_field(32, 32, &sources);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();
    let config = absolute_config(0.8, 3);

    let a = extract(&image, &config).unwrap();
    let b = extract(&image, &config).unwrap();

    assert_eq!(a.len(), b.len());
    assert_eq!(a.x, b.x);
    assert_eq!(a.y, b.y);
    assert_eq!(a.x2, b.x2);
    assert_eq!(a.cflux, b.cflux);
    assert_eq!(a.flags, b.flags);
    for i in 0..a.len() {
        assert_eq!(a.pixels(i), b.pixels(i));
    }
}

#[test]
fn test_pixel_sets_disjoint_and_complete() {
    let _guard = lock();
    let sources = [(10.0, 10.0, 10.0, 1.5), (22.0, 20.0, 9.0, 1.5)];
    let data = gaussian_field(32, 32, &sources);
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();
    let catalog = extract(&image, &absolute_config(1.0, 5)).unwrap();

    assert!(catalog.len() >= 2);
    let mut seen = vec![false; 32 * 32];
    let mut total = 0usize;
    for i in 0..catalog.len() {
        let pixels = catalog.pixels(i);
        assert_eq!(pixels.len(), catalog.npix[i]);
        assert!(pixels.windows(2).all(|w| w[0] < w[1]), "pixels sorted");
        for &idx in pixels {
            assert!(idx < 32 * 32);
            assert!(!seen[idx], "pixel {idx} in two objects");
            seen[idx] = true;
        }
        total += pixels.len();
    }
    assert_eq!(total, catalog.npix.iter().sum::<usize>());

    // Bounding boxes and barycenters are consistent.
    for i in 0..catalog.len() {
        assert!(catalog.xmin[i] as f64 <= catalog.x[i] && catalog.x[i] <= catalog.xmax[i] as f64);
        assert!(catalog.ymin[i] as f64 <= catalog.y[i] && catalog.y[i] <= catalog.ymax[i] as f64);
        assert!(catalog.a[i] >= catalog.b[i] && catalog.b[i] >= 0.0);
        let theta = catalog.theta[i] as f64;
        assert!((-std::f64::consts::FRAC_PI_2..=std::f64::consts::FRAC_PI_2).contains(&theta));
        assert!(catalog.tnpix[i] <= catalog.npix[i]);
    }
}

#[test]
fn test_relative_threshold_without_noise_fails() {
    let _guard = lock();
    let data = vec![0.0f32; 16 * 16];
    let image = Image::new(PixelData::F32(&data), 16, 16).unwrap();
    let config = ExtractConfig {
        thresh: 1.5,
        thresh_kind: ThreshKind::Relative,
        kernel: None,
        ..Default::default()
    };
    assert!(matches!(extract(&image, &config), Err(Error::RelthreshNoNoise)));
}

#[test]
fn test_relative_threshold_with_scalar_noise() {
    let _guard = lock();
    let data = gaussian_field(32, 32, &[(16.0, 16.0, 10.0, 1.5)]);
    let image = Image::new(PixelData::F32(&data), 32, 32)
        .unwrap()
        .with_noise_scalar(2.0, NoiseKind::Stddev);
    let config = ExtractConfig {
        thresh: 1.5, // 1.5 sigma = 3.0 in data units
        thresh_kind: ThreshKind::Relative,
        minarea: 5,
        kernel: None,
        ..Default::default()
    };
    let catalog = extract(&image, &config).unwrap();
    assert_eq!(catalog.len(), 1);
    assert!((catalog.thresh[0] - 3.0).abs() < 1e-6);
}

#[test]
fn test_u8_image_plane() {
    let _guard = lock();
    let mut data = vec![0u8; 32 * 32];
    for (dx, dy, v) in [(0i32, 0i32, 200u8), (1, 0, 120), (-1, 0, 120), (0, 1, 120), (0, -1, 120)] {
        let x = (16 + dx) as usize;
        let y = (16 + dy) as usize;
        data[y * 32 + x] = v;
    }
    let image = Image::new(PixelData::U8(&data), 32, 32).unwrap();
    let catalog = extract(&image, &absolute_config(50.0, 3)).unwrap();
    assert_eq!(catalog.len(), 1);
    assert!((catalog.peak[0] - 200.0).abs() < 1e-6);
}

#[test]
fn test_masked_region_not_detected() {
    let _guard = lock();
    let data = gaussian_field(32, 32, &[(10.0, 10.0, 10.0, 1.5), (22.0, 22.0, 10.0, 1.5)]);
    // Mask out the second source entirely.
    let mut mask = vec![0u8; 32 * 32];
    for y in 16..32 {
        for x in 16..32 {
            mask[y * 32 + x] = 1;
        }
    }
    let image = Image::new(PixelData::F32(&data), 32, 32)
        .unwrap()
        .with_mask(PixelData::U8(&mask), 0.0)
        .unwrap();
    let catalog = extract(&image, &absolute_config(1.0, 5)).unwrap();
    assert_eq!(catalog.len(), 1);
    assert!((catalog.x[0] - 10.0).abs() < 0.1);
}

#[test]
fn test_cleaning_absorbs_severed_wing_fragment() {
    let _guard = lock();
    let width = 48;
    let height = 48;
    // A bright source whose footprint is cut by a masked column: the strip
    // beyond the mask becomes a detection of its own, sitting where the
    // bright object's wings alone exceed the threshold. Cleaning must give
    // it back.
    let data = gaussian_field(width, height, &[(24.0, 24.0, 50.0, 3.0)]);
    let mut mask = vec![0u8; width * height];
    for y in 0..height {
        mask[y * width + 30] = 1;
    }
    let image = Image::new(PixelData::F32(&data), width, height)
        .unwrap()
        .with_mask(PixelData::U8(&mask), 0.0)
        .unwrap();

    let base = ExtractConfig {
        deblend_cont: 1.0,
        ..absolute_config(1.0, 3)
    };

    let raw = extract(
        &image,
        &ExtractConfig {
            clean: false,
            ..base.clone()
        },
    )
    .unwrap();
    assert_eq!(raw.len(), 2, "mask should sever the wing fragment");

    let cleaned = extract(&image, &ExtractConfig { clean: true, ..base }).unwrap();
    assert_eq!(cleaned.len(), 1, "fragment should be absorbed");

    // Every unmasked above-threshold pixel is attributed to the survivor.
    let above = data
        .iter()
        .enumerate()
        .filter(|&(idx, &v)| idx % width != 30 && v > 1.0)
        .count();
    assert_eq!(cleaned.npix[0], above);
}

#[test]
fn test_segmap_measurement() {
    let _guard = lock();
    let width = 16;
    let height = 8;
    let mut data = vec![1.0f32; width * height];
    let mut segmap = vec![0i32; width * height];
    // Object 7: a 2x2 block with known flux; object 3: a single row segment.
    for &(x, y) in &[(2usize, 2usize), (3, 2), (2, 3), (3, 3)] {
        segmap[y * width + x] = 7;
        data[y * width + x] = 2.5;
    }
    for x in 10..13 {
        segmap[4 * width + x] = 3;
        data[4 * width + x] = 4.0;
    }

    let image = Image::new(PixelData::F32(&data), width, height)
        .unwrap()
        .with_segmap(Segmap {
            data: PixelData::I32(&segmap),
            ids: Some(&[7, 3]),
        })
        .unwrap();

    let catalog = extract(&image, &ExtractConfig::default()).unwrap();
    assert_eq!(catalog.len(), 2);

    // Entries follow the id list order.
    assert_eq!(catalog.npix[0], 4);
    assert!((catalog.flux[0] - 10.0).abs() < 1e-6);
    assert!((catalog.x[0] - 2.5).abs() < 1e-9);

    assert_eq!(catalog.npix[1], 3);
    assert!((catalog.flux[1] - 12.0).abs() < 1e-6);
    assert!((catalog.y[1] - 4.0).abs() < 1e-9);
}

#[test]
fn test_elongated_source_orientation() {
    let _guard = lock();
    // A horizontal bar: theta near 0, a > b.
    let mut data = vec![0.0f32; 32 * 32];
    for x in 8..24 {
        data[16 * 32 + x] = 5.0;
        data[15 * 32 + x] = 2.0;
        data[17 * 32 + x] = 2.0;
    }
    let image = Image::new(PixelData::F32(&data), 32, 32).unwrap();
    let catalog = extract(
        &image,
        &ExtractConfig {
            deblend_cont: 1.0,
            ..absolute_config(1.0, 5)
        },
    )
    .unwrap();

    assert_eq!(catalog.len(), 1);
    assert!(catalog.a[0] > 2.0 * catalog.b[0], "bar should be elongated");
    assert!(catalog.theta[0].abs() < 0.05);
}
