//! Tests for background estimation.

use super::*;
use crate::image::{NoiseKind, PixelData};

fn image_of(data: &[f32], width: usize, height: usize) -> Image<'_> {
    Image::new(PixelData::F32(data), width, height).unwrap()
}

#[test]
fn test_constant_image() {
    let data = vec![0.0f32; 64 * 64];
    let image = image_of(&data, 64, 64);
    let bkg = Background::new(&image, &BackgroundConfig::default()).unwrap();

    assert_eq!(bkg.global(), 0.0);
    assert_eq!(bkg.global_rms(), 0.0);

    let mut out = data.clone();
    bkg.subtract_from(&mut PixelDataMut::F32(&mut out)).unwrap();
    for &v in &out {
        assert!(v.abs() < 1e-6, "residual {v}");
    }
}

#[test]
fn test_constant_nonzero_level() {
    let data = vec![7.25f32; 128 * 96];
    let image = image_of(&data, 128, 96);
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    assert!((bkg.global() - 7.25).abs() < 1e-5);
    assert!(bkg.global_rms() < 1e-5);
    for &(x, y) in &[(0, 0), (64, 48), (127, 95)] {
        assert!((bkg.pixel(x, y) - 7.25).abs() < 1e-5);
    }
}

#[test]
fn test_gradient_preserved() {
    let width = 128;
    let height = 128;
    let data: Vec<f32> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x + y) as f32 / 64.0))
        .collect();
    let image = image_of(&data, width, height);
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    let mut first = vec![0.0f32; width];
    let mut last = vec![0.0f32; width];
    bkg.line_f32(4, &mut first);
    bkg.line_f32(height - 4, &mut last);
    assert!(last[width / 2] > first[width / 2], "gradient lost");
    assert!(first[width - 4] > first[4], "gradient lost along x");
}

#[test]
fn test_robust_to_bright_sources() {
    let width = 128;
    let height = 128;
    let mut data = vec![10.0f32; width * height];
    // A bright blob contaminating a few percent of one tile.
    for y in 40..48 {
        for x in 40..48 {
            data[y * width + x] = 500.0;
        }
    }
    let image = image_of(&data, width, height);
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(
        (bkg.pixel(44, 44) - 10.0).abs() < 1.0,
        "background pulled to {}",
        bkg.pixel(44, 44)
    );
    assert!((bkg.global() - 10.0).abs() < 0.5);
}

#[test]
fn test_masked_tile_filled_from_neighbors() {
    let width = 96;
    let height = 96;
    let data = vec![3.0f32; width * height];
    // Mask out one whole tile.
    let mut mask = vec![0u8; width * height];
    for y in 0..32 {
        for x in 0..32 {
            mask[y * width + x] = 1;
        }
    }
    let image = Image::new(PixelData::F32(&data), width, height)
        .unwrap()
        .with_mask(PixelData::U8(&mask), 0.0)
        .unwrap();
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    assert!((bkg.pixel(8, 8) - 3.0).abs() < 1e-5);
}

#[test]
fn test_sentinel_pixels_ignored() {
    let width = 64;
    let height = 64;
    let mut data = vec![1.5f32; width * height];
    data[100] = f32::NAN;
    data[200] = -1e31;
    let image = image_of(&data, width, height);
    let bkg = Background::new(&image, &BackgroundConfig::default()).unwrap();
    assert!((bkg.global() - 1.5).abs() < 1e-5);
}

#[test]
fn test_image_smaller_than_tile_rejected() {
    let data = vec![0.0f32; 32 * 32];
    let image = image_of(&data, 32, 32);
    let err = Background::new(&image, &BackgroundConfig::default()).unwrap_err();
    assert!(matches!(err, Error::IllegalArg { .. }));
}

#[test]
fn test_integer_output_rejected() {
    let data = vec![0.0f32; 64 * 64];
    let image = image_of(&data, 64, 64);
    let bkg = Background::new(&image, &BackgroundConfig::default()).unwrap();

    let mut out = vec![0i32; 64 * 64];
    let err = bkg.array(&mut PixelDataMut::I32(&mut out)).unwrap_err();
    assert!(matches!(err, Error::UnsupportedDtype { .. }));
}

#[test]
fn test_f64_output_supported() {
    let data = vec![2.0f32; 64 * 64];
    let image = image_of(&data, 64, 64);
    let bkg = Background::new(&image, &BackgroundConfig::default()).unwrap();

    let mut out = vec![0.0f64; 64 * 64];
    bkg.array(&mut PixelDataMut::F64(&mut out)).unwrap();
    for &v in &out {
        assert!((v - 2.0).abs() < 1e-5);
    }

    let mut line = vec![5.0f64; 64];
    bkg.subtract_line(0, &mut PixelDataMut::F64(&mut line)).unwrap();
    for &v in &line {
        assert!((v - 3.0).abs() < 1e-5);
    }
}

#[test]
fn test_line_matches_array() {
    let width = 96;
    let height = 64;
    let data: Vec<f32> = (0..height)
        .flat_map(|y| (0..width).map(move |x| 5.0 + 0.01 * (x * y) as f32))
        .collect();
    let image = image_of(&data, width, height);
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    let mut full = vec![0.0f32; width * height];
    bkg.array(&mut PixelDataMut::F32(&mut full)).unwrap();

    for y in [0, height / 2, height - 1] {
        let mut row = vec![0.0f32; width];
        bkg.line(y, &mut PixelDataMut::F32(&mut row)).unwrap();
        assert_eq!(&full[y * width..(y + 1) * width], &row[..]);
    }
}

#[test]
fn test_rms_reflects_noise_scale() {
    let width = 64;
    let height = 64;
    // Deterministic checkerboard-ish variation around 10 with amplitude 1.
    let data: Vec<f32> = (0..width * height)
        .map(|i| 10.0 + if (i / 3) % 2 == 0 { 1.0 } else { -1.0 })
        .collect();
    let image = image_of(&data, width, height);
    let bkg = Background::new(
        &image,
        &BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(bkg.global_rms() > 0.5 && bkg.global_rms() < 1.5);
    let mut row = vec![0.0f32; width];
    bkg.rms_line_f32(10, &mut row);
    assert!(row.iter().all(|&v| v > 0.5 && v < 1.5));
}

#[test]
fn test_noise_plane_does_not_affect_background() {
    // The noise plane feeds thresholding, not the background model itself.
    let data = vec![4.0f32; 64 * 64];
    let noise = vec![2.0f32; 64 * 64];
    let plain = image_of(&data, 64, 64);
    let with_noise = Image::new(PixelData::F32(&data), 64, 64)
        .unwrap()
        .with_noise_array(PixelData::F32(&noise), NoiseKind::Stddev)
        .unwrap();

    let a = Background::new(&plain, &BackgroundConfig::default()).unwrap();
    let b = Background::new(&with_noise, &BackgroundConfig::default()).unwrap();
    assert_eq!(a.global(), b.global());
    assert_eq!(a.global_rms(), b.global_rms());
}
