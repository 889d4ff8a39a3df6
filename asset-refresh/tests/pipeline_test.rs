use asset_refresh::classify::external_contour_areas;
use asset_refresh::config::{ClaheConfig, NormalizationPolicy};
use asset_refresh::difference::{absolute_difference, DifferenceEngine};
use asset_refresh::hosting::sign_params;
use asset_refresh::normalize::{equalize_local, stretch_contrast, Normalizer};
use asset_refresh::{AppConfig, ChangeClassifier, ChangeDetector, DetectorConfig, DetectorPreset, RecordKind, RefreshError};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use std::collections::{BTreeMap, HashMap};
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    });
}

/// A photo-like scene: horizontal gradient with a couple of shapes.
fn scene(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        Rgb([r, g, 160])
    });
    draw_filled_rect_mut(&mut image, Rect::at(20, 30).of_size(60, 40), Rgb([240, 240, 240]));
    draw_filled_circle_mut(&mut image, (width as i32 - 70, height as i32 - 70), 35, Rgb([30, 90, 30]));
    image
}

fn flat(width: u32, height: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
}

fn with_dark_disk(width: u32, height: u32, value: u8) -> DynamicImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb([value, value, value]));
    draw_filled_circle_mut(&mut image, (width as i32 / 2, height as i32 / 2), 60, Rgb([0, 0, 0]));
    DynamicImage::ImageRgb8(image)
}

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| vars.get(key).cloned()
}

const HOSTING_VARS: [(&str, &str); 3] = [
    ("CLOUDINARY_CLOUD_NAME", "demo"),
    ("CLOUDINARY_API_KEY", "key"),
    ("CLOUDINARY_API_SECRET", "shh-do-not-log"),
];

#[test]
fn test_normalizer_output_is_square_for_both_policies() {
    init_tracing();

    let photo = DynamicImage::ImageRgb8(scene(320, 180));
    for policy in [NormalizationPolicy::ContrastAdaptive(ClaheConfig::default()), NormalizationPolicy::ColorAware] {
        let normalizer = Normalizer::new(128, policy);
        let gray = normalizer.normalize(&photo);
        assert_eq!(gray.dimensions(), (128, 128), "policy {:?}", policy);

        // Aspect ratio is not preserved: a portrait photo lands on the same grid.
        let portrait = DynamicImage::ImageRgb8(scene(90, 260));
        let (a, b) = normalizer.normalize_pair(&photo, &portrait);
        assert_eq!(a.dimensions(), b.dimensions());
    }
}

#[test]
fn test_clahe_keeps_dimensions_and_spreads_low_contrast() {
    let narrow = GrayImage::from_fn(64, 48, |x, _| Luma([100 + (x % 8) as u8]));
    let equalized = equalize_local(&narrow, ClaheConfig::default());
    assert_eq!(equalized.dimensions(), (64, 48));

    let range = |image: &GrayImage| {
        let lo = image.pixels().map(|p| p[0]).min().unwrap();
        let hi = image.pixels().map(|p| p[0]).max().unwrap();
        hi - lo
    };
    assert!(range(&equalized) > range(&narrow), "local equalization should widen an 8-level range");

    // A grid larger than the image is clamped instead of panicking.
    let tiny = GrayImage::from_pixel(3, 2, Luma([50]));
    let out = equalize_local(&tiny, ClaheConfig { clip_limit: 2.0, tile_grid: 8 });
    assert_eq!(out.dimensions(), (3, 2));
}

#[test]
fn test_stretch_contrast_maps_extremes_and_leaves_flat_images() {
    let image = GrayImage::from_fn(4, 1, |x, _| Luma([[60u8, 80, 100, 120][x as usize]]));
    let stretched = stretch_contrast(&image);
    assert_eq!(stretched.get_pixel(0, 0)[0], 0);
    assert_eq!(stretched.get_pixel(3, 0)[0], 255);
    assert!(stretched.get_pixel(1, 0)[0] < stretched.get_pixel(2, 0)[0]);

    let flat = GrayImage::from_pixel(5, 5, Luma([42]));
    assert_eq!(stretch_contrast(&flat), flat);
}

#[test]
fn test_absolute_difference_is_symmetric() {
    let a = GrayImage::from_fn(8, 8, |x, y| Luma([(x * 30 + y) as u8]));
    let b = GrayImage::from_fn(8, 8, |x, y| Luma([(y * 30 + x) as u8]));
    assert_eq!(absolute_difference(&a, &b), absolute_difference(&b, &a));
    assert!(absolute_difference(&a, &a).pixels().all(|p| p[0] == 0));
}

#[test]
fn test_difference_engine_is_silent_on_identical_input() {
    for config in [DetectorConfig::contrast_adaptive(), DetectorConfig::color_aware()] {
        let engine = DifferenceEngine::from_config(&config);
        let gray = Normalizer::new(config.canonical_size, config.policy).normalize(&DynamicImage::ImageRgb8(scene(200, 200)));

        let maps = engine.run(&gray, &gray);
        assert_eq!(maps.mean_difference(), 0.0);
        assert!(maps.edge_map().pixels().all(|p| p[0] == 0));
        assert_eq!(maps.closed.is_some(), config.closing_kernel_size.is_some());
    }
}

#[test]
fn test_classifier_threshold_is_strict() {
    let mut edges = GrayImage::new(40, 40);
    // Pixel centers 10..=20 on both axes enclose a 10 × 10 polygon.
    draw_filled_rect_mut(&mut edges, Rect::at(10, 10).of_size(11, 11), Luma([255]));

    let areas = external_contour_areas(&edges);
    assert_eq!(areas.len(), 1);
    assert!((areas[0] - 100.0).abs() < f64::EPSILON);

    assert!(!ChangeClassifier::new(100.0).classify(&edges).changed);
    assert!(ChangeClassifier::new(99.0).classify(&edges).changed);
}

#[test]
fn test_classifier_ignores_nested_contours_and_empty_maps() {
    let empty = GrayImage::new(30, 30);
    let verdict = ChangeClassifier::new(0.0).classify(&empty);
    assert!(!verdict.changed);
    assert_eq!(verdict.diagnostics.contour_count, 0);
    assert_eq!(verdict.diagnostics.edge_pixels, 0);

    // A hollow frame with a blob inside its hole: only the frame is external.
    let mut nested = GrayImage::new(60, 60);
    draw_filled_rect_mut(&mut nested, Rect::at(5, 5).of_size(50, 50), Luma([255]));
    draw_filled_rect_mut(&mut nested, Rect::at(10, 10).of_size(40, 40), Luma([0]));
    draw_filled_rect_mut(&mut nested, Rect::at(25, 25).of_size(6, 6), Luma([255]));

    let areas = external_contour_areas(&nested);
    assert_eq!(areas.len(), 1);
    assert!((areas[0] - 49.0 * 49.0).abs() < f64::EPSILON);
}

#[test]
fn test_identical_images_are_unchanged_under_both_presets() {
    init_tracing();

    let photo = DynamicImage::ImageRgb8(scene(300, 240));
    for preset in [DetectorPreset::ContrastAdaptive, DetectorPreset::ColorAware] {
        let detector = ChangeDetector::new(&preset.config()).unwrap();
        let first = detector.detect(&photo, &photo);
        let second = detector.detect(&photo, &photo);

        assert!(!first.changed, "{:?} flagged an identical pair", preset);
        assert_eq!(first, second);
        assert_eq!(first.diagnostics.contour_count, 0);
    }
}

#[test]
fn test_large_new_object_is_detected_under_both_presets() {
    init_tracing();

    let reference = flat(400, 400, 200);
    let new = with_dark_disk(400, 400, 200);
    for preset in [DetectorPreset::ContrastAdaptive, DetectorPreset::ColorAware] {
        let detector = ChangeDetector::new(&preset.config()).unwrap();
        let verdict = detector.detect(&new, &reference);
        info!("{:?}: {:?}", preset, verdict.diagnostics);

        assert!(verdict.changed, "{:?} missed a dark disk", preset);
        assert!(verdict.diagnostics.largest_area > preset.config().area_threshold);
        assert!(verdict.diagnostics.mean_difference > 0.0);
    }
}

#[test]
fn test_raising_threshold_never_turns_unchanged_into_changed() {
    let reference = flat(400, 400, 200);
    let new = with_dark_disk(400, 400, 200);

    let base = DetectorConfig::color_aware();
    let largest = ChangeDetector::new(&base).unwrap().detect(&new, &reference).diagnostics.largest_area;
    assert!(largest > 0.0);

    let verdict_at = |threshold: f64| {
        let config = DetectorConfig {
            area_threshold: threshold,
            ..base.clone()
        };
        ChangeDetector::new(&config).unwrap().detect(&new, &reference).changed
    };

    let thresholds = [0.0, largest / 4.0, largest - 1.0, largest, largest * 2.0];
    let verdicts: Vec<bool> = thresholds.iter().map(|t| verdict_at(*t)).collect();
    assert_eq!(verdicts, vec![true, true, true, false, false]);
    assert!(verdicts.windows(2).all(|pair| pair[0] || !pair[1]));
}

#[test]
fn test_debug_dir_receives_stage_images() {
    let dir = tempfile::tempdir().unwrap();
    let config = DetectorConfig {
        debug_dir: Some(dir.path().join("dumps")),
        ..DetectorConfig::contrast_adaptive()
    };
    let detector = ChangeDetector::new(&config).unwrap();
    detector.detect_tagged(&with_dark_disk(200, 200, 180), &flat(200, 200, 180), "42_front_view");

    for stage in ["diff", "blurred_diff", "edges", "closed_edges"] {
        let path = dir.path().join("dumps").join(format!("42_front_view_{}.png", stage));
        assert!(path.exists(), "missing {}", path.display());
    }
}

#[test]
fn test_detector_config_validation() {
    assert!(DetectorConfig::contrast_adaptive().validate().is_ok());
    assert!(DetectorConfig::color_aware().validate().is_ok());

    let invalid = [
        DetectorConfig { blur_kernel_size: 4, ..DetectorConfig::default() },
        DetectorConfig { canonical_size: 0, ..DetectorConfig::default() },
        DetectorConfig { canny_low: 250.0, canny_high: 100.0, ..DetectorConfig::default() },
        DetectorConfig { closing_kernel_size: Some(2), ..DetectorConfig::default() },
        DetectorConfig { area_threshold: -1.0, ..DetectorConfig::default() },
        DetectorConfig {
            policy: NormalizationPolicy::ContrastAdaptive(ClaheConfig { clip_limit: 0.0, tile_grid: 8 }),
            ..DetectorConfig::default()
        },
    ];
    for config in invalid {
        assert!(matches!(config.validate(), Err(RefreshError::Config(_))), "{:?} accepted", config);
        assert!(ChangeDetector::new(&config).is_err());
    }
}

#[test]
fn test_blur_sigma_follows_kernel_width() {
    assert!((DetectorConfig::contrast_adaptive().blur_sigma() - 1.4).abs() < 1e-5);
    assert!((DetectorConfig::color_aware().blur_sigma() - 1.1).abs() < 1e-5);
}

#[test]
fn test_detector_config_deserializes_partial_json() {
    let config: DetectorConfig = serde_json::from_str(r#"{"area_threshold": 75.0, "policy": "color-aware"}"#).unwrap();
    assert_eq!(config.area_threshold, 75.0);
    assert_eq!(config.policy, NormalizationPolicy::ColorAware);
    assert_eq!(config.canonical_size, 500);
}

#[test]
fn test_app_config_from_lookup() {
    let mut vars = HOSTING_VARS.to_vec();
    vars.extend([
        ("RECORD_KIND", "scooter"),
        ("REFRESH_CONCURRENCY", "4"),
        ("DETECTOR_PRESET", "color-aware"),
        ("DETECTOR_AREA_THRESHOLD", "25"),
        ("FETCH_MAX_RETRIES", "3"),
        ("CLOUDINARY_FOLDER", ""),
    ]);
    let config = AppConfig::from_lookup(&lookup_from(&vars)).unwrap();

    assert_eq!(config.record_kind, RecordKind::Scooter);
    assert_eq!(config.concurrency, 4);
    assert_eq!(config.detector.policy, NormalizationPolicy::ColorAware);
    assert_eq!(config.detector.area_threshold, 25.0);
    assert_eq!(config.fetch.max_retries, 3);
    assert!(config.hosting.folder.is_none(), "empty values count as unset");
    assert!(config.database_url.starts_with("postgresql://"));
    assert!(!config.redacted_database_url().contains("asset_password"));
    assert!(!format!("{:?}", config.hosting).contains("shh-do-not-log"));
}

#[test]
fn test_app_config_rejects_bad_values() {
    let missing_secret = lookup_from(&HOSTING_VARS[..2]);
    assert!(matches!(AppConfig::from_lookup(&missing_secret), Err(RefreshError::Config(_))));

    for (key, value) in [
        ("RECORD_KIND", "truck"),
        ("DETECTOR_PRESET", "sharpest"),
        ("DETECTOR_BLUR_KERNEL", "6"),
        ("REFRESH_CONCURRENCY", "many"),
    ] {
        let mut vars = HOSTING_VARS.to_vec();
        vars.push((key, value));
        let result = AppConfig::from_lookup(&lookup_from(&vars));
        assert!(matches!(result, Err(RefreshError::Config(_))), "{}={} accepted", key, value);
    }
}

#[test]
fn test_sign_params_is_stable_hex() {
    let mut params = BTreeMap::new();
    params.insert("timestamp", "1700000000".to_string());
    params.insert("folder", "vehicles".to_string());

    let signature = sign_params(&params, "secret");
    assert_eq!(signature.len(), 64);
    assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(signature, sign_params(&params, "secret"));
    assert_ne!(signature, sign_params(&params, "other"));
}

#[test]
fn test_blur_kernel_controls_difference_smoothing() {
    let reference = flat(300, 300, 200).to_luma8();
    let new = with_dark_disk(300, 300, 200).to_luma8();

    let blurred_with = |kernel: u32| {
        let config = DetectorConfig {
            blur_kernel_size: kernel,
            ..DetectorConfig::color_aware()
        };
        DifferenceEngine::from_config(&config).run(&new, &reference).blurred
    };

    let narrow = blurred_with(3);
    let wide = blurred_with(15);
    assert_ne!(narrow, wide);

    // Just outside the disk edge, a wider kernel pulls in more of the step.
    let outside_x = 150 + 60 + 3;
    assert!(wide.get_pixel(outside_x, 150)[0] > narrow.get_pixel(outside_x, 150)[0]);
}
