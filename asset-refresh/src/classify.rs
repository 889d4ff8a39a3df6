use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

/// Numbers behind a verdict, reported with every compared pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub contour_count: usize,
    pub largest_area: f64,
    pub edge_pixels: u64,
    pub mean_difference: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub changed: bool,
    pub diagnostics: Diagnostics,
}

/// Area threshold over the external contours of a binary edge map.
#[derive(Debug, Clone, Copy)]
pub struct ChangeClassifier {
    area_threshold: f64,
}

impl ChangeClassifier {
    pub fn new(area_threshold: f64) -> Self {
        Self { area_threshold }
    }

    pub fn area_threshold(&self) -> f64 {
        self.area_threshold
    }

    /// `changed` iff some external contour encloses strictly more than the
    /// threshold. Equality does not count.
    pub fn classify(&self, edge_map: &GrayImage) -> Verdict {
        let areas = external_contour_areas(edge_map);
        let largest_area = areas.iter().copied().fold(0.0, f64::max);
        let changed = areas.iter().any(|area| *area > self.area_threshold);

        Verdict {
            changed,
            diagnostics: Diagnostics {
                contour_count: areas.len(),
                largest_area,
                edge_pixels: edge_map.pixels().filter(|p| p[0] > 0).count() as u64,
                mean_difference: 0.0,
            },
        }
    }
}

/// Enclosed area of every outermost contour in `edge_map`. Contours nested
/// inside another contour's hole are ignored.
pub fn external_contour_areas(edge_map: &GrayImage) -> Vec<f64> {
    find_contours::<i32>(edge_map)
        .into_iter()
        .filter(|contour| matches!(contour.border_type, BorderType::Outer) && contour.parent.is_none())
        .map(|contour| polygon_area(&contour.points))
        .collect()
}

/// Shoelace area of the closed polygon through `points`.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    (twice as f64 / 2.0).abs()
}
