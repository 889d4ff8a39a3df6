use crate::config::{ClaheConfig, NormalizationPolicy};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};

const BINS: usize = 256;

/// Brings two photos to the same square resolution and a single intensity
/// channel so they can be differenced pixel by pixel.
#[derive(Debug, Clone)]
pub struct Normalizer {
    size: u32,
    policy: NormalizationPolicy,
}

impl Normalizer {
    pub fn new(size: u32, policy: NormalizationPolicy) -> Self {
        Self { size, policy }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn normalize(&self, image: &DynamicImage) -> GrayImage {
        match self.policy {
            NormalizationPolicy::ContrastAdaptive(clahe) => {
                let gray = image.to_luma8();
                let resized = imageops::resize(&gray, self.size, self.size, FilterType::Triangle);
                equalize_local(&resized, clahe)
            }
            NormalizationPolicy::ColorAware => {
                let resized = image.resize_exact(self.size, self.size, FilterType::Triangle);
                stretch_contrast(&resized.to_luma8())
            }
        }
    }

    pub fn normalize_pair(&self, new: &DynamicImage, reference: &DynamicImage) -> (GrayImage, GrayImage) {
        (self.normalize(new), self.normalize(reference))
    }
}

/// Linearly maps the darkest pixel to 0 and the brightest to 255.
/// A flat image is returned unchanged.
pub fn stretch_contrast(image: &GrayImage) -> GrayImage {
    let (lo, hi) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if hi <= lo {
        return image.clone();
    }

    let span = (hi - lo) as f32;
    let mut out = image.clone();
    for p in out.pixels_mut() {
        let v = (p[0] - lo) as f32 * 255.0 / span;
        *p = Luma([v.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into a `tile_grid × tile_grid` grid. Each tile gets its
/// own equalization table from a clipped histogram (clipped counts are spread
/// evenly over all bins), and every pixel is mapped by bilinear interpolation
/// between the tables of the four nearest tile centers.
pub fn equalize_local(image: &GrayImage, config: ClaheConfig) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }

    let grid_x = config.tile_grid.clamp(1, w) as usize;
    let grid_y = config.tile_grid.clamp(1, h) as usize;
    let tile_w = w as f32 / grid_x as f32;
    let tile_h = h as f32 / grid_y as f32;

    let bounds = |index: usize, tile: f32, limit: u32| -> (u32, u32) {
        let start = (index as f32 * tile).floor() as u32;
        let end = (((index + 1) as f32 * tile).floor() as u32).min(limit);
        (start, end.max(start + 1).min(limit))
    };

    let mut luts = vec![[0u8; BINS]; grid_x * grid_y];
    for ty in 0..grid_y {
        let (y0, y1) = bounds(ty, tile_h, h);
        for tx in 0..grid_x {
            let (x0, x1) = bounds(tx, tile_w, w);
            let mut hist = [0u32; BINS];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            luts[ty * grid_x + tx] = tile_lut(&mut hist, area, config.clip_limit);
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let (ty0, ty1, ay) = neighbours(y, tile_h, grid_y);
        for x in 0..w {
            let (tx0, tx1, ax) = neighbours(x, tile_w, grid_x);
            let v = image.get_pixel(x, y)[0] as usize;

            let top = lerp(luts[ty0 * grid_x + tx0][v], luts[ty0 * grid_x + tx1][v], ax);
            let bottom = lerp(luts[ty1 * grid_x + tx0][v], luts[ty1 * grid_x + tx1][v], ax);
            let value = top + (bottom - top) * ay;

            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn tile_lut(hist: &mut [u32; BINS], area: u32, clip_limit: f32) -> [u8; BINS] {
    let mut lut = [0u8; BINS];
    if area == 0 {
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = v as u8;
        }
        return lut;
    }

    let limit = ((clip_limit * area as f32 / BINS as f32) as u32).max(1);
    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }

    let batch = excess / BINS as u32;
    let residual = (excess % BINS as u32) as usize;
    for count in hist.iter_mut() {
        *count += batch;
    }
    if residual > 0 {
        let step = (BINS / residual).max(1);
        for i in (0..BINS).step_by(step).take(residual) {
            hist[i] += 1;
        }
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0u32;
    for (slot, count) in lut.iter_mut().zip(hist.iter()) {
        cdf += count;
        *slot = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

// Indices of the two tiles whose centers bracket `pos`, plus the weight of
// the second one.
fn neighbours(pos: u32, tile: f32, grid: usize) -> (usize, usize, f32) {
    let t = (pos as f32 + 0.5) / tile - 0.5;
    if t <= 0.0 {
        return (0, 0, 0.0);
    }
    let first = (t.floor() as usize).min(grid - 1);
    let second = (first + 1).min(grid - 1);
    let weight = if first == second { 0.0 } else { t - first as f32 };
    (first, second, weight)
}

fn lerp(a: u8, b: u8, t: f32) -> f32 {
    a as f32 + (b as f32 - a as f32) * t
}
