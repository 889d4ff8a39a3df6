use crate::config::DetectorConfig;
use crate::normalize::stretch_contrast;
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::close;

/// Every intermediate of one difference pass, kept for diagnostics and debug
/// dumps.
#[derive(Debug, Clone)]
pub struct DifferenceMaps {
    pub difference: GrayImage,
    pub blurred: GrayImage,
    pub edges: GrayImage,
    pub closed: Option<GrayImage>,
}

impl DifferenceMaps {
    /// The binary map contours are extracted from.
    pub fn edge_map(&self) -> &GrayImage {
        self.closed.as_ref().unwrap_or(&self.edges)
    }

    pub fn mean_difference(&self) -> f32 {
        let count = self.difference.width() as u64 * self.difference.height() as u64;
        if count == 0 {
            return 0.0;
        }
        let total: u64 = self.difference.pixels().map(|p| p[0] as u64).sum();
        total as f32 / count as f32
    }
}

#[derive(Debug, Clone)]
pub struct DifferenceEngine {
    sigma: f32,
    canny_low: f32,
    canny_high: f32,
    closing_radius: Option<u8>,
    stretch_difference: bool,
}

impl DifferenceEngine {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            sigma: config.blur_sigma(),
            canny_low: config.canny_low,
            canny_high: config.canny_high,
            closing_radius: config.closing_kernel_size.map(|size| (size / 2).min(u8::MAX as u32) as u8),
            stretch_difference: config.stretch_difference,
        }
    }

    /// Difference, smooth, and edge-detect two normalized images.
    /// Deterministic for identical inputs.
    pub fn run(&self, new: &GrayImage, reference: &GrayImage) -> DifferenceMaps {
        let mut difference = absolute_difference(new, reference);
        if self.stretch_difference {
            difference = stretch_contrast(&difference);
        }

        let blurred = gaussian_blur_f32(&difference, self.sigma);
        // canny applies its own sigma 1.4 blur and thresholds L2 gradients.
        let edges = canny(&blurred, self.canny_low, self.canny_high);

        // A zero radius closing is the identity.
        let closed = match self.closing_radius {
            Some(radius) if radius > 0 => Some(close(&edges, Norm::LInf, radius)),
            _ => None,
        };

        DifferenceMaps {
            difference,
            blurred,
            edges,
            closed,
        }
    }
}

/// Per-pixel `|a - b|` over the overlapping area of the two images.
pub fn absolute_difference(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let w = a.width().min(b.width());
    let h = a.height().min(b.height());
    ImageBuffer::from_fn(w, h, |x, y| Luma([a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0])]))
}
