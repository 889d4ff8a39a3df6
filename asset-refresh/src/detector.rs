use crate::classify::{ChangeClassifier, Verdict};
use crate::config::DetectorConfig;
use crate::difference::{DifferenceEngine, DifferenceMaps};
use crate::normalize::Normalizer;
use crate::types::Result;
use image::{DynamicImage, GrayImage};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Normalizer → difference engine → classifier, configured once.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    normalizer: Normalizer,
    engine: DifferenceEngine,
    classifier: ChangeClassifier,
    debug_dir: Option<PathBuf>,
}

impl ChangeDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            normalizer: Normalizer::new(config.canonical_size, config.policy),
            engine: DifferenceEngine::from_config(config),
            classifier: ChangeClassifier::new(config.area_threshold),
            debug_dir: config.debug_dir.clone(),
        })
    }

    pub fn detect(&self, new: &DynamicImage, reference: &DynamicImage) -> Verdict {
        self.detect_tagged(new, reference, "comparison")
    }

    /// Like `detect`; `tag` names the debug dump files of this comparison.
    pub fn detect_tagged(&self, new: &DynamicImage, reference: &DynamicImage, tag: &str) -> Verdict {
        let (new_gray, reference_gray) = self.normalizer.normalize_pair(new, reference);
        let maps = self.engine.run(&new_gray, &reference_gray);

        if let Some(dir) = &self.debug_dir {
            dump_maps(dir, tag, &maps);
        }

        let mut verdict = self.classifier.classify(maps.edge_map());
        verdict.diagnostics.mean_difference = maps.mean_difference();

        debug!(
            "Detection '{}': changed={} contours={} largest_area={:.1} threshold={}",
            tag,
            verdict.changed,
            verdict.diagnostics.contour_count,
            verdict.diagnostics.largest_area,
            self.classifier.area_threshold()
        );
        verdict
    }
}

fn dump_maps(dir: &Path, tag: &str, maps: &DifferenceMaps) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Cannot create debug directory {}: {}", dir.display(), e);
        return;
    }

    let prefix: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();

    let mut stages: Vec<(&str, &GrayImage)> = vec![
        ("diff", &maps.difference),
        ("blurred_diff", &maps.blurred),
        ("edges", &maps.edges),
    ];
    if let Some(closed) = &maps.closed {
        stages.push(("closed_edges", closed));
    }

    for (stage, image) in stages {
        let path = dir.join(format!("{}_{}.png", prefix, stage));
        if let Err(e) = image.save(&path) {
            warn!("Failed to write debug image {}: {}", path.display(), e);
        }
    }
}
