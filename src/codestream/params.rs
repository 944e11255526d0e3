//! Region parameters and progressiveness stages of a request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RequestError;

use super::structure::CodestreamStructure;

/// A quality threshold: a number of quality layers, or everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLayers {
    Count(u32),
    Max,
}

impl QualityLayers {
    /// Whether `layers` reached (and `fully_loaded`) satisfy this threshold.
    pub fn is_satisfied(&self, layers: u32, fully_loaded: bool) -> bool {
        match self {
            QualityLayers::Count(count) => fully_loaded || layers >= *count,
            QualityLayers::Max => fully_loaded,
        }
    }
}

impl fmt::Display for QualityLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLayers::Count(count) => write!(f, "{}", count),
            QualityLayers::Max => write!(f, "max"),
        }
    }
}

/// One threshold at which a progressive request hands control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressivenessStage {
    pub min_num_quality_layers: QualityLayers,
}

impl ProgressivenessStage {
    pub fn layers(count: u32) -> Self {
        Self {
            min_num_quality_layers: QualityLayers::Count(count),
        }
    }

    pub fn max() -> Self {
        Self {
            min_num_quality_layers: QualityLayers::Max,
        }
    }
}

/// Region of the image a request covers, in pixels of the requested
/// resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionParams {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x_exclusive: u32,
    pub max_y_exclusive: u32,

    /// Resolution levels discarded from the full-resolution image
    pub num_resolution_levels_to_cut: u32,

    /// Upper bound on the quality layers fetched (all layers if `None`)
    pub quality: Option<u32>,
}

impl RegionParams {
    pub fn new(min_x: u32, min_y: u32, max_x_exclusive: u32, max_y_exclusive: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x_exclusive,
            max_y_exclusive,
            num_resolution_levels_to_cut: 0,
            quality: None,
        }
    }

    pub fn with_resolution_levels_to_cut(mut self, levels: u32) -> Self {
        self.num_resolution_levels_to_cut = levels;
        self
    }

    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Check the region against the codestream geometry.
    pub fn validate(&self, structure: &dyn CodestreamStructure) -> Result<(), RequestError> {
        if self.min_x >= self.max_x_exclusive || self.min_y >= self.max_y_exclusive {
            return Err(RequestError::Argument(format!(
                "empty region [{}, {}) x [{}, {})",
                self.min_x, self.max_x_exclusive, self.min_y, self.max_y_exclusive
            )));
        }

        let levels = structure.num_resolution_levels();
        if self.num_resolution_levels_to_cut >= levels {
            return Err(RequestError::Argument(format!(
                "cannot cut {} resolution levels from {}",
                self.num_resolution_levels_to_cut, levels
            )));
        }

        let (width, height) = structure.level_size(self.num_resolution_levels_to_cut);
        if self.max_x_exclusive > width || self.max_y_exclusive > height {
            return Err(RequestError::Argument(format!(
                "region ends at ({}, {}) outside level size {}x{}",
                self.max_x_exclusive, self.max_y_exclusive, width, height
            )));
        }

        if let Some(quality) = self.quality {
            let total = structure.num_quality_layers();
            if quality == 0 || quality > total {
                return Err(RequestError::Argument(format!(
                    "quality {} outside 1..={}",
                    quality, total
                )));
            }
        }

        Ok(())
    }

    /// Stage list used when a request does not specify one.
    pub fn default_progressiveness(&self) -> Vec<ProgressivenessStage> {
        match self.quality {
            Some(quality) => vec![ProgressivenessStage::layers(quality)],
            None => vec![ProgressivenessStage::max()],
        }
    }
}

/// Check a stage list and clamp it to the params' quality limit.
///
/// Stages must be non-empty and strictly increasing, with `Max` only last.
/// With a quality limit, counts above it are clamped and `Max` becomes the
/// limit; stages made equal by clamping collapse into one.
pub fn normalize_progressiveness(
    stages: Vec<ProgressivenessStage>,
    params: &RegionParams,
) -> Result<Vec<ProgressivenessStage>, RequestError> {
    if stages.is_empty() {
        return Err(RequestError::Argument(
            "progressiveness needs at least one stage".to_string(),
        ));
    }

    let mut previous: Option<u32> = None;
    for (idx, stage) in stages.iter().enumerate() {
        match stage.min_num_quality_layers {
            QualityLayers::Max if idx + 1 != stages.len() => {
                return Err(RequestError::Argument(
                    "max quality stage must be the last one".to_string(),
                ));
            }
            QualityLayers::Max => {}
            QualityLayers::Count(0) => {
                return Err(RequestError::Argument(
                    "stage quality layers must be positive".to_string(),
                ));
            }
            QualityLayers::Count(count) => {
                if previous.is_some_and(|p| count <= p) {
                    return Err(RequestError::Argument(format!(
                        "stage {} does not increase quality ({} layers)",
                        idx, count
                    )));
                }
                previous = Some(count);
            }
        }
    }

    let Some(limit) = params.quality else {
        return Ok(stages);
    };

    let mut normalized: Vec<ProgressivenessStage> = Vec::with_capacity(stages.len());
    for stage in stages {
        let count = match stage.min_num_quality_layers {
            QualityLayers::Count(count) => count.min(limit),
            QualityLayers::Max => limit,
        };
        let stage = ProgressivenessStage::layers(count);
        if normalized.last() != Some(&stage) {
            normalized.push(stage);
        }
    }
    Ok(normalized)
}
