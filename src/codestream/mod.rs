//! Codestream-level view of a request.
//!
//! - [`RegionParams`] and [`ProgressivenessStage`]: what a request asks for
//! - [`CodestreamStructure`]: geometry and databin layout, from the parser
//! - [`read_codeblocks`] / [`assemble_codestream`]: turning held databins
//!   back into decoder input

mod assembly;
mod params;
mod structure;

pub use assembly::{
    assemble_codestream, layers_held, read_codeblocks, CodeblocksData, CodestreamLayout,
    PrecinctData, MARKER_EOC, MARKER_SOD, MARKER_SOT,
};
pub use params::{normalize_progressiveness, ProgressivenessStage, QualityLayers, RegionParams};
pub use structure::{CodestreamStructure, PrecinctInfo};
