//! Structural view of a codestream, supplied by the marker parser.

use crate::databin::DatabinId;

use super::params::RegionParams;

/// A precinct covered by a region, with the databin holding its packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecinctInfo {
    /// Tile the precinct belongs to
    pub tile: u32,

    /// Databin carrying the precinct's packet data
    pub databin: DatabinId,

    /// Databin offset at which each quality layer's packet ends, ascending
    pub layer_ends: Vec<usize>,
}

/// Geometry and databin layout of one image.
///
/// Implemented by the external codestream parser from the main and tile
/// headers.
pub trait CodestreamStructure {
    fn image_width(&self) -> u32;

    fn image_height(&self) -> u32;

    fn num_resolution_levels(&self) -> u32;

    fn num_quality_layers(&self) -> u32;

    /// Tiles intersecting the region, in codestream order.
    fn tiles_in_region(&self, params: &RegionParams) -> Vec<u32>;

    /// Precincts needed to decode the region, in codestream order.
    fn precincts_in_region(&self, params: &RegionParams) -> Vec<PrecinctInfo>;

    /// Image size after discarding `levels_to_cut` resolution levels.
    fn level_size(&self, levels_to_cut: u32) -> (u32, u32) {
        let scale = 1u64 << levels_to_cut.min(31);
        let shrink = |size: u32| ((size as u64 + scale - 1) / scale) as u32;
        (shrink(self.image_width()), shrink(self.image_height()))
    }

    fn main_header_databin(&self) -> DatabinId {
        DatabinId::main_header()
    }

    fn tile_header_databin(&self, tile: u32) -> DatabinId {
        DatabinId::tile_header(tile)
    }
}
