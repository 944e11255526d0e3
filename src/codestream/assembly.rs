//! Read-back of precinct data and codestream assembly from databins.
//!
//! A JPIP client never receives a codestream as such: it receives databins.
//! To decode, the client rebuilds a codestream the decoder understands:
//!
//! ```text
//!   main header databin            (SOC, SIZ, COD, QCD, ...)
//!   for each tile:
//!     SOT marker segment           (rebuilt, Psot covers the tile-part)
//!     tile header databin
//!     SOD
//!     precinct packet data         (complete quality layers only)
//!   EOC
//! ```
//!
//! Packet data is emitted precinct after precinct in the order given by the
//! codestream structure.

use bytes::{BufMut, Bytes, BytesMut};

use crate::databin::{ByteRangeStore, CopyOptions, DatabinId, Databins};
use crate::error::DatabinError;

use super::structure::PrecinctInfo;

/// Start of tile-part marker.
pub const MARKER_SOT: u16 = 0xFF90;

/// Start of data marker.
pub const MARKER_SOD: u16 = 0xFF93;

/// End of codestream marker.
pub const MARKER_EOC: u16 = 0xFFD9;

/// Length field of the SOT marker segment (excluding the marker itself).
const SOT_SEGMENT_LENGTH: u16 = 10;

/// Packet data of one precinct, cut at a quality layer boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecinctData {
    pub tile: u32,
    pub info: PrecinctInfo,
    pub quality_layers: u32,
    pub data: Bytes,
}

/// Packet data of all precincts of a region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeblocksData {
    pub precincts: Vec<PrecinctData>,

    /// Fewest complete quality layers over the returned precincts
    pub min_quality_layers: u32,
}

/// Number of complete quality layers a databin holds for a precinct.
pub fn layers_held(store: Option<&ByteRangeStore>, precinct: &PrecinctInfo, total_layers: u32) -> u32 {
    let Some(store) = store else {
        return 0;
    };

    if store.is_all_databin_loaded() {
        return total_layers;
    }

    let prefix = store.contiguous_length_from_start();
    precinct
        .layer_ends
        .iter()
        .take_while(|&&end| end <= prefix)
        .count() as u32
}

/// Databin offset where the packet data of the first `layers` layers ends.
fn layers_end_offset(store: &ByteRangeStore, precinct: &PrecinctInfo, layers: u32) -> usize {
    if layers == 0 {
        return 0;
    }

    match precinct.layer_ends.get(layers as usize - 1) {
        Some(&end) => end,
        None => store.contiguous_length_from_start(),
    }
}

fn copy_precinct(
    store: Option<&ByteRangeStore>,
    precinct: &PrecinctInfo,
    layers: u32,
) -> Result<Bytes, DatabinError> {
    let Some(store) = store else {
        return Ok(Bytes::new());
    };

    let end = layers_end_offset(store, precinct, layers);
    let mut data = vec![0u8; end];
    let copied = store
        .copy_bytes(&mut data, 0, CopyOptions::new().max_length(end))?
        .unwrap_or(0);
    data.truncate(copied);
    Ok(Bytes::from(data))
}

/// Collect the complete quality layers held for each precinct, up to
/// `max_layers`.
pub fn read_codeblocks(
    databins: &Databins,
    precincts: &[PrecinctInfo],
    max_layers: u32,
    total_layers: u32,
) -> Result<CodeblocksData, DatabinError> {
    let mut result = CodeblocksData {
        precincts: Vec::with_capacity(precincts.len()),
        min_quality_layers: max_layers,
    };

    for precinct in precincts {
        let store = databins.get(&precinct.databin);
        let layers = layers_held(store, precinct, total_layers).min(max_layers);
        let data = copy_precinct(store, precinct, layers)?;

        result.min_quality_layers = result.min_quality_layers.min(layers);
        result.precincts.push(PrecinctData {
            tile: precinct.tile,
            info: precinct.clone(),
            quality_layers: layers,
            data,
        });
    }

    Ok(result)
}

/// Copy a whole databin, or `None` if it is not complete yet.
fn read_whole(databins: &Databins, id: &DatabinId) -> Result<Option<Vec<u8>>, DatabinError> {
    let Some(store) = databins.get(id) else {
        return Ok(None);
    };
    let Some(length) = store.databin_length_if_known() else {
        return Ok(None);
    };

    let mut data = vec![0u8; length];
    let copied = store.copy_bytes(&mut data, 0, CopyOptions::new().force_all())?;
    Ok(copied.map(|_| data))
}

/// Input of [`assemble_codestream`].
pub struct CodestreamLayout<'a> {
    pub main_header: DatabinId,
    pub tiles: Vec<(u32, DatabinId)>,
    pub precincts: &'a [PrecinctInfo],
}

/// Rebuild a decodable codestream from the databins held.
///
/// Returns `None` while the main header or a tile header is incomplete.
/// With `headers_only`, tiles carry no packet data.
pub fn assemble_codestream(
    databins: &Databins,
    layout: &CodestreamLayout<'_>,
    headers_only: bool,
    max_layers: u32,
    total_layers: u32,
) -> Result<Option<Bytes>, DatabinError> {
    let Some(main_header) = read_whole(databins, &layout.main_header)? else {
        return Ok(None);
    };

    let mut out = BytesMut::with_capacity(main_header.len());
    out.extend_from_slice(&main_header);

    for &(tile, header_id) in &layout.tiles {
        let Some(tile_header) = read_whole(databins, &header_id)? else {
            return Ok(None);
        };

        let mut packets = BytesMut::new();
        if !headers_only {
            for precinct in layout.precincts.iter().filter(|p| p.tile == tile) {
                let store = databins.get(&precinct.databin);
                let layers = layers_held(store, precinct, total_layers).min(max_layers);
                packets.extend_from_slice(&copy_precinct(store, precinct, layers)?);
            }
        }

        // SOT (2 + 10) + tile header + SOD (2) + packets
        let tile_part_length = 12 + tile_header.len() + 2 + packets.len();
        let isot = u16::try_from(tile).map_err(|_| DatabinError::FieldOverflow {
            field: "Isot",
            value: u64::from(tile),
        })?;
        let psot = u32::try_from(tile_part_length).map_err(|_| DatabinError::FieldOverflow {
            field: "Psot",
            value: tile_part_length as u64,
        })?;

        out.put_u16(MARKER_SOT);
        out.put_u16(SOT_SEGMENT_LENGTH);
        out.put_u16(isot);
        out.put_u32(psot);
        out.put_u8(0);
        out.put_u8(1);
        out.extend_from_slice(&tile_header);
        out.put_u16(MARKER_SOD);
        out.extend_from_slice(&packets);
    }

    out.put_u16(MARKER_EOC);
    Ok(Some(out.freeze()))
}
