//! Registry of all databins of one image.
//!
//! The external message parser addresses each message body to a databin by
//! its JPIP class and in-class identifier. The registry creates stores on
//! first write and notifies listeners whenever a write changed a databin, so
//! that progressive requests can react to threshold crossings.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::DatabinError;

use super::store::{ByteRangeStore, MessageHeader};

// =============================================================================
// Databin Identity
// =============================================================================

/// JPIP databin classes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatabinClass {
    Precinct,
    ExtendedPrecinct,
    TileHeader,
    Tile,
    MainHeader,
    Metadata,
}

impl DatabinClass {
    /// Class number used in message headers.
    pub fn class_id(&self) -> u8 {
        match self {
            DatabinClass::Precinct => 0,
            DatabinClass::ExtendedPrecinct => 1,
            DatabinClass::TileHeader => 2,
            DatabinClass::Tile => 4,
            DatabinClass::MainHeader => 6,
            DatabinClass::Metadata => 8,
        }
    }

    /// Parse a class number from a message header.
    pub fn from_class_id(class_id: u8) -> Option<Self> {
        match class_id {
            0 => Some(DatabinClass::Precinct),
            1 => Some(DatabinClass::ExtendedPrecinct),
            2 => Some(DatabinClass::TileHeader),
            4 => Some(DatabinClass::Tile),
            6 => Some(DatabinClass::MainHeader),
            8 => Some(DatabinClass::Metadata),
            _ => None,
        }
    }
}

/// Address of a databin: class plus in-class identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabinId {
    pub class: DatabinClass,
    pub in_class_id: u64,
}

impl DatabinId {
    pub fn new(class: DatabinClass, in_class_id: u64) -> Self {
        Self { class, in_class_id }
    }

    pub fn main_header() -> Self {
        Self::new(DatabinClass::MainHeader, 0)
    }

    pub fn tile_header(tile: u32) -> Self {
        Self::new(DatabinClass::TileHeader, tile as u64)
    }

    pub fn precinct(in_class_id: u64) -> Self {
        Self::new(DatabinClass::Precinct, in_class_id)
    }
}

impl fmt::Display for DatabinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.class, self.in_class_id)
    }
}

// =============================================================================
// Databins
// =============================================================================

/// Read-only view of the stored databins, handed to listeners.
#[derive(Debug, Default)]
pub struct Databins {
    stores: HashMap<DatabinId, ByteRangeStore>,
}

impl Databins {
    /// The store of a databin, if any message for it has arrived.
    pub fn get(&self, id: &DatabinId) -> Option<&ByteRangeStore> {
        self.stores.get(id)
    }

    /// Whether a databin is held completely.
    pub fn is_loaded(&self, id: &DatabinId) -> bool {
        self.get(id).is_some_and(ByteRangeStore::is_all_databin_loaded)
    }

    /// Number of databins with at least one message.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Sum of loaded bytes over all databins.
    pub fn total_loaded_bytes(&self) -> usize {
        self.stores.values().map(ByteRangeStore::loaded_bytes).sum()
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// Receives a notification after every write that changed a databin.
pub trait DatabinListener {
    fn databin_updated(&mut self, id: &DatabinId, databins: &Databins);
}

/// Handle returned by [`DatabinRegistry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// =============================================================================
// Registry
// =============================================================================

/// Owns the databins of one image and fans out update notifications.
#[derive(Default)]
pub struct DatabinRegistry {
    databins: Databins,
    listeners: Vec<(ListenerId, Box<dyn DatabinListener>)>,
    next_listener_id: u64,
}

impl DatabinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one message body in databin `id`.
    ///
    /// Listeners are notified when bytes were added or the databin length
    /// became known. Returns the number of net-new bytes.
    pub fn add_data(
        &mut self,
        id: DatabinId,
        header: &MessageHeader,
        source: &[u8],
    ) -> Result<usize, DatabinError> {
        let store = self.databins.stores.entry(id).or_default();
        let length_was_known = store.databin_length_if_known().is_some();

        let added = store.add_data(header, source)?;
        let length_learned = !length_was_known && store.databin_length_if_known().is_some();

        if added > 0 || length_learned {
            for (_, listener) in self.listeners.iter_mut() {
                listener.databin_updated(&id, &self.databins);
            }
        }

        Ok(added)
    }

    pub fn databins(&self) -> &Databins {
        &self.databins
    }

    pub fn get(&self, id: &DatabinId) -> Option<&ByteRangeStore> {
        self.databins.get(id)
    }

    /// Register a listener. It is called for writes made after this point.
    pub fn add_listener(&mut self, listener: Box<dyn DatabinListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        debug!(listener = id.0, total = self.listeners.len(), "databin listener added");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
