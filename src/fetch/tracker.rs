//! Quality-layer tracking over the precinct databins of a request.

use std::collections::HashSet;

use tracing::{trace, warn};

use crate::codestream::{layers_held, PrecinctInfo};
use crate::databin::{DatabinId, DatabinListener, Databins};

use super::events::{FetchEvent, FetchEventSender};

/// Quality reached by a set of precincts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerProgress {
    /// Complete quality layers held for every precinct
    pub layers: u32,

    /// Every precinct databin is held completely
    pub fully_loaded: bool,
}

impl LayerProgress {
    /// Evaluate the precincts against the databins held.
    ///
    /// A region without precincts counts as fully loaded.
    pub fn measure(databins: &Databins, precincts: &[PrecinctInfo], total_layers: u32) -> Self {
        let mut layers = total_layers;
        let mut fully_loaded = true;

        for precinct in precincts {
            let store = databins.get(&precinct.databin);
            layers = layers.min(layers_held(store, precinct, total_layers));
            fully_loaded &= store.is_some_and(|s| s.is_all_databin_loaded());
        }

        Self {
            layers,
            fully_loaded,
        }
    }
}

/// Databin listener posting [`FetchEvent::QualityLayerReached`] whenever the
/// layers reached by a request's precincts, or their full-load state, change.
pub struct QualityLayerTracker {
    precincts: Vec<PrecinctInfo>,
    watched: HashSet<DatabinId>,
    total_layers: u32,
    last: LayerProgress,
    events: FetchEventSender,
}

impl QualityLayerTracker {
    /// Create a tracker starting from the databins already held.
    pub fn new(
        precincts: Vec<PrecinctInfo>,
        total_layers: u32,
        databins: &Databins,
        events: FetchEventSender,
    ) -> Self {
        let last = LayerProgress::measure(databins, &precincts, total_layers);
        let watched = precincts.iter().map(|p| p.databin).collect();
        Self {
            precincts,
            watched,
            total_layers,
            last,
            events,
        }
    }

    /// Progress as of the last notification.
    pub fn current(&self) -> LayerProgress {
        self.last
    }
}

impl DatabinListener for QualityLayerTracker {
    fn databin_updated(&mut self, id: &DatabinId, databins: &Databins) {
        if !self.watched.contains(id) {
            return;
        }

        let progress = LayerProgress::measure(databins, &self.precincts, self.total_layers);
        if progress == self.last {
            return;
        }

        trace!(
            databin = %id,
            layers = progress.layers,
            fully_loaded = progress.fully_loaded,
            "quality layer progress"
        );
        self.last = progress;

        let event = FetchEvent::QualityLayerReached {
            layers: progress.layers,
            fully_loaded: progress.fully_loaded,
        };
        if self.events.send(event).is_err() {
            warn!(databin = %id, "request dropped before its quality update");
        }
    }
}
