//! Progressive fetch request state machine.
//!
//! A request covers one region of the image and advances through a list of
//! progressiveness stages, each a quality threshold. At every threshold it
//! hands control back to its owner, who decodes what is there and decides
//! whether to continue.
//!
//! ```text
//!                   try_continue_request
//!   Paused ────────────────────────────────▶ Active
//!     ▲  ▲                                    │  ▲
//!     │  └──── pause_async / failure ─────────┤  │ try_continue_request
//!     │                                       ▼  │
//!     └──────── pause_async ───────── WaitingForUserInput
//!
//!   any live state ── end_async / create_moved_request ──▶ Ended
//!   ZombieOfMovableRequest ── create_moved_request ──▶ Ended (+ new Paused)
//! ```
//!
//! The request never runs user callbacks from inside a call its owner made.
//! Requesters and the quality tracker post [`FetchEvent`]s to its queue and
//! the owner drains them with [`ProgressiveFetchRequest::process_events`].

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codestream::{
    assemble_codestream, normalize_progressiveness, read_codeblocks, CodeblocksData,
    CodestreamLayout, CodestreamStructure, PrecinctInfo, ProgressivenessStage, RegionParams,
};
use crate::databin::{DatabinRegistry, ListenerId};
use crate::error::{FetchError, RequestError};

use super::events::{
    event_channel, ChannelHandle, FetchEvent, FetchEventReceiver, FetchEventSender, RequestHandle,
};
use super::requester::Requester;
use super::tracker::{LayerProgress, QualityLayerTracker};

// =============================================================================
// Status and Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// A fetch for the next threshold is outstanding
    Active,
    /// A threshold was reached; the owner decides what comes next
    WaitingForUserInput,
    /// Stopped, resumable with `try_continue_request`
    Paused,
    /// Terminal
    Ended,
    /// Template of a movable request; only spawns moved requests
    ZombieOfMovableRequest,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchStatus::Active => "active",
            FetchStatus::WaitingForUserInput => "waiting_for_user_input",
            FetchStatus::Paused => "paused",
            FetchStatus::Ended => "ended",
            FetchStatus::ZombieOfMovableRequest => "zombie_of_movable_request",
        };
        f.write_str(name)
    }
}

/// Result of [`ProgressiveFetchRequest::try_continue_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    /// A fetch is outstanding; progress arrives through events.
    WorkPending,
    /// Cached data already satisfied at least one more stage.
    StageReached,
    /// Every stage is finished.
    Done,
}

// =============================================================================
// Callbacks
// =============================================================================

type StageCallback = Box<dyn FnMut(usize)>;
type FailureCallback = Box<dyn FnMut(&FetchError)>;

/// User callbacks of a request.
pub struct RequestCallbacks {
    on_stage_reached: StageCallback,
    on_failure: Option<FailureCallback>,
}

impl RequestCallbacks {
    /// `on_stage_reached` receives the number of stages finished.
    pub fn new(on_stage_reached: impl FnMut(usize) + 'static) -> Self {
        Self {
            on_stage_reached: Box::new(on_stage_reached),
            on_failure: None,
        }
    }

    /// Without a failure callback, failures are latched on the request.
    pub fn with_failure(mut self, on_failure: impl FnMut(&FetchError) + 'static) -> Self {
        self.on_failure = Some(Box::new(on_failure));
        self
    }

    fn noop() -> Self {
        Self::new(|_| {})
    }
}

// =============================================================================
// Request
// =============================================================================

pub struct ProgressiveFetchRequest {
    params: RegionParams,
    progressiveness: Vec<ProgressivenessStage>,
    structure: Rc<dyn CodestreamStructure>,
    requester: Rc<dyn Requester>,
    callbacks: RequestCallbacks,

    precincts: Vec<PrecinctInfo>,
    total_layers: u32,

    status: FetchStatus,
    progressive_stages_finished: usize,
    /// Stages the owner has been handed back at
    stages_reported: usize,
    quality_layers_reached: u32,
    outstanding: Option<RequestHandle>,
    tracker: Option<ListenerId>,
    failure: Option<FetchError>,

    dedicated_channel: Option<ChannelHandle>,
    ended_by_move: bool,

    events_tx: FetchEventSender,
    events_rx: FetchEventReceiver,
}

impl ProgressiveFetchRequest {
    /// Create a paused request for `params`.
    ///
    /// Without `progressiveness`, the request has a single stage: the params'
    /// quality limit, or full quality.
    pub fn new(
        params: RegionParams,
        progressiveness: Option<Vec<ProgressivenessStage>>,
        structure: Rc<dyn CodestreamStructure>,
        requester: Rc<dyn Requester>,
        callbacks: RequestCallbacks,
    ) -> Result<Self, RequestError> {
        Self::build(params, progressiveness, structure, requester, callbacks, None)
    }

    /// Create the template of a movable request.
    ///
    /// The template reserves a dedicated channel and only serves to spawn
    /// live requests with [`Self::create_moved_request`].
    pub fn new_movable(
        params: RegionParams,
        progressiveness: Option<Vec<ProgressivenessStage>>,
        structure: Rc<dyn CodestreamStructure>,
        requester: Rc<dyn Requester>,
        callbacks: RequestCallbacks,
    ) -> Result<Self, RequestError> {
        let channel = requester.dedicate_channel_for_movable_request();
        let mut request =
            Self::build(params, progressiveness, structure, requester, callbacks, Some(channel))?;
        request.status = FetchStatus::ZombieOfMovableRequest;
        Ok(request)
    }

    fn build(
        params: RegionParams,
        progressiveness: Option<Vec<ProgressivenessStage>>,
        structure: Rc<dyn CodestreamStructure>,
        requester: Rc<dyn Requester>,
        callbacks: RequestCallbacks,
        dedicated_channel: Option<ChannelHandle>,
    ) -> Result<Self, RequestError> {
        params.validate(structure.as_ref())?;
        let stages = progressiveness.unwrap_or_else(|| params.default_progressiveness());
        let progressiveness = normalize_progressiveness(stages, &params)?;

        let precincts = structure.precincts_in_region(&params);
        let total_layers = structure.num_quality_layers();
        let (events_tx, events_rx) = event_channel();

        debug!(
            region = ?params,
            stages = progressiveness.len(),
            precincts = precincts.len(),
            movable = dedicated_channel.is_some(),
            "request created"
        );

        Ok(Self {
            params,
            progressiveness,
            structure,
            requester,
            callbacks,
            precincts,
            total_layers,
            status: FetchStatus::Paused,
            progressive_stages_finished: 0,
            stages_reported: 0,
            quality_layers_reached: 0,
            outstanding: None,
            tracker: None,
            failure: None,
            dedicated_channel,
            ended_by_move: false,
            events_tx,
            events_rx,
        })
    }

    // -------------------------------------------------------------------------
    // Driving the request
    // -------------------------------------------------------------------------

    /// Move the request forward.
    ///
    /// Stages already satisfied by cached data, or finished while the request
    /// was not waiting for them, are reported as `StageReached` without a
    /// round trip. Otherwise one fetch is issued for the next stage. No
    /// callback runs from inside this call.
    pub fn try_continue_request(
        &mut self,
        registry: &mut DatabinRegistry,
    ) -> Result<ContinueOutcome, RequestError> {
        if let Some(failure) = &self.failure {
            return Err(RequestError::PreviousFailure(failure.clone()));
        }
        self.ensure_live("continue")?;

        if self.outstanding.is_some() {
            return Ok(ContinueOutcome::WorkPending);
        }

        self.ensure_tracker(registry);

        let progress = LayerProgress::measure(registry.databins(), &self.precincts, self.total_layers);
        self.advance_stages(progress);
        if self.progressive_stages_finished > self.stages_reported {
            self.stages_reported = self.progressive_stages_finished;
            self.status = FetchStatus::WaitingForUserInput;
            debug!(
                stages_finished = self.progressive_stages_finished,
                layers = self.quality_layers_reached,
                "stage reached without a fetch"
            );
            return Ok(ContinueOutcome::StageReached);
        }

        if self.is_done() {
            self.status = FetchStatus::WaitingForUserInput;
            return Ok(ContinueOutcome::Done);
        }

        self.issue_request();
        Ok(ContinueOutcome::WorkPending)
    }

    /// Handle every queued event. Returns how many were handled.
    ///
    /// This is where stage and failure callbacks run.
    pub fn process_events(&mut self, registry: &DatabinRegistry) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            handled += 1;
            self.handle_event(event, registry);
        }
        handled
    }

    fn handle_event(&mut self, event: FetchEvent, registry: &DatabinRegistry) {
        if matches!(
            self.status,
            FetchStatus::Ended | FetchStatus::ZombieOfMovableRequest
        ) {
            return;
        }

        match event {
            FetchEvent::QualityLayerReached {
                layers,
                fully_loaded,
            } => {
                let progress = LayerProgress {
                    layers,
                    fully_loaded,
                };
                self.on_progress(progress);
            }
            FetchEvent::RequestDone(handle) => {
                if self.outstanding != Some(handle) {
                    return;
                }
                self.outstanding = None;
                if self.status != FetchStatus::Active {
                    return;
                }

                // Nothing reached while the fetch ran: measure once more in
                // case data landed without a tracker update, then refetch.
                let progress =
                    LayerProgress::measure(registry.databins(), &self.precincts, self.total_layers);
                if !self.on_progress(progress) {
                    if self.is_done() {
                        self.status = FetchStatus::WaitingForUserInput;
                    } else {
                        debug!(%handle, "fetch done below threshold, issuing again");
                        self.issue_request();
                    }
                }
            }
            FetchEvent::RequestFailed(handle, error) => {
                if self.outstanding != Some(handle) {
                    return;
                }
                self.outstanding = None;
                self.status = FetchStatus::Paused;
                warn!(%handle, error = %error, "fetch failed");

                match self.callbacks.on_failure.as_mut() {
                    Some(on_failure) => on_failure(&error),
                    None => self.failure = Some(error),
                }
            }
        }
    }

    /// Apply new progress. Returns whether a stage was finished.
    fn on_progress(&mut self, progress: LayerProgress) -> bool {
        let was_waiting = self.status == FetchStatus::Active;
        if !self.advance_stages(progress) {
            return false;
        }

        if was_waiting {
            // The fetch met its threshold; the next stage gets a fetch of its own.
            if let Some(handle) = self.outstanding.take() {
                self.requester.stop_request_async(handle);
            }
            self.status = FetchStatus::WaitingForUserInput;
            self.stages_reported = self.progressive_stages_finished;
            debug!(
                stages_finished = self.progressive_stages_finished,
                layers = self.quality_layers_reached,
                "stage reached"
            );
            (self.callbacks.on_stage_reached)(self.progressive_stages_finished);
        }
        true
    }

    fn advance_stages(&mut self, progress: LayerProgress) -> bool {
        self.quality_layers_reached = self.quality_layers_reached.max(progress.layers);

        let before = self.progressive_stages_finished;
        while let Some(stage) = self.progressiveness.get(self.progressive_stages_finished) {
            if !stage
                .min_num_quality_layers
                .is_satisfied(progress.layers, progress.fully_loaded)
            {
                break;
            }
            self.progressive_stages_finished += 1;
        }
        self.progressive_stages_finished > before
    }

    fn issue_request(&mut self) {
        let Some(stage) = self.progressiveness.get(self.progressive_stages_finished) else {
            return;
        };

        let handle = self.requester.request_data(
            &self.params,
            stage.min_num_quality_layers,
            self.dedicated_channel,
            self.events_tx.clone(),
        );
        debug!(
            %handle,
            min_quality_layers = %stage.min_num_quality_layers,
            channel = ?self.dedicated_channel,
            "fetch issued"
        );
        self.outstanding = Some(handle);
        self.status = FetchStatus::Active;
    }

    fn ensure_tracker(&mut self, registry: &mut DatabinRegistry) {
        if self.tracker.is_some() {
            return;
        }
        let tracker = QualityLayerTracker::new(
            self.precincts.clone(),
            self.total_layers,
            registry.databins(),
            self.events_tx.clone(),
        );
        self.tracker = Some(registry.add_listener(Box::new(tracker)));
    }

    fn release(&mut self, registry: &mut DatabinRegistry) {
        if let Some(handle) = self.outstanding.take() {
            self.requester.stop_request_async(handle);
        }
        if let Some(listener) = self.tracker.take() {
            registry.remove_listener(listener);
        }
    }

    // -------------------------------------------------------------------------
    // Pause, end, move
    // -------------------------------------------------------------------------

    /// Stop the outstanding fetch. Resume with `try_continue_request`.
    pub fn pause_async(&mut self) -> Result<(), RequestError> {
        match self.status {
            FetchStatus::Paused | FetchStatus::Ended | FetchStatus::ZombieOfMovableRequest => {
                return Err(RequestError::IllegalOperation(format!(
                    "cannot pause a {} request",
                    self.status
                )));
            }
            FetchStatus::Active | FetchStatus::WaitingForUserInput => {}
        }

        if let Some(handle) = self.outstanding.take() {
            self.requester.stop_request_async(handle);
        }
        self.status = FetchStatus::Paused;
        debug!("request paused");
        Ok(())
    }

    /// End the request for good.
    pub fn end_async(&mut self, registry: &mut DatabinRegistry) -> Result<(), RequestError> {
        if self.status == FetchStatus::Ended {
            return Err(RequestError::IllegalOperation(
                "request already ended".to_string(),
            ));
        }

        self.release(registry);
        self.status = FetchStatus::Ended;
        debug!("request ended");
        Ok(())
    }

    /// End this movable request and create its successor on the same
    /// dedicated channel.
    ///
    /// The successor starts paused, covering `new_params` (or the current
    /// params) with `new_progressiveness` (or the current stages when the
    /// params are unchanged, else the default stages). Callbacks move to the
    /// successor.
    pub fn create_moved_request(
        &mut self,
        registry: &mut DatabinRegistry,
        new_params: Option<RegionParams>,
        new_progressiveness: Option<Vec<ProgressivenessStage>>,
    ) -> Result<ProgressiveFetchRequest, RequestError> {
        if self.dedicated_channel.is_none() {
            return Err(RequestError::IllegalOperation(
                "only movable requests can be moved".to_string(),
            ));
        }
        if self.status == FetchStatus::Ended {
            return Err(RequestError::IllegalOperation(
                "cannot move an ended request".to_string(),
            ));
        }

        let progressiveness = match (&new_params, new_progressiveness) {
            (_, Some(stages)) => Some(stages),
            (None, None) => Some(self.progressiveness.clone()),
            (Some(_), None) => None,
        };
        let params = new_params.unwrap_or(self.params);

        let mut moved = Self::build(
            params,
            progressiveness,
            self.structure.clone(),
            self.requester.clone(),
            RequestCallbacks::noop(),
            self.dedicated_channel,
        )?;

        self.release(registry);
        self.status = FetchStatus::Ended;
        self.ended_by_move = true;
        moved.callbacks = std::mem::replace(&mut self.callbacks, RequestCallbacks::noop());

        debug!(
            region = ?moved.params,
            channel = ?self.dedicated_channel,
            "request moved"
        );
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Reading data
    // -------------------------------------------------------------------------

    /// Whether at least one stage was reached.
    pub fn has_data(&self) -> Result<bool, RequestError> {
        if self.status == FetchStatus::Ended {
            return Err(RequestError::IllegalOperation(
                "request already ended".to_string(),
            ));
        }
        Ok(self.progressive_stages_finished > 0)
    }

    /// Packet data of the region's precincts, cut at the last complete
    /// quality layer and at `max_quality_layers`.
    pub fn get_all_codeblocks_data(
        &self,
        registry: &DatabinRegistry,
        max_quality_layers: Option<u32>,
    ) -> Result<CodeblocksData, RequestError> {
        self.ensure_readable()?;
        let max_layers = self.layer_limit(max_quality_layers);
        Ok(read_codeblocks(
            registry.databins(),
            &self.precincts,
            max_layers,
            self.total_layers,
        )?)
    }

    /// Rebuild a decodable codestream for the region.
    ///
    /// Returns `None` while a header databin is incomplete. With
    /// `headers_only`, no packet data is included and no stage needs to be
    /// reached first.
    pub fn create_codestream(
        &self,
        registry: &DatabinRegistry,
        headers_only: bool,
        max_quality_layers: Option<u32>,
    ) -> Result<Option<Bytes>, RequestError> {
        if headers_only {
            self.ensure_not_ended()?;
        } else {
            self.ensure_readable()?;
        }

        let tiles = self
            .structure
            .tiles_in_region(&self.params)
            .into_iter()
            .map(|tile| (tile, self.structure.tile_header_databin(tile)))
            .collect();
        let layout = CodestreamLayout {
            main_header: self.structure.main_header_databin(),
            tiles,
            precincts: &self.precincts,
        };

        Ok(assemble_codestream(
            registry.databins(),
            &layout,
            headers_only,
            self.layer_limit(max_quality_layers),
            self.total_layers,
        )?)
    }

    fn layer_limit(&self, max_quality_layers: Option<u32>) -> u32 {
        let mut limit = self.total_layers;
        if let Some(quality) = self.params.quality {
            limit = limit.min(quality);
        }
        if let Some(max) = max_quality_layers {
            limit = limit.min(max);
        }
        limit
    }

    fn ensure_live(&self, operation: &str) -> Result<(), RequestError> {
        match self.status {
            FetchStatus::Ended => Err(RequestError::IllegalOperation(format!(
                "cannot {} an ended request",
                operation
            ))),
            FetchStatus::ZombieOfMovableRequest => Err(RequestError::IllegalOperation(format!(
                "cannot {} a movable request template",
                operation
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_not_ended(&self) -> Result<(), RequestError> {
        if self.status == FetchStatus::Ended && !self.ended_by_move {
            return Err(RequestError::IllegalOperation(
                "cannot read data of an ended request".to_string(),
            ));
        }
        Ok(())
    }

    /// Packet data may be read once a stage was reached, from the template of
    /// a movable request, and from a request that ended by being moved.
    fn ensure_readable(&self) -> Result<(), RequestError> {
        self.ensure_not_ended()?;
        let zombie_allowed =
            self.ended_by_move || self.status == FetchStatus::ZombieOfMovableRequest;
        if !zombie_allowed && self.progressive_stages_finished == 0 {
            return Err(RequestError::IllegalOperation(
                "no progressiveness stage reached yet".to_string(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Clear a latched failure so the request can be continued.
    pub fn ignore_previous_failure(&mut self) {
        self.failure = None;
    }

    pub fn status(&self) -> FetchStatus {
        self.status
    }

    pub fn progressive_stages_finished(&self) -> usize {
        self.progressive_stages_finished
    }

    pub fn quality_layers_reached(&self) -> u32 {
        self.quality_layers_reached
    }

    /// Every stage is finished.
    pub fn is_done(&self) -> bool {
        self.progressive_stages_finished >= self.progressiveness.len()
    }

    /// A failure is latched.
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn params(&self) -> &RegionParams {
        &self.params
    }

    pub fn progressiveness(&self) -> &[ProgressivenessStage] {
        &self.progressiveness
    }

    pub fn dedicated_channel(&self) -> Option<ChannelHandle> {
        self.dedicated_channel
    }

    pub fn is_movable(&self) -> bool {
        self.dedicated_channel.is_some()
    }
}
