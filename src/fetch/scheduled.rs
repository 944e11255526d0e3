//! Requester running fetches on a priority scheduler.
//!
//! Network channels are the pooled resource: each fetch is a job that waits
//! for a channel, is handed to the [`Transport`] once it has one, and returns
//! the channel when the transport reports the fetch finished. Fetches on a
//! dedicated channel skip the pool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::codestream::{QualityLayers, RegionParams};
use crate::error::{FetchError, SchedulerError};
use crate::scheduler::{PriorityScheduler, SchedulerOptions, PRIORITY_ABORT};

use super::events::{ChannelHandle, FetchEvent, FetchEventSender, RequestHandle};
use super::requester::Requester;

/// Priority of a fetch until changed with [`ScheduledRequester::set_priority`].
pub const DEFAULT_FETCH_PRIORITY: i32 = 0;

/// A fetch ready to go out on a channel.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub handle: RequestHandle,
    pub params: RegionParams,
    pub min_quality_layers: QualityLayers,
}

/// Wire side of the requester.
///
/// The transport writes received messages into the databin registry and
/// reports the end of each fetch through
/// [`ScheduledRequester::request_finished`].
pub trait Transport {
    fn send(&self, channel: ChannelHandle, request: &OutgoingRequest);

    fn cancel(&self, channel: ChannelHandle, handle: RequestHandle);
}

/// Scheduling context of one fetch.
#[derive(Debug)]
pub struct FetchJob {
    handle: RequestHandle,
    priority: Cell<i32>,
    cancelled: Cell<bool>,
}

impl FetchJob {
    fn priority(&self) -> i32 {
        if self.cancelled.get() {
            PRIORITY_ABORT
        } else {
            self.priority.get()
        }
    }
}

struct Entry {
    job: Option<Rc<FetchJob>>,
    channel: Option<ChannelHandle>,
    dedicated: bool,
    events: FetchEventSender,
}

#[derive(Default)]
struct RequesterState {
    next_handle: u64,
    entries: HashMap<RequestHandle, Entry>,
}

/// [`Requester`] multiplexing fetches over a bounded set of channels.
pub struct ScheduledRequester {
    scheduler: PriorityScheduler<Rc<FetchJob>, ChannelHandle>,
    transport: Rc<dyn Transport>,
    state: Rc<RefCell<RequesterState>>,
    channel_ids: Rc<Cell<u64>>,
}

impl ScheduledRequester {
    /// Create a requester using at most `channels` pooled channels.
    pub fn new(transport: Rc<dyn Transport>, channels: usize, options: SchedulerOptions) -> Self {
        let channel_ids = Rc::new(Cell::new(0u64));
        let ids = channel_ids.clone();
        let scheduler = PriorityScheduler::new(
            move || next_channel(&ids),
            channels,
            |job: &Rc<FetchJob>| job.priority(),
            options,
        );

        Self {
            scheduler,
            transport,
            state: Rc::new(RefCell::new(RequesterState::default())),
            channel_ids,
        }
    }

    /// Report the end of a fetch and release its channel.
    ///
    /// Posts [`FetchEvent::RequestDone`] or [`FetchEvent::RequestFailed`] to
    /// the issuing request. Returns false for an unknown handle.
    pub fn request_finished(
        &self,
        handle: RequestHandle,
        result: Result<(), FetchError>,
    ) -> Result<bool, SchedulerError> {
        let Some(entry) = self.state.borrow_mut().entries.remove(&handle) else {
            return Ok(false);
        };

        let event = match result {
            Ok(()) => FetchEvent::RequestDone(handle),
            Err(error) => {
                warn!(%handle, error = %error, "fetch failed");
                FetchEvent::RequestFailed(handle, error)
            }
        };
        let cancelled = entry.job.as_ref().is_some_and(|job| job.cancelled.get());
        if !cancelled && entry.events.send(event).is_err() {
            debug!(%handle, "request dropped before fetch finished");
        }

        if let (Some(channel), false) = (entry.channel, entry.dedicated) {
            debug!(%handle, %channel, "channel released");
            self.scheduler.job_done(channel)?;
        }
        Ok(true)
    }

    /// Change the priority of a waiting or running fetch.
    pub fn set_priority(&self, handle: RequestHandle, priority: i32) -> bool {
        let state = self.state.borrow();
        match state.entries.get(&handle).and_then(|e| e.job.as_ref()) {
            Some(job) => {
                job.priority.set(priority);
                true
            }
            None => false,
        }
    }

    /// Fetches issued and not finished yet.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().entries.len()
    }

    /// Fetches waiting for a channel.
    ///
    /// Stopped fetches are not counted, even while the scheduler still holds
    /// their job.
    pub fn waiting(&self) -> usize {
        self.state
            .borrow()
            .entries
            .values()
            .filter(|entry| entry.channel.is_none())
            .count()
    }

    pub fn scheduler(&self) -> &PriorityScheduler<Rc<FetchJob>, ChannelHandle> {
        &self.scheduler
    }

    fn new_handle(&self) -> RequestHandle {
        let mut state = self.state.borrow_mut();
        let handle = RequestHandle(state.next_handle);
        state.next_handle += 1;
        handle
    }
}

fn next_channel(ids: &Cell<u64>) -> ChannelHandle {
    let id = ids.get();
    ids.set(id + 1);
    ChannelHandle(id)
}

impl Requester for ScheduledRequester {
    fn request_data(
        &self,
        params: &RegionParams,
        min_quality_layers: QualityLayers,
        dedicated_channel: Option<ChannelHandle>,
        events: FetchEventSender,
    ) -> RequestHandle {
        let handle = self.new_handle();
        let request = OutgoingRequest {
            handle,
            params: *params,
            min_quality_layers,
        };

        if let Some(channel) = dedicated_channel {
            self.state.borrow_mut().entries.insert(
                handle,
                Entry {
                    job: None,
                    channel: Some(channel),
                    dedicated: true,
                    events,
                },
            );
            debug!(%handle, %channel, "fetch sent on dedicated channel");
            self.transport.send(channel, &request);
            return handle;
        }

        let job = Rc::new(FetchJob {
            handle,
            priority: Cell::new(DEFAULT_FETCH_PRIORITY),
            cancelled: Cell::new(false),
        });
        self.state.borrow_mut().entries.insert(
            handle,
            Entry {
                job: Some(job.clone()),
                channel: None,
                dedicated: false,
                events: events.clone(),
            },
        );

        let run_state = self.state.clone();
        let transport = self.transport.clone();
        let abort_state = self.state.clone();

        let enqueued = self.scheduler.enqueue_job(
            move |channel, job: Rc<FetchJob>| {
                if let Some(entry) = run_state.borrow_mut().entries.get_mut(&job.handle) {
                    entry.channel = Some(channel);
                }
                debug!(handle = %job.handle, %channel, "fetch sent");
                transport.send(channel, &request);
            },
            job,
            move |job: Rc<FetchJob>| {
                let entry = abort_state.borrow_mut().entries.remove(&job.handle);
                debug!(handle = %job.handle, "fetch dropped by scheduler");
                if job.cancelled.get() {
                    return;
                }
                if let Some(entry) = entry {
                    let error = FetchError::Connection("fetch aborted by scheduler".to_string());
                    let _ = entry.events.send(FetchEvent::RequestFailed(job.handle, error));
                }
            },
        );

        if let Err(err) = enqueued {
            warn!(%handle, error = %err, "scheduler rejected fetch");
            self.state.borrow_mut().entries.remove(&handle);
            let _ = events.send(FetchEvent::RequestFailed(
                handle,
                FetchError::Protocol(err.to_string()),
            ));
        }
        handle
    }

    fn stop_request_async(&self, handle: RequestHandle) {
        let channel = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.entries.get(&handle) else {
                return;
            };
            if let Some(job) = &entry.job {
                job.cancelled.set(true);
            }
            let channel = entry.channel;
            if channel.is_none() {
                // The scheduler drops the job on its next pass.
                state.entries.remove(&handle);
            }
            channel
        };

        match channel {
            // Released by `request_finished` once the transport confirms.
            Some(channel) => self.transport.cancel(channel, handle),
            None => debug!(%handle, "waiting fetch cancelled"),
        }
    }

    fn dedicate_channel_for_movable_request(&self) -> ChannelHandle {
        let channel = next_channel(&self.channel_ids);
        debug!(%channel, "channel dedicated to movable request");
        channel
    }
}
