//! Progressive requests driven end to end through the scheduled requester.

use std::cell::RefCell;
use std::rc::Rc;

use jpip_streamer::codestream::{
    ProgressivenessStage, QualityLayers, RegionParams, MARKER_EOC, MARKER_SOD, MARKER_SOT,
};
use jpip_streamer::databin::DatabinRegistry;
use jpip_streamer::error::{FetchError, RequestError};
use jpip_streamer::fetch::{
    ContinueOutcome, FetchStatus, ProgressiveFetchRequest, RequestCallbacks, ScheduledRequester,
};
use jpip_streamer::scheduler::SchedulerOptions;

use super::test_utils::{serve_headers, serve_request, GridStructure, LoopbackTransport, MAIN_HEADER};

struct Session {
    structure: Rc<GridStructure>,
    transport: Rc<LoopbackTransport>,
    requester: Rc<ScheduledRequester>,
    registry: DatabinRegistry,
}

impl Session {
    fn new(channels: usize) -> Self {
        let transport = Rc::new(LoopbackTransport::default());
        let requester = Rc::new(ScheduledRequester::new(
            transport.clone(),
            channels,
            SchedulerOptions::named("fetch"),
        ));
        Self {
            structure: Rc::new(GridStructure::new(3, 20)),
            transport,
            requester,
            registry: DatabinRegistry::new(),
        }
    }

    fn request(
        &self,
        params: RegionParams,
        stages: Option<Vec<ProgressivenessStage>>,
        log: &Rc<RefCell<Vec<usize>>>,
    ) -> ProgressiveFetchRequest {
        let log = log.clone();
        ProgressiveFetchRequest::new(
            params,
            stages,
            self.structure.clone(),
            self.requester.clone(),
            RequestCallbacks::new(move |stages| log.borrow_mut().push(stages)),
        )
        .unwrap()
    }

    /// Answer the oldest fetch on the wire and report it finished.
    fn serve_next(&mut self) -> bool {
        let Some((_, outgoing)) = self.transport.take_next() else {
            return false;
        };
        serve_request(&mut self.registry, &self.structure, &outgoing);
        self.requester
            .request_finished(outgoing.handle, Ok(()))
            .unwrap();
        true
    }
}

fn whole_image() -> RegionParams {
    RegionParams::new(0, 0, 256, 256)
}

#[test]
fn test_one_layer_then_max() {
    let mut session = Session::new(2);
    let log = Rc::default();
    let stages = vec![ProgressivenessStage::layers(1), ProgressivenessStage::max()];
    let mut request = session.request(whole_image(), Some(stages), &log);

    let outcome = request.try_continue_request(&mut session.registry).unwrap();
    assert_eq!(outcome, ContinueOutcome::WorkPending);
    assert_eq!(request.status(), FetchStatus::Active);
    {
        let sent = session.transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.min_quality_layers, QualityLayers::Count(1));
    }

    assert!(session.serve_next());
    // Nothing runs before the owner drains events.
    assert!(log.borrow().is_empty());
    request.process_events(&session.registry);

    assert_eq!(request.status(), FetchStatus::WaitingForUserInput);
    assert_eq!(*log.borrow(), vec![1]);
    assert!(request.has_data().unwrap());
    assert_eq!(request.quality_layers_reached(), 1);

    let data = request
        .get_all_codeblocks_data(&session.registry, None)
        .unwrap();
    assert_eq!(data.precincts.len(), 4);
    assert_eq!(data.min_quality_layers, 1);
    assert!(data.precincts.iter().all(|p| p.data.len() == 20));

    request.try_continue_request(&mut session.registry).unwrap();
    assert_eq!(
        session.transport.sent.borrow()[0].1.min_quality_layers,
        QualityLayers::Max
    );
    assert!(session.serve_next());
    request.process_events(&session.registry);

    assert_eq!(*log.borrow(), vec![1, 2]);
    assert!(request.is_done());
    assert_eq!(request.quality_layers_reached(), 3);
    assert_eq!(
        request.try_continue_request(&mut session.registry).unwrap(),
        ContinueOutcome::Done
    );
}

#[test]
fn test_second_request_served_from_cache() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let mut first = session.request(whole_image(), None, &log);

    first.try_continue_request(&mut session.registry).unwrap();
    session.serve_next();
    first.process_events(&session.registry);
    assert!(first.is_done());

    // A region inside tile 0 finds everything cached.
    let second_log: Rc<RefCell<Vec<usize>>> = Rc::default();
    let mut second = session.request(RegionParams::new(0, 0, 64, 64), None, &second_log);
    let outcome = second.try_continue_request(&mut session.registry).unwrap();

    assert_eq!(outcome, ContinueOutcome::StageReached);
    assert!(second.is_done());
    assert_eq!(session.transport.sent_count(), 0);
    assert!(second_log.borrow().is_empty());
}

#[test]
fn test_quality_limit_caps_fetch() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let params = RegionParams::new(0, 0, 100, 100).with_quality(2);
    let mut request = session.request(params, None, &log);

    assert_eq!(request.progressiveness(), &[ProgressivenessStage::layers(2)]);
    request.try_continue_request(&mut session.registry).unwrap();
    assert_eq!(
        session.transport.sent.borrow()[0].1.min_quality_layers,
        QualityLayers::Count(2)
    );

    session.serve_next();
    request.process_events(&session.registry);
    assert!(request.is_done());

    let data = request
        .get_all_codeblocks_data(&session.registry, Some(5))
        .unwrap();
    assert_eq!(data.min_quality_layers, 2);
    assert_eq!(data.precincts[0].data.len(), 40);
}

#[test]
fn test_pause_drops_waiting_fetch() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let mut busy = session.request(whole_image(), None, &log);
    let mut waiting = session.request(RegionParams::new(128, 128, 256, 256), None, &log);

    busy.try_continue_request(&mut session.registry).unwrap();
    waiting.try_continue_request(&mut session.registry).unwrap();
    assert_eq!(session.transport.sent_count(), 1);
    assert_eq!(session.requester.waiting(), 1);

    waiting.pause_async().unwrap();
    assert_eq!(waiting.status(), FetchStatus::Paused);
    assert!(waiting.pause_async().is_err());

    // The channel frees up; the cancelled fetch is dropped, not sent.
    session.serve_next();
    assert_eq!(session.transport.sent_count(), 0);
    assert_eq!(session.requester.in_flight(), 0);

    busy.process_events(&session.registry);
    waiting.process_events(&session.registry);
    assert!(busy.is_done());

    // Data fetched for the other request still counts, without a callback.
    assert_eq!(waiting.status(), FetchStatus::Paused);
    assert_eq!(waiting.progressive_stages_finished(), 1);
    assert_eq!(*log.borrow(), vec![1]);

    // The owner is handed back at the stage it missed, then told it is done.
    assert_eq!(
        waiting.try_continue_request(&mut session.registry).unwrap(),
        ContinueOutcome::StageReached
    );
    assert_eq!(waiting.status(), FetchStatus::WaitingForUserInput);
    assert_eq!(
        waiting.try_continue_request(&mut session.registry).unwrap(),
        ContinueOutcome::Done
    );
    assert_eq!(session.transport.sent_count(), 0);
}

#[test]
fn test_stage_reached_before_fetch_finishes() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let stages = vec![ProgressivenessStage::layers(1), ProgressivenessStage::max()];
    let mut request = session.request(whole_image(), Some(stages), &log);

    request.try_continue_request(&mut session.registry).unwrap();
    let (channel, first) = session.transport.take_next().unwrap();

    // The data lands, but the transport has not reported the fetch finished.
    serve_request(&mut session.registry, &session.structure, &first);
    request.process_events(&session.registry);
    assert_eq!(*log.borrow(), vec![1]);
    assert_eq!(
        *session.transport.cancelled.borrow(),
        vec![(channel, first.handle)]
    );

    // The next stage waits for the channel the stopped fetch still holds.
    assert_eq!(
        request.try_continue_request(&mut session.registry).unwrap(),
        ContinueOutcome::WorkPending
    );
    assert_eq!(session.transport.sent_count(), 0);
    assert_eq!(session.requester.waiting(), 1);

    session
        .requester
        .request_finished(first.handle, Ok(()))
        .unwrap();
    assert_eq!(session.transport.sent_count(), 1);
    assert_eq!(session.requester.in_flight(), 1);

    assert!(session.serve_next());
    request.process_events(&session.registry);
    assert_eq!(*log.borrow(), vec![1, 2]);
    assert!(request.is_done());
    assert_eq!(session.transport.cancelled.borrow().len(), 1);
}

#[test]
fn test_failure_latches_until_ignored() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let mut request = session.request(whole_image(), None, &log);

    request.try_continue_request(&mut session.registry).unwrap();
    let (_, outgoing) = session.transport.take_next().unwrap();
    let error = FetchError::Protocol("unexpected response".to_string());
    session
        .requester
        .request_finished(outgoing.handle, Err(error.clone()))
        .unwrap();
    request.process_events(&session.registry);

    assert!(request.is_failure());
    assert_eq!(request.status(), FetchStatus::Paused);
    assert_eq!(
        request.try_continue_request(&mut session.registry),
        Err(RequestError::PreviousFailure(error))
    );

    request.ignore_previous_failure();
    assert_eq!(
        request.try_continue_request(&mut session.registry).unwrap(),
        ContinueOutcome::WorkPending
    );
    assert_eq!(session.transport.sent_count(), 1);
}

#[test]
fn test_moved_request_reuses_dedicated_channel() {
    let mut session = Session::new(1);
    let log: Rc<RefCell<Vec<usize>>> = Rc::default();
    let stage_log = log.clone();
    let mut template = ProgressiveFetchRequest::new_movable(
        whole_image(),
        None,
        session.structure.clone(),
        session.requester.clone(),
        RequestCallbacks::new(move |stages| stage_log.borrow_mut().push(stages)),
    )
    .unwrap();
    let channel = template.dedicated_channel().unwrap();

    let mut first = template
        .create_moved_request(&mut session.registry, Some(RegionParams::new(0, 0, 128, 128)), None)
        .unwrap();
    first.try_continue_request(&mut session.registry).unwrap();
    assert_eq!(session.transport.sent.borrow()[0].0, channel);
    // Dedicated channels are not taken from the pool.
    assert_eq!(session.requester.scheduler().free_resources_count(), 1);

    let mut second = first
        .create_moved_request(&mut session.registry, Some(RegionParams::new(128, 0, 256, 128)), None)
        .unwrap();
    assert_eq!(first.status(), FetchStatus::Ended);
    assert_eq!(session.transport.cancelled.borrow().len(), 1);
    assert!(first.get_all_codeblocks_data(&session.registry, None).is_ok());

    // The cancelled fetch is confirmed finished; the moved request ignores it.
    let (_, stale) = session.transport.take_next().unwrap();
    session
        .requester
        .request_finished(stale.handle, Ok(()))
        .unwrap();

    second.try_continue_request(&mut session.registry).unwrap();
    assert!(session.serve_next());
    second.process_events(&session.registry);
    assert!(second.is_done());
    assert_eq!(*log.borrow(), vec![1]);
}

#[test]
fn test_codestream_assembly() {
    let mut session = Session::new(1);
    let log = Rc::default();
    let mut request = session.request(RegionParams::new(0, 0, 100, 100), None, &log);

    assert_eq!(
        request
            .create_codestream(&session.registry, true, None)
            .unwrap(),
        None
    );
    assert!(matches!(
        request.create_codestream(&session.registry, false, None),
        Err(RequestError::IllegalOperation(_))
    ));

    serve_headers(&mut session.registry, &session.structure);
    request.try_continue_request(&mut session.registry).unwrap();
    session.serve_next();
    request.process_events(&session.registry);

    let codestream = request
        .create_codestream(&session.registry, false, Some(2))
        .unwrap()
        .unwrap();

    // main header, SOT(12) + tile header(2) + SOD(2) + 2 layers(40), EOC
    assert_eq!(codestream.len(), MAIN_HEADER.len() + 12 + 2 + 2 + 40 + 2);
    assert_eq!(&codestream[..MAIN_HEADER.len()], MAIN_HEADER);
    let sot = MAIN_HEADER.len();
    assert_eq!(&codestream[sot..sot + 2], &MARKER_SOT.to_be_bytes());
    assert_eq!(
        &codestream[sot + 14..sot + 16],
        &MARKER_SOD.to_be_bytes()
    );
    assert_eq!(&codestream[codestream.len() - 2..], &MARKER_EOC.to_be_bytes());

    let headers = request
        .create_codestream(&session.registry, true, None)
        .unwrap()
        .unwrap();
    assert_eq!(headers.len(), codestream.len() - 40);
}

#[test]
fn test_invalid_requests_rejected() {
    let session = Session::new(1);
    let log = Rc::default();
    let make = |params: RegionParams, stages: Option<Vec<ProgressivenessStage>>| {
        let log: Rc<RefCell<Vec<usize>>> = Rc::clone(&log);
        ProgressiveFetchRequest::new(
            params,
            stages,
            session.structure.clone(),
            session.requester.clone(),
            RequestCallbacks::new(move |s| log.borrow_mut().push(s)),
        )
    };

    assert!(matches!(
        make(RegionParams::new(10, 10, 10, 20), None),
        Err(RequestError::Argument(_))
    ));
    assert!(matches!(
        make(RegionParams::new(0, 0, 200, 200).with_resolution_levels_to_cut(1), None),
        Err(RequestError::Argument(_))
    ));
    assert!(matches!(
        make(whole_image().with_quality(4), None),
        Err(RequestError::Argument(_))
    ));
    assert!(matches!(
        make(
            whole_image(),
            Some(vec![ProgressivenessStage::layers(2), ProgressivenessStage::layers(1)])
        ),
        Err(RequestError::Argument(_))
    ));
    assert!(make(RegionParams::new(0, 0, 128, 128).with_resolution_levels_to_cut(1), None).is_ok());
}
