//! Priority scheduler over a bounded resource pool.
//!
//! At most `jobs_limit` jobs hold a resource at any time. Pending jobs are
//! kept in two structures:
//!
//! ```text
//!   enqueue ──▶ new_jobs (most recent first, bounded)
//!                   │ overflow: oldest entry ages out
//!                   ▼
//!               old_jobs_by_priority: priority ─▶ stack of jobs
//! ```
//!
//! When a resource frees up, the best new job is taken first, then old jobs
//! from the highest bucket down. Every candidate's priority is evaluated
//! again before it is accepted, because priorities move (the viewport
//! changes, a request is cancelled). Jobs whose priority turned negative are
//! aborted; old jobs whose priority dropped are moved to a lower bucket.
//!
//! Everything runs on one thread. The scheduler is a cloneable handle so job
//! functions can report completion through it, and no job, abort or yield
//! callback is invoked while its internal state is borrowed.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::SchedulerError;

use super::policy::{Prioritizer, ResourceFactory, SchedulerOptions};

type JobFn<C, R> = Box<dyn FnOnce(R, C)>;
type AbortFn<C> = Box<dyn FnOnce(C)>;
type YieldFn<C> = Box<dyn FnOnce(&C)>;

struct Job<C, R> {
    run: JobFn<C, R>,
    on_aborted: AbortFn<C>,
    context: C,
}

/// What [`PriorityScheduler::try_yield`] did with the running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldOutcome {
    /// Nothing outranked the job; its continuation ran with the same resource.
    Continued,
    /// The resource went to a higher-priority job; the continuation is queued.
    Yielded,
    /// The job's priority turned negative; it was aborted and its resource freed.
    Aborted,
}

/// Callbacks collected while the state is borrowed, run once it is released.
struct Dispatch<C, R> {
    aborted: Vec<Job<C, R>>,
    yielded: Option<(YieldFn<C>, C)>,
    scheduled: Option<(Job<C, R>, R)>,
}

impl<C, R> Dispatch<C, R> {
    fn new() -> Self {
        Self {
            aborted: Vec::new(),
            yielded: None,
            scheduled: None,
        }
    }

    fn run(self) {
        for job in self.aborted {
            (job.on_aborted)(job.context);
        }
        if let Some((on_yielded, context)) = self.yielded {
            on_yielded(&context);
        }
        if let Some((job, resource)) = self.scheduled {
            (job.run)(resource, job.context);
        }
    }
}

struct SchedulerState<C, R> {
    options: SchedulerOptions,
    prioritizer: Box<dyn Prioritizer<C>>,
    resource_factory: Box<dyn ResourceFactory<R>>,
    free_resources: Vec<R>,
    free_resources_count: usize,
    new_jobs: VecDeque<Job<C, R>>,
    old_jobs_by_priority: BTreeMap<i32, Vec<Job<C, R>>>,
    pending_jobs_count: usize,
    schedules_counter: usize,
}

/// Runs jobs over a bounded pool of resources, highest priority first.
///
/// Cloning yields another handle to the same scheduler.
pub struct PriorityScheduler<C, R> {
    state: Rc<RefCell<SchedulerState<C, R>>>,
}

impl<C, R> Clone for PriorityScheduler<C, R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<C: 'static, R: 'static> PriorityScheduler<C, R> {
    /// Create a scheduler running at most `jobs_limit` jobs at once.
    ///
    /// Resources are created lazily through `resource_factory`.
    pub fn new(
        resource_factory: impl ResourceFactory<R> + 'static,
        jobs_limit: usize,
        prioritizer: impl Prioritizer<C> + 'static,
        options: SchedulerOptions,
    ) -> Self {
        debug!(
            scheduler = %options.name,
            jobs_limit,
            num_new_jobs = options.num_new_jobs,
            guaranteed = options.resources_guaranteed_for_high_priority,
            "scheduler created"
        );

        Self {
            state: Rc::new(RefCell::new(SchedulerState {
                options,
                prioritizer: Box::new(prioritizer),
                resource_factory: Box::new(resource_factory),
                free_resources: Vec::with_capacity(jobs_limit),
                free_resources_count: jobs_limit,
                new_jobs: VecDeque::new(),
                old_jobs_by_priority: BTreeMap::new(),
                pending_jobs_count: 0,
                schedules_counter: 0,
            })),
        }
    }

    /// Submit a job.
    ///
    /// With a negative priority, `on_aborted` runs immediately and the job is
    /// dropped. Otherwise the job runs now if a resource is free and its
    /// priority clears the guarantee floor, else it waits. `job` receives the
    /// resource and must eventually hand it back through [`Self::job_done`]
    /// or [`Self::try_yield`].
    pub fn enqueue_job(
        &self,
        job: impl FnOnce(R, C) + 'static,
        context: C,
        on_aborted: impl FnOnce(C) + 'static,
    ) -> Result<(), SchedulerError> {
        let job = Job {
            run: Box::new(job),
            on_aborted: Box::new(on_aborted),
            context,
        };

        let dispatch = self.state.borrow_mut().enqueue(job)?;
        dispatch.run();
        Ok(())
    }

    /// Return a resource after a job finished, and schedule the best pending
    /// job on it.
    pub fn job_done(&self, resource: R) -> Result<(), SchedulerError> {
        let dispatch = {
            let mut state = self.state.borrow_mut();
            let mut dispatch = Dispatch::new();
            state.resource_freed(resource, &mut dispatch);
            state.ensure_pending_jobs_count()?;
            dispatch
        };
        dispatch.run();
        Ok(())
    }

    /// Offer the resource of a running job to higher-priority work.
    ///
    /// The running job checkpoints itself as `continuation`. If a new job
    /// with a strictly higher priority waits, `on_yielded` is called, the
    /// continuation is queued at its current priority and the resource goes
    /// to the other job. If the context's priority turned negative, the job
    /// is aborted and the resource freed. Otherwise the continuation runs
    /// right away with the same resource.
    pub fn try_yield(
        &self,
        continuation: impl FnOnce(R, C) + 'static,
        context: C,
        on_aborted: impl FnOnce(C) + 'static,
        on_yielded: impl FnOnce(&C) + 'static,
        resource: R,
    ) -> Result<YieldOutcome, SchedulerError>
    where
        C: Clone,
    {
        let job = Job {
            run: Box::new(continuation),
            on_aborted: Box::new(on_aborted),
            context,
        };

        let (dispatch, outcome) = {
            let mut state = self.state.borrow_mut();
            let mut dispatch = Dispatch::new();
            let priority = state.priority_of(&job.context);

            let outcome = if priority < 0 {
                debug!(scheduler = %state.options.name, priority, "running job aborted on yield");
                dispatch.aborted.push(job);
                state.resource_freed(resource, &mut dispatch);
                YieldOutcome::Aborted
            } else if let Some(higher) =
                state.take_best_new_job(priority.saturating_add(1), &mut dispatch)
            {
                debug!(scheduler = %state.options.name, priority, "job yielded resource");
                dispatch.yielded = Some((Box::new(on_yielded), job.context.clone()));
                state.enqueue_new_job(job, &mut dispatch);
                state.schedule(higher, resource, &mut dispatch);
                YieldOutcome::Yielded
            } else {
                dispatch.scheduled = Some((job, resource));
                YieldOutcome::Continued
            };

            state.ensure_pending_jobs_count()?;
            (dispatch, outcome)
        };

        dispatch.run();
        Ok(outcome)
    }

    /// Whether a running job with this context should stop: its priority is
    /// negative, or a new job with a higher priority is waiting.
    ///
    /// Waiting jobs found to have a negative priority are aborted on the way.
    pub fn should_yield_or_abort(&self, context: &C) -> Result<bool, SchedulerError> {
        let (dispatch, should_stop) = {
            let mut state = self.state.borrow_mut();
            let mut dispatch = Dispatch::new();
            let priority = state.priority_of(context);
            let should_stop =
                priority < 0 || state.has_new_job_with_higher_priority(priority, &mut dispatch);
            state.ensure_pending_jobs_count()?;
            (dispatch, should_stop)
        };
        dispatch.run();
        Ok(should_stop)
    }

    /// Number of jobs waiting for a resource.
    pub fn pending_jobs_count(&self) -> usize {
        self.state.borrow().pending_jobs_count
    }

    /// Number of jobs in the recent list.
    pub fn new_jobs_count(&self) -> usize {
        self.state.borrow().new_jobs.len()
    }

    /// Number of resources not held by a running job.
    pub fn free_resources_count(&self) -> usize {
        self.state.borrow().free_resources_count
    }

    /// Verify the pending job count against the queues.
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        self.state.borrow().ensure_pending_jobs_count()
    }
}

impl<C, R> SchedulerState<C, R> {
    fn priority_of(&self, context: &C) -> i32 {
        self.prioritizer.priority(context)
    }

    fn enqueue(&mut self, job: Job<C, R>) -> Result<Dispatch<C, R>, SchedulerError> {
        let mut dispatch = Dispatch::new();
        let priority = self.priority_of(&job.context);

        if priority < 0 {
            debug!(scheduler = %self.options.name, priority, "job aborted on enqueue");
            dispatch.aborted.push(job);
            return Ok(dispatch);
        }

        if priority >= self.minimal_priority_to_schedule() {
            if let Some(resource) = self.try_get_free_resource() {
                self.schedule(job, resource, &mut dispatch);
                self.ensure_pending_jobs_count()?;
                return Ok(dispatch);
            }
        }

        trace!(scheduler = %self.options.name, priority, "job queued");
        self.enqueue_new_job(job, &mut dispatch);
        self.ensure_pending_jobs_count()?;
        Ok(dispatch)
    }

    /// The lowest priority allowed to take a resource right now.
    fn minimal_priority_to_schedule(&self) -> i32 {
        let guaranteed = self.options.resources_guaranteed_for_high_priority;
        if guaranteed > 0 && self.free_resources_count <= guaranteed {
            self.options.high_priority_to_guarantee_resource
        } else {
            0
        }
    }

    fn try_get_free_resource(&mut self) -> Option<R> {
        if self.free_resources_count == 0 {
            return None;
        }

        self.free_resources_count -= 1;
        let resource = match self.free_resources.pop() {
            Some(resource) => resource,
            None => self.resource_factory.create(),
        };
        Some(resource)
    }

    fn resource_freed(&mut self, resource: R, dispatch: &mut Dispatch<C, R>) {
        // The floor is computed as if the resource were already back.
        self.free_resources_count += 1;
        let min_priority = self.minimal_priority_to_schedule();
        self.free_resources_count -= 1;

        let next = match self.take_best_new_job(min_priority, dispatch) {
            Some(job) => Some(job),
            None => self.take_old_job(min_priority, dispatch),
        };

        match next {
            Some(job) => self.schedule(job, resource, dispatch),
            None => {
                self.free_resources.push(resource);
                self.free_resources_count += 1;
            }
        }
    }

    fn schedule(&mut self, job: Job<C, R>, resource: R, dispatch: &mut Dispatch<C, R>) {
        self.schedules_counter += 1;
        if self.schedules_counter >= self.options.num_jobs_before_rerank_old_priorities {
            self.schedules_counter = 0;
            self.rerank_priorities(dispatch);
        }

        trace!(
            scheduler = %self.options.name,
            pending = self.pending_jobs_count,
            free = self.free_resources_count,
            "job scheduled"
        );
        dispatch.scheduled = Some((job, resource));
    }

    fn enqueue_new_job(&mut self, job: Job<C, R>, dispatch: &mut Dispatch<C, R>) {
        self.pending_jobs_count += 1;
        self.new_jobs.push_front(job);

        if self.new_jobs.len() <= self.options.num_new_jobs {
            return;
        }

        if let Some(oldest) = self.new_jobs.pop_back() {
            self.enqueue_old_job(oldest, dispatch);
        }
    }

    fn enqueue_old_job(&mut self, job: Job<C, R>, dispatch: &mut Dispatch<C, R>) {
        let priority = self.priority_of(&job.context);
        if priority < 0 {
            self.pending_jobs_count -= 1;
            dispatch.aborted.push(job);
            return;
        }

        self.old_jobs_by_priority
            .entry(priority)
            .or_default()
            .push(job);
    }

    /// Remove and return the new job with the highest current priority that
    /// is at least `min_priority`. Ties go to the most recent job.
    fn take_best_new_job(
        &mut self,
        min_priority: i32,
        dispatch: &mut Dispatch<C, R>,
    ) -> Option<Job<C, R>> {
        let mut best: Option<(usize, i32)> = None;
        let mut idx = 0;

        while idx < self.new_jobs.len() {
            let priority = self.priority_of(&self.new_jobs[idx].context);

            if priority < 0 {
                if let Some(job) = self.new_jobs.remove(idx) {
                    self.pending_jobs_count -= 1;
                    dispatch.aborted.push(job);
                }
                continue;
            }

            if priority >= min_priority && best.map_or(true, |(_, found)| priority > found) {
                best = Some((idx, priority));
            }
            idx += 1;
        }

        let (idx, _) = best?;
        let job = self.new_jobs.remove(idx)?;
        self.pending_jobs_count -= 1;
        Some(job)
    }

    fn has_new_job_with_higher_priority(
        &mut self,
        low_priority: i32,
        dispatch: &mut Dispatch<C, R>,
    ) -> bool {
        let mut idx = 0;
        while idx < self.new_jobs.len() {
            let priority = self.priority_of(&self.new_jobs[idx].context);

            if priority < 0 {
                if let Some(job) = self.new_jobs.remove(idx) {
                    self.pending_jobs_count -= 1;
                    dispatch.aborted.push(job);
                }
                continue;
            }

            if priority > low_priority {
                return true;
            }
            idx += 1;
        }
        false
    }

    /// Take an old job, scanning buckets from the highest priority down to
    /// `min_priority`, most recent first inside a bucket.
    fn take_old_job(
        &mut self,
        min_priority: i32,
        dispatch: &mut Dispatch<C, R>,
    ) -> Option<Job<C, R>> {
        let mut upper: Option<i32> = None;

        loop {
            let bucket_priority = match upper {
                None => self.old_jobs_by_priority.keys().next_back().copied(),
                Some(bound) => self
                    .old_jobs_by_priority
                    .range(..bound)
                    .next_back()
                    .map(|(priority, _)| *priority),
            }?;

            if bucket_priority < min_priority {
                return None;
            }
            upper = Some(bucket_priority);

            while let Some(job) = self
                .old_jobs_by_priority
                .get_mut(&bucket_priority)
                .and_then(Vec::pop)
            {
                let priority = self.priority_of(&job.context);

                if priority < 0 {
                    self.pending_jobs_count -= 1;
                    dispatch.aborted.push(job);
                } else if priority >= bucket_priority {
                    self.remove_bucket_if_empty(bucket_priority);
                    self.pending_jobs_count -= 1;
                    return Some(job);
                } else {
                    // Lower buckets are visited later in this scan.
                    self.old_jobs_by_priority
                        .entry(priority)
                        .or_default()
                        .push(job);
                }
            }

            self.old_jobs_by_priority.remove(&bucket_priority);
        }
    }

    fn remove_bucket_if_empty(&mut self, priority: i32) {
        if self
            .old_jobs_by_priority
            .get(&priority)
            .is_some_and(Vec::is_empty)
        {
            self.old_jobs_by_priority.remove(&priority);
        }
    }

    /// Redistribute every pending job into the priority buckets by its
    /// current priority.
    fn rerank_priorities(&mut self, dispatch: &mut Dispatch<C, R>) {
        let old_buckets = std::mem::take(&mut self.old_jobs_by_priority);
        let new_jobs = std::mem::take(&mut self.new_jobs);

        if old_buckets.is_empty() && new_jobs.is_empty() {
            return;
        }

        // Oldest first, so the most recent jobs end on top of their bucket.
        for job in old_buckets.into_values().flatten() {
            self.enqueue_old_job(job, dispatch);
        }
        for job in new_jobs.into_iter().rev() {
            self.enqueue_old_job(job, dispatch);
        }

        debug!(
            scheduler = %self.options.name,
            buckets = ?self
                .old_jobs_by_priority
                .iter()
                .map(|(priority, jobs)| (*priority, jobs.len()))
                .collect::<Vec<_>>(),
            "rerank"
        );
    }

    fn ensure_pending_jobs_count(&self) -> Result<(), SchedulerError> {
        let old_jobs: usize = self.old_jobs_by_priority.values().map(Vec::len).sum();
        let queued = old_jobs + self.new_jobs.len();

        if queued != self.pending_jobs_count {
            return Err(SchedulerError::InconsistentJobCount {
                counted: self.pending_jobs_count,
                queued,
            });
        }
        Ok(())
    }
}
