//! Pluggable policies and options for [`PriorityScheduler`](super::PriorityScheduler).

/// Default capacity of the list of recently enqueued jobs.
pub const DEFAULT_NUM_NEW_JOBS: usize = 20;

/// Default number of scheduling events between re-ranks of old jobs.
pub const DEFAULT_NUM_JOBS_BEFORE_RERANK: usize = 20;

/// Priority below which a job is dropped.
pub const PRIORITY_ABORT: i32 = -1;

/// Maps a job context to its current priority.
///
/// Priorities are re-evaluated every time the scheduler considers a job, so
/// implementations may depend on state that changes over time (a viewport,
/// a cancellation flag). A negative value means the job is no longer needed
/// and it will be aborted.
///
/// Implementations must not call back into the scheduler.
pub trait Prioritizer<C> {
    fn priority(&self, context: &C) -> i32;
}

impl<C, F> Prioritizer<C> for F
where
    F: Fn(&C) -> i32,
{
    fn priority(&self, context: &C) -> i32 {
        self(context)
    }
}

/// Creates pool resources on first need.
pub trait ResourceFactory<R> {
    fn create(&mut self) -> R;
}

impl<R, F> ResourceFactory<R> for F
where
    F: FnMut() -> R,
{
    fn create(&mut self) -> R {
        self()
    }
}

/// Tuning knobs of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Name carried into log records
    pub name: String,

    /// Capacity of the most-recent-first list of new jobs; overflow ages the
    /// oldest entry into the priority buckets
    pub num_new_jobs: usize,

    /// Scheduling events between re-ranks of all pending jobs
    pub num_jobs_before_rerank_old_priorities: usize,

    /// Resources kept back for high-priority jobs
    pub resources_guaranteed_for_high_priority: usize,

    /// Minimal priority allowed to take a guaranteed resource
    pub high_priority_to_guarantee_resource: i32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            num_new_jobs: DEFAULT_NUM_NEW_JOBS,
            num_jobs_before_rerank_old_priorities: DEFAULT_NUM_JOBS_BEFORE_RERANK,
            resources_guaranteed_for_high_priority: 0,
            high_priority_to_guarantee_resource: 0,
        }
    }
}

impl SchedulerOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Keep `count` resources for jobs with priority at least `min_priority`.
    pub fn with_guaranteed_resources(mut self, count: usize, min_priority: i32) -> Self {
        self.resources_guaranteed_for_high_priority = count;
        self.high_priority_to_guarantee_resource = min_priority;
        self
    }

    pub fn with_num_new_jobs(mut self, num_new_jobs: usize) -> Self {
        self.num_new_jobs = num_new_jobs;
        self
    }

    pub fn with_rerank_interval(mut self, num_jobs: usize) -> Self {
        self.num_jobs_before_rerank_old_priorities = num_jobs;
        self
    }
}
