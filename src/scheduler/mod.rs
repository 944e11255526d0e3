//! Priority job scheduling over a bounded resource pool.
//!
//! Jobs are fetches or decodes that each need one pooled resource (a network
//! channel, a decode worker). The scheduler keeps at most `jobs_limit` of them
//! running and always hands a freed resource to the most relevant waiting job,
//! as judged by a [`Prioritizer`] evaluated at the time of the decision.
//!
//! # Components
//!
//! - [`PriorityScheduler`]: the scheduler handle
//! - [`Prioritizer`]: context → priority policy (negative aborts)
//! - [`ResourceFactory`]: lazy creation of pool resources
//! - [`SchedulerOptions`]: recent-list size, re-rank interval, guaranteed
//!   resources for high-priority work

mod policy;
mod priority_scheduler;

pub use policy::{
    Prioritizer, ResourceFactory, SchedulerOptions, DEFAULT_NUM_JOBS_BEFORE_RERANK,
    DEFAULT_NUM_NEW_JOBS, PRIORITY_ABORT,
};
pub use priority_scheduler::{PriorityScheduler, YieldOutcome};
