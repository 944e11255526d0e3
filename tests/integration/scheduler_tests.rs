//! Scheduler behavior over long job runs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use jpip_streamer::scheduler::{PriorityScheduler, SchedulerOptions};

use super::test_utils::shuffled;

#[derive(Clone)]
struct Job {
    id: usize,
    priority: Rc<Cell<i32>>,
}

struct Harness {
    scheduler: PriorityScheduler<Job, usize>,
    running: Rc<RefCell<Vec<(usize, usize)>>>,
    ran: Rc<RefCell<Vec<usize>>>,
    aborted: Rc<RefCell<Vec<usize>>>,
}

impl Harness {
    fn new(resources: usize, options: SchedulerOptions) -> Self {
        let mut next = 0;
        Self {
            scheduler: PriorityScheduler::new(
                move || {
                    next += 1;
                    next
                },
                resources,
                |job: &Job| job.priority.get(),
                options,
            ),
            running: Rc::default(),
            ran: Rc::default(),
            aborted: Rc::default(),
        }
    }

    fn enqueue(&self, id: usize, priority: i32) -> Job {
        let job = Job {
            id,
            priority: Rc::new(Cell::new(priority)),
        };
        let running = self.running.clone();
        let ran = self.ran.clone();
        let aborted = self.aborted.clone();
        self.scheduler
            .enqueue_job(
                move |resource, job: Job| {
                    ran.borrow_mut().push(job.id);
                    running.borrow_mut().push((resource, job.id));
                },
                job.clone(),
                move |job: Job| aborted.borrow_mut().push(job.id),
            )
            .unwrap();
        job
    }

    /// Finish the oldest running job.
    fn finish_one(&self) -> Option<usize> {
        let (resource, id) = {
            let mut running = self.running.borrow_mut();
            if running.is_empty() {
                return None;
            }
            running.remove(0)
        };
        self.scheduler.job_done(resource).unwrap();
        Some(id)
    }

    fn drain(&self) {
        while self.finish_one().is_some() {
            self.scheduler.check_invariants().unwrap();
        }
    }
}

#[test]
fn test_every_job_runs_or_aborts_exactly_once() {
    let options = SchedulerOptions::named("drain")
        .with_num_new_jobs(4)
        .with_rerank_interval(5);
    let harness = Harness::new(3, options);

    let mut jobs = Vec::new();
    for (id, p) in shuffled(60, 7).into_iter().enumerate() {
        jobs.push(harness.enqueue(id, (p % 10) as i32));
        harness.scheduler.check_invariants().unwrap();
        if id % 4 == 0 {
            harness.finish_one();
        }
    }

    // Cancel every fifth job while it may still wait.
    for job in jobs.iter().step_by(5) {
        job.priority.set(-1);
    }

    harness.drain();
    assert_eq!(harness.scheduler.pending_jobs_count(), 0);
    assert_eq!(harness.scheduler.free_resources_count(), 3);

    let ran = harness.ran.borrow();
    let aborted = harness.aborted.borrow();
    assert_eq!(ran.len() + aborted.len(), 60);
    for id in 0..60 {
        let count = ran.iter().filter(|&&r| r == id).count()
            + aborted.iter().filter(|&&a| a == id).count();
        assert_eq!(count, 1, "job {}", id);
    }
    for id in aborted.iter() {
        assert_eq!(id % 5, 0, "job {} aborted without being cancelled", id);
    }
}

#[test]
fn test_negative_priority_never_runs() {
    let harness = Harness::new(2, SchedulerOptions::default());
    harness.enqueue(0, -1);
    harness.enqueue(1, -100);

    assert!(harness.ran.borrow().is_empty());
    assert_eq!(*harness.aborted.borrow(), vec![0, 1]);
    assert_eq!(harness.scheduler.free_resources_count(), 2);
}

#[test]
fn test_waiting_jobs_run_by_priority() {
    let harness = Harness::new(1, SchedulerOptions::default());
    harness.enqueue(0, 1);
    for (id, priority) in [(1, 3), (2, 9), (3, 1), (4, 5)] {
        harness.enqueue(id, priority);
    }

    harness.drain();
    assert_eq!(*harness.ran.borrow(), vec![0, 2, 4, 1, 3]);
}

#[test]
fn test_low_priority_never_takes_guaranteed_resources() {
    // Two of four resources are kept for priority >= 10.
    let options = SchedulerOptions::named("guarded").with_guaranteed_resources(2, 10);
    let harness = Harness::new(4, options);

    for id in 0..10 {
        harness.enqueue(id, 1);
    }
    assert_eq!(harness.running.borrow().len(), 2);
    assert_eq!(harness.scheduler.free_resources_count(), 2);

    harness.enqueue(100, 10);
    harness.enqueue(101, 12);
    assert_eq!(harness.scheduler.free_resources_count(), 0);

    // Low-priority work keeps flowing through the unreserved resources.
    while harness.finish_one().is_some() {
        assert!(harness.running.borrow().iter().filter(|(_, id)| *id < 100).count() <= 2);
        harness.scheduler.check_invariants().unwrap();
    }
    assert_eq!(harness.ran.borrow().len(), 12);
}

#[test]
fn test_priority_change_while_waiting() {
    let options = SchedulerOptions::default().with_num_new_jobs(1);
    let harness = Harness::new(1, options);

    harness.enqueue(0, 1);
    let late = harness.enqueue(1, 1);
    harness.enqueue(2, 2);
    harness.enqueue(3, 3);

    // Jobs 1 and 2 aged into buckets 1 and 2. Raising job 1 does not move it
    // before the bucket scan reaches it.
    late.priority.set(50);
    harness.drain();

    assert_eq!(*harness.ran.borrow(), vec![0, 3, 2, 1]);
    assert!(harness.aborted.borrow().is_empty());
}
