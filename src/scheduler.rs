//! Two-phase job scheduler: ordered queue jobs, deferred post callbacks,
//! one drain per microtask.
//!
//! Writes batched within one synchronous region collapse into a single
//! drain: the first enqueue parks [`flush_jobs`] on the microtask queue, and
//! everything queued before the host reaches its yield point runs in that
//! one drain. Within a drain, jobs run in ascending id order (jobs without
//! an id last), pre jobs before plain jobs at the same id; post callbacks
//! run after the queue empties; work produced by post callbacks starts a
//! fresh queue pass inside the same drain.
//!
//! Job identity is `Arc` identity: enqueueing the same `Arc<Job>` twice
//! while it is pending is a no-op.

use crate::hash::FastHashBuilder;
use crate::microtask;
use parking_lot::{Mutex, RwLock};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// How many times one job may run within a single drain before it is
/// skipped as runaway recursion (checked in debug builds).
pub const RECURSION_LIMIT: u32 = 100;

/// Handler for failures escaping a scheduler job.
///
/// The drain never stops on a failing job; the panic message is routed
/// here (or to stderr when no handler is installed) and the next job runs.
pub type ErrorHandler = Box<dyn Fn(&str) + Send + Sync>;

static ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

thread_local! {
    // Main queue, kept in non-decreasing id order from flush_index on.
    static QUEUE: RefCell<Vec<Arc<Job>>> = const { RefCell::new(Vec::new()) };
    // Index of the job currently running; entries strictly after it may
    // still be reordered or invalidated.
    static FLUSH_INDEX: Cell<usize> = const { Cell::new(0) };

    static PENDING_POST: RefCell<Vec<Arc<Job>>> = const { RefCell::new(Vec::new()) };
    static ACTIVE_POST: RefCell<Option<Vec<Arc<Job>>>> = const { RefCell::new(None) };
    static POST_INDEX: Cell<usize> = const { Cell::new(0) };

    static IS_FLUSHING: Cell<bool> = const { Cell::new(false) };
    static IS_FLUSH_PENDING: Cell<bool> = const { Cell::new(false) };

    // The in-flight drain's completion hook list, for next_tick.
    static CURRENT_TICKET: RefCell<Option<FlushTicket>> = const { RefCell::new(None) };
}

/// Per-drain invocation counts, keyed by job identity.
type Seen = HashMap<usize, u32, FastHashBuilder>;

/// A schedulable unit of work.
///
/// Jobs are shared as `Arc<Job>`; the pointer is the identity the queue
/// deduplicates on. Typically a job is an effect's scheduler callback or a
/// renderer update, but any callback qualifies.
pub struct Job {
    cb: Mutex<Box<dyn FnMut() + Send>>,
    id: Option<u32>,
    pre: bool,
    allow_recurse: bool,
    computed: bool,
    active: AtomicBool,
    owner: Option<String>,
}

impl Job {
    /// A plain job: no ordering id, not pre, runs when its turn comes.
    pub fn new<F>(f: F) -> Arc<Job>
    where
        F: FnMut() + Send + 'static,
    {
        JobOptions::new().build(f)
    }

    /// The ordering id, if any. Jobs without an id sort after all jobs
    /// with one.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Whether this is a pre job (runs before non-pre jobs at the same id,
    /// and is drained by [`flush_pre_flush_cbs`]).
    pub fn is_pre(&self) -> bool {
        self.pre
    }

    /// Whether the job was marked as backing a computed value.
    pub fn is_computed(&self) -> bool {
        self.computed
    }

    /// Whether the drain will still run this job.
    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Disable (or re-enable) the job. A disabled job stays in the queue
    /// but is skipped by the drain; effect teardown uses this to cancel
    /// updates that are already scheduled.
    pub fn set_active(&self, active: bool) {
        self.active
            .store(active, std::sync::atomic::Ordering::Release);
    }

    fn invoke(&self) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.cb.lock())();
        }));
        if let Err(payload) = result {
            report_job_error(payload_message(payload.as_ref()));
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("pre", &self.pre)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Configuration for [`Job`] construction.
///
/// # Example
/// ```ignore
/// let update = JobOptions::new().id(instance_uid).pre().build(move || {
///     // observe pre-update state
/// });
/// queue_job(&update);
/// ```
#[derive(Default)]
pub struct JobOptions {
    id: Option<u32>,
    pre: bool,
    allow_recurse: bool,
    computed: bool,
    owner: Option<String>,
}

impl JobOptions {
    /// Start from the defaults: no id, plain phase, no recursion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordering id. Parents are created before children, so
    /// id-ordered drains update parents first.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Run before non-pre jobs at the same id.
    pub fn pre(mut self) -> Self {
        self.pre = true;
        self
    }

    /// Allow the job to requeue itself while it is running.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Mark the job as backing a computed value (informational; hosts that
    /// inspect the queue use it).
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Name the owning component, used by the runaway-recursion warning.
    pub fn owner(mut self, name: impl Into<String>) -> Self {
        self.owner = Some(name.into());
        self
    }

    /// Create the job.
    pub fn build<F>(self, f: F) -> Arc<Job>
    where
        F: FnMut() + Send + 'static,
    {
        Arc::new(Job {
            cb: Mutex::new(Box::new(f)),
            id: self.id,
            pre: self.pre,
            allow_recurse: self.allow_recurse,
            computed: self.computed,
            active: AtomicBool::new(true),
            owner: self.owner,
        })
    }
}

/// Install the job-failure handler, replacing any previous one.
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    *ERROR_HANDLER.write() = Some(Box::new(handler));
}

/// Remove the job-failure handler; failures fall back to stderr.
pub fn clear_error_handler() {
    *ERROR_HANDLER.write() = None;
}

fn report_job_error(message: &str) {
    match ERROR_HANDLER.read().as_ref() {
        Some(handler) => handler(message),
        None => eprintln!("scheduler: job failed: {message}"),
    }
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn sort_id(job: &Job) -> u64 {
    job.id.map(u64::from).unwrap_or(u64::MAX)
}

fn comparator(a: &Arc<Job>, b: &Arc<Job>) -> Ordering {
    match sort_id(a).cmp(&sort_id(b)) {
        Ordering::Equal => {
            if a.pre && !b.pre {
                Ordering::Less
            } else if b.pre && !a.pre {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

/// Binary search for the insertion point of `id`, scanning only the part of
/// the queue that may still be reordered.
fn find_insertion_index(queue: &[Arc<Job>], id: u64) -> usize {
    let mut start = FLUSH_INDEX.get() + 1;
    let mut end = queue.len();
    while start < end {
        let middle = (start + end) >> 1;
        if sort_id(&queue[middle]) < id {
            start = middle + 1;
        } else {
            end = middle;
        }
    }
    start.min(queue.len())
}

/// Enqueue a job for the next drain.
///
/// Enqueueing a job that is already pending is a no-op. While a drain is
/// running, the running job itself can only requeue if it was built with
/// `allow_recurse`.
pub fn queue_job(job: &Arc<Job>) {
    let inserted = QUEUE.with(|q| {
        let mut q = q.borrow_mut();
        let from = if IS_FLUSHING.get() && job.allow_recurse {
            FLUSH_INDEX.get() + 1
        } else {
            FLUSH_INDEX.get()
        };
        if q[from.min(q.len())..].iter().any(|j| Arc::ptr_eq(j, job)) {
            return false;
        }
        match job.id {
            None => q.push(job.clone()),
            Some(id) => {
                let at = find_insertion_index(&q, u64::from(id));
                q.insert(at, job.clone());
            }
        }
        true
    });
    if inserted {
        queue_flush();
    }
}

/// Defer a callback until the main queue has drained.
///
/// Deduplicates against the post list currently being drained, so a post
/// callback re-queued by the drain itself only runs once (unless built with
/// `allow_recurse`).
pub fn queue_post_flush_cb(job: &Arc<Job>) {
    let duplicate = ACTIVE_POST.with(|a| {
        let a = a.borrow();
        match a.as_ref() {
            Some(active) => {
                let from = if IS_FLUSHING.get() && job.allow_recurse {
                    POST_INDEX.get() + 1
                } else {
                    POST_INDEX.get()
                };
                active[from.min(active.len())..]
                    .iter()
                    .any(|j| Arc::ptr_eq(j, job))
            }
            None => false,
        }
    });
    if !duplicate {
        PENDING_POST.with(|p| p.borrow_mut().push(job.clone()));
    }
    queue_flush();
}

/// Defer a batch of callbacks (a lifecycle group) without deduplication.
pub fn queue_post_flush_cbs(jobs: &[Arc<Job>]) {
    PENDING_POST.with(|p| p.borrow_mut().extend(jobs.iter().cloned()));
    queue_flush();
}

/// Remove a job that has not started yet.
///
/// No-op for the running job, jobs that already ran this drain, and jobs
/// that are not queued.
pub fn invalidate_job(job: &Arc<Job>) {
    QUEUE.with(|q| {
        let mut q = q.borrow_mut();
        if let Some(i) = q.iter().position(|j| Arc::ptr_eq(j, job)) {
            if i > FLUSH_INDEX.get() {
                q.remove(i);
            }
        }
    });
}

/// Run every pre job still waiting in the queue, in place.
///
/// Watch-style callers use this to observe pre-update state before the
/// ordinary drain reaches their position. Each pre job is spliced out and
/// then invoked; the scan resumes from the mutated index, so a pre job
/// inserted behind the scan position by the invoked job waits for the next
/// pass.
pub fn flush_pre_flush_cbs() {
    let mut seen = Seen::default();
    flush_pre_flush_cbs_with(&mut seen);
}

fn flush_pre_flush_cbs_with(seen: &mut Seen) {
    let mut i = if IS_FLUSHING.get() {
        FLUSH_INDEX.get() + 1
    } else {
        0
    };
    loop {
        let job = QUEUE.with(|q| {
            let q = q.borrow();
            while i < q.len() {
                if q[i].pre {
                    return Some(q[i].clone());
                }
                i += 1;
            }
            None
        });
        let Some(job) = job else { break };
        if check_recursive_updates(seen, &job) {
            // Left in the queue; move past it
            i += 1;
            continue;
        }
        QUEUE.with(|q| {
            q.borrow_mut().remove(i);
        });
        job.invoke();
    }
}

/// Drain every deferred post callback immediately.
///
/// Normally the drain calls this after the queue empties; hosts may also
/// force it (e.g. around unmount) to run pending post work early.
pub fn flush_post_flush_cbs() {
    let mut seen = Seen::default();
    flush_post_flush_cbs_with(&mut seen);
}

fn flush_post_flush_cbs_with(seen: &mut Seen) {
    let pending: Vec<Arc<Job>> = PENDING_POST.with(|p| p.borrow_mut().drain(..).collect());
    if pending.is_empty() {
        return;
    }

    // Dedup by identity, first occurrence wins
    let mut deduped: Vec<Arc<Job>> = Vec::with_capacity(pending.len());
    for job in pending {
        if !deduped.iter().any(|j| Arc::ptr_eq(j, &job)) {
            deduped.push(job);
        }
    }

    // A drain nested inside an active post drain hands its callbacks to
    // the outer drain
    let appended = ACTIVE_POST.with(|a| {
        let mut a = a.borrow_mut();
        match a.as_mut() {
            Some(active) => {
                active.extend(deduped.iter().cloned());
                true
            }
            None => false,
        }
    });
    if appended {
        return;
    }

    let mut deduped = deduped;
    deduped.sort_by(|a, b| sort_id(a).cmp(&sort_id(b)));
    ACTIVE_POST.with(|a| *a.borrow_mut() = Some(deduped));

    loop {
        let pi = POST_INDEX.get();
        let job = ACTIVE_POST.with(|a| a.borrow().as_ref().and_then(|v| v.get(pi).cloned()));
        let Some(job) = job else { break };
        if !check_recursive_updates(seen, &job) {
            job.invoke();
        }
        POST_INDEX.set(pi + 1);
    }

    ACTIVE_POST.with(|a| *a.borrow_mut() = None);
    POST_INDEX.set(0);
}

/// Schedule a callback after the in-flight (or next) drain completes.
///
/// Never starts a drain by itself: with no drain pending, the callback
/// simply runs at the next microtask checkpoint.
pub fn next_tick<F>(f: F)
where
    F: FnOnce() + 'static,
{
    let ticket = CURRENT_TICKET.with(|t| t.borrow().clone());
    match ticket {
        Some(ticket) => ticket.add_waiter(Box::new(f)),
        None => microtask::defer(f),
    }
}

/// Completion hook list of one drain. Cloned into the drain's microtask;
/// waiters added by `next_tick` fire (as fresh microtasks) once the
/// outermost `flush_jobs` returns.
#[derive(Clone, Default)]
struct FlushTicket {
    waiters: Rc<RefCell<Vec<Box<dyn FnOnce()>>>>,
}

impl FlushTicket {
    fn add_waiter(&self, f: Box<dyn FnOnce()>) {
        self.waiters.borrow_mut().push(f);
    }

    fn complete(self) {
        for waiter in self.waiters.borrow_mut().drain(..) {
            microtask::defer(waiter);
        }
    }
}

/// Park one drain on the microtask queue, if none is pending or running.
fn queue_flush() {
    if !IS_FLUSHING.get() && !IS_FLUSH_PENDING.get() {
        IS_FLUSH_PENDING.set(true);
        let ticket = FlushTicket::default();
        CURRENT_TICKET.with(|t| *t.borrow_mut() = Some(ticket.clone()));
        microtask::defer(move || {
            let mut seen = Seen::default();
            flush_jobs(&mut seen);
            ticket.complete();
        });
    }
}

/// The drain. Sorts, runs the queue in order, drains post callbacks, and
/// re-enters while jobs or post callbacks keep appearing, carrying the
/// same per-drain invocation counts.
fn flush_jobs(seen: &mut Seen) {
    IS_FLUSH_PENDING.set(false);
    IS_FLUSHING.set(true);

    // Ascending id (absent id last), pre before plain on ties: parent
    // components were created first and must update first, and their pre
    // effects must observe pre-update child state.
    QUEUE.with(|q| q.borrow_mut().sort_by(comparator));

    loop {
        let fi = FLUSH_INDEX.get();
        let job = QUEUE.with(|q| q.borrow().get(fi).cloned());
        let Some(job) = job else { break };
        if job.is_active() && !check_recursive_updates(seen, &job) {
            job.invoke();
        }
        FLUSH_INDEX.set(fi + 1);
    }

    FLUSH_INDEX.set(0);
    QUEUE.with(|q| q.borrow_mut().clear());

    flush_post_flush_cbs_with(seen);

    IS_FLUSHING.set(false);
    CURRENT_TICKET.with(|t| t.borrow_mut().take());

    // Post callbacks may have produced more work; drain it in the same
    // invocation so nothing waits for another microtask
    let more = QUEUE.with(|q| !q.borrow().is_empty())
        || PENDING_POST.with(|p| !p.borrow().is_empty());
    if more {
        flush_jobs(seen);
    }
}

/// Count one invocation attempt; over the limit, warn and skip.
///
/// The count is per drain attempt, so reentry across nested drains starts
/// fresh. Active only in debug builds.
fn check_recursive_updates(seen: &mut Seen, job: &Arc<Job>) -> bool {
    if !cfg!(debug_assertions) {
        return false;
    }
    let key = Arc::as_ptr(job) as usize;
    let count = seen.get(&key).copied().unwrap_or(0);
    if count > RECURSION_LIMIT {
        cov_mark::hit!(recursion_limit_exceeded);
        match &job.owner {
            Some(owner) => eprintln!(
                "Warning: maximum recursive updates exceeded in component <{owner}>. \
                 A job is scheduling itself on every run; it will be skipped for this drain."
            ),
            None => eprintln!(
                "Warning: maximum recursive updates exceeded. \
                 A job is scheduling itself on every run; it will be skipped for this drain."
            ),
        }
        true
    } else {
        seen.insert(key, count + 1);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microtask::flush_microtasks;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn recording_job(
        options: JobOptions,
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> Arc<Job> {
        let log = log.clone();
        options.build(move || log.lock().push(name))
    }

    #[test]
    fn drain_orders_by_id_with_pre_first_on_ties() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let j1 = recording_job(JobOptions::new().id(2), &log, "j1");
        let j2 = recording_job(JobOptions::new().id(1).pre(), &log, "j2");
        let j3 = recording_job(JobOptions::new().id(1), &log, "j3");

        queue_job(&j1);
        queue_job(&j2);
        queue_job(&j3);
        flush_microtasks();

        assert_eq!(*log.lock(), vec!["j2", "j3", "j1"]);
    }

    #[test]
    fn jobs_without_id_sort_last() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let tail = recording_job(JobOptions::new(), &log, "tail");
        let head = recording_job(JobOptions::new().id(7), &log, "head");

        queue_job(&tail);
        queue_job(&head);
        flush_microtasks();

        assert_eq!(*log.lock(), vec!["head", "tail"]);
    }

    #[test]
    fn repeated_enqueue_is_idempotent() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let job = Job::new(move || {
            runs_in.fetch_add(1, AtomicOrdering::Relaxed);
        });

        queue_job(&job);
        queue_job(&job);
        queue_job(&job);
        flush_microtasks();

        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn invalidate_removes_only_jobs_strictly_after_the_cursor() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = recording_job(JobOptions::new().id(1), &log, "a");
        let b = recording_job(JobOptions::new().id(2), &log, "b");
        queue_job(&a);
        queue_job(&b);

        // The cursor sits at index 0 between drains: the job there cannot
        // be invalidated, anything behind it can
        invalidate_job(&b);
        invalidate_job(&a);
        flush_microtasks();

        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn inactive_job_is_skipped_but_stays_reusable() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let job = Job::new(move || {
            runs_in.fetch_add(1, AtomicOrdering::Relaxed);
        });

        job.set_active(false);
        queue_job(&job);
        flush_microtasks();
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 0);

        job.set_active(true);
        queue_job(&job);
        flush_microtasks();
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn pre_jobs_drain_on_demand_and_leave_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let pre = recording_job(JobOptions::new().id(1).pre(), &log, "pre");
        let plain = recording_job(JobOptions::new().id(1), &log, "plain");
        queue_job(&plain);
        queue_job(&pre);

        flush_pre_flush_cbs();
        assert_eq!(*log.lock(), vec!["pre"]);

        flush_microtasks();
        assert_eq!(*log.lock(), vec!["pre", "plain"]);
    }

    #[test]
    fn post_callbacks_run_after_the_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let post = recording_job(JobOptions::new(), &log, "post");
        let main = recording_job(JobOptions::new().id(1), &log, "main");

        queue_post_flush_cb(&post);
        queue_job(&main);
        flush_microtasks();

        assert_eq!(*log.lock(), vec!["main", "post"]);
    }

    #[test]
    fn post_batch_enqueues_without_dedup() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let hook = Job::new(move || {
            runs_in.fetch_add(1, AtomicOrdering::Relaxed);
        });

        // A lifecycle group may legitimately contain the same callback; the
        // batch path must not dedup it. The dedup inside the post drain
        // collapses identical entries queued separately, not batch content.
        queue_post_flush_cbs(&[hook.clone(), hook.clone()]);
        flush_microtasks();

        // Flush-level dedup still applies across the merged pending list
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn post_callbacks_sort_by_id() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let late = recording_job(JobOptions::new().id(9), &log, "late");
        let early = recording_job(JobOptions::new().id(3), &log, "early");

        queue_post_flush_cb(&late);
        queue_post_flush_cb(&early);
        flush_microtasks();

        assert_eq!(*log.lock(), vec!["early", "late"]);
    }

    #[test]
    fn work_queued_by_post_callbacks_drains_in_the_same_flush() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let followup = recording_job(JobOptions::new().id(5), &log, "followup");
        let log_in = log.clone();
        let post = JobOptions::new().build(move || {
            log_in.lock().push("post");
            queue_job(&followup);
        });

        queue_post_flush_cb(&post);

        let log_tick = log.clone();
        next_tick(move || log_tick.lock().push("tick"));

        flush_microtasks();

        // The follow-up job ran inside the same drain, before next_tick
        assert_eq!(*log.lock(), vec!["post", "followup", "tick"]);
    }

    #[test]
    fn next_tick_without_pending_drain_still_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        next_tick(move || {
            fired_in.fetch_add(1, AtomicOrdering::Relaxed);
        });

        assert_eq!(fired.load(AtomicOrdering::Relaxed), 0);
        flush_microtasks();
        assert_eq!(fired.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn next_tick_resolves_after_the_drain_it_joined() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let job = recording_job(JobOptions::new().id(1), &log, "job");
        queue_job(&job);

        let log_in = log.clone();
        next_tick(move || log_in.lock().push("after"));

        flush_microtasks();
        assert_eq!(*log.lock(), vec!["job", "after"]);
    }

    #[test]
    fn runaway_self_requeue_is_cut_off() {
        cov_mark::check!(recursion_limit_exceeded);

        let runs = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<Job>>>> = Arc::new(Mutex::new(None));

        let runs_in = runs.clone();
        let slot_in = slot.clone();
        let job = JobOptions::new()
            .allow_recurse()
            .owner("looper")
            .build(move || {
                runs_in.fetch_add(1, AtomicOrdering::Relaxed);
                if let Some(me) = slot_in.lock().as_ref() {
                    queue_job(me);
                }
            });
        *slot.lock() = Some(job.clone());

        queue_job(&job);
        flush_microtasks();

        // Limit plus the first run; the drain terminated instead of looping
        let total = runs.load(AtomicOrdering::Relaxed);
        assert!(total as u32 <= RECURSION_LIMIT + 2, "ran {total} times");

        // Drop the self-reference cycle
        slot.lock().take();
    }

    #[test]
    fn failing_job_reports_and_the_drain_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let reported = Arc::new(AtomicUsize::new(0));
        let reported_in = reported.clone();
        // The handler is global; only count this test's own failure so a
        // parallel test's reports cannot interfere
        set_error_handler(move |message| {
            if message.contains("boom") {
                reported_in.fetch_add(1, AtomicOrdering::Relaxed);
            }
        });

        let bad = JobOptions::new().id(1).build(|| panic!("boom"));
        let good = recording_job(JobOptions::new().id(2), &log, "good");

        queue_job(&bad);
        queue_job(&good);
        flush_microtasks();

        assert_eq!(reported.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(*log.lock(), vec!["good"]);

        clear_error_handler();
    }
}
