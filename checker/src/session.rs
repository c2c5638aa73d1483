use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::Sender,
    },
};

use weft_core::{ObjectId, Schedule};

use crate::{
    errors::CheckError,
    fiber::{self, Event},
    process::ProcessTable,
};

// SESSION
// ================================================================================================

/// Everything the scheduler owns for one [`trace`](crate::trace) invocation: the process
/// table, hooks, counters, and failure bookkeeping.
///
/// A session is installed in a thread-local for the duration of the trace so the free-function
/// surface (`spawn`, `every`, `finally`, `check`) can reach it from the init routine and from
/// hooks. Fibers never touch the session; they only hold their channel endpoints plus the
/// shared verbose flag and object-id counter.
pub(crate) struct Session {
    table: RefCell<ProcessTable>,
    every_hook: RefCell<Option<Rc<dyn Fn()>>>,
    final_hook: RefCell<Option<Rc<dyn Fn()>>>,
    /// Sender for the current run's event channel; present only while a run is executing.
    run_event_tx: RefCell<Option<Sender<Event>>>,
    /// Schedule of the run currently executing, kept for failure dumps.
    current_schedule: RefCell<Schedule>,
    /// Completed interleavings so far.
    num_runs: Cell<u64>,
    /// Whether `num_runs` already includes the run currently executing.
    run_complete: Cell<bool>,
    /// Set by a failing `check`; converted into an error by the replayer.
    failed: Cell<bool>,
    object_ids: Arc<AtomicU64>,
    verbose: Arc<AtomicBool>,
}

impl Session {
    fn new() -> Self {
        Self {
            table: RefCell::new(ProcessTable::default()),
            every_hook: RefCell::new(None),
            final_hook: RefCell::new(None),
            run_event_tx: RefCell::new(None),
            current_schedule: RefCell::new(Schedule::new()),
            num_runs: Cell::new(0),
            run_complete: Cell::new(false),
            failed: Cell::new(false),
            object_ids: Arc::new(AtomicU64::new(0)),
            verbose: Arc::new(AtomicBool::new(false)),
        }
    }

    // RUN LIFECYCLE
    // --------------------------------------------------------------------------------------------

    /// Prepares the session for one run of `schedule`: hooks and failure state are cleared
    /// (the init routine re-registers hooks), and the run's event sender is installed so
    /// `spawn` can hand it to new fibers.
    pub fn begin_run(&self, event_tx: Sender<Event>, schedule: Schedule) {
        *self.every_hook.borrow_mut() = None;
        *self.final_hook.borrow_mut() = None;
        *self.run_event_tx.borrow_mut() = Some(event_tx);
        *self.current_schedule.borrow_mut() = schedule;
        self.run_complete.set(false);
        self.failed.set(false);
    }

    /// Tears down per-run state. The object-id counter resets here so replays recreate every
    /// cell under the same id.
    pub fn finish_run(&self) {
        *self.run_event_tx.borrow_mut() = None;
        self.object_ids.store(0, Ordering::Relaxed);
    }

    /// Counts the run currently executing as a completed interleaving.
    pub fn bump_runs(&self) -> u64 {
        let runs = self.num_runs.get() + 1;
        self.num_runs.set(runs);
        self.run_complete.set(true);
        runs
    }

    /// Returns the number of completed interleavings.
    pub fn runs(&self) -> u64 {
        self.num_runs.get()
    }

    /// Returns the 1-based number of the interleaving currently executing (or just executed).
    pub fn current_run_number(&self) -> u64 {
        if self.run_complete.get() {
            self.num_runs.get()
        } else {
            self.num_runs.get() + 1
        }
    }

    // PROCESSES AND OBJECTS
    // --------------------------------------------------------------------------------------------

    pub fn table(&self) -> &RefCell<ProcessTable> {
        &self.table
    }

    /// Registers a process and parks its fiber until the scheduler delivers its start step.
    ///
    /// # Panics
    /// Panics if called while no run is executing; processes can only be spawned from the init
    /// routine of a run.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let event_tx = self
            .run_event_tx
            .borrow()
            .clone()
            .expect("processes can only be spawned from the init routine of a run");
        let mut table = self.table.borrow_mut();
        let pid = weft_core::ProcessId::from(table.len() as u32);
        let fiber =
            fiber::spawn_fiber(pid, event_tx, self.verbose.clone(), self.object_ids.clone(), f);
        table.insert(fiber);
    }

    /// Draws the next object-id; the first id of every run is 1.
    pub fn next_object_id(&self) -> ObjectId {
        ObjectId::from(self.object_ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // HOOKS AND FAILURE
    // --------------------------------------------------------------------------------------------

    pub fn set_every_hook(&self, hook: Rc<dyn Fn()>) {
        *self.every_hook.borrow_mut() = Some(hook);
    }

    pub fn set_final_hook(&self, hook: Rc<dyn Fn()>) {
        *self.final_hook.borrow_mut() = Some(hook);
    }

    /// Invokes the between-steps hook, if one is installed.
    pub fn run_every_hook(&self) {
        let hook = self.every_hook.borrow().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Invokes the end-of-run hook, if one is installed.
    pub fn run_final_hook(&self) {
        let hook = self.final_hook.borrow().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Records a failed `check` and dumps the offending schedule.
    pub fn report_check_failure(&self) {
        println!("Found assertion violation at run {}:", self.current_run_number());
        let schedule = self.current_schedule.borrow();
        print!("{}", *schedule);
        self.failed.set(true);
    }

    /// Returns and clears the failure flag.
    pub fn take_failure(&self) -> bool {
        self.failed.replace(false)
    }

    /// Dumps the schedule currently executing to stdout.
    pub fn dump_current_schedule(&self) {
        let schedule = self.current_schedule.borrow();
        print!("{}", *schedule);
    }

    // VERBOSE REPLAY
    // --------------------------------------------------------------------------------------------

    /// Enables verbose logging for all fibers of subsequent runs.
    pub fn set_verbose(&self) {
        self.verbose.store(true, Ordering::Relaxed);
    }
}

// SESSION INSTALLATION
// ================================================================================================

thread_local! {
    static SESSION: RefCell<Option<Rc<Session>>> = const { RefCell::new(None) };
}

/// Guard installing a fresh session on the current thread for the duration of a trace.
pub(crate) struct SessionGuard {
    session: Rc<Session>,
}

impl SessionGuard {
    /// Installs a new session, failing if one is already active on this thread.
    pub fn install() -> Result<Self, CheckError> {
        SESSION.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(CheckError::NestedTrace);
            }
            let session = Rc::new(Session::new());
            *slot = Some(session.clone());
            Ok(Self { session })
        })
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION.with(|slot| slot.borrow_mut().take());
    }
}

/// Returns the session installed on the current thread, if any.
pub(crate) fn current() -> Option<Rc<Session>> {
    SESSION.with(|slot| slot.borrow().clone())
}

/// Allocates an object-id for a direct-mode `make`.
///
/// Resolution order: the session installed on this thread (init routine and hooks), then the
/// fiber context (destructors running while a fiber unwinds), then a process-global counter
/// for standalone use outside any trace.
pub(crate) fn alloc_object_id() -> ObjectId {
    static FALLBACK_OBJECT_IDS: AtomicU64 = AtomicU64::new(0);

    if let Some(session) = current() {
        return session.next_object_id();
    }
    if let Some(id) = fiber::alloc_object_id() {
        return id;
    }
    ObjectId::from(FALLBACK_OBJECT_IDS.fetch_add(1, Ordering::Relaxed) + 1)
}

// USER SURFACE
// ================================================================================================

/// Registers a process with entry `f`.
///
/// Under an active trace session the process is added to the table and its fiber stays parked
/// until the scheduler first runs it. Outside a session this degenerates to a detached
/// `std::thread::spawn`.
///
/// # Panics
/// Panics when called from inside a traced process; registration happens in the init routine.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if fiber::is_fiber_thread() {
        panic!("spawn may not be called from inside a traced process");
    }
    match current() {
        Some(session) => session.spawn(f),
        None => {
            std::thread::spawn(f);
        },
    }
}

/// Installs a hook invoked between schedule steps.
///
/// The hook runs on the scheduler thread, so its atomic reads go directly to the cells and
/// record no schedule steps. Hooks are observers: writing through the façade from a hook
/// mutates cells without being scheduled. Outside a session this is a no-op.
pub fn every<F>(f: F)
where
    F: Fn() + 'static,
{
    if let Some(session) = current() {
        session.set_every_hook(Rc::new(f));
    }
}

/// Installs a hook invoked at the end of each completed run, once every process has finished.
///
/// Same conventions as [`every`]. Named `finally` because `final` is reserved in Rust.
pub fn finally<F>(f: F)
where
    F: Fn() + 'static,
{
    if let Some(session) = current() {
        session.set_final_hook(Rc::new(f));
    }
}

/// Evaluates an invariant predicate.
///
/// Under an active session a false predicate dumps the current schedule and makes the
/// enclosing [`trace`](crate::trace) return [`CheckError::AssertionViolation`]. Outside a
/// session it is a plain assertion.
pub fn check<F>(pred: F)
where
    F: FnOnce() -> bool,
{
    match current() {
        Some(session) => {
            if !pred() {
                session.report_check_failure();
            }
        },
        None => assert!(pred(), "check predicate failed"),
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_start_at_one_and_reset() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session();
        assert_eq!(session.next_object_id(), ObjectId::from(1));
        assert_eq!(session.next_object_id(), ObjectId::from(2));
        session.finish_run();
        assert_eq!(session.next_object_id(), ObjectId::from(1));
    }

    #[test]
    fn nested_install_is_rejected() {
        let _guard = SessionGuard::install().unwrap();
        assert!(matches!(SessionGuard::install(), Err(CheckError::NestedTrace)));
    }

    #[test]
    fn install_after_drop_succeeds() {
        drop(SessionGuard::install().unwrap());
        assert!(SessionGuard::install().is_ok());
    }

    #[test]
    fn run_numbering_counts_completed_interleavings() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session();
        assert_eq!(session.current_run_number(), 1);
        assert_eq!(session.bump_runs(), 1);
        assert_eq!(session.current_run_number(), 1);

        let (tx, _rx) = std::sync::mpsc::channel();
        session.begin_run(tx, Schedule::initial());
        assert_eq!(session.current_run_number(), 2);
        assert_eq!(session.runs(), 1);
    }
}
