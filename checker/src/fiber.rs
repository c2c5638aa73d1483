use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread::{self, JoinHandle},
};

use weft_core::{ObjectId, Op, ProcessId};

/// How many backtrace lines a verbose interception prints.
const BACKTRACE_LINES: usize = 12;

// EVENTS
// ================================================================================================

/// What a fiber reports to the scheduler when it stops running.
pub(crate) enum Event {
    /// The fiber reached its next atomic operation and is blocked on it.
    Suspended { pid: ProcessId, op: Op, repr: Option<ObjectId> },
    /// The fiber's entry function returned normally.
    Finished { pid: ProcessId },
    /// The fiber unwound in response to a discontinue signal. Only produced during disposal,
    /// when nothing is listening; the event is dropped with the run's channel.
    #[allow(dead_code)]
    Aborted { pid: ProcessId },
    /// User code panicked; the replayer re-raises the payload after the verbose replay.
    Panicked { pid: ProcessId, payload: Box<dyn Any + Send> },
}

/// The scheduler's verdict delivered into a suspended fiber.
pub(crate) enum ResumeMsg {
    /// Perform the pending operation; for `make` steps carries the object-id to create under.
    Proceed { make_id: Option<ObjectId> },
    /// Unwind: release scoped resources and exit without performing the pending operation.
    Abort,
}

// CONTINUATION
// ================================================================================================

/// One-shot handle to a suspended fiber.
///
/// Exactly one of [`resume`](Self::resume) or [`discontinue`](Self::discontinue) may be
/// invoked; both consume the handle. The process table re-arms a record with a fresh
/// continuation each time its fiber suspends.
#[derive(Debug)]
pub(crate) struct Continuation {
    tx: Sender<ResumeMsg>,
}

impl Continuation {
    pub fn from_sender(tx: Sender<ResumeMsg>) -> Self {
        Self { tx }
    }

    /// Wakes the fiber to perform its pending operation.
    ///
    /// Returns the underlying sender so the caller can re-arm the record once the fiber
    /// suspends again. A send can only fail if the fiber is already gone, in which case its
    /// final event is sitting in the event channel and the scheduler will observe it.
    pub fn resume(self, make_id: Option<ObjectId>) -> Sender<ResumeMsg> {
        let _ = self.tx.send(ResumeMsg::Proceed { make_id });
        self.tx
    }

    /// Delivers the abort signal; the fiber unwinds, running its destructors on the way out.
    pub fn discontinue(self) {
        let _ = self.tx.send(ResumeMsg::Abort);
    }
}

// FIBER CONTEXT
// ================================================================================================

/// Payload unwound through a fiber when it is discontinued. Raised with `resume_unwind` so the
/// panic hook stays silent, and caught by the fiber wrapper.
struct FiberAbort;

/// Per-fiber context, installed in a thread-local for the lifetime of the fiber's user code.
struct FiberCtx {
    pid: ProcessId,
    event_tx: Sender<Event>,
    resume_rx: Receiver<ResumeMsg>,
    verbose: Arc<AtomicBool>,
    object_ids: Arc<AtomicU64>,
}

thread_local! {
    static FIBER: RefCell<Option<FiberCtx>> = const { RefCell::new(None) };
}

/// Outcome of announcing an atomic operation from user code.
pub(crate) enum Suspension {
    /// No intercepting context: perform the operation directly.
    Direct,
    /// The scheduler resumed the fiber; for `make` steps carries the allocated object-id.
    Resumed(Option<ObjectId>),
}

/// Announces an atomic operation to the scheduler and blocks until it is this fiber's turn.
///
/// Outside an intercepting fiber (the init routine, hooks, plain threads, or a fiber that is
/// already unwinding) the operation is not a schedulable step and `Direct` is returned
/// immediately. Destructors running during an unwind fall under the same rule: the run is
/// being torn down and nobody is listening for events.
pub(crate) fn suspend(op: Op, repr: Option<ObjectId>) -> Suspension {
    if thread::panicking() {
        return Suspension::Direct;
    }
    FIBER.with(|slot| {
        let ctx = slot.borrow();
        let Some(ctx) = ctx.as_ref() else {
            return Suspension::Direct;
        };
        if ctx.verbose.load(Ordering::Relaxed) {
            print_interception(ctx.pid, op, repr);
        }
        let suspended = Event::Suspended { pid: ctx.pid, op, repr };
        if ctx.event_tx.send(suspended).is_err() {
            // the scheduler is gone; unwind so the fiber releases its resources
            panic::resume_unwind(Box::new(FiberAbort));
        }
        match ctx.resume_rx.recv() {
            Ok(ResumeMsg::Proceed { make_id }) => Suspension::Resumed(make_id),
            Ok(ResumeMsg::Abort) | Err(_) => panic::resume_unwind(Box::new(FiberAbort)),
        }
    })
}

/// Allocates an object-id from the fiber's shared counter, if called on a fiber thread.
///
/// Reached only by direct-mode `make` calls on a fiber thread, i.e. from destructors running
/// while the fiber unwinds.
pub(crate) fn alloc_object_id() -> Option<ObjectId> {
    FIBER.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|ctx| ObjectId::from(ctx.object_ids.fetch_add(1, Ordering::Relaxed) + 1))
    })
}

/// Returns true when called on a fiber thread of some trace session.
pub(crate) fn is_fiber_thread() -> bool {
    FIBER.with(|slot| slot.borrow().is_some())
}

fn print_interception(pid: ProcessId, op: Op, repr: Option<ObjectId>) {
    println!("Process {pid}: {op} {}", repr.map_or_else(String::new, |r| r.to_string()));
    let backtrace = Backtrace::force_capture().to_string();
    for line in backtrace.lines().take(BACKTRACE_LINES) {
        println!("  {line}");
    }
}

// FIBER SPAWNING
// ================================================================================================

/// Handle to a not-yet-started fiber: its resume channel and join handle.
pub(crate) struct Fiber {
    pub tx: Sender<ResumeMsg>,
    pub join: JoinHandle<()>,
}

/// Creates the fiber for a newly spawned process.
///
/// The underlying thread parks on its resume channel immediately; no user code runs until the
/// scheduler delivers the process's `start` step. An abort delivered before that first
/// resumption exits the thread without ever entering user code.
pub(crate) fn spawn_fiber<F>(
    pid: ProcessId,
    event_tx: Sender<Event>,
    verbose: Arc<AtomicBool>,
    object_ids: Arc<AtomicU64>,
    f: F,
) -> Fiber
where
    F: FnOnce() + Send + 'static,
{
    let (tx, resume_rx) = channel();
    let wrapper_tx = event_tx.clone();
    let join = thread::Builder::new()
        .name(format!("weft-proc-{pid}"))
        .spawn(move || {
            match resume_rx.recv() {
                Ok(ResumeMsg::Proceed { .. }) => {},
                Ok(ResumeMsg::Abort) | Err(_) => return,
            }
            FIBER.with(|slot| {
                *slot.borrow_mut() =
                    Some(FiberCtx { pid, event_tx, resume_rx, verbose, object_ids });
            });
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            FIBER.with(|slot| slot.borrow_mut().take());
            let event = match outcome {
                Ok(()) => Event::Finished { pid },
                Err(payload) if payload.is::<FiberAbort>() => Event::Aborted { pid },
                Err(payload) => Event::Panicked { pid, payload },
            };
            let _ = wrapper_tx.send(event);
        })
        .expect("failed to spawn a fiber thread");
    Fiber { tx, join }
}
