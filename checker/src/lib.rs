//! A dynamic partial-order reduction (DPOR) model checker for programs that coordinate through
//! atomic shared-memory cells.
//!
//! User programs spawn cooperating processes with [`spawn`] and share state through the atomic
//! façade ([`make`], [`get`], [`set`], [`exchange`], [`compare_and_set`], [`fetch_and_add`]).
//! [`trace`] then explores every meaningfully distinct interleaving of those atomic steps,
//! invoking the [`every`]/[`finally`] hooks of each interleaving so [`check`] can test
//! invariants. When a predicate fails, the offending schedule is printed and `trace` returns
//! the failure.
//!
//! Scheduling is single-threaded and cooperative: each process runs as a fiber that suspends
//! exactly when it invokes an atomic operation, and the replayer decides which fiber runs next
//! purely from the schedule under test. Outside of a `trace` call the façade degenerates to
//! direct forwarding, so the same program can run under a real runtime unchanged.
//!
//! ```ignore
//! use weft_checker::{check, fetch_and_add, finally, get, make, spawn, trace};
//!
//! let report = trace(|| {
//!     let counter = make(0i64);
//!     for _ in 0..2 {
//!         let counter = counter.clone();
//!         spawn(move || {
//!             fetch_and_add(&counter, 1);
//!         });
//!     }
//!     let counter = counter.clone();
//!     finally(move || check(|| get(&counter) == 2));
//! })?;
//! println!("explored {} interleavings", report.runs);
//! # Ok::<(), weft_checker::CheckError>(())
//! ```

use std::{cell::RefCell, rc::Rc};

use tracing::debug;

mod atomic;
mod errors;
mod explore;
mod fiber;
mod process;
mod replay;
mod session;

use crate::explore::{Clock, LastAccess};

// RE-EXPORTS
// ================================================================================================

pub use weft_core::{ObjectId, Op, ProcessId, Schedule, ScheduleStep};

pub use crate::{
    atomic::{Atomic, compare_and_set, decr, exchange, fetch_and_add, get, incr, make, set},
    errors::CheckError,
    session::{check, every, finally, spawn},
};

// TRACE
// ================================================================================================

/// Summary of a completed exploration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceReport {
    /// Number of complete interleavings executed.
    pub runs: u64,
}

/// Explores every meaningfully distinct interleaving of the program set up by `init`.
///
/// `init` is invoked once per run, outside any fiber, to spawn the program's processes and
/// (re)install hooks; it must be deterministic, and the program's only non-determinism must
/// flow through the atomic façade. Exploration starts from the schedule containing only the
/// start step of process 0 and extends it depth-first, one replay per extension.
///
/// Returns how many complete interleavings were explored, or the first failure. The first
/// panic out of user code is replayed once with verbose logging and then re-raised.
#[tracing::instrument(level = "debug", skip_all)]
pub fn trace<F>(init: F) -> Result<TraceReport, CheckError>
where
    F: Fn(),
{
    let guard = session::SessionGuard::install()?;
    let session = guard.session().clone();

    let root = Schedule::initial();
    let first = replay::do_run(&session, &init, &root)?;
    let mut states = vec![Rc::new(RefCell::new(first))];

    let mut clock = Clock::new();
    clock.insert(ProcessId::first(), 0);
    let last_access = LastAccess::new();
    explore::explore(&session, &init, &mut states, &clock, &last_access)?;

    let report = TraceReport { runs: session.runs() };
    debug!(runs = report.runs, "exploration complete");
    Ok(report)
}
