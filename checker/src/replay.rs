use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::mpsc::{Receiver, channel},
};

use tracing::debug;
use weft_core::{Op, ProcessId, Schedule};

use crate::{
    errors::CheckError,
    explore::{PendingOp, StateCell},
    fiber::Event,
    session::Session,
};

/// How many completed runs between progress lines.
const PROGRESS_INTERVAL: u64 = 100_000;

// RUN FAILURE
// ================================================================================================

/// How a single run can fail before its state cell is harvested.
enum RunFailure {
    /// A deterministic checker-level failure; propagated as-is.
    Check(CheckError),
    /// User code panicked. The payload is held so the replayer can re-raise it after the
    /// verbose replay.
    Panic { pid: ProcessId, payload: Box<dyn Any + Send> },
}

impl From<CheckError> for RunFailure {
    fn from(err: CheckError) -> Self {
        Self::Check(err)
    }
}

// REPLAYER
// ================================================================================================

/// Executes user code along `schedule`, step by step, and harvests the resulting state cell.
///
/// `init` is invoked first, outside any fiber, to spawn the run's processes and re-register
/// hooks. Checker-level failures dump the schedule and surface as [`CheckError`]. The first
/// panic out of user code tears the run down, replays the same schedule once with verbose
/// logging, and re-raises the panic.
#[tracing::instrument(level = "debug", skip(session, init), fields(steps = schedule.len()))]
pub(crate) fn do_run(
    session: &Rc<Session>,
    init: &dyn Fn(),
    schedule: &Schedule,
) -> Result<StateCell, CheckError> {
    match run_once(session, init, schedule) {
        Ok(state) => Ok(state),
        Err(RunFailure::Check(err)) => Err(err),
        Err(RunFailure::Panic { pid, payload }) => {
            drop(payload);
            session.set_verbose();
            debug!(%pid, "user code panicked; replaying the schedule with verbose logging");
            match run_once(session, init, schedule) {
                Err(RunFailure::Panic { pid, payload }) => {
                    report_panic(pid, payload.as_ref(), schedule);
                    panic::resume_unwind(payload)
                },
                Ok(_) | Err(RunFailure::Check(_)) => Err(CheckError::ReplayDiverged { pid }),
            }
        },
    }
}

/// One full pass over `schedule`: init, step loop, hooks, snapshot, disposal.
///
/// Disposal runs on every exit path so no fiber outlives its run.
fn run_once(
    session: &Rc<Session>,
    init: &dyn Fn(),
    schedule: &Schedule,
) -> Result<StateCell, RunFailure> {
    let starts_at_process_zero = matches!(
        schedule.steps().first(),
        Some(step) if step.pid == ProcessId::first() && step.op == Op::Start && step.repr.is_none()
    );
    if !starts_at_process_zero {
        return Err(CheckError::MalformedSchedule.into());
    }

    let (event_tx, event_rx) = channel();
    session.begin_run(event_tx, schedule.clone());
    init();

    let result = drive(session, &event_rx, schedule);

    session.table().borrow_mut().dispose();
    session.finish_run();
    result
}

/// The step loop: resume the scheduled process, absorb its next event, run the observer hook.
fn drive(
    session: &Rc<Session>,
    event_rx: &Receiver<Event>,
    schedule: &Schedule,
) -> Result<StateCell, RunFailure> {
    for (index, step) in schedule.steps().iter().enumerate() {
        {
            let table = session.table().borrow();
            if table.all_finished() {
                session.dump_current_schedule();
                return Err(CheckError::ScheduleOverrun { step: index, pid: step.pid }.into());
            }
            let Some(record) = table.get(step.pid) else {
                session.dump_current_schedule();
                return Err(CheckError::UnknownProcess { step: index, pid: step.pid }.into());
            };
            if record.is_finished() {
                session.dump_current_schedule();
                return Err(CheckError::StepAfterFinish { step: index, pid: step.pid }.into());
            }
            if (record.next_op(), record.next_repr()) != (step.op, step.repr) {
                session.dump_current_schedule();
                return Err(CheckError::StepMismatch {
                    pid: step.pid,
                    expected_op: step.op,
                    expected_repr: step.repr,
                    found_op: record.next_op(),
                    found_repr: record.next_repr(),
                }
                .into());
            }
        }

        // object-ids are assigned in schedule order: a make step draws its id when executed,
        // not when the fiber announced it
        let make_id = (step.op == Op::Make).then(|| session.next_object_id());
        let continuation = session
            .table()
            .borrow_mut()
            .take_continuation(step.pid)
            .expect("an unfinished, matched process holds a continuation");
        let tx = continuation.resume(make_id);

        let event = event_rx
            .recv()
            .expect("the event channel outlives the run");
        match event {
            Event::Suspended { pid, op, repr } => {
                debug_assert_eq!(pid, step.pid, "only the resumed fiber can be awake");
                session.table().borrow_mut().update_process_data(pid, tx, op, repr);
            },
            Event::Finished { pid } => {
                drop(tx);
                session.table().borrow_mut().finish_process(pid);
            },
            Event::Panicked { pid, payload } => {
                return Err(RunFailure::Panic { pid, payload });
            },
            Event::Aborted { .. } => {
                unreachable!("abort events are only produced during disposal")
            },
        }

        // hook panics get the same catch-once treatment as fiber panics, attributed to the
        // process whose step just ran
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| session.run_every_hook())) {
            return Err(RunFailure::Panic { pid: step.pid, payload });
        }
        if session.take_failure() {
            return Err(CheckError::AssertionViolation {
                run: session.current_run_number(),
                schedule: schedule.clone(),
            }
            .into());
        }
    }

    // a run that retired its whole schedule with every process finished is one completed
    // interleaving; only those runs are counted and shown to the final hook
    if session.table().borrow().all_finished() {
        let runs = session.bump_runs();
        if runs % PROGRESS_INTERVAL == 0 {
            println!("run: {runs}");
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| session.run_final_hook())) {
            let pid = schedule.steps().last().expect("schedules are never empty").pid;
            return Err(RunFailure::Panic { pid, payload });
        }
        if session.take_failure() {
            return Err(CheckError::AssertionViolation {
                run: session.current_run_number(),
                schedule: schedule.clone(),
            }
            .into());
        }
    }

    Ok(snapshot(session, schedule))
}

/// Summarizes the run for the search: pending ops, enabled set, and the last executed step.
fn snapshot(session: &Rc<Session>, schedule: &Schedule) -> StateCell {
    let table = session.table().borrow();
    let procs = table
        .iter()
        .map(|record| PendingOp {
            pid: record.id(),
            op: record.next_op(),
            repr: record.next_repr(),
        })
        .collect();
    let enabled = table.enabled();
    let run_step = *schedule.steps().last().expect("schedules are never empty");
    StateCell::new(procs, run_step, enabled)
}

/// Prints the verbose failure report: schedule length, dump, and the raising process.
fn report_panic(pid: ProcessId, payload: &(dyn Any + Send), schedule: &Schedule) {
    println!("Schedule: {} length", schedule.len());
    print!("{schedule}");
    println!("Process {pid} raised {}", panic_message(payload));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weft_core::{ObjectId, ScheduleStep};

    use super::*;
    use crate::{
        atomic::{fetch_and_add, get, make},
        session::{SessionGuard, spawn},
    };

    /// Two processes bumping one shared counter; the cell is created by the init routine, so
    /// it always carries object-id 1.
    fn counter_program() -> impl Fn() {
        || {
            let counter = make(0i64);
            for _ in 0..2 {
                let counter = counter.clone();
                spawn(move || {
                    fetch_and_add(&counter, 1);
                });
            }
        }
    }

    fn step(pid: u32, op: Op, repr: Option<u64>) -> ScheduleStep {
        ScheduleStep::new(ProcessId::from(pid), op, repr.map(ObjectId::from))
    }

    #[test]
    fn replaying_a_schedule_twice_is_deterministic() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = counter_program();
        let schedule: Schedule = [
            step(0, Op::Start, None),
            step(0, Op::FetchAndAdd, Some(1)),
            step(1, Op::Start, None),
        ]
        .into_iter()
        .collect();

        let first = do_run(&session, &init, &schedule).unwrap();
        let second = do_run(&session, &init, &schedule).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn prefix_run_reports_pending_ops_and_enabled_set() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = counter_program();
        let schedule: Schedule =
            [step(0, Op::Start, None), step(1, Op::Start, None)].into_iter().collect();

        let state = do_run(&session, &init, &schedule).unwrap();
        assert_eq!(state.enabled, [ProcessId::from(0), ProcessId::from(1)].into_iter().collect());
        assert_eq!(
            state.procs,
            vec![
                PendingOp {
                    pid: ProcessId::from(0),
                    op: Op::FetchAndAdd,
                    repr: Some(ObjectId::from(1))
                },
                PendingOp {
                    pid: ProcessId::from(1),
                    op: Op::FetchAndAdd,
                    repr: Some(ObjectId::from(1))
                },
            ]
        );
        assert_eq!(state.run_step, step(1, Op::Start, None));
        assert_eq!(session.runs(), 0);
    }

    #[test]
    fn completed_run_counts_and_empties_the_enabled_set() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = counter_program();
        let schedule: Schedule = [
            step(0, Op::Start, None),
            step(0, Op::FetchAndAdd, Some(1)),
            step(1, Op::Start, None),
            step(1, Op::FetchAndAdd, Some(1)),
        ]
        .into_iter()
        .collect();

        let state = do_run(&session, &init, &schedule).unwrap();
        assert!(state.enabled.is_empty());
        assert_eq!(session.runs(), 1);
    }

    #[test]
    fn schedules_must_start_with_process_zero() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = counter_program();

        let empty = Schedule::new();
        assert!(matches!(
            do_run(&session, &init, &empty),
            Err(CheckError::MalformedSchedule)
        ));

        let wrong: Schedule = [step(1, Op::Start, None)].into_iter().collect();
        assert!(matches!(
            do_run(&session, &init, &wrong),
            Err(CheckError::MalformedSchedule)
        ));
    }

    #[test]
    fn mismatched_step_is_rejected() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = counter_program();
        let schedule: Schedule =
            [step(0, Op::Start, None), step(0, Op::Get, Some(1))].into_iter().collect();

        match do_run(&session, &init, &schedule) {
            Err(CheckError::StepMismatch { pid, expected_op, found_op, .. }) => {
                assert_eq!(pid, ProcessId::from(0));
                assert_eq!(expected_op, Op::Get);
                assert_eq!(found_op, Op::FetchAndAdd);
            },
            other => panic!("expected a step mismatch, got {other:?}"),
        }
    }

    #[test]
    fn overlong_schedule_is_rejected() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = || {
            spawn(|| {});
        };
        let schedule: Schedule =
            [step(0, Op::Start, None), step(0, Op::Start, None)].into_iter().collect();

        assert!(matches!(
            do_run(&session, &init, &schedule),
            Err(CheckError::ScheduleOverrun { step: 1, .. })
        ));
    }

    #[test]
    fn unknown_process_is_rejected() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        let init = || {
            spawn(|| {});
        };
        let schedule: Schedule =
            [step(0, Op::Start, None), step(3, Op::Start, None)].into_iter().collect();

        // process 0 finishes at step 0, so the bogus step trips the overrun check first; with
        // a second live process the unknown id is detected as such
        assert!(matches!(
            do_run(&session, &init, &schedule),
            Err(CheckError::ScheduleOverrun { .. })
        ));

        let init_two = || {
            spawn(|| {});
            spawn(|| {});
        };
        let schedule: Schedule =
            [step(0, Op::Start, None), step(3, Op::Start, None)].into_iter().collect();
        assert!(matches!(
            do_run(&session, &init_two, &schedule),
            Err(CheckError::UnknownProcess { step: 1, .. })
        ));
    }

    #[test]
    fn object_ids_follow_schedule_order() {
        let guard = SessionGuard::install().unwrap();
        let session = guard.session().clone();
        // both processes create a private cell; the ids they end up reading depend only on the
        // order of the make steps in the schedule
        let init = || {
            for _ in 0..2 {
                spawn(|| {
                    let cell = make(0i64);
                    let _ = get(&cell);
                });
            }
        };
        let schedule: Schedule = [
            step(0, Op::Start, None),
            step(1, Op::Start, None),
            step(1, Op::Make, None),
            step(0, Op::Make, None),
        ]
        .into_iter()
        .collect();

        let state = do_run(&session, &init, &schedule).unwrap();
        // process 1's make ran first, so its cell is object 1 and process 0's is object 2
        assert_eq!(
            state.procs,
            vec![
                PendingOp { pid: ProcessId::from(0), op: Op::Get, repr: Some(ObjectId::from(2)) },
                PendingOp { pid: ProcessId::from(1), op: Op::Get, repr: Some(ObjectId::from(1)) },
            ]
        );
    }
}
