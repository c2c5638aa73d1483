use weft_core::{ObjectId, Op, ProcessId, Schedule};

// CHECK ERROR
// ================================================================================================

/// Errors surfaced by [`trace`](crate::trace) and the replayer.
///
/// User panics are not represented here: the first panic out of user code is replayed once in
/// verbose mode and then re-raised, so it reaches the host as a panic, not an error.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// A `check` predicate returned false. The offending schedule has already been dumped to
    /// stdout by the time this error is constructed.
    #[error("assertion violation at run {run}")]
    AssertionViolation { run: u64, schedule: Schedule },
    /// The schedule names a step although every process has already finished.
    #[error("schedule step {step} names process {pid}, but every process has already finished")]
    ScheduleOverrun { step: usize, pid: ProcessId },
    /// The schedule resumes a process whose fiber has already returned.
    #[error("schedule step {step} resumes process {pid}, which has already finished")]
    StepAfterFinish { step: usize, pid: ProcessId },
    /// A process's pending operation does not match what the schedule prescribes for it. For a
    /// deterministic program this indicates a checker bug.
    #[error(
        "process {pid} is blocked on `{found_op} {}`, but the schedule expected `{expected_op} {}`",
        display_repr(.found_repr),
        display_repr(.expected_repr)
    )]
    StepMismatch {
        pid: ProcessId,
        expected_op: Op,
        expected_repr: Option<ObjectId>,
        found_op: Op,
        found_repr: Option<ObjectId>,
    },
    /// The schedule names a process that was never spawned.
    #[error("schedule step {step} names process {pid}, which was never spawned")]
    UnknownProcess { step: usize, pid: ProcessId },
    /// Schedules must be non-empty and begin with `(process 0, start)`.
    #[error("schedule must begin with the start step of process 0")]
    MalformedSchedule,
    /// `trace` was invoked while another trace session was active on the same thread.
    #[error("a trace session is already active on this thread")]
    NestedTrace,
    /// The verbose replay of a failing schedule did not reproduce the failure, which means the
    /// program is not deterministic.
    #[error("verbose replay did not reproduce the failure of process {pid}; the program is not deterministic")]
    ReplayDiverged { pid: ProcessId },
}

fn display_repr(repr: &Option<ObjectId>) -> String {
    repr.map_or_else(String::new, |id| id.to_string())
}
