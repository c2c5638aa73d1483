use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

use weft_core::{ObjectId, Op, ProcessId, Schedule, ScheduleStep};

use crate::{errors::CheckError, replay, session::Session};

// STATE CELL
// ================================================================================================

/// Pending `(op, object)` of one process at the end of a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PendingOp {
    pub pid: ProcessId,
    pub op: Op,
    pub repr: Option<ObjectId>,
}

/// Search metadata for one executed schedule prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct StateCell {
    /// Snapshot of every process's pending operation at the end of the step. Finished
    /// processes keep the operation they last executed.
    pub procs: Vec<PendingOp>,
    /// The step that produced this state.
    pub run_step: ScheduleStep,
    /// Processes whose fiber has not returned.
    pub enabled: BTreeSet<ProcessId>,
    /// Processes still to be explored from this state; grows as races are discovered.
    pub backtrack: BTreeSet<ProcessId>,
}

impl StateCell {
    pub fn new(
        procs: Vec<PendingOp>,
        run_step: ScheduleStep,
        enabled: BTreeSet<ProcessId>,
    ) -> Self {
        Self { procs, run_step, enabled, backtrack: BTreeSet::new() }
    }
}

/// State cells are shared between stack frames of the search: deeper recursion must be able to
/// grow the backtrack sets of ancestor states.
pub(crate) type SharedState = Rc<RefCell<StateCell>>;

/// Process id → index of the state produced by that process's most recent step.
pub(crate) type Clock = BTreeMap<ProcessId, usize>;

/// Object id → index of the state produced by the most recent step touching that object.
pub(crate) type LastAccess = BTreeMap<ObjectId, usize>;

// DPOR SEARCH
// ================================================================================================

/// Depth-first expansion from the last state of `states`.
///
/// Race detection runs first: every pending operation whose object was already touched on this
/// path forces the state *before* that earlier access to also try the pending process (or, if
/// that process was not runnable there, everything that was). The state is then expanded by
/// running each backtracked process in turn, one schedule extension (and one replay) per run.
///
/// Exploration is finite for programs whose every schedule terminates: state sequences are
/// bounded by the longest terminating interleaving, and each backtrack set is bounded by the
/// enabled set of its state.
pub(crate) fn explore(
    session: &Rc<Session>,
    init: &dyn Fn(),
    states: &mut Vec<SharedState>,
    clock: &Clock,
    last_access: &LastAccess,
) -> Result<(), CheckError> {
    let state = states.last().cloned().expect("the state sequence is never empty");

    add_backtrack_points(&state.borrow(), states, last_access);

    if state.borrow().enabled.is_empty() {
        return Ok(());
    }
    let seed = *state.borrow().enabled.iter().next().expect("the enabled set is non-empty");
    state.borrow_mut().backtrack.insert(seed);

    let mut done: BTreeSet<ProcessId> = BTreeSet::new();
    loop {
        // the backtrack set can grow while this loop runs, through the race detection of
        // deeper calls; re-derive the next candidate each iteration
        let candidate = {
            let state = state.borrow();
            state.backtrack.difference(&done).next().copied()
        };
        let Some(j) = candidate else { break };
        done.insert(j);

        let (op, repr) = {
            let state = state.borrow();
            let pending = state.procs[j.as_usize()];
            debug_assert_eq!(pending.pid, j, "pending snapshots are dense by process id");
            (pending.op, pending.repr)
        };

        let mut schedule: Schedule = states.iter().map(|s| s.borrow().run_step).collect();
        schedule.push(ScheduleStep::new(j, op, repr));

        let next = replay::do_run(session, init, &schedule)?;
        states.push(Rc::new(RefCell::new(next)));
        let index = states.len() - 1;

        let mut last_access = last_access.clone();
        if let Some(ptr) = repr {
            last_access.insert(ptr, index);
        }
        let mut clock = clock.clone();
        clock.insert(j, index);

        let result = explore(session, init, states, &clock, &last_access);
        states.pop();
        result?;
    }
    Ok(())
}

/// Updates earlier states' backtrack sets for every pending operation that races with the most
/// recent access to the same object on the current path.
fn add_backtrack_points(state: &StateCell, states: &[SharedState], last_access: &LastAccess) {
    for pending in &state.procs {
        let Some(ptr) = pending.repr else { continue };
        let Some(&access) = last_access.get(&ptr) else { continue };
        if access == 0 {
            continue;
        }
        let mut pre = states[access - 1].borrow_mut();
        if pre.enabled.contains(&pending.pid) {
            pre.backtrack.insert(pending.pid);
        } else {
            // the racing process was not runnable back then; conservatively retry everything
            // that was
            let enabled = pre.enabled.clone();
            pre.backtrack.extend(enabled);
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cell(pid: u32, op: Op, repr: Option<u64>, enabled: &[u32]) -> SharedState {
        let enabled: BTreeSet<ProcessId> =
            enabled.iter().map(|&p| ProcessId::from(p)).collect();
        let procs = vec![
            PendingOp { pid: ProcessId::from(0), op: Op::Get, repr: Some(ObjectId::from(1)) },
            PendingOp { pid: ProcessId::from(1), op: Op::Set, repr: Some(ObjectId::from(1)) },
        ];
        let run_step = ScheduleStep::new(ProcessId::from(pid), op, repr.map(ObjectId::from));
        Rc::new(RefCell::new(StateCell::new(procs, run_step, enabled)))
    }

    #[test]
    fn racing_pending_op_backtracks_the_state_before_the_access() {
        // object 1 was last touched by the step that produced state index 1, so the race point
        // is state index 0
        let states =
            vec![cell(0, Op::Start, None, &[0, 1]), cell(0, Op::Get, Some(1), &[0, 1])];
        let last_access: LastAccess = [(ObjectId::from(1), 1)].into_iter().collect();

        add_backtrack_points(&states[1].borrow().clone(), &states, &last_access);
        let backtrack = states[0].borrow().backtrack.clone();
        assert_eq!(backtrack, [ProcessId::from(0), ProcessId::from(1)].into_iter().collect());
    }

    #[test]
    fn disabled_racer_falls_back_to_the_whole_enabled_set() {
        // the pre-state only had process 0 enabled, so discovering a race with process 1 must
        // schedule everything that was runnable there
        let states = vec![cell(0, Op::Start, None, &[0]), cell(0, Op::Get, Some(1), &[0, 1])];
        let last_access: LastAccess = [(ObjectId::from(1), 1)].into_iter().collect();

        add_backtrack_points(&states[1].borrow().clone(), &states, &last_access);
        let backtrack = states[0].borrow().backtrack.clone();
        assert_eq!(backtrack, [ProcessId::from(0)].into_iter().collect());
    }

    #[test]
    fn untouched_objects_add_no_backtrack_points() {
        let states =
            vec![cell(0, Op::Start, None, &[0, 1]), cell(0, Op::Get, Some(1), &[0, 1])];
        let last_access = LastAccess::new();

        add_backtrack_points(&states[1].borrow().clone(), &states, &last_access);
        assert!(states[0].borrow().backtrack.is_empty());
    }
}
