use core::fmt::{self, Display};

use crate::{ObjectId, Op, ProcessId};

// SCHEDULE STEP
// ================================================================================================

/// One step of a schedule: which process runs, the operation it is expected to be blocked on,
/// and the object that operation references (absent for `Start` and `Make`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScheduleStep {
    pub pid: ProcessId,
    pub op: Op,
    pub repr: Option<ObjectId>,
}

impl ScheduleStep {
    /// Returns a new step for the given process, operation, and referenced object.
    pub const fn new(pid: ProcessId, op: Op, repr: Option<ObjectId>) -> Self {
        Self { pid, op, repr }
    }
}

impl Display for ScheduleStep {
    /// Formats the step as the dump line `Process <pid>: <op> <ptr_or_empty>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process {}: {} ", self.pid, self.op)?;
        if let Some(ptr) = self.repr {
            write!(f, "{ptr}")?;
        }
        Ok(())
    }
}

// SCHEDULE
// ================================================================================================

/// A totally ordered sequence of steps; a schedule uniquely determines one interleaving.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schedule(Vec<ScheduleStep>);

impl Schedule {
    /// Returns an empty schedule.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the schedule every exploration starts from: the start step of process 0.
    pub fn initial() -> Self {
        Self(vec![ScheduleStep::new(ProcessId::first(), Op::Start, None)])
    }

    /// Appends a step.
    pub fn push(&mut self, step: ScheduleStep) {
        self.0.push(step);
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the schedule has no steps.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the steps in order.
    pub fn steps(&self) -> &[ScheduleStep] {
        &self.0
    }
}

impl FromIterator<ScheduleStep> for Schedule {
    fn from_iter<I: IntoIterator<Item = ScheduleStep>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for Schedule {
    /// Formats the schedule as a dump: one step per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.0 {
            writeln!(f, "{step}")?;
        }
        Ok(())
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_dump_line_with_object() {
        let step = ScheduleStep::new(ProcessId::from(1), Op::Get, Some(ObjectId::from(3)));
        assert_eq!(step.to_string(), "Process 1: get 3");
    }

    #[test]
    fn step_dump_line_without_object() {
        let step = ScheduleStep::new(ProcessId::first(), Op::Start, None);
        assert_eq!(step.to_string(), "Process 0: start ");
    }

    #[test]
    fn initial_schedule_is_the_start_of_process_zero() {
        let schedule = Schedule::initial();
        assert_eq!(schedule.len(), 1);
        assert_eq!(
            schedule.steps()[0],
            ScheduleStep::new(ProcessId::first(), Op::Start, None)
        );
    }

    #[test]
    fn schedule_dump_is_one_line_per_step() {
        let schedule: Schedule = [
            ScheduleStep::new(ProcessId::first(), Op::Start, None),
            ScheduleStep::new(ProcessId::first(), Op::Make, None),
            ScheduleStep::new(ProcessId::first(), Op::Set, Some(ObjectId::from(1))),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            schedule.to_string(),
            "Process 0: start \nProcess 0: make \nProcess 0: set 1\n"
        );
    }
}
