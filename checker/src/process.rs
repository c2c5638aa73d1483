use std::{collections::BTreeSet, sync::mpsc::Sender};

use weft_core::{ObjectId, Op, ProcessId};

use crate::fiber::{Continuation, Fiber, ResumeMsg};

// PROCESS RECORD
// ================================================================================================

/// Bookkeeping for one spawned process.
///
/// The continuation slot follows the fiber's lifecycle: armed while the fiber is suspended,
/// vacant while it runs or once it has finished. Resume and discontinue both consume the slot,
/// which makes the one-shot rule structural.
#[derive(Debug)]
pub(crate) struct ProcessRecord {
    id: ProcessId,
    next_op: Op,
    next_repr: Option<ObjectId>,
    continuation: Option<Continuation>,
    join: Option<std::thread::JoinHandle<()>>,
    finished: bool,
}

impl ProcessRecord {
    /// Returns this process's id.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Returns the operation the process is currently blocked on (`Start` until first resumed;
    /// stale once the process has finished).
    pub fn next_op(&self) -> Op {
        self.next_op
    }

    /// Returns the object the pending operation references, if any.
    pub fn next_repr(&self) -> Option<ObjectId> {
        self.next_repr
    }

    /// Returns true once the fiber has returned normally.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// PROCESS TABLE
// ================================================================================================

/// The set of processes spawned for the current run, dense by [`ProcessId`].
#[derive(Debug, Default)]
pub(crate) struct ProcessTable {
    records: Vec<ProcessRecord>,
    finished: usize,
}

impl ProcessTable {
    // MUTATORS
    // --------------------------------------------------------------------------------------------

    /// Appends a record for a freshly spawned fiber and returns its id.
    pub fn insert(&mut self, fiber: Fiber) -> ProcessId {
        let id = ProcessId::from(self.records.len() as u32);
        self.records.push(ProcessRecord {
            id,
            next_op: Op::Start,
            next_repr: None,
            continuation: Some(Continuation::from_sender(fiber.tx)),
            join: Some(fiber.join),
            finished: false,
        });
        id
    }

    /// Takes the continuation of `pid`, leaving the slot vacant.
    pub fn take_continuation(&mut self, pid: ProcessId) -> Option<Continuation> {
        self.records.get_mut(pid.as_usize()).and_then(|record| record.continuation.take())
    }

    /// Re-arms `pid` with the operation it suspended on; called exactly once per suspension.
    pub fn update_process_data(
        &mut self,
        pid: ProcessId,
        tx: Sender<ResumeMsg>,
        op: Op,
        repr: Option<ObjectId>,
    ) {
        let record = &mut self.records[pid.as_usize()];
        debug_assert!(!record.finished, "a finished process cannot suspend");
        debug_assert!(record.continuation.is_none(), "suspension while already armed");
        record.next_op = op;
        record.next_repr = repr;
        record.continuation = Some(Continuation::from_sender(tx));
    }

    /// Marks `pid` finished and bumps the finished count.
    pub fn finish_process(&mut self, pid: ProcessId) {
        let record = &mut self.records[pid.as_usize()];
        debug_assert!(!record.finished, "finish reported twice for one process");
        record.finished = true;
        self.finished += 1;
    }

    /// Discontinues every unfinished fiber and joins all fiber threads, then clears the table.
    pub fn dispose(&mut self) {
        for record in &mut self.records {
            if let Some(continuation) = record.continuation.take() {
                continuation.discontinue();
            }
        }
        for record in &mut self.records {
            if let Some(join) = record.join.take() {
                // fibers catch every unwind and report through the event channel, so the join
                // itself cannot carry a panic
                let _ = join.join();
            }
        }
        self.records.clear();
        self.finished = 0;
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    /// Returns the number of spawned processes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns the record for `pid`, if it was spawned.
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessRecord> {
        self.records.get(pid.as_usize())
    }

    /// Returns all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.iter()
    }

    /// Returns true once every spawned process has finished.
    pub fn all_finished(&self) -> bool {
        self.finished == self.records.len()
    }

    /// Returns the ids of every process whose fiber has not returned.
    pub fn enabled(&self) -> BTreeSet<ProcessId> {
        self.records.iter().filter(|r| !r.finished).map(|r| r.id).collect()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    /// A fiber whose thread just waits for its abort signal; enough to exercise the table.
    fn idle_fiber() -> Fiber {
        let (tx, rx) = channel();
        let join = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        Fiber { tx, join }
    }

    #[test]
    fn records_are_dense_and_start_pending() {
        let mut table = ProcessTable::default();
        let a = table.insert(idle_fiber());
        let b = table.insert(idle_fiber());
        assert_eq!(a, ProcessId::from(0));
        assert_eq!(b, ProcessId::from(1));
        let record = table.get(a).unwrap();
        assert_eq!(record.next_op(), Op::Start);
        assert_eq!(record.next_repr(), None);
        assert!(!record.is_finished());
        table.dispose();
    }

    #[test]
    fn continuation_is_consumed_at_most_once() {
        let mut table = ProcessTable::default();
        let pid = table.insert(idle_fiber());
        let first = table.take_continuation(pid);
        assert!(first.is_some());
        assert!(table.take_continuation(pid).is_none());
        first.unwrap().discontinue();
        table.dispose();
    }

    #[test]
    fn enabled_tracks_unfinished_processes() {
        let mut table = ProcessTable::default();
        let a = table.insert(idle_fiber());
        let b = table.insert(idle_fiber());
        assert_eq!(table.enabled(), [a, b].into_iter().collect());
        assert!(!table.all_finished());

        table.finish_process(a);
        assert_eq!(table.enabled(), [b].into_iter().collect());
        table.finish_process(b);
        assert!(table.all_finished());
        table.dispose();
    }

    #[test]
    fn update_rearms_the_record() {
        let mut table = ProcessTable::default();
        let pid = table.insert(idle_fiber());
        let continuation = table.take_continuation(pid).unwrap();
        let tx = continuation.resume(None);
        table.update_process_data(pid, tx, Op::Get, Some(ObjectId::from(1)));
        let record = table.get(pid).unwrap();
        assert_eq!(record.next_op(), Op::Get);
        assert_eq!(record.next_repr(), Some(ObjectId::from(1)));
        assert!(table.take_continuation(pid).is_some());
        table.dispose();
    }

    #[test]
    fn dispose_clears_the_table() {
        let mut table = ProcessTable::default();
        table.insert(idle_fiber());
        table.insert(idle_fiber());
        table.dispose();
        assert_eq!(table.len(), 0);
        assert!(table.enabled().is_empty());
    }
}
